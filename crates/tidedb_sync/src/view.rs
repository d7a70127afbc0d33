//! Query views: materialized, filtered caches with event generation.
//!
//! A view holds two caches for one query at one path. The server cache is
//! the last authoritative data received for the query's window; the event
//! cache is that data with the pending-write overlay applied and the query's
//! ordering, bounds, and limit enforced. Events are computed by diffing the
//! previous and new event caches using key identity, so a window slide shows
//! up as one child leaving and another entering.

use crate::events::{DataEvent, DataEventType, EventRegistration, RaisedEvent};
use crate::operation::{Operation, OperationSource};
use crate::write_tree::WriteTree;
use std::collections::BTreeMap;
use tidedb_core::{LimitAnchor, Node, QueryParams, QuerySpec};

/// A cache plus a completeness marker.
#[derive(Clone, Debug, Default)]
pub struct CacheNode {
    /// The cached data.
    pub node: Node,
    /// True when the cache covers the whole query window.
    pub complete: bool,
}

impl CacheNode {
    /// A complete cache over `node`.
    pub fn complete(node: Node) -> Self {
        Self {
            node,
            complete: true,
        }
    }
}

/// Sorts a node's children under the query's index.
fn sorted_children(params: &QueryParams, node: &Node) -> Vec<(String, Node)> {
    let mut kids: Vec<(String, Node)> = node
        .children_iter()
        .map(|(k, v)| (k.to_owned(), v.clone()))
        .collect();
    kids.sort_by(|(ak, an), (bk, bn)| params.index().compare(ak, an, bk, bn));
    kids
}

/// Applies ordering bounds and the limit window to a node.
pub fn filter_node(params: &QueryParams, node: &Node) -> Node {
    if params.loads_all_data() || node.is_leaf() || node.is_empty() {
        return node.clone();
    }
    let mut kids = sorted_children(params, node);
    kids.retain(|(key, child)| params.bounds_contain(key, child));
    if let Some(limit) = params.limit_value() {
        let limit = limit as usize;
        if kids.len() > limit {
            match params.effective_anchor() {
                LimitAnchor::Left => kids.truncate(limit),
                LimitAnchor::Right => {
                    kids.drain(..kids.len() - limit);
                }
            }
        }
    }
    Node::children(kids.into_iter().collect::<BTreeMap<_, _>>())
}

/// The outcome of applying one operation to a view.
#[derive(Default)]
pub struct ViewApplyResult {
    /// Events ready to raise, one per (event, registration) pair.
    pub events: Vec<RaisedEvent>,
    /// Child keys that entered the window (for tracked-key persistence).
    pub added_keys: Vec<String>,
    /// Child keys that left the window.
    pub removed_keys: Vec<String>,
}

/// One query's materialized state at one sync point.
pub struct View {
    query: QuerySpec,
    server: CacheNode,
    event: CacheNode,
    registrations: Vec<EventRegistration>,
}

impl View {
    /// Builds a view from an initial server cache (tree-local cache,
    /// persisted cache, or empty) plus the current write overlay.
    pub fn new(query: QuerySpec, initial_server: CacheNode, writes: &WriteTree) -> Self {
        let event = Self::compute_event_cache(&query, &initial_server, writes);
        Self {
            query,
            server: initial_server,
            event,
            registrations: Vec::new(),
        }
    }

    /// The view's query.
    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    /// The current server cache.
    pub fn server_cache(&self) -> &CacheNode {
        &self.server
    }

    /// The current event cache.
    pub fn event_cache(&self) -> &CacheNode {
        &self.event
    }

    /// True when no registrations remain.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Attaches a registration and returns its initial event set.
    pub fn add_registration(&mut self, registration: EventRegistration) -> Vec<RaisedEvent> {
        let events = self.initial_events(&registration);
        self.registrations.push(registration);
        events
    }

    /// Detaches a registration by id, or all of them when `id` is `None`.
    /// Returns the removed registrations.
    pub fn remove_registration(&mut self, id: Option<u64>) -> Vec<EventRegistration> {
        match id {
            Some(id) => {
                let mut removed = Vec::new();
                self.registrations.retain(|reg| {
                    if reg.id == id {
                        removed.push(reg.clone());
                        false
                    } else {
                        true
                    }
                });
                removed
            }
            None => std::mem::take(&mut self.registrations),
        }
    }

    /// Applies one operation, updating caches and diffing out events.
    pub fn apply_operation(
        &mut self,
        op: &Operation,
        writes: &WriteTree,
    ) -> ViewApplyResult {
        if let OperationSource::Server { .. } = op.source() {
            self.update_server_cache(op);
        }
        let new_event = Self::compute_event_cache(&self.query, &self.server, writes);
        let events = diff_events(&self.query, &self.event, &new_event);
        let (added_keys, removed_keys) = key_delta(&self.event.node, &new_event.node);
        let raised = self.pair_with_registrations(events);
        self.event = new_event;
        ViewApplyResult {
            events: raised,
            added_keys,
            removed_keys,
        }
    }

    fn update_server_cache(&mut self, op: &Operation) {
        match op {
            Operation::Overwrite { path, node, .. } => {
                if path.is_empty() {
                    self.server = CacheNode::complete(node.clone());
                } else {
                    self.server.node = self.server.node.update(path, node.clone());
                }
            }
            Operation::Merge { path, children, .. } => {
                for (rel, node) in children.entries() {
                    let full = path.append(&rel);
                    self.server.node = self.server.node.update(&full, node.clone());
                }
            }
            Operation::ListenComplete { .. } => {
                self.server.complete = true;
            }
            Operation::AckUserWrite { .. } => {}
        }
    }

    fn compute_event_cache(query: &QuerySpec, server: &CacheNode, writes: &WriteTree) -> CacheNode {
        let server_opt = server.complete.then(|| server.node.clone());
        match writes.calc_complete_event_cache(&query.path, server_opt.as_ref(), &[], false) {
            Some(node) => CacheNode::complete(filter_node(&query.params, &node)),
            None => {
                // Partial: overlay what we can onto the incomplete window.
                let overlaid = writes.calc_complete_event_children(&query.path, &server.node);
                CacheNode {
                    node: filter_node(&query.params, &overlaid),
                    complete: false,
                }
            }
        }
    }

    /// The events a brand-new registration should observe: one add per
    /// child in the window, then the settling value event. Nothing fires
    /// until the cache is complete.
    fn initial_events(&self, registration: &EventRegistration) -> Vec<RaisedEvent> {
        if !self.event.complete {
            return Vec::new();
        }
        let empty = CacheNode::default();
        let events = diff_events(&self.query, &empty, &self.event);
        events
            .into_iter()
            .map(|event| RaisedEvent {
                callback: registration.on_event.clone(),
                event,
            })
            .collect()
    }

    fn pair_with_registrations(&self, events: Vec<DataEvent>) -> Vec<RaisedEvent> {
        let mut raised = Vec::new();
        for event in events {
            for registration in &self.registrations {
                raised.push(RaisedEvent {
                    callback: registration.on_event.clone(),
                    event: event.clone(),
                });
            }
        }
        raised
    }
}

/// Child keys that entered / left between two event caches.
fn key_delta(old: &Node, new: &Node) -> (Vec<String>, Vec<String>) {
    let added = new
        .children_iter()
        .filter(|(k, _)| !old.has_child(k))
        .map(|(k, _)| k.to_owned())
        .collect();
    let removed = old
        .children_iter()
        .filter(|(k, _)| !new.has_child(k))
        .map(|(k, _)| k.to_owned())
        .collect();
    (added, removed)
}

/// Diffs two event caches into ordered data events.
///
/// Structural changes use key identity. Emission order is removals, then
/// additions, then moves and in-place changes, then the value event.
fn diff_events(query: &QuerySpec, old: &CacheNode, new: &CacheNode) -> Vec<DataEvent> {
    if !new.complete {
        return Vec::new();
    }
    // A view that just became complete reports everything as new.
    let old_node = if old.complete { &old.node } else { &Node::Empty };
    if old.complete && old_node == &new.node {
        return Vec::new();
    }
    let mut events = Vec::new();
    if new.node.is_leaf() || new.node.is_empty() {
        events.push(value_event(query, &new.node));
        return events;
    }

    let old_sorted = sorted_children(&query.params, old_node);
    let new_sorted = sorted_children(&query.params, &new.node);
    let prev_key = |sorted: &[(String, Node)], key: &str| -> Option<String> {
        sorted
            .iter()
            .position(|(k, _)| k == key)
            .and_then(|i| i.checked_sub(1))
            .map(|i| sorted[i].0.clone())
    };

    for (key, node) in &old_sorted {
        if !new.node.has_child(key) {
            events.push(DataEvent {
                kind: DataEventType::ChildRemoved,
                query: query.clone(),
                child_key: Some(key.clone()),
                node: node.clone(),
                old_node: None,
                prev_child_key: None,
            });
        }
    }
    for (key, node) in &new_sorted {
        if !old_node.has_child(key) {
            events.push(DataEvent {
                kind: DataEventType::ChildAdded,
                query: query.clone(),
                child_key: Some(key.clone()),
                node: node.clone(),
                old_node: None,
                prev_child_key: prev_key(&new_sorted, key),
            });
        }
    }
    for (key, node) in &new_sorted {
        let Some((_, old_child)) = old_sorted.iter().find(|(k, _)| k == key) else {
            continue;
        };
        if old_child == node {
            continue;
        }
        if prev_key(&old_sorted, key) != prev_key(&new_sorted, key) {
            events.push(DataEvent {
                kind: DataEventType::ChildMoved,
                query: query.clone(),
                child_key: Some(key.clone()),
                node: node.clone(),
                old_node: None,
                prev_child_key: prev_key(&new_sorted, key),
            });
        }
        events.push(DataEvent {
            kind: DataEventType::ChildChanged,
            query: query.clone(),
            child_key: Some(key.clone()),
            node: node.clone(),
            old_node: Some(old_child.clone()),
            prev_child_key: prev_key(&new_sorted, key),
        });
    }
    events.push(value_event(query, &new.node));
    events
}

fn value_event(query: &QuerySpec, node: &Node) -> DataEvent {
    DataEvent {
        kind: DataEventType::Value,
        query: query.clone(),
        child_key: None,
        node: node.clone(),
        old_node: None,
        prev_child_key: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidedb_core::{Index, Path};

    fn rooms_query(limit: u32) -> QuerySpec {
        let params = QueryParams::default()
            .order_by(Index::Child(Path::new("/name")))
            .limit_to_first(limit);
        QuerySpec::new(Path::new("/rooms"), params)
    }

    fn server_overwrite(json: serde_json::Value) -> Operation {
        Operation::Overwrite {
            source: OperationSource::server(),
            path: Path::root(),
            node: Node::from_json(&json),
        }
    }

    fn kinds(result: &ViewApplyResult) -> Vec<(DataEventType, Option<String>)> {
        result
            .events
            .iter()
            .map(|r| (r.event.kind, r.event.child_key.clone()))
            .collect()
    }

    fn listening_view(query: QuerySpec) -> View {
        let mut view = View::new(query, CacheNode::default(), &WriteTree::new());
        view.add_registration(EventRegistration::silent());
        view
    }

    #[test]
    fn limit_to_first_keeps_leading_window() {
        let writes = WriteTree::new();
        let mut view = listening_view(rooms_query(2));
        let result = view.apply_operation(
            &server_overwrite(serde_json::json!({
                "a": {"name": "x"}, "b": {"name": "y"}, "c": {"name": "z"}
            })),
            &writes,
        );
        let got = kinds(&result);
        assert!(got.contains(&(DataEventType::ChildAdded, Some("a".into()))));
        assert!(got.contains(&(DataEventType::ChildAdded, Some("b".into()))));
        assert!(!got.iter().any(|(_, k)| k.as_deref() == Some("c")));
        assert!(view.event_cache().node.has_child("a"));
        assert!(!view.event_cache().node.has_child("c"));
    }

    #[test]
    fn window_slides_when_earlier_child_arrives() {
        let writes = WriteTree::new();
        let mut view = listening_view(rooms_query(2));
        view.apply_operation(
            &server_overwrite(serde_json::json!({
                "a": {"name": "x"}, "b": {"name": "y"}, "c": {"name": "z"}
            })),
            &writes,
        );
        let result = view.apply_operation(
            &Operation::Overwrite {
                source: OperationSource::server(),
                path: Path::new("/aa"),
                node: Node::from_json(&serde_json::json!({"name": "aa"})),
            },
            &writes,
        );
        let got = kinds(&result);
        assert!(got.contains(&(DataEventType::ChildAdded, Some("aa".into()))));
        assert!(got.contains(&(DataEventType::ChildRemoved, Some("b".into()))));
        assert_eq!(result.added_keys, vec!["aa".to_owned()]);
        assert_eq!(result.removed_keys, vec!["b".to_owned()]);
    }

    #[test]
    fn no_events_before_cache_is_complete() {
        let writes = WriteTree::new();
        let mut view = listening_view(rooms_query(2));
        let result = view.apply_operation(
            &Operation::Overwrite {
                source: OperationSource::server(),
                path: Path::new("/a"),
                node: Node::from_json(&serde_json::json!({"name": "x"})),
            },
            &writes,
        );
        assert!(result.events.is_empty());
        assert!(!view.event_cache().complete);
    }

    #[test]
    fn pending_write_overlays_server_data() {
        let mut writes = WriteTree::new();
        let query = QuerySpec::default_at(Path::new("/x"));
        let mut view = listening_view(query);
        view.apply_operation(
            &server_overwrite(serde_json::json!(1)),
            &writes,
        );
        writes.add_overwrite(Path::new("/x"), Node::leaf(2.0), 1, true);
        let result = view.apply_operation(
            &Operation::Overwrite {
                source: OperationSource::User,
                path: Path::root(),
                node: Node::leaf(2.0),
            },
            &writes,
        );
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].event.kind, DataEventType::Value);
        assert_eq!(view.event_cache().node, Node::leaf(2.0));
        // The server cache is untouched by the user write.
        assert_eq!(view.server_cache().node, Node::leaf(1.0));
    }

    #[test]
    fn move_reported_when_index_position_changes() {
        let writes = WriteTree::new();
        let params = QueryParams::default().order_by(Index::Child(Path::new("/rank")));
        let mut view = listening_view(QuerySpec::new(Path::new("/players"), params));
        view.apply_operation(
            &server_overwrite(serde_json::json!({
                "p1": {"rank": 1}, "p2": {"rank": 2}
            })),
            &writes,
        );
        let result = view.apply_operation(
            &Operation::Overwrite {
                source: OperationSource::server(),
                path: Path::new("/p1/rank"),
                node: Node::leaf(3.0),
            },
            &writes,
        );
        let got = kinds(&result);
        assert!(got.contains(&(DataEventType::ChildMoved, Some("p1".into()))));
        assert!(got.contains(&(DataEventType::ChildChanged, Some("p1".into()))));
    }
}
