//! The sync tree: central operation-application engine.
//!
//! Owns the sync point tree, the pending-write overlay, and the query-tag
//! assignments. Every mutation of synced data flows through here as an
//! [`Operation`], which is walked down the sync point tree along its path
//! (relativized at each level) and fanned out across descendants when it
//! lands, emitting events deepest-first so listeners observe deep changes
//! before shallow ones.
//!
//! Listens are reconciled rather than toggled: after any registration
//! change, the desired listen set is recomputed from the tree (one listen
//! per complete view, one per filtered view where no complete view covers
//! it, nothing under a shadowing ancestor) and diffed against the active
//! set; the difference goes to the listen provider.

use crate::error::SyncError;
use crate::events::{EventRegistration, RaisedCancel, RaisedEvent};
use crate::operation::{Operation, OperationSource};
use crate::persistence::PersistenceEngine;
use crate::sync_point::SyncPoint;
use crate::view::CacheNode;
use crate::write_tree::WriteTree;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tidedb_core::{CompoundWrite, Node, Path, PathTree, QuerySpec};
use tracing::{debug, trace, warn};

/// Starts and stops server listens on behalf of the sync tree.
///
/// Implementations must not call back into the sync tree synchronously;
/// the repo defers the actual network calls until its lock is released.
pub trait ListenProvider: Send + Sync {
    /// Establishes a listen for `query`, tagged for non-default queries.
    fn start_listen(&self, query: &QuerySpec, tag: Option<u64>);
    /// Tears a listen down.
    fn stop_listen(&self, query: &QuerySpec, tag: Option<u64>);
}

/// Tracked-key delta collected during an operation walk.
type TrackedDelta = (QuerySpec, Vec<String>, Vec<String>);

/// The operation-application engine.
pub struct SyncTree {
    sync_points: PathTree<SyncPoint>,
    pending: WriteTree,
    tag_counter: u64,
    query_to_tag: HashMap<QuerySpec, u64>,
    tag_to_query: HashMap<u64, QuerySpec>,
    active_listens: HashSet<QuerySpec>,
    keep_synced: HashMap<QuerySpec, u64>,
    persistence: Box<dyn PersistenceEngine>,
    listen_provider: Arc<dyn ListenProvider>,
}

impl SyncTree {
    /// Creates an engine over a listen provider and persistence layer.
    pub fn new(
        listen_provider: Arc<dyn ListenProvider>,
        persistence: Box<dyn PersistenceEngine>,
    ) -> Self {
        Self {
            sync_points: PathTree::new(),
            pending: WriteTree::new(),
            tag_counter: 0,
            query_to_tag: HashMap::new(),
            tag_to_query: HashMap::new(),
            active_listens: HashSet::new(),
            keep_synced: HashMap::new(),
            persistence,
            listen_provider,
        }
    }

    /// The pending-write overlay (read-only).
    pub fn pending_writes(&self) -> &WriteTree {
        &self.pending
    }

    /// The query currently assigned to `tag`.
    pub fn query_for_tag(&self, tag: u64) -> Option<&QuerySpec> {
        self.tag_to_query.get(&tag)
    }

    /// The tag assigned to `query`, if any.
    pub fn tag_for_query(&self, query: &QuerySpec) -> Option<u64> {
        self.query_to_tag.get(query).copied()
    }

    // ---- user writes ----------------------------------------------------

    /// Records a user overwrite and emits the resulting local events.
    pub fn apply_user_overwrite(
        &mut self,
        path: Path,
        node: Node,
        write_id: u64,
        visible: bool,
    ) -> Vec<RaisedEvent> {
        trace!(%path, write_id, visible, "user overwrite");
        self.persistence.save_user_overwrite(&path, &node, write_id);
        self.pending
            .add_overwrite(path.clone(), node.clone(), write_id, visible);
        if !visible {
            return Vec::new();
        }
        self.apply_operation(Operation::Overwrite {
            source: OperationSource::User,
            path,
            node,
        })
    }

    /// Records a user merge and emits the resulting local events.
    pub fn apply_user_merge(
        &mut self,
        path: Path,
        children: CompoundWrite,
        write_id: u64,
    ) -> Vec<RaisedEvent> {
        trace!(%path, write_id, "user merge");
        self.persistence.save_user_merge(&path, &children, write_id);
        self.pending.add_merge(path.clone(), children.clone(), write_id);
        self.apply_operation(Operation::Merge {
            source: OperationSource::User,
            path,
            children,
        })
    }

    /// Removes a pending write after the server settled it.
    ///
    /// `revert` rolls the local overlay back instead of confirming it;
    /// events fire only where removing the write changes visible data.
    pub fn ack_user_write(&mut self, write_id: u64, revert: bool) -> Vec<RaisedEvent> {
        self.persistence.remove_user_write(write_id);
        let Some((record, needs_recalc)) = self.pending.remove_write(write_id) else {
            debug_assert!(false, "acking unknown write {write_id}");
            return Vec::new();
        };
        trace!(write_id, revert, needs_recalc, "ack user write");
        if !needs_recalc {
            return Vec::new();
        }
        let affected = record.affected_tree();
        self.apply_operation(Operation::AckUserWrite {
            path: record.path,
            affected,
            revert,
        })
    }

    /// Reverts every pending write (engine purge). Emits the events needed
    /// to roll local caches back to server state.
    pub fn purge_pending_writes(&mut self) -> Vec<RaisedEvent> {
        self.persistence.remove_all_user_writes();
        let records = self.pending.purge_all_writes();
        let mut events = Vec::new();
        for record in records {
            let affected = record.affected_tree();
            events.extend(self.apply_operation(Operation::AckUserWrite {
                path: record.path,
                affected,
                revert: true,
            }));
        }
        events
    }

    // ---- server data ----------------------------------------------------

    /// Applies an authoritative overwrite from the server.
    pub fn apply_server_overwrite(&mut self, path: Path, node: Node) -> Vec<RaisedEvent> {
        trace!(%path, "server overwrite");
        self.persistence.update_server_cache(&path, &node);
        self.apply_operation(Operation::Overwrite {
            source: OperationSource::server(),
            path,
            node,
        })
    }

    /// Applies an authoritative merge from the server.
    pub fn apply_server_merge(
        &mut self,
        path: Path,
        children: CompoundWrite,
    ) -> Vec<RaisedEvent> {
        trace!(%path, "server merge");
        self.persistence.merge_server_cache(&path, &children);
        self.apply_operation(Operation::Merge {
            source: OperationSource::server(),
            path,
            children,
        })
    }

    /// Applies a query-scoped overwrite, routed by tag.
    pub fn apply_tagged_overwrite(
        &mut self,
        tag: u64,
        path: Path,
        node: Node,
    ) -> Vec<RaisedEvent> {
        let Some(query) = self.tag_to_query.get(&tag).cloned() else {
            // The listen was torn down while the push was in flight.
            trace!(tag, "dropping update for unknown tag");
            return Vec::new();
        };
        let Some(rel) = path.relative_to(&query.path) else {
            warn!(%path, %query, "tagged update outside its query");
            return Vec::new();
        };
        self.persistence.update_server_cache(&path, &node);
        self.apply_tagged(
            &query,
            Operation::Overwrite {
                source: OperationSource::Server { tag: Some(tag) },
                path: rel,
                node,
            },
        )
    }

    /// Applies a query-scoped merge, routed by tag.
    pub fn apply_tagged_merge(
        &mut self,
        tag: u64,
        path: Path,
        children: CompoundWrite,
    ) -> Vec<RaisedEvent> {
        let Some(query) = self.tag_to_query.get(&tag).cloned() else {
            trace!(tag, "dropping merge for unknown tag");
            return Vec::new();
        };
        let Some(rel) = path.relative_to(&query.path) else {
            warn!(%path, %query, "tagged merge outside its query");
            return Vec::new();
        };
        self.persistence.merge_server_cache(&path, &children);
        self.apply_tagged(
            &query,
            Operation::Merge {
                source: OperationSource::Server { tag: Some(tag) },
                path: rel,
                children,
            },
        )
    }

    /// The server finished the initial data for an untagged listen.
    pub fn apply_listen_complete(&mut self, path: Path) -> Vec<RaisedEvent> {
        self.persistence
            .set_query_complete(&QuerySpec::default_at(path.clone()));
        self.apply_operation(Operation::ListenComplete {
            source: OperationSource::server(),
            path,
        })
    }

    /// The server finished the initial data for a tagged listen.
    pub fn apply_tagged_listen_complete(&mut self, tag: u64) -> Vec<RaisedEvent> {
        let Some(query) = self.tag_to_query.get(&tag).cloned() else {
            return Vec::new();
        };
        self.persistence.set_query_complete(&query);
        self.apply_tagged(
            &query,
            Operation::ListenComplete {
                source: OperationSource::Server { tag: Some(tag) },
                path: Path::root(),
            },
        )
    }

    // ---- registrations --------------------------------------------------

    /// Attaches a listener to a query, creating its view (and possibly a
    /// server listen) on first use. Returns the initial events.
    pub fn add_event_registration(
        &mut self,
        query: QuerySpec,
        registration: EventRegistration,
    ) -> Vec<RaisedEvent> {
        debug!(%query, registration = registration.id, "add registration");
        let initial = self.initial_cache_for(&query);
        let point_path = query.path.clone();
        let subtree = self.sync_points.subtree_mut(&point_path);
        if subtree.value().is_none() {
            subtree.set_value(Some(SyncPoint::new()));
        }
        let point = subtree
            .value_mut()
            .unwrap_or_else(|| unreachable!("sync point inserted above"));
        let (events, created) =
            point.add_event_registration(&query, registration, initial, &self.pending);
        if created && !query.is_default() {
            self.tag_counter += 1;
            let tag = self.tag_counter;
            self.query_to_tag.insert(query.clone(), tag);
            self.tag_to_query.insert(tag, query.clone());
        }
        if created {
            self.persistence.set_query_active(&query);
        }
        self.reconcile_listens();
        events
    }

    /// Detaches a listener (all listeners for the query when `id` is
    /// `None`). `error`, when present, is delivered to the removed
    /// registrations' cancel callbacks.
    pub fn remove_event_registration(
        &mut self,
        query: &QuerySpec,
        id: Option<u64>,
        error: Option<SyncError>,
    ) -> Vec<RaisedCancel> {
        let Some(point) = self.sync_points.get_mut(&query.path) else {
            // Removing a listener with no matching view is a programming
            // error; harmless to ignore in release builds.
            debug_assert!(id.is_none(), "no sync point at {}", query.path);
            return Vec::new();
        };
        let (removed, dead) = point.remove_event_registration(&query.params, id);
        if point.is_empty() {
            self.sync_points.remove(&query.path);
        }
        // Reconcile while the dying queries still hold their tags, so the
        // provider's stop command carries the tag the listen was sent with.
        self.reconcile_listens();
        for dead_query in &dead {
            self.release_query(dead_query);
        }
        match error {
            Some(error) => removed
                .into_iter()
                .map(|reg| RaisedCancel {
                    callback: reg.on_cancel,
                    error: error.clone(),
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// The server revoked listens at or below `path`; tears the affected
    /// views down and reports permission-denied to their registrations.
    pub fn apply_listen_revoked(&mut self, path: &Path) -> Vec<RaisedCancel> {
        let mut affected: Vec<Path> = Vec::new();
        if let Some(subtree) = self.sync_points.subtree(path) {
            subtree.for_each(&mut |rel, _point: &SyncPoint| {
                affected.push(path.append(rel));
            });
        }
        let mut cancels = Vec::new();
        let mut dead: Vec<QuerySpec> = Vec::new();
        for point_path in affected {
            let Some(point) = self.sync_points.get_mut(&point_path) else {
                continue;
            };
            for (query, regs) in point.remove_all_views() {
                dead.push(query);
                for reg in regs {
                    cancels.push(RaisedCancel {
                        callback: reg.on_cancel,
                        error: SyncError::PermissionDenied,
                    });
                }
            }
            self.sync_points.remove(&point_path);
        }
        // Tags are released only after the stop commands are issued.
        self.reconcile_listens();
        for query in &dead {
            self.release_query(query);
        }
        cancels
    }

    /// Keeps a query's data synced without delivering events.
    pub fn keep_synced(&mut self, query: QuerySpec, keep: bool) {
        if keep {
            if self.keep_synced.contains_key(&query) {
                return;
            }
            let registration = EventRegistration::silent();
            let id = registration.id;
            self.add_event_registration(query.clone(), registration);
            self.keep_synced.insert(query, id);
        } else if let Some(id) = self.keep_synced.remove(&query) {
            self.remove_event_registration(&query, Some(id), None);
        }
    }

    // ---- reads ----------------------------------------------------------

    /// The locally-visible value at `path`: server state with pending
    /// writes applied. `None` when no complete server value is known and
    /// the overlay does not fully cover the path.
    pub fn calc_complete_event_cache(
        &self,
        path: &Path,
        exclude_write_ids: &[u64],
    ) -> Option<Node> {
        let server = self.server_cache_at(path);
        self.pending
            .calc_complete_event_cache(path, server.as_ref(), exclude_write_ids, true)
    }

    /// The complete server-side value at `path`, from the nearest view
    /// whose cache covers it.
    pub fn server_cache_at(&self, path: &Path) -> Option<Node> {
        let mut current = &self.sync_points;
        let mut best: Option<Node> = None;
        let mut walked = Path::root();
        // Deepest complete cache wins.
        if let Some(point) = current.value() {
            if let Some(cache) = point.complete_server_cache() {
                best = Some(cache.node.child(path));
            }
        }
        for segment in path.iter() {
            match current.subtree(&Path::from_segments(vec![segment.to_owned()])) {
                Some(child) => current = child,
                None => break,
            }
            walked = walked.child(segment);
            if let Some(point) = current.value() {
                if let Some(cache) = point.complete_server_cache() {
                    let rel = path
                        .relative_to(&walked)
                        .unwrap_or_else(Path::root);
                    best = Some(cache.node.child(&rel));
                }
            }
        }
        best
    }

    /// The node a resubscribe hash should digest for `query`: the view's
    /// complete server cache, or empty when none is known.
    pub fn server_cache_for_listen(&self, query: &QuerySpec) -> Node {
        self.sync_points
            .get(&query.path)
            .and_then(|point| point.view_for(&query.params))
            .map(|view| view.server_cache())
            .filter(|cache| cache.complete)
            .map(|cache| cache.node.clone())
            .unwrap_or_else(Node::empty)
    }

    // ---- internals ------------------------------------------------------

    fn apply_tagged(&mut self, query: &QuerySpec, op: Operation) -> Vec<RaisedEvent> {
        let pending = &self.pending;
        let mut events = Vec::new();
        let mut tracked: Vec<TrackedDelta> = Vec::new();
        if let Some(point) = self.sync_points.get_mut(&query.path) {
            for (view_query, result) in
                point.apply_operation(&op, pending, Some(&query.params))
            {
                events.extend(result.events);
                collect_tracked(&mut tracked, view_query, result.added_keys, result.removed_keys);
            }
        }
        self.flush_tracked(tracked);
        events
    }

    fn apply_operation(&mut self, op: Operation) -> Vec<RaisedEvent> {
        let mut tracked: Vec<TrackedDelta> = Vec::new();
        let events = apply_recursive(
            &mut self.sync_points,
            &op,
            &self.pending,
            &Path::root(),
            &mut tracked,
        );
        self.flush_tracked(tracked);
        events
    }

    fn flush_tracked(&mut self, tracked: Vec<TrackedDelta>) {
        for (query, added, removed) in tracked {
            self.persistence
                .update_tracked_query_keys(&query, &added, &removed);
        }
    }

    fn release_query(&mut self, query: &QuerySpec) {
        if let Some(tag) = self.query_to_tag.remove(query) {
            self.tag_to_query.remove(&tag);
        }
        self.persistence.set_query_inactive(query);
    }

    /// The initial server cache for a new view: the nearest complete cache
    /// at or above the path, else the persisted cache for the query.
    fn initial_cache_for(&self, query: &QuerySpec) -> CacheNode {
        if let Some(node) = self.server_cache_at(&query.path) {
            return CacheNode::complete(node);
        }
        let cached = self.persistence.server_cache_for_query(query);
        CacheNode {
            node: cached.node,
            complete: cached.fully_initialized,
        }
    }

    /// Recomputes the desired listen set and diffs it against the active
    /// set, starting and stopping listens through the provider.
    fn reconcile_listens(&mut self) {
        let mut desired: HashSet<QuerySpec> = HashSet::new();
        collect_desired_listens(&self.sync_points, false, &mut desired);

        let stopped: Vec<QuerySpec> = self
            .active_listens
            .iter()
            .filter(|q| !desired.contains(q))
            .cloned()
            .collect();
        for query in stopped {
            self.active_listens.remove(&query);
            let tag = self.query_to_tag.get(&query).copied();
            debug!(%query, ?tag, "stopping listen");
            self.listen_provider.stop_listen(&query, tag);
        }
        let started: Vec<QuerySpec> = desired
            .into_iter()
            .filter(|q| !self.active_listens.contains(q))
            .collect();
        for query in started {
            let tag = self.query_to_tag.get(&query).copied();
            debug!(%query, ?tag, "starting listen");
            self.listen_provider.start_listen(&query, tag);
            self.active_listens.insert(query);
        }
    }
}

fn collect_tracked(
    tracked: &mut Vec<TrackedDelta>,
    query: QuerySpec,
    added: Vec<String>,
    removed: Vec<String>,
) {
    if query.params.is_default() || (added.is_empty() && removed.is_empty()) {
        return;
    }
    tracked.push((query, added, removed));
}

/// Depth-first walk computing which listens should exist.
///
/// A complete view shadows everything below it; a point with only filtered
/// views listens per view and leaves its descendants unshadowed.
fn collect_desired_listens(
    tree: &PathTree<SyncPoint>,
    shadowed: bool,
    desired: &mut HashSet<QuerySpec>,
) {
    let mut child_shadowed = shadowed;
    if let Some(point) = tree.value() {
        if !shadowed {
            if let Some(view) = point.complete_view() {
                desired.insert(view.query().clone());
            } else {
                for view in point.views() {
                    desired.insert(view.query().clone());
                }
            }
        }
        child_shadowed = shadowed || point.has_complete_view();
    }
    for (_, child) in tree.children() {
        collect_desired_listens(child, child_shadowed, desired);
    }
}

/// Walks an operation down the sync point tree, descendant events first.
fn apply_recursive(
    tree: &mut PathTree<SyncPoint>,
    op: &Operation,
    writes: &WriteTree,
    tree_path: &Path,
    tracked: &mut Vec<TrackedDelta>,
) -> Vec<RaisedEvent> {
    let mut events = Vec::new();
    match op.path().split_front() {
        Some((front, _)) => {
            // Path-scoped: descend only along the operation's path.
            let front = front.to_owned();
            if let Some(child_op) = op.for_child(&front) {
                if let Some(child) = tree.child_mut(&front) {
                    events.extend(apply_recursive(
                        child,
                        &child_op,
                        writes,
                        &tree_path.child(&front),
                        tracked,
                    ));
                }
            }
        }
        None => {
            // The operation lands here: fan out across all descendants.
            let keys: Vec<String> = tree.children().map(|(k, _)| k.to_owned()).collect();
            for key in keys {
                if let Some(child_op) = op.for_child(&key) {
                    if let Some(child) = tree.child_mut(&key) {
                        events.extend(apply_recursive(
                            child,
                            &child_op,
                            writes,
                            &tree_path.child(&key),
                            tracked,
                        ));
                    }
                }
            }
        }
    }
    if let Some(point) = tree.value_mut() {
        for (query, result) in point.apply_operation(op, writes, None) {
            events.extend(result.events);
            collect_tracked(tracked, query, result.added_keys, result.removed_keys);
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DataEventType;
    use crate::persistence::NoopPersistence;
    use parking_lot::Mutex;
    use tidedb_core::QueryParams;

    #[derive(Default)]
    struct RecordingProvider {
        log: Mutex<Vec<String>>,
    }

    impl ListenProvider for RecordingProvider {
        fn start_listen(&self, query: &QuerySpec, tag: Option<u64>) {
            self.log.lock().push(format!("start {query} {tag:?}"));
        }
        fn stop_listen(&self, query: &QuerySpec, tag: Option<u64>) {
            self.log.lock().push(format!("stop {query} {tag:?}"));
        }
    }

    fn tree() -> (SyncTree, Arc<RecordingProvider>) {
        let provider = Arc::new(RecordingProvider::default());
        let tree = SyncTree::new(
            Arc::clone(&provider) as Arc<dyn ListenProvider>,
            Box::new(NoopPersistence),
        );
        (tree, provider)
    }

    fn recording_registration() -> (EventRegistration, Arc<Mutex<Vec<(DataEventType, Option<String>)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_in = Arc::clone(&log);
        let registration = EventRegistration::new(
            Arc::new(move |event| {
                log_in
                    .lock()
                    .push((event.kind, event.child_key.clone()));
            }),
            Arc::new(|_| {}),
        );
        (registration, log)
    }

    #[test]
    fn ancestor_default_view_shadows_descendant_listens() {
        let (mut tree, provider) = tree();
        tree.add_event_registration(
            QuerySpec::default_at(Path::new("/rooms")),
            EventRegistration::silent(),
        );
        tree.add_event_registration(
            QuerySpec::default_at(Path::new("/rooms/a")),
            EventRegistration::silent(),
        );
        let log = provider.log.lock().clone();
        assert_eq!(log, vec!["start /rooms None"]);
    }

    #[test]
    fn removing_shadowing_listener_relistens_descendants() {
        let (mut tree, provider) = tree();
        let parent = EventRegistration::silent();
        let parent_id = parent.id;
        tree.add_event_registration(QuerySpec::default_at(Path::new("/rooms")), parent);
        tree.add_event_registration(
            QuerySpec::default_at(Path::new("/rooms/a")),
            EventRegistration::silent(),
        );
        tree.remove_event_registration(
            &QuerySpec::default_at(Path::new("/rooms")),
            Some(parent_id),
            None,
        );
        let log = provider.log.lock().clone();
        assert_eq!(
            log,
            vec!["start /rooms None", "stop /rooms None", "start /rooms/a None"]
        );
    }

    #[test]
    fn non_default_queries_get_tags() {
        let (mut tree, _provider) = tree();
        let query = QuerySpec::new(
            Path::new("/rooms"),
            QueryParams::default().limit_to_first(5),
        );
        tree.add_event_registration(query.clone(), EventRegistration::silent());
        let tag = tree.tag_for_query(&query).unwrap();
        assert_eq!(tree.query_for_tag(tag), Some(&query));

        tree.remove_event_registration(&query, None, None);
        assert_eq!(tree.tag_for_query(&query), None);
    }

    #[test]
    fn stopping_a_tagged_listen_reports_its_tag() {
        let (mut tree, provider) = tree();
        let query = QuerySpec::new(
            Path::new("/rooms"),
            QueryParams::default().limit_to_first(5),
        );
        tree.add_event_registration(query.clone(), EventRegistration::silent());
        let tag = tree.tag_for_query(&query).unwrap();
        provider.log.lock().clear();

        tree.remove_event_registration(&query, None, None);
        assert_eq!(
            provider.log.lock().clone(),
            vec![format!("stop {query} {:?}", Some(tag))]
        );
    }

    #[test]
    fn revoking_a_tagged_listen_stops_with_its_tag() {
        let (mut tree, provider) = tree();
        let query = QuerySpec::new(
            Path::new("/rooms"),
            QueryParams::default().limit_to_first(5),
        );
        tree.add_event_registration(query.clone(), EventRegistration::silent());
        let tag = tree.tag_for_query(&query).unwrap();
        provider.log.lock().clear();

        tree.apply_listen_revoked(&Path::new("/rooms"));
        assert_eq!(
            provider.log.lock().clone(),
            vec![format!("stop {query} {:?}", Some(tag))]
        );
    }

    #[test]
    fn server_overwrite_reaches_descendant_views_first() {
        let (mut tree, _provider) = tree();
        let (parent_reg, parent_log) = recording_registration();
        let (child_reg, child_log) = recording_registration();
        tree.add_event_registration(QuerySpec::default_at(Path::new("/rooms")), parent_reg);
        tree.add_event_registration(QuerySpec::default_at(Path::new("/rooms/a")), child_reg);

        let events = tree.apply_server_overwrite(
            Path::new("/rooms"),
            Node::from_json(&serde_json::json!({"a": {"name": "x"}})),
        );
        crate::events::raise_events(events);
        assert!(child_log
            .lock()
            .iter()
            .any(|(kind, _)| *kind == DataEventType::Value));
        assert!(parent_log
            .lock()
            .iter()
            .any(|(kind, key)| *kind == DataEventType::ChildAdded
                && key.as_deref() == Some("a")));
    }

    #[test]
    fn user_write_is_visible_then_ack_is_silent() {
        let (mut tree, _provider) = tree();
        let (reg, log) = recording_registration();
        tree.add_event_registration(QuerySpec::default_at(Path::new("/x")), reg);
        tree.apply_server_overwrite(Path::new("/x"), Node::leaf(1.0));

        let events = tree.apply_user_overwrite(Path::new("/x"), Node::leaf(2.0), 1, true);
        crate::events::raise_events(events);
        assert!(log.lock().iter().any(|(k, _)| *k == DataEventType::Value));
        assert_eq!(
            tree.calc_complete_event_cache(&Path::new("/x"), &[]),
            Some(Node::leaf(2.0))
        );

        // Server confirms: same value, no new events.
        log.lock().clear();
        let events = tree.apply_server_overwrite(Path::new("/x"), Node::leaf(2.0));
        crate::events::raise_events(events);
        let events = tree.ack_user_write(1, false);
        crate::events::raise_events(events);
        assert!(log.lock().is_empty());
        assert_eq!(
            tree.calc_complete_event_cache(&Path::new("/x"), &[]),
            Some(Node::leaf(2.0))
        );
    }

    #[test]
    fn reverted_write_rolls_back_to_server_value() {
        let (mut tree, _provider) = tree();
        let (reg, log) = recording_registration();
        tree.add_event_registration(QuerySpec::default_at(Path::new("/x")), reg);
        tree.apply_server_overwrite(Path::new("/x"), Node::leaf(1.0));
        tree.apply_user_overwrite(Path::new("/x"), Node::leaf(2.0), 1, true);

        log.lock().clear();
        let events = tree.ack_user_write(1, true);
        crate::events::raise_events(events);
        assert!(log.lock().iter().any(|(k, _)| *k == DataEventType::Value));
        assert_eq!(
            tree.calc_complete_event_cache(&Path::new("/x"), &[]),
            Some(Node::leaf(1.0))
        );
    }

    #[test]
    fn tagged_update_routes_to_one_view() {
        let (mut tree, _provider) = tree();
        let limited = QuerySpec::new(
            Path::new("/rooms"),
            QueryParams::default().limit_to_first(1),
        );
        let (reg, log) = recording_registration();
        tree.add_event_registration(limited.clone(), reg);
        let tag = tree.tag_for_query(&limited).unwrap();

        let events = tree.apply_tagged_overwrite(
            tag,
            Path::new("/rooms"),
            Node::from_json(&serde_json::json!({"a": 1})),
        );
        crate::events::raise_events(events);
        assert!(log
            .lock()
            .iter()
            .any(|(kind, key)| *kind == DataEventType::ChildAdded
                && key.as_deref() == Some("a")));
        // An unknown tag is dropped without effect.
        assert!(tree
            .apply_tagged_overwrite(999, Path::new("/rooms"), Node::leaf(1.0))
            .is_empty());
    }

    #[test]
    fn listen_revocation_cancels_registrations() {
        let (mut tree, provider) = tree();
        let canceled = Arc::new(Mutex::new(None));
        let canceled_in = Arc::clone(&canceled);
        let registration = EventRegistration::new(
            Arc::new(|_| {}),
            Arc::new(move |err| *canceled_in.lock() = Some(err.clone())),
        );
        tree.add_event_registration(QuerySpec::default_at(Path::new("/secret")), registration);
        provider.log.lock().clear();

        let cancels = tree.apply_listen_revoked(&Path::new("/secret"));
        crate::events::raise_cancels(cancels);
        assert_eq!(*canceled.lock(), Some(SyncError::PermissionDenied));
        assert!(provider.log.lock().iter().any(|l| l.starts_with("stop /secret")));
    }

    #[test]
    fn keep_synced_holds_a_listen_without_events() {
        let (mut tree, provider) = tree();
        let query = QuerySpec::default_at(Path::new("/warm"));
        tree.keep_synced(query.clone(), true);
        assert_eq!(provider.log.lock().clone(), vec!["start /warm None"]);
        tree.keep_synced(query, false);
        assert_eq!(
            provider.log.lock().clone(),
            vec!["start /warm None", "stop /warm None"]
        );
    }

    #[derive(Clone)]
    enum JournaledWrite {
        Overwrite(Path, Node),
        Merge(Path, CompoundWrite),
    }

    /// Journals user writes and the server cache the way a durable layer
    /// would, so a second tree can be rebuilt from it.
    #[derive(Clone, Default)]
    struct SharedJournal {
        user_writes: Arc<Mutex<Vec<(u64, JournaledWrite)>>>,
        server_root: Arc<Mutex<Node>>,
    }

    impl crate::persistence::PersistenceEngine for SharedJournal {
        fn save_user_overwrite(&mut self, path: &Path, node: &Node, write_id: u64) {
            self.user_writes
                .lock()
                .push((write_id, JournaledWrite::Overwrite(path.clone(), node.clone())));
        }
        fn save_user_merge(&mut self, path: &Path, children: &CompoundWrite, write_id: u64) {
            self.user_writes
                .lock()
                .push((write_id, JournaledWrite::Merge(path.clone(), children.clone())));
        }
        fn remove_user_write(&mut self, write_id: u64) {
            self.user_writes.lock().retain(|(id, _)| *id != write_id);
        }
        fn remove_all_user_writes(&mut self) {
            self.user_writes.lock().clear();
        }
        fn update_server_cache(&mut self, path: &Path, node: &Node) {
            let mut root = self.server_root.lock();
            *root = root.update(path, node.clone());
        }
        fn merge_server_cache(&mut self, path: &Path, children: &CompoundWrite) {
            let mut root = self.server_root.lock();
            for (rel, node) in children.entries() {
                let full = path.append(&rel);
                *root = root.update(&full, node.clone());
            }
        }
        fn server_cache_for_query(&self, _query: &QuerySpec) -> crate::persistence::CachedQueryData {
            crate::persistence::CachedQueryData::default()
        }
        fn set_query_active(&mut self, _query: &QuerySpec) {}
        fn set_query_inactive(&mut self, _query: &QuerySpec) {}
        fn set_query_complete(&mut self, _query: &QuerySpec) {}
        fn update_tracked_query_keys(
            &mut self,
            _query: &QuerySpec,
            _added: &[String],
            _removed: &[String],
        ) {
        }
    }

    #[test]
    fn journal_replay_rebuilds_visible_state_after_restart() {
        let journal = SharedJournal::default();
        let path = Path::new("/app");
        let query = QuerySpec::default_at(path.clone());

        let mut live = SyncTree::new(
            Arc::new(RecordingProvider::default()) as Arc<dyn ListenProvider>,
            Box::new(journal.clone()),
        );
        live.add_event_registration(query.clone(), EventRegistration::silent());
        live.apply_server_overwrite(
            path.clone(),
            Node::from_json(&serde_json::json!({"a": 1.0, "b": 2.0})),
        );
        live.apply_user_overwrite(path.child("a"), Node::leaf(10.0), 1, true);
        live.apply_user_merge(
            path.clone(),
            CompoundWrite::from_entries([(Path::new("b"), Node::leaf(20.0))]),
            2,
        );
        live.apply_user_overwrite(path.child("c"), Node::leaf(30.0), 3, true);
        // Write 1 settles before the restart and leaves the journal.
        live.ack_user_write(1, false);
        let expected = live.calc_complete_event_cache(&path, &[]).unwrap();

        let cached_server = journal.server_root.lock().child(&path);
        let surviving: Vec<(u64, JournaledWrite)> = journal.user_writes.lock().clone();

        let (mut restarted, _provider) = tree();
        restarted.add_event_registration(query, EventRegistration::silent());
        restarted.apply_server_overwrite(path.clone(), cached_server);
        for (write_id, write) in surviving {
            match write {
                JournaledWrite::Overwrite(p, node) => {
                    restarted.apply_user_overwrite(p, node, write_id, true);
                }
                JournaledWrite::Merge(p, children) => {
                    restarted.apply_user_merge(p, children, write_id);
                }
            }
        }
        assert_eq!(restarted.calc_complete_event_cache(&path, &[]), Some(expected));
    }
}
