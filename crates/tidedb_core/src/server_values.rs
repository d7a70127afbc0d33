//! Deferred-value placeholders and their resolution.
//!
//! A client may write `{".sv": "timestamp"}` or
//! `{".sv": {"increment": n}}` instead of a concrete value. Placeholders are
//! resolved at write time against the server clock estimate and the value
//! currently visible at the written location.

use crate::compound_write::CompoundWrite;
use crate::node::{Node, Scalar};
use crate::path::Path;

const SERVER_VALUE_KEY: &str = ".sv";

/// Supplies the currently-visible node at a path, for increment resolution.
///
/// Implemented over a synced snapshot or over a lazily-computed sync-tree
/// value; resolution never needs more than the node at the written location.
pub trait SnapshotSource {
    /// The visible node at `path`, or empty if unknown.
    fn node_at(&self, path: &Path) -> Node;
}

/// A [`SnapshotSource`] over a single already-materialized node.
pub struct SyncedSource<'a> {
    root: &'a Node,
}

impl<'a> SyncedSource<'a> {
    /// Wraps a snapshot rooted at the resolution root.
    pub fn new(root: &'a Node) -> Self {
        Self { root }
    }
}

impl SnapshotSource for SyncedSource<'_> {
    fn node_at(&self, path: &Path) -> Node {
        self.root.child(path)
    }
}

/// The `{".sv": "timestamp"}` placeholder node.
pub fn server_timestamp() -> Node {
    let mut map = std::collections::BTreeMap::new();
    map.insert(SERVER_VALUE_KEY.to_owned(), Node::leaf("timestamp"));
    Node::children(map)
}

/// The `{".sv": {"increment": by}}` placeholder node.
pub fn increment(by: f64) -> Node {
    let mut inner = std::collections::BTreeMap::new();
    inner.insert("increment".to_owned(), Node::leaf(by));
    let mut map = std::collections::BTreeMap::new();
    map.insert(SERVER_VALUE_KEY.to_owned(), Node::children(inner));
    Node::children(map)
}

/// True when `node` is a deferred-value placeholder.
pub fn is_deferred_value(node: &Node) -> bool {
    node.has_child(SERVER_VALUE_KEY) && node.num_children() == 1
}

/// Resolves every placeholder in `node`.
///
/// `path` locates `node` relative to the source's root; `now_ms` is the
/// estimated server time in milliseconds.
pub fn resolve_deferred_node(
    node: &Node,
    source: &dyn SnapshotSource,
    path: &Path,
    now_ms: f64,
) -> Node {
    if is_deferred_value(node) {
        return resolve_placeholder(&node.immediate_child(SERVER_VALUE_KEY), source, path, now_ms);
    }
    match node {
        Node::Children { .. } => {
            let mut result = node.clone();
            for (key, child) in node.children_iter() {
                let resolved =
                    resolve_deferred_node(child, source, &path.child(key), now_ms);
                if &resolved != child {
                    result = result.update_immediate_child(key, resolved);
                }
            }
            result
        }
        _ => node.clone(),
    }
}

fn resolve_placeholder(
    sv: &Node,
    source: &dyn SnapshotSource,
    path: &Path,
    now_ms: f64,
) -> Node {
    if sv.value().and_then(Scalar::as_str) == Some("timestamp") {
        return Node::leaf(now_ms);
    }
    if let Some(delta) = sv.immediate_child("increment").value().and_then(Scalar::as_number) {
        let existing = source
            .node_at(path)
            .value()
            .and_then(Scalar::as_number)
            .unwrap_or(0.0);
        return Node::leaf(existing + delta);
    }
    // Unknown placeholder kinds pass through unresolved.
    let mut map = std::collections::BTreeMap::new();
    map.insert(SERVER_VALUE_KEY.to_owned(), sv.clone());
    Node::children(map)
}

/// Resolves every placeholder inside a compound write.
pub fn resolve_deferred_compound_write(
    write: &CompoundWrite,
    source: &dyn SnapshotSource,
    at: &Path,
    now_ms: f64,
) -> CompoundWrite {
    CompoundWrite::from_entries(write.entries().into_iter().map(|(path, node)| {
        let absolute = at.append(&path);
        (
            path.clone(),
            resolve_deferred_node(node, source, &absolute, now_ms),
        )
    }))
}
