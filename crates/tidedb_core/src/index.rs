//! Ordering indexes over child nodes.
//!
//! An [`Index`] selects the value a query orders by: the child's priority,
//! its key, its own value, or the value at a fixed sub-path.

use crate::node::{Node, Scalar};
use crate::path::Path;
use std::cmp::Ordering;

/// Compares two child keys, numeric keys first.
///
/// Keys that parse as integers order numerically before all other keys,
/// which order lexicographically.
pub fn compare_child_keys(a: &str, b: &str) -> Ordering {
    match (parse_int_key(a), parse_int_key(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn parse_int_key(key: &str) -> Option<i64> {
    let digits = key.strip_prefix('-').unwrap_or(key);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Reject leading zeros so each integer has one canonical spelling.
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    key.parse().ok()
}

/// Compares two nodes by value rank: empty, then leaves by scalar order,
/// then children collections (which compare equal among themselves and are
/// tie-broken by key at the call site).
pub fn compare_nodes(a: &Node, b: &Node) -> Ordering {
    fn rank(n: &Node) -> u8 {
        match n {
            Node::Empty => 0,
            Node::Leaf {
                value: Scalar::Bool(_),
                ..
            } => 1,
            Node::Leaf {
                value: Scalar::Number(_),
                ..
            } => 2,
            Node::Leaf {
                value: Scalar::String(_),
                ..
            } => 3,
            Node::Children { .. } => 4,
        }
    }
    match (a, b) {
        (Node::Leaf { value: va, .. }, Node::Leaf { value: vb, .. }) => va.cmp(vb),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// The value a query orders children by.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Index {
    /// Order by each child's priority (the default).
    Priority,
    /// Order by child key.
    Key,
    /// Order by each child's own value.
    Value,
    /// Order by the value at a sub-path of each child.
    Child(Path),
}

impl Index {
    /// The indexed value for a child, expressed as a node.
    pub fn value_for(&self, key: &str, node: &Node) -> Node {
        match self {
            Index::Priority => node
                .priority()
                .map(|p| Node::leaf(p.clone()))
                .unwrap_or(Node::Empty),
            Index::Key => Node::leaf(key),
            Index::Value => node.clone(),
            Index::Child(path) => node.child(path),
        }
    }

    /// Total order over `(key, node)` pairs under this index, with key
    /// tie-break.
    pub fn compare(&self, a_key: &str, a: &Node, b_key: &str, b: &Node) -> Ordering {
        if matches!(self, Index::Key) {
            return compare_child_keys(a_key, b_key);
        }
        compare_nodes(&self.value_for(a_key, a), &self.value_for(b_key, b))
            .then_with(|| compare_child_keys(a_key, b_key))
    }

    /// The wire identifier for this index, or `None` for the default
    /// priority index (omitted on the wire).
    pub fn wire_id(&self) -> Option<String> {
        match self {
            Index::Priority => None,
            Index::Key => Some(".key".to_owned()),
            Index::Value => Some(".value".to_owned()),
            Index::Child(path) => Some(path.iter().collect::<Vec<_>>().join("/")),
        }
    }

    /// Parses a wire identifier back into an index.
    pub fn from_wire_id(id: &str) -> Index {
        match id {
            ".key" => Index::Key,
            ".value" => Index::Value,
            ".priority" => Index::Priority,
            other => Index::Child(Path::new(other)),
        }
    }
}

impl Default for Index {
    fn default() -> Self {
        Index::Priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_keys_sort_first() {
        assert_eq!(compare_child_keys("2", "10"), Ordering::Less);
        assert_eq!(compare_child_keys("10", "apple"), Ordering::Less);
        assert_eq!(compare_child_keys("apple", "banana"), Ordering::Less);
        assert_eq!(compare_child_keys("007", "7"), Ordering::Greater); // not canonical int
        assert_eq!(compare_child_keys("a", "a"), Ordering::Equal);
    }

    #[test]
    fn value_index_orders_by_node() {
        let idx = Index::Value;
        assert_eq!(
            idx.compare("a", &Node::leaf(1.0), "b", &Node::leaf(2.0)),
            Ordering::Less
        );
        // Equal values fall back to key order.
        assert_eq!(
            idx.compare("b", &Node::leaf(1.0), "a", &Node::leaf(1.0)),
            Ordering::Greater
        );
    }

    #[test]
    fn child_index_reads_sub_path() {
        let idx = Index::Child(Path::new("/name"));
        let a = Node::empty().update(&Path::new("/name"), Node::leaf("x"));
        let b = Node::empty().update(&Path::new("/name"), Node::leaf("y"));
        assert_eq!(idx.compare("k1", &a, "k2", &b), Ordering::Less);
    }

    #[test]
    fn priority_index_missing_sorts_first() {
        let idx = Index::Priority;
        let plain = Node::leaf("v");
        let prioritized = Node::leaf_with_priority("v", 1.0);
        assert_eq!(idx.compare("a", &plain, "b", &prioritized), Ordering::Less);
    }

    #[test]
    fn wire_ids() {
        assert_eq!(Index::Priority.wire_id(), None);
        assert_eq!(Index::Key.wire_id().as_deref(), Some(".key"));
        assert_eq!(
            Index::Child(Path::new("/a/b")).wire_id().as_deref(),
            Some("a/b")
        );
        assert_eq!(Index::from_wire_id("a/b"), Index::Child(Path::new("/a/b")));
    }
}
