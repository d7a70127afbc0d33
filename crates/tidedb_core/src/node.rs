//! Immutable tree values.
//!
//! A [`Node`] is the value at one location in the hierarchy: either empty, a
//! leaf scalar, or an ordered collection of child nodes. Nodes are plain
//! values with structural equality; every mutation produces a new node.

use crate::path::Path;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Key used in exported JSON to carry a leaf value alongside its priority.
const VALUE_KEY: &str = ".value";
/// Key used in exported JSON to carry a node's priority.
const PRIORITY_KEY: &str = ".priority";

/// A leaf scalar value.
#[derive(Clone, Debug)]
pub enum Scalar {
    /// Boolean.
    Bool(bool),
    /// Double-precision number. Integers are represented exactly up to 2^53.
    Number(f64),
    /// UTF-8 string.
    String(String),
}

impl Scalar {
    fn type_rank(&self) -> u8 {
        match self {
            Scalar::Bool(_) => 0,
            Scalar::Number(_) => 1,
            Scalar::String(_) => 2,
        }
    }

    /// Returns the numeric value, if this scalar is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string value, if this scalar is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scalar {}

// Ordering follows leaf-type rank: booleans sort before numbers, numbers
// before strings. Numbers use IEEE total order so the relation stays
// consistent with Eq and Hash.
impl Ord for Scalar {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            (Scalar::Number(a), Scalar::Number(b)) => a.total_cmp(b),
            (Scalar::String(a), Scalar::String(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Scalar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Scalar::Bool(b) => {
                0u8.hash(state);
                b.hash(state);
            }
            Scalar::Number(n) => {
                1u8.hash(state);
                n.to_bits().hash(state);
            }
            Scalar::String(s) => {
                2u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Number(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Number(v as f64)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::String(v.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::String(v)
    }
}

/// An immutable value at one location in the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// No value.
    Empty,
    /// A scalar with an optional priority.
    Leaf {
        /// The scalar value.
        value: Scalar,
        /// Ordering priority, if one was written.
        priority: Option<Scalar>,
    },
    /// A non-empty collection of named children with an optional priority.
    Children {
        /// Child nodes by key. Never contains empty nodes.
        children: BTreeMap<String, Node>,
        /// Ordering priority, if one was written.
        priority: Option<Scalar>,
    },
}

impl Default for Node {
    fn default() -> Self {
        Node::Empty
    }
}

impl Node {
    /// The empty node.
    pub fn empty() -> Self {
        Node::Empty
    }

    /// A leaf node without priority.
    pub fn leaf(value: impl Into<Scalar>) -> Self {
        Node::Leaf {
            value: value.into(),
            priority: None,
        }
    }

    /// A leaf node with a priority.
    pub fn leaf_with_priority(value: impl Into<Scalar>, priority: impl Into<Scalar>) -> Self {
        Node::Leaf {
            value: value.into(),
            priority: Some(priority.into()),
        }
    }

    /// Builds a children node, normalizing away empty children.
    ///
    /// An empty map collapses to [`Node::Empty`].
    pub fn children(map: BTreeMap<String, Node>) -> Self {
        let children: BTreeMap<String, Node> =
            map.into_iter().filter(|(_, n)| !n.is_empty()).collect();
        if children.is_empty() {
            Node::Empty
        } else {
            Node::Children {
                children,
                priority: None,
            }
        }
    }

    /// True for the empty node.
    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Empty)
    }

    /// True for leaf nodes.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    /// The node's priority, if any.
    pub fn priority(&self) -> Option<&Scalar> {
        match self {
            Node::Empty => None,
            Node::Leaf { priority, .. } | Node::Children { priority, .. } => priority.as_ref(),
        }
    }

    /// Returns this node with a different priority. Empty stays empty.
    pub fn with_priority(&self, priority: Option<Scalar>) -> Node {
        match self {
            Node::Empty => Node::Empty,
            Node::Leaf { value, .. } => Node::Leaf {
                value: value.clone(),
                priority,
            },
            Node::Children { children, .. } => Node::Children {
                children: children.clone(),
                priority,
            },
        }
    }

    /// The leaf scalar, if this node is a leaf.
    pub fn value(&self) -> Option<&Scalar> {
        match self {
            Node::Leaf { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Number of immediate children.
    pub fn num_children(&self) -> usize {
        match self {
            Node::Children { children, .. } => children.len(),
            _ => 0,
        }
    }

    /// Iterates over immediate children in key order.
    pub fn children_iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        static EMPTY: BTreeMap<String, Node> = BTreeMap::new();
        let map = match self {
            Node::Children { children, .. } => children,
            _ => &EMPTY,
        };
        map.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The immediate child under `key`, or empty.
    pub fn immediate_child(&self, key: &str) -> Node {
        match self {
            Node::Children { children, .. } => {
                children.get(key).cloned().unwrap_or(Node::Empty)
            }
            _ => Node::Empty,
        }
    }

    /// Whether the immediate child under `key` is non-empty.
    pub fn has_child(&self, key: &str) -> bool {
        match self {
            Node::Children { children, .. } => children.contains_key(key),
            _ => false,
        }
    }

    /// The node at `path` below this one, or empty.
    pub fn child(&self, path: &Path) -> Node {
        match path.split_front() {
            None => self.clone(),
            Some((head, rest)) => self.immediate_child(head).child(&rest),
        }
    }

    /// Replaces the immediate child under `key`, returning the new node.
    ///
    /// Writing an empty child removes it; a children node whose last child is
    /// removed collapses to empty. Replacing a child of a leaf discards the
    /// leaf value.
    pub fn update_immediate_child(&self, key: &str, child: Node) -> Node {
        let (mut children, priority) = match self {
            Node::Children { children, priority } => (children.clone(), priority.clone()),
            _ => (BTreeMap::new(), None),
        };
        if child.is_empty() {
            children.remove(key);
        } else {
            children.insert(key.to_owned(), child);
        }
        if children.is_empty() {
            Node::Empty
        } else {
            Node::Children { children, priority }
        }
    }

    /// Replaces the node at `path` below this one, returning the new node.
    pub fn update(&self, path: &Path, node: Node) -> Node {
        match path.split_front() {
            None => node,
            Some((head, rest)) => {
                let updated = self.immediate_child(head).update(&rest, node);
                self.update_immediate_child(head, updated)
            }
        }
    }

    /// Converts a JSON value into a node.
    ///
    /// Objects may carry `".value"` and `".priority"` entries in the export
    /// form; `null` becomes the empty node.
    pub fn from_json(value: &serde_json::Value) -> Node {
        match value {
            serde_json::Value::Null => Node::Empty,
            serde_json::Value::Bool(b) => Node::leaf(*b),
            serde_json::Value::Number(n) => Node::leaf(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Node::leaf(s.as_str()),
            serde_json::Value::Array(items) => {
                // Arrays arrive as objects keyed by index.
                let map = items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), Node::from_json(v)))
                    .collect();
                Node::children(map)
            }
            serde_json::Value::Object(obj) => {
                let priority = obj.get(PRIORITY_KEY).and_then(scalar_from_json);
                if let Some(value) = obj.get(VALUE_KEY) {
                    return Node::from_json(value).with_priority(priority);
                }
                let map = obj
                    .iter()
                    .filter(|(k, _)| !k.starts_with('.') || k.as_str() == ".sv")
                    .map(|(k, v)| (k.clone(), Node::from_json(v)))
                    .collect();
                Node::children(map).with_priority(priority)
            }
        }
    }

    /// Converts this node to JSON.
    ///
    /// With `export` set, priorities are included using the
    /// `".value"`/`".priority"` form.
    pub fn to_json(&self, export: bool) -> serde_json::Value {
        match self {
            Node::Empty => serde_json::Value::Null,
            Node::Leaf { value, priority } => {
                let v = scalar_to_json(value);
                match (export, priority) {
                    (true, Some(p)) => serde_json::json!({
                        VALUE_KEY: v,
                        PRIORITY_KEY: scalar_to_json(p),
                    }),
                    _ => v,
                }
            }
            Node::Children { children, priority } => {
                let mut obj = serde_json::Map::new();
                for (k, v) in children {
                    obj.insert(k.clone(), v.to_json(export));
                }
                if export {
                    if let Some(p) = priority {
                        obj.insert(PRIORITY_KEY.to_owned(), scalar_to_json(p));
                    }
                }
                serde_json::Value::Object(obj)
            }
        }
    }
}

fn scalar_from_json(value: &serde_json::Value) -> Option<Scalar> {
    match value {
        serde_json::Value::Bool(b) => Some(Scalar::Bool(*b)),
        serde_json::Value::Number(n) => n.as_f64().map(Scalar::Number),
        serde_json::Value::String(s) => Some(Scalar::String(s.clone())),
        _ => None,
    }
}

fn scalar_to_json(scalar: &Scalar) -> serde_json::Value {
    match scalar {
        Scalar::Bool(b) => serde_json::Value::Bool(*b),
        Scalar::Number(n) => {
            // Integral doubles serialize as integers.
            if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                serde_json::json!(*n as i64)
            } else {
                serde_json::json!(*n)
            }
        }
        Scalar::String(s) => serde_json::Value::String(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_the_empty_node() {
        assert_eq!(Node::default(), Node::Empty);
        assert!(Node::default().is_empty());
    }

    #[test]
    fn scalar_ordering() {
        assert!(Scalar::Bool(false) < Scalar::Bool(true));
        assert!(Scalar::Bool(true) < Scalar::Number(0.0));
        assert!(Scalar::Number(1.5) < Scalar::Number(2.0));
        assert!(Scalar::Number(100.0) < Scalar::String("a".into()));
        assert!(Scalar::String("a".into()) < Scalar::String("b".into()));
    }

    #[test]
    fn update_and_child() {
        let node = Node::empty()
            .update(&Path::new("/a/b"), Node::leaf(1.0))
            .update(&Path::new("/a/c"), Node::leaf("x"));
        assert_eq!(node.child(&Path::new("/a/b")), Node::leaf(1.0));
        assert_eq!(node.child(&Path::new("/a/c")), Node::leaf("x"));
        assert_eq!(node.child(&Path::new("/missing")), Node::Empty);
        assert_eq!(node.num_children(), 1);
        assert_eq!(node.immediate_child("a").num_children(), 2);
    }

    #[test]
    fn removing_last_child_collapses_to_empty() {
        let node = Node::empty().update(&Path::new("/a/b"), Node::leaf(1.0));
        let node = node.update(&Path::new("/a/b"), Node::Empty);
        assert!(node.is_empty());
    }

    #[test]
    fn leaf_overwritten_by_deep_update() {
        let node = Node::leaf("scalar").update(&Path::new("/k"), Node::leaf(2.0));
        assert!(!node.is_leaf());
        assert_eq!(node.immediate_child("k"), Node::leaf(2.0));
    }

    #[test]
    fn json_round_trip() {
        let json = serde_json::json!({"a": {"b": 1, "c": "x"}, "d": true});
        let node = Node::from_json(&json);
        assert_eq!(node.to_json(false), json);
        assert_eq!(node.child(&Path::new("/a/b")), Node::leaf(1.0));
    }

    #[test]
    fn json_export_includes_priority() {
        let node = Node::leaf_with_priority("v", 3.0);
        let json = node.to_json(true);
        assert_eq!(json[".value"], "v");
        assert_eq!(json[".priority"], 3);
        assert_eq!(Node::from_json(&json), node);
    }

    #[test]
    fn null_is_empty() {
        assert!(Node::from_json(&serde_json::Value::Null).is_empty());
        assert_eq!(Node::Empty.to_json(false), serde_json::Value::Null);
    }
}
