//! A set of writes at distinct paths, applied as one unit.
//!
//! A write at an ancestor path shadows anything below it: adding a write at
//! `/a` discards recorded writes under `/a/...`, and adding a write below an
//! existing ancestor write folds it into that node instead.

use crate::node::Node;
use crate::path::Path;
use crate::tree::PathTree;
use std::collections::BTreeMap;

/// An immutable collection of path-disjoint overwrites.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompoundWrite {
    writes: PathTree<Node>,
}

impl CompoundWrite {
    /// The empty write set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a write set from immediate children of the root.
    pub fn from_children(map: BTreeMap<String, Node>) -> Self {
        let mut write = Self::empty();
        for (key, node) in map {
            write = write.add_write(&Path::new(&key), node);
        }
        write
    }

    /// Builds a write set from `(path, node)` pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (Path, Node)>) -> Self {
        let mut write = Self::empty();
        for (path, node) in entries {
            write = write.add_write(&path, node);
        }
        write
    }

    /// True when no writes are recorded.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Returns a new write set with `node` written at `path`.
    pub fn add_write(&self, path: &Path, node: Node) -> CompoundWrite {
        let mut writes = self.writes.clone();
        if let Some((ancestor, existing)) = writes.find_root_most(path) {
            let relative = path.relative_to(&ancestor).unwrap_or_else(Path::root);
            let merged = existing.update(&relative, node);
            writes.set(&ancestor, merged);
        } else {
            // Replace anything previously recorded below this path.
            writes.set_subtree(path, PathTree::leaf(node));
        }
        CompoundWrite { writes }
    }

    /// Returns a new write set with every entry of `other` added on top.
    pub fn add_writes(&self, at: &Path, other: &CompoundWrite) -> CompoundWrite {
        let mut result = self.clone();
        for (path, node) in other.entries() {
            result = result.add_write(&at.append(&path), node.clone());
        }
        result
    }

    /// Removes the write rooted exactly at `path`.
    ///
    /// Removing inside an ancestor write is a programming error; release
    /// builds leave the set unchanged.
    pub fn remove_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return CompoundWrite::empty();
        }
        debug_assert!(
            self.writes
                .find_root_most(path)
                .map(|(p, _)| p == *path)
                .unwrap_or(true),
            "cannot remove a write inside an ancestor write"
        );
        let mut writes = self.writes.clone();
        writes.remove_subtree(path);
        CompoundWrite { writes }
    }

    /// True when the set contains a write covering `path` completely.
    pub fn has_complete_write(&self, path: &Path) -> bool {
        self.complete_node(path).is_some()
    }

    /// The fully-written node at `path`, if an ancestor write covers it.
    pub fn complete_node(&self, path: &Path) -> Option<Node> {
        self.writes.find_root_most(path).map(|(ancestor, node)| {
            let relative = path.relative_to(&ancestor).unwrap_or_else(Path::root);
            node.child(&relative)
        })
    }

    /// The root write, if the whole tree is overwritten.
    pub fn root_write(&self) -> Option<&Node> {
        self.writes.value()
    }

    /// The write set scoped to children of `path`.
    pub fn child_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return self.clone();
        }
        match self.complete_node(path) {
            Some(node) => CompoundWrite {
                writes: PathTree::leaf(node),
            },
            None => CompoundWrite {
                writes: self
                    .writes
                    .subtree(path)
                    .cloned()
                    .unwrap_or_default(),
            },
        }
    }

    /// Applies every write to `node`, shallowest first.
    pub fn apply(&self, node: &Node) -> Node {
        let mut result = node.clone();
        self.writes.for_each(&mut |path, write| {
            result = result.update(path, write.clone());
        });
        result
    }

    /// Every `(path, node)` entry, shallowest first.
    pub fn entries(&self) -> Vec<(Path, &Node)> {
        self.writes.entries()
    }

    /// Immediate child keys that this write set touches.
    pub fn touched_children(&self) -> Vec<String> {
        if self.writes.value().is_some() {
            return Vec::new();
        }
        self.writes.children().map(|(k, _)| k.to_owned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_shallow_and_deep() {
        let write = CompoundWrite::empty()
            .add_write(&Path::new("/a/b"), Node::leaf(1.0))
            .add_write(&Path::new("/c"), Node::leaf("x"));
        let result = write.apply(&Node::Empty);
        assert_eq!(result.child(&Path::new("/a/b")), Node::leaf(1.0));
        assert_eq!(result.child(&Path::new("/c")), Node::leaf("x"));
    }

    #[test]
    fn ancestor_write_shadows_descendants() {
        let write = CompoundWrite::empty()
            .add_write(&Path::new("/a/b"), Node::leaf(1.0))
            .add_write(&Path::new("/a"), Node::leaf(9.0));
        // The /a write replaced the /a/b write entirely.
        assert_eq!(write.apply(&Node::Empty), {
            Node::Empty.update(&Path::new("/a"), Node::leaf(9.0))
        });
        assert_eq!(write.entries().len(), 1);
    }

    #[test]
    fn descendant_write_folds_into_ancestor() {
        let write = CompoundWrite::empty()
            .add_write(&Path::new("/a"), Node::leaf(9.0))
            .add_write(&Path::new("/a/b"), Node::leaf(1.0));
        assert_eq!(
            write.complete_node(&Path::new("/a/b")),
            Some(Node::leaf(1.0))
        );
        // Still one root-level entry.
        assert_eq!(write.entries().len(), 1);
    }

    #[test]
    fn complete_node_via_ancestor() {
        let node = Node::Empty.update(&Path::new("/x/y"), Node::leaf(5.0));
        let write = CompoundWrite::empty().add_write(&Path::new("/a"), node);
        assert_eq!(
            write.complete_node(&Path::new("/a/x/y")),
            Some(Node::leaf(5.0))
        );
        assert!(write.complete_node(&Path::new("/b")).is_none());
        assert!(write.has_complete_write(&Path::new("/a/anything")));
    }

    #[test]
    fn child_write_scoping() {
        let write = CompoundWrite::empty()
            .add_write(&Path::new("/a/b"), Node::leaf(1.0))
            .add_write(&Path::new("/c"), Node::leaf(2.0));
        let scoped = write.child_write(&Path::new("/a"));
        assert_eq!(scoped.complete_node(&Path::new("/b")), Some(Node::leaf(1.0)));
        assert!(scoped.complete_node(&Path::new("/c")).is_none());
    }

    #[test]
    fn remove_write() {
        let write = CompoundWrite::empty()
            .add_write(&Path::new("/a"), Node::leaf(1.0))
            .add_write(&Path::new("/b"), Node::leaf(2.0));
        let removed = write.remove_write(&Path::new("/a"));
        assert!(!removed.has_complete_write(&Path::new("/a")));
        assert!(removed.has_complete_write(&Path::new("/b")));
    }

    #[test]
    fn from_children_builds_root_level_writes() {
        let mut map = BTreeMap::new();
        map.insert("a".to_owned(), Node::leaf(1.0));
        map.insert("b".to_owned(), Node::leaf(2.0));
        let write = CompoundWrite::from_children(map);
        assert_eq!(write.touched_children(), vec!["a", "b"]);
    }
}
