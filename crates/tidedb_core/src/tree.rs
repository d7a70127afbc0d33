//! A path-keyed tree with optional values at interior locations.
//!
//! Used for the pending-write overlay, the sync-point index, and the
//! transaction queue tree. Mutation happens only inside the engine's serial
//! context, so plain `&mut` access replaces the reference-counted graph of
//! the classic design.

use crate::path::Path;
use std::collections::BTreeMap;

/// A tree keyed by path segments, holding an optional value per location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathTree<T> {
    value: Option<T>,
    children: BTreeMap<String, PathTree<T>>,
}

impl<T> Default for PathTree<T> {
    fn default() -> Self {
        Self {
            value: None,
            children: BTreeMap::new(),
        }
    }
}

impl<T> PathTree<T> {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// A tree with a single value at the root.
    pub fn leaf(value: T) -> Self {
        Self {
            value: Some(value),
            children: BTreeMap::new(),
        }
    }

    /// True when the tree holds no values anywhere.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// The value at the root of this tree.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Mutable value at the root of this tree.
    pub fn value_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    /// Sets the value at the root of this tree.
    pub fn set_value(&mut self, value: Option<T>) {
        self.value = value;
    }

    /// The value at `path`, if any.
    pub fn get(&self, path: &Path) -> Option<&T> {
        self.subtree(path).and_then(|t| t.value.as_ref())
    }

    /// Mutable access to the value at `path`.
    pub fn get_mut(&mut self, path: &Path) -> Option<&mut T> {
        match path.split_front() {
            None => self.value.as_mut(),
            Some((head, rest)) => self.children.get_mut(head).and_then(|c| c.get_mut(&rest)),
        }
    }

    /// Mutable access to an immediate child, without creating it.
    pub fn child_mut(&mut self, key: &str) -> Option<&mut PathTree<T>> {
        self.children.get_mut(key)
    }

    /// The subtree rooted at `path`, if it exists.
    pub fn subtree(&self, path: &Path) -> Option<&PathTree<T>> {
        match path.split_front() {
            None => Some(self),
            Some((head, rest)) => self.children.get(head).and_then(|c| c.subtree(&rest)),
        }
    }

    /// Mutable subtree rooted at `path`, created on demand.
    pub fn subtree_mut(&mut self, path: &Path) -> &mut PathTree<T> {
        match path.split_front() {
            None => self,
            Some((head, rest)) => self
                .children
                .entry(head.to_owned())
                .or_default()
                .subtree_mut(&rest),
        }
    }

    /// Sets the value at `path`, creating intermediate nodes.
    pub fn set(&mut self, path: &Path, value: T) {
        self.subtree_mut(path).value = Some(value);
    }

    /// Removes the value at `path`, pruning now-empty branches.
    pub fn remove(&mut self, path: &Path) -> Option<T> {
        match path.split_front() {
            None => self.value.take(),
            Some((head, rest)) => {
                let child = self.children.get_mut(head)?;
                let removed = child.remove(&rest);
                if child.is_empty() {
                    self.children.remove(head);
                }
                removed
            }
        }
    }

    /// Removes and returns the entire subtree at `path`.
    pub fn remove_subtree(&mut self, path: &Path) -> Option<PathTree<T>> {
        match path.split_front() {
            None => {
                if self.is_empty() {
                    None
                } else {
                    Some(std::mem::take(self))
                }
            }
            Some((head, rest)) => {
                if rest.is_empty() {
                    self.children.remove(head)
                } else {
                    let child = self.children.get_mut(head)?;
                    let removed = child.remove_subtree(&rest);
                    if child.is_empty() {
                        self.children.remove(head);
                    }
                    removed
                }
            }
        }
    }

    /// Replaces the subtree at `path`.
    pub fn set_subtree(&mut self, path: &Path, subtree: PathTree<T>) {
        match path.split_front() {
            None => *self = subtree,
            Some((head, rest)) => {
                if rest.is_empty() && subtree.is_empty() {
                    self.children.remove(head);
                } else {
                    self.children
                        .entry(head.to_owned())
                        .or_default()
                        .set_subtree(&rest, subtree);
                }
            }
        }
    }

    /// Iterates over immediate child subtrees in key order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &PathTree<T>)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The value at the shallowest location on `path` holding one,
    /// together with that location.
    pub fn find_root_most(&self, path: &Path) -> Option<(Path, &T)> {
        self.find_root_most_inner(path, Path::root())
    }

    fn find_root_most_inner(&self, path: &Path, here: Path) -> Option<(Path, &T)> {
        if let Some(v) = &self.value {
            return Some((here, v));
        }
        let (head, rest) = path.split_front()?;
        self.children
            .get(head)?
            .find_root_most_inner(&rest, here.child(head))
    }

    /// Calls `f` for every value in the tree with its absolute path,
    /// shallowest first. Value references borrow from the tree, so they
    /// may be collected past the closure call.
    pub fn for_each<'s>(&'s self, f: &mut impl FnMut(&Path, &'s T)) {
        self.for_each_inner(&Path::root(), f);
    }

    fn for_each_inner<'s>(&'s self, here: &Path, f: &mut impl FnMut(&Path, &'s T)) {
        if let Some(v) = &self.value {
            f(here, v);
        }
        for (key, child) in &self.children {
            child.for_each_inner(&here.child(key), f);
        }
    }

    /// Folds the tree depth-first (children before the local value).
    pub fn fold_deepest_first<R>(&self, f: &mut impl FnMut(&Path, Option<&T>, Vec<R>) -> R) -> R {
        self.fold_inner(&Path::root(), f)
    }

    fn fold_inner<R>(
        &self,
        here: &Path,
        f: &mut impl FnMut(&Path, Option<&T>, Vec<R>) -> R,
    ) -> R {
        let child_results = self
            .children
            .iter()
            .map(|(key, child)| child.fold_inner(&here.child(key), f))
            .collect();
        f(here, self.value.as_ref(), child_results)
    }

    /// True if any value in the tree satisfies the predicate.
    pub fn any(&self, pred: &impl Fn(&T) -> bool) -> bool {
        if let Some(v) = &self.value {
            if pred(v) {
                return true;
            }
        }
        self.children.values().any(|c| c.any(pred))
    }

    /// Collects every `(path, value)` pair, shallowest first.
    pub fn entries(&self) -> Vec<(Path, &T)> {
        let mut out = Vec::new();
        self.for_each(&mut |path, value| out.push((path.clone(), value)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let mut tree = PathTree::new();
        tree.set(&Path::new("/a/b"), 1);
        tree.set(&Path::new("/a"), 2);
        assert_eq!(tree.get(&Path::new("/a/b")), Some(&1));
        assert_eq!(tree.get(&Path::new("/a")), Some(&2));
        assert_eq!(tree.get(&Path::new("/a/b/c")), None);

        assert_eq!(tree.remove(&Path::new("/a/b")), Some(1));
        assert_eq!(tree.get(&Path::new("/a/b")), None);
        // /a still holds a value, so the branch survives.
        assert_eq!(tree.get(&Path::new("/a")), Some(&2));
        assert_eq!(tree.remove(&Path::new("/a")), Some(2));
        assert!(tree.is_empty());
    }

    #[test]
    fn pruning_on_remove() {
        let mut tree = PathTree::new();
        tree.set(&Path::new("/a/b/c"), 1);
        tree.remove(&Path::new("/a/b/c"));
        assert!(tree.is_empty());
    }

    #[test]
    fn root_most_lookup() {
        let mut tree = PathTree::new();
        tree.set(&Path::new("/a"), 1);
        tree.set(&Path::new("/a/b/c"), 2);
        let (path, value) = tree.find_root_most(&Path::new("/a/b/c/d")).unwrap();
        assert_eq!(path, Path::new("/a"));
        assert_eq!(*value, 1);
        assert!(tree.find_root_most(&Path::new("/x")).is_none());
    }

    #[test]
    fn for_each_visits_all() {
        let mut tree = PathTree::new();
        tree.set(&Path::new("/a"), 1);
        tree.set(&Path::new("/a/b"), 2);
        tree.set(&Path::new("/c"), 3);
        let entries = tree.entries();
        let paths: Vec<String> = entries.iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(paths, vec!["/a", "/a/b", "/c"]);
    }

    #[test]
    fn visited_values_borrow_from_the_tree() {
        let mut tree = PathTree::new();
        tree.set(&Path::new("/a"), String::from("one"));
        tree.set(&Path::new("/b"), String::from("two"));
        // The collected references outlive each closure invocation.
        let mut seen: Vec<&String> = Vec::new();
        tree.for_each(&mut |_, value| seen.push(value));
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[test]
    fn subtree_replacement() {
        let mut tree = PathTree::new();
        tree.set(&Path::new("/a/b"), 1);
        tree.set_subtree(&Path::new("/a"), PathTree::leaf(9));
        assert_eq!(tree.get(&Path::new("/a")), Some(&9));
        assert_eq!(tree.get(&Path::new("/a/b")), None);

        let taken = tree.remove_subtree(&Path::new("/a")).unwrap();
        assert_eq!(taken.value(), Some(&9));
        assert!(tree.is_empty());
    }
}
