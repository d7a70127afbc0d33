//! Slash-delimited paths into the hierarchical data tree.

use std::fmt;
use std::str::FromStr;

/// A location in the hierarchical keyed tree.
///
/// Paths are sequences of non-empty string segments. The empty sequence is
/// the root. Paths are cheap to clone and compare structurally.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// The root path.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parses a path from a slash-delimited string.
    ///
    /// Leading, trailing, and repeated slashes are ignored, so `"/a/b/"`,
    /// `"a/b"` and `"a//b"` all name the same location.
    pub fn new(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Builds a path from pre-split segments.
    pub fn from_segments(segments: Vec<String>) -> Self {
        debug_assert!(segments.iter().all(|s| !s.is_empty()));
        Self { segments }
    }

    /// Returns true if this is the root path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// The first segment, if any.
    pub fn front(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// The last segment, if any.
    pub fn back(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Splits off the first segment, returning it with the remainder.
    pub fn split_front(&self) -> Option<(&str, Path)> {
        self.segments.split_first().map(|(head, rest)| {
            (
                head.as_str(),
                Path {
                    segments: rest.to_vec(),
                },
            )
        })
    }

    /// Returns the path without its first segment. Root stays root.
    pub fn pop_front(&self) -> Path {
        Path {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    /// Returns the parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            None
        } else {
            Some(Path {
                segments: self.segments[..self.segments.len() - 1].to_vec(),
            })
        }
    }

    /// Returns this path extended by one child segment.
    pub fn child(&self, segment: &str) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(segment.split('/').filter(|s| !s.is_empty()).map(str::to_owned));
        Path { segments }
    }

    /// Returns this path extended by another path.
    pub fn append(&self, other: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Path { segments }
    }

    /// Returns true if `self` is a prefix of (or equal to) `other`.
    pub fn contains(&self, other: &Path) -> bool {
        other.segments.len() >= self.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// Returns `other` relative to `self`, if `self` is a prefix of it.
    pub fn relative_to(&self, ancestor: &Path) -> Option<Path> {
        if ancestor.contains(self) {
            Some(Path {
                segments: self.segments[ancestor.segments.len()..].to_vec(),
            })
        } else {
            None
        }
    }

    /// Iterates over the segments in order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(String::as_str)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Path::new(s))
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!(Path::new("/a/b/c").to_string(), "/a/b/c");
        assert_eq!(Path::new("a/b/").to_string(), "/a/b");
        assert_eq!(Path::new("a//b").to_string(), "/a/b");
        assert_eq!(Path::root().to_string(), "/");
        assert_eq!(Path::new(""), Path::root());
        assert_eq!(Path::new("/"), Path::root());
    }

    #[test]
    fn front_and_pop() {
        let p = Path::new("/a/b/c");
        assert_eq!(p.front(), Some("a"));
        assert_eq!(p.pop_front(), Path::new("/b/c"));
        assert_eq!(Path::root().pop_front(), Path::root());

        let (head, rest) = p.split_front().unwrap();
        assert_eq!(head, "a");
        assert_eq!(rest, Path::new("/b/c"));
        assert!(Path::root().split_front().is_none());
    }

    #[test]
    fn parent_and_child() {
        let p = Path::new("/rooms/general");
        assert_eq!(p.parent(), Some(Path::new("/rooms")));
        assert_eq!(Path::new("/rooms").child("general"), p);
        assert_eq!(Path::root().parent(), None);
        assert_eq!(Path::root().child("a/b"), Path::new("/a/b"));
    }

    #[test]
    fn prefix_relations() {
        let root = Path::root();
        let a = Path::new("/a");
        let ab = Path::new("/a/b");
        assert!(root.contains(&ab));
        assert!(a.contains(&ab));
        assert!(a.contains(&a));
        assert!(!ab.contains(&a));
        assert!(!Path::new("/x").contains(&ab));

        assert_eq!(ab.relative_to(&a), Some(Path::new("/b")));
        assert_eq!(ab.relative_to(&root), Some(ab.clone()));
        assert_eq!(a.relative_to(&ab), None);
    }
}
