//! Digests of cached data sent with listen requests.
//!
//! When a client resubscribes it sends a digest of what it has cached so the
//! server can skip resending matching data. Small nodes use a single simple
//! hash; above a size threshold a compound hash splits the node into sorted
//! ranges with one digest each, letting the server resend only mismatched
//! ranges.

use sha2::{Digest, Sha256};
use tidedb_core::{Node, Path, Scalar};

/// Default serialized-size threshold above which a compound hash is used.
pub const COMPOUND_HASH_THRESHOLD: usize = 1024;

/// Hex digest of a canonical serialization of `node`.
///
/// The empty node hashes to the empty string, which the server treats as
/// "nothing cached".
pub fn simple_hash(node: &Node) -> String {
    if node.is_empty() {
        return String::new();
    }
    let mut repr = String::new();
    canonical_repr(node, &mut repr);
    hex_digest(repr.as_bytes())
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn canonical_repr(node: &Node, out: &mut String) {
    if let Some(priority) = node.priority() {
        out.push_str("priority:");
        scalar_repr(priority, out);
        out.push(':');
    }
    match node {
        Node::Empty => {}
        Node::Leaf { value, .. } => scalar_repr(value, out),
        Node::Children { .. } => {
            for (key, child) in node.children_iter() {
                out.push(':');
                out.push_str(key);
                out.push(':');
                canonical_repr(child, out);
            }
        }
    }
}

fn scalar_repr(scalar: &Scalar, out: &mut String) {
    match scalar {
        Scalar::Bool(b) => {
            out.push_str("boolean:");
            out.push_str(if *b { "true" } else { "false" });
        }
        Scalar::Number(n) => {
            out.push_str("number:");
            out.push_str(&format!("{:016x}", n.to_bits()));
        }
        Scalar::String(s) => {
            out.push_str("string:");
            out.push_str(s);
        }
    }
}

/// Rough serialized size of a node, used to pick the hash form and to place
/// compound-hash split points.
pub fn estimate_serialized_size(node: &Node) -> usize {
    match node {
        Node::Empty => 4,
        Node::Leaf { value, .. } => match value {
            Scalar::Bool(_) => 5,
            Scalar::Number(_) => 8,
            Scalar::String(s) => s.len() + 2,
        },
        Node::Children { .. } => node
            .children_iter()
            .map(|(k, c)| k.len() + 4 + estimate_serialized_size(c))
            .sum(),
    }
}

/// A structured digest: sorted split posts with one digest per range.
///
/// With `n` posts there are `n + 1` range digests; the final range is
/// unbounded on the right.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompoundHash {
    /// Paths of the range split posts, in traversal order.
    pub posts: Vec<Path>,
    /// One hex digest per range.
    pub hashes: Vec<String>,
}

impl CompoundHash {
    /// Splits `node` into ranges of roughly `range_size` serialized bytes
    /// and digests each one.
    pub fn from_node(node: &Node, range_size: usize) -> CompoundHash {
        let mut builder = CompoundHashBuilder {
            range_size,
            posts: Vec::new(),
            hashes: Vec::new(),
            buffer: String::new(),
            buffered_bytes: 0,
        };
        builder.visit(node, &Path::root());
        builder.finish()
    }

    /// The wire map form: `{"ps": [...], "hs": [...]}`.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "ps": self
                .posts
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>(),
            "hs": self.hashes,
        })
    }
}

struct CompoundHashBuilder {
    range_size: usize,
    posts: Vec<Path>,
    hashes: Vec<String>,
    buffer: String,
    buffered_bytes: usize,
}

impl CompoundHashBuilder {
    fn visit(&mut self, node: &Node, path: &Path) {
        match node {
            Node::Children { .. } => {
                for (key, child) in node.children_iter() {
                    self.visit(child, &path.child(key));
                }
            }
            _ => {
                canonical_repr(node, &mut self.buffer);
                self.buffer.push('|');
                self.buffered_bytes += estimate_serialized_size(node);
                // Ranges only split at leaf boundaries.
                if self.buffered_bytes >= self.range_size {
                    self.posts.push(path.clone());
                    self.hashes.push(hex_digest(self.buffer.as_bytes()));
                    self.buffer.clear();
                    self.buffered_bytes = 0;
                }
            }
        }
    }

    fn finish(mut self) -> CompoundHash {
        // The final, right-unbounded range digest (empty buffer included so
        // the range count is always posts + 1).
        self.hashes.push(hex_digest(self.buffer.as_bytes()));
        CompoundHash {
            posts: self.posts,
            hashes: self.hashes,
        }
    }
}

/// The digest form chosen for one listen request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenHash {
    /// One digest over the whole cached node.
    Simple(String),
    /// A structured digest of sorted ranges.
    Compound {
        /// Whole-node digest, still sent alongside the ranges.
        simple: String,
        /// The per-range digests.
        compound: CompoundHash,
    },
}

impl ListenHash {
    /// Picks the digest form for `node` using the default threshold.
    pub fn for_node(node: &Node) -> ListenHash {
        Self::for_node_with_threshold(node, COMPOUND_HASH_THRESHOLD)
    }

    /// Picks the digest form for `node` with an explicit size threshold.
    pub fn for_node_with_threshold(node: &Node, threshold: usize) -> ListenHash {
        let simple = simple_hash(node);
        if estimate_serialized_size(node) > threshold {
            ListenHash::Compound {
                simple,
                compound: CompoundHash::from_node(node, threshold / 4 + 1),
            }
        } else {
            ListenHash::Simple(simple)
        }
    }

    /// The whole-node digest.
    pub fn simple(&self) -> &str {
        match self {
            ListenHash::Simple(s) => s,
            ListenHash::Compound { simple, .. } => simple,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node(children: usize) -> Node {
        let mut node = Node::Empty;
        for i in 0..children {
            node = node.update(
                &Path::new(&format!("/k{i:04}")),
                Node::leaf(format!("value-{i}")),
            );
        }
        node
    }

    #[test]
    fn empty_hashes_to_empty_string() {
        assert_eq!(simple_hash(&Node::Empty), "");
    }

    #[test]
    fn hash_is_stable_and_structural() {
        let a = sample_node(3);
        let b = sample_node(3);
        assert_eq!(simple_hash(&a), simple_hash(&b));
        assert_ne!(simple_hash(&a), simple_hash(&sample_node(4)));
    }

    #[test]
    fn priority_affects_hash() {
        let plain = Node::leaf("v");
        let prioritized = Node::leaf_with_priority("v", 1.0);
        assert_ne!(simple_hash(&plain), simple_hash(&prioritized));
    }

    #[test]
    fn small_nodes_use_simple_hash() {
        let node = sample_node(2);
        assert!(matches!(ListenHash::for_node(&node), ListenHash::Simple(_)));
    }

    #[test]
    fn large_nodes_use_compound_hash() {
        let node = sample_node(200);
        match ListenHash::for_node(&node) {
            ListenHash::Compound { compound, .. } => {
                assert_eq!(compound.hashes.len(), compound.posts.len() + 1);
                assert!(compound.posts.len() > 1);
                // Posts come out in traversal (sorted) order.
                let mut sorted = compound.posts.clone();
                sorted.sort();
                assert_eq!(sorted, compound.posts);
            }
            other => panic!("expected compound hash, got {other:?}"),
        }
    }

    #[test]
    fn compound_hash_wire_form() {
        let compound = CompoundHash::from_node(&sample_node(50), 64);
        let wire = compound.to_wire();
        assert!(wire["ps"].is_array());
        assert!(wire["hs"].is_array());
        assert_eq!(
            wire["hs"].as_array().unwrap().len(),
            wire["ps"].as_array().unwrap().len() + 1
        );
    }
}
