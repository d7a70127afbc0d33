//! Operations applied to the sync tree.
//!
//! Every mutation of synced data, whether a local write, a server push, a
//! write acknowledgment, or a listen completion, is expressed as one
//! [`Operation`] and pushed through the sync point tree. Descending a level
//! relativizes the operation to the child, which keeps each sync point's
//! view logic path-agnostic.

use tidedb_core::{CompoundWrite, Node, Path, PathTree};

/// Where an operation originated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationSource {
    /// A local user write (optimistic overlay).
    User,
    /// An authoritative server update; `tag` scopes it to one query's view.
    Server {
        /// Query tag for query-scoped pushes.
        tag: Option<u64>,
    },
}

impl OperationSource {
    /// An untagged server source.
    pub fn server() -> Self {
        OperationSource::Server { tag: None }
    }

    /// True for any server-sourced operation.
    pub fn is_from_server(&self) -> bool {
        matches!(self, OperationSource::Server { .. })
    }

    /// The query tag, if this is a tagged server operation.
    pub fn tag(&self) -> Option<u64> {
        match self {
            OperationSource::Server { tag } => *tag,
            OperationSource::User => None,
        }
    }
}

/// A single mutation, scoped to a path relative to the current tree level.
#[derive(Clone, Debug)]
pub enum Operation {
    /// Replace the node at `path`.
    Overwrite {
        /// Origin of the data.
        source: OperationSource,
        /// Location relative to the current level.
        path: Path,
        /// Replacement node.
        node: Node,
    },
    /// Merge children into the node at `path`.
    Merge {
        /// Origin of the data.
        source: OperationSource,
        /// Location relative to the current level.
        path: Path,
        /// The children being merged.
        children: CompoundWrite,
    },
    /// A pending user write left the overlay (acknowledged or reverted).
    AckUserWrite {
        /// Location relative to the current level.
        path: Path,
        /// Which sub-paths of the write were affected.
        affected: PathTree<bool>,
        /// True when the write was rolled back rather than confirmed.
        revert: bool,
    },
    /// The server finished sending the initial data for a listen.
    ListenComplete {
        /// Origin; always a server source.
        source: OperationSource,
        /// Location relative to the current level.
        path: Path,
    },
}

impl Operation {
    /// The operation's source.
    pub fn source(&self) -> OperationSource {
        match self {
            Operation::Overwrite { source, .. } | Operation::Merge { source, .. } => {
                source.clone()
            }
            Operation::AckUserWrite { .. } => OperationSource::User,
            Operation::ListenComplete { source, .. } => source.clone(),
        }
    }

    /// The operation's path relative to the current level.
    pub fn path(&self) -> &Path {
        match self {
            Operation::Overwrite { path, .. }
            | Operation::Merge { path, .. }
            | Operation::AckUserWrite { path, .. }
            | Operation::ListenComplete { path, .. } => path,
        }
    }

    /// Relativizes the operation to the child named `key`.
    ///
    /// Returns `None` when the operation cannot affect that child.
    pub fn for_child(&self, key: &str) -> Option<Operation> {
        match self {
            Operation::Overwrite { source, path, node } => match path.split_front() {
                None => Some(Operation::Overwrite {
                    source: source.clone(),
                    path: Path::root(),
                    node: node.immediate_child(key),
                }),
                Some((front, rest)) if front == key => Some(Operation::Overwrite {
                    source: source.clone(),
                    path: rest,
                    node: node.clone(),
                }),
                Some(_) => None,
            },
            Operation::Merge {
                source,
                path,
                children,
            } => match path.split_front() {
                None => {
                    let child_path = Path::from_segments(vec![key.to_owned()]);
                    if let Some(node) = children.complete_node(&child_path) {
                        // The merge fully defines this child; descend as an
                        // overwrite.
                        Some(Operation::Overwrite {
                            source: source.clone(),
                            path: Path::root(),
                            node,
                        })
                    } else {
                        let scoped = children.child_write(&child_path);
                        if scoped.is_empty() {
                            None
                        } else {
                            Some(Operation::Merge {
                                source: source.clone(),
                                path: Path::root(),
                                children: scoped,
                            })
                        }
                    }
                }
                Some((front, rest)) if front == key => Some(Operation::Merge {
                    source: source.clone(),
                    path: rest,
                    children: children.clone(),
                }),
                Some(_) => None,
            },
            Operation::AckUserWrite {
                path,
                affected,
                revert,
            } => match path.split_front() {
                None => {
                    let child_path = Path::from_segments(vec![key.to_owned()]);
                    let sub = affected.subtree(&child_path);
                    match sub {
                        Some(sub) if !sub.is_empty() => Some(Operation::AckUserWrite {
                            path: Path::root(),
                            affected: sub.clone(),
                            revert: *revert,
                        }),
                        _ => {
                            if affected.value().copied().unwrap_or(false) {
                                // The whole subtree was affected.
                                Some(Operation::AckUserWrite {
                                    path: Path::root(),
                                    affected: PathTree::leaf(true),
                                    revert: *revert,
                                })
                            } else {
                                None
                            }
                        }
                    }
                }
                Some((front, rest)) if front == key => Some(Operation::AckUserWrite {
                    path: rest,
                    affected: affected.clone(),
                    revert: *revert,
                }),
                Some(_) => None,
            },
            Operation::ListenComplete { source, path } => match path.split_front() {
                None => Some(Operation::ListenComplete {
                    source: source.clone(),
                    path: Path::root(),
                }),
                Some((front, rest)) if front == key => Some(Operation::ListenComplete {
                    source: source.clone(),
                    path: rest,
                }),
                Some(_) => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_descends_along_its_path() {
        let op = Operation::Overwrite {
            source: OperationSource::server(),
            path: Path::new("/a/b"),
            node: Node::leaf(1.0),
        };
        let down = op.for_child("a").unwrap();
        assert_eq!(down.path(), &Path::new("/b"));
        assert!(op.for_child("z").is_none());
    }

    #[test]
    fn root_overwrite_projects_child_data() {
        let node = Node::from_json(&serde_json::json!({"a": 1, "b": 2}));
        let op = Operation::Overwrite {
            source: OperationSource::server(),
            path: Path::root(),
            node,
        };
        let down = op.for_child("a").unwrap();
        match down {
            Operation::Overwrite { node, .. } => assert_eq!(node, Node::leaf(1.0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn merge_becomes_overwrite_when_child_fully_written() {
        let children = CompoundWrite::empty().add_write(&Path::new("/a"), Node::leaf(5.0));
        let op = Operation::Merge {
            source: OperationSource::User,
            path: Path::root(),
            children,
        };
        match op.for_child("a").unwrap() {
            Operation::Overwrite { node, .. } => assert_eq!(node, Node::leaf(5.0)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(op.for_child("b").is_none());
    }
}
