//! The pending-write overlay.
//!
//! Every unacknowledged user write is tracked here, ordered by write id.
//! Composing the visible value at a path means layering the still-pending
//! writes, in increasing id order, over the last known server value. The id
//! order is the single source of truth for precedence; a later write always
//! wins where they overlap.

use tidedb_core::{CompoundWrite, Node, Path, PathTree};

/// The payload of one pending write.
#[derive(Clone, Debug)]
pub enum UserWrite {
    /// A complete replacement at the record's path.
    Overwrite(Node),
    /// A merge of children at the record's path.
    Merge(CompoundWrite),
}

/// One pending user write.
#[derive(Clone, Debug)]
pub struct WriteRecord {
    /// Monotonic id; higher ids take precedence.
    pub id: u64,
    /// Absolute location of the write.
    pub path: Path,
    /// What is being written.
    pub write: UserWrite,
    /// Hidden writes (unapplied transaction results) do not contribute to
    /// the visible overlay until acknowledged.
    pub visible: bool,
}

impl WriteRecord {
    /// The paths this record touches, as a boolean affected-tree rooted at
    /// the record's path.
    pub fn affected_tree(&self) -> PathTree<bool> {
        match &self.write {
            UserWrite::Overwrite(_) => PathTree::leaf(true),
            UserWrite::Merge(children) => {
                let mut tree = PathTree::new();
                for (path, _) in children.entries() {
                    tree.set(&path, true);
                }
                tree
            }
        }
    }
}

/// The ordered overlay of pending writes.
#[derive(Default)]
pub struct WriteTree {
    writes: Vec<WriteRecord>,
    /// Composite of all visible writes, rebuilt when records change.
    visible: CompoundWrite,
}

impl WriteTree {
    /// An empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no writes are pending.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// All pending records in id order.
    pub fn records(&self) -> &[WriteRecord] {
        &self.writes
    }

    /// Adds an overwrite. Ids must arrive in increasing order.
    pub fn add_overwrite(&mut self, path: Path, node: Node, id: u64, visible: bool) {
        debug_assert!(
            self.writes.last().map(|w| w.id < id).unwrap_or(true),
            "write ids must be monotonic"
        );
        if visible {
            self.visible = self.visible.add_write(&path, node.clone());
        }
        self.writes.push(WriteRecord {
            id,
            path,
            write: UserWrite::Overwrite(node),
            visible,
        });
    }

    /// Adds a merge. Merges are always visible.
    pub fn add_merge(&mut self, path: Path, children: CompoundWrite, id: u64) {
        debug_assert!(
            self.writes.last().map(|w| w.id < id).unwrap_or(true),
            "write ids must be monotonic"
        );
        self.visible = self.visible.add_writes(&path, &children);
        self.writes.push(WriteRecord {
            id,
            path,
            write: UserWrite::Merge(children),
            visible: true,
        });
    }

    /// Looks a record up by id.
    pub fn get_write(&self, id: u64) -> Option<&WriteRecord> {
        self.writes.iter().find(|w| w.id == id)
    }

    /// Removes a record, rebuilding the visible composite.
    ///
    /// Returns the record together with a flag that is true when removing it
    /// may change visible data (the record was visible and not completely
    /// shadowed by later writes), meaning events must be recalculated.
    pub fn remove_write(&mut self, id: u64) -> Option<(WriteRecord, bool)> {
        let idx = self.writes.iter().position(|w| w.id == id)?;
        let record = self.writes.remove(idx);
        let needs_recalc = record.visible && !self.shadowed_by_later(&record, idx);
        if record.visible {
            self.rebuild_visible();
        }
        Some((record, needs_recalc))
    }

    /// Removes every record; returns them for reverting.
    pub fn purge_all_writes(&mut self) -> Vec<WriteRecord> {
        self.visible = CompoundWrite::empty();
        std::mem::take(&mut self.writes)
    }

    fn shadowed_by_later(&self, record: &WriteRecord, from_idx: usize) -> bool {
        let covers = |later: &WriteRecord, path: &Path| match &later.write {
            UserWrite::Overwrite(_) => later.path.contains(path),
            UserWrite::Merge(children) => path
                .relative_to(&later.path)
                .map(|rel| children.has_complete_write(&rel))
                .unwrap_or(false),
        };
        let touched: Vec<Path> = match &record.write {
            UserWrite::Overwrite(_) => vec![record.path.clone()],
            UserWrite::Merge(children) => children
                .entries()
                .into_iter()
                .map(|(rel, _)| record.path.append(&rel))
                .collect(),
        };
        touched.iter().all(|path| {
            self.writes[from_idx..]
                .iter()
                .any(|later| covers(later, path))
        })
    }

    fn rebuild_visible(&mut self) {
        let mut composite = CompoundWrite::empty();
        for record in &self.writes {
            if !record.visible {
                continue;
            }
            composite = match &record.write {
                UserWrite::Overwrite(node) => composite.add_write(&record.path, node.clone()),
                UserWrite::Merge(children) => composite.add_writes(&record.path, children),
            };
        }
        self.visible = composite;
    }

    /// The visible overlay scoped to `path`.
    pub fn child_writes(&self, path: &Path) -> CompoundWrite {
        self.visible.child_write(path)
    }

    /// The locally-visible value at `path`, given the complete server value
    /// there (or `None` when the server value is unknown).
    ///
    /// `exclude` drops specific write ids from the overlay (used to compute
    /// the value a transaction should run against); `include_hidden` layers
    /// hidden writes in as well.
    pub fn calc_complete_event_cache(
        &self,
        path: &Path,
        server_cache: Option<&Node>,
        exclude: &[u64],
        include_hidden: bool,
    ) -> Option<Node> {
        let overlay = if exclude.is_empty() && !include_hidden {
            self.child_writes(path)
        } else {
            let mut composite = CompoundWrite::empty();
            for record in &self.writes {
                if exclude.contains(&record.id) || (!record.visible && !include_hidden) {
                    continue;
                }
                composite = match &record.write {
                    UserWrite::Overwrite(node) => {
                        composite.add_write(&record.path, node.clone())
                    }
                    UserWrite::Merge(children) => {
                        composite.add_writes(&record.path, children)
                    }
                };
            }
            composite.child_write(path)
        };
        match server_cache {
            Some(server) => Some(overlay.apply(server)),
            None => overlay.complete_node(&Path::root()),
        }
    }

    /// Overlays pending writes onto a known-complete children collection.
    pub fn calc_complete_event_children(&self, path: &Path, server_children: &Node) -> Node {
        self.child_writes(path).apply(server_children)
    }

    /// A complete pending value for `path`, if one write fully covers it.
    pub fn shadowing_write(&self, path: &Path) -> Option<Node> {
        self.visible.complete_node(path)
    }
}
