//! Persistence collaborator interface.
//!
//! The engine functions fully without a persistence layer; every call site
//! tolerates the no-op implementation. A real implementation stores user
//! writes for replay across restarts, caches server data per query, and
//! tracks which child keys each filtered query retains.

use tidedb_core::{CompoundWrite, Node, Path, QuerySpec};

/// A server-cache read result for a query.
#[derive(Clone, Debug, Default)]
pub struct CachedQueryData {
    /// The cached node, scoped to the query's window.
    pub node: Node,
    /// True when the cache is known to cover the whole query.
    pub fully_initialized: bool,
}

/// External storage collaborator.
pub trait PersistenceEngine: Send {
    /// Records a user overwrite for replay across restarts.
    fn save_user_overwrite(&mut self, path: &Path, node: &Node, write_id: u64);

    /// Records a user merge for replay across restarts.
    fn save_user_merge(&mut self, path: &Path, children: &CompoundWrite, write_id: u64);

    /// Drops a stored user write once acknowledged.
    fn remove_user_write(&mut self, write_id: u64);

    /// Drops all stored user writes.
    fn remove_all_user_writes(&mut self);

    /// Overwrites the cached server value at a path.
    fn update_server_cache(&mut self, path: &Path, node: &Node);

    /// Merges children into the cached server value at a path.
    fn merge_server_cache(&mut self, path: &Path, children: &CompoundWrite);

    /// Reads the cached server value for a query.
    fn server_cache_for_query(&self, query: &QuerySpec) -> CachedQueryData;

    /// Marks a query as having an active listen.
    fn set_query_active(&mut self, query: &QuerySpec);

    /// Marks a query's listen as released.
    fn set_query_inactive(&mut self, query: &QuerySpec);

    /// Marks a query's cached data as complete.
    fn set_query_complete(&mut self, query: &QuerySpec);

    /// Adjusts the set of child keys a filtered query retains.
    fn update_tracked_query_keys(&mut self, query: &QuerySpec, added: &[String], removed: &[String]);
}

/// The in-memory-only stand-in: remembers nothing.
#[derive(Default)]
pub struct NoopPersistence;

impl PersistenceEngine for NoopPersistence {
    fn save_user_overwrite(&mut self, _path: &Path, _node: &Node, _write_id: u64) {}
    fn save_user_merge(&mut self, _path: &Path, _children: &CompoundWrite, _write_id: u64) {}
    fn remove_user_write(&mut self, _write_id: u64) {}
    fn remove_all_user_writes(&mut self) {}
    fn update_server_cache(&mut self, _path: &Path, _node: &Node) {}
    fn merge_server_cache(&mut self, _path: &Path, _children: &CompoundWrite) {}
    fn server_cache_for_query(&self, _query: &QuerySpec) -> CachedQueryData {
        CachedQueryData::default()
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
