//! Client-side sync engine: local cache, listener fan-out, optimistic
//! writes, and transactions over the realtime connection.
//!
//! The [`SyncTree`] holds every active query's view of the data plus the
//! overlay of unacknowledged writes; the [`Repo`] coordinates it with a
//! [`tidedb_connection::PersistentConnection`], resolving deferred values,
//! replaying transactions, and raising listener events in deterministic
//! order.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod operation;
pub mod persistence;
pub mod range_merge;
pub mod repo;
pub mod sync_point;
pub mod sync_tree;
pub mod view;
pub mod write_tree;

pub use error::{SyncError, SyncResult};
pub use events::{
    CancelCallback, DataEvent, DataEventType, EventCallback, EventRegistration,
};
pub use persistence::{CachedQueryData, NoopPersistence, PersistenceEngine};
pub use repo::{
    GetCallback, Repo, TransactionCallback, TransactionUpdate, WriteCallback,
};
pub use sync_tree::{ListenProvider, SyncTree};
pub use view::View;
pub use write_tree::{UserWrite, WriteRecord, WriteTree};
