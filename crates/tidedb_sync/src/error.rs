//! Error types for the sync engine.

use tidedb_wire::Status;

/// Errors surfaced to application callbacks.
///
/// Backend rejections arrive through completion callbacks, never as panics;
/// local invariant violations assert in debug builds and degrade to no-ops
/// in release builds where that is safe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Security rules rejected the operation.
    #[error("permission denied")]
    PermissionDenied,

    /// A local write was canceled before the server accepted it.
    #[error("write canceled")]
    WriteCanceled,

    /// No connection was available within the allowed time.
    #[error("offline: no connection available")]
    Offline,

    /// A transaction exhausted its retry budget.
    #[error("transaction failed: too many retries")]
    TooManyRetries,

    /// The transaction's update function chose not to commit.
    #[error("transaction aborted by update function")]
    Aborted,

    /// The engine was disposed while the operation was outstanding.
    #[error("engine disposed")]
    Disposed,

    /// The write payload exceeded the server's size limit.
    #[error("payload too large")]
    TooBig,

    /// Any other backend status code.
    #[error("server error: {0}")]
    Server(String),
}

impl SyncError {
    /// Maps a non-ok wire status onto the engine taxonomy.
    pub fn from_status(status: &Status) -> SyncError {
        match status {
            Status::PermissionDenied => SyncError::PermissionDenied,
            Status::Disconnect => SyncError::WriteCanceled,
            Status::Offline => SyncError::Offline,
            Status::TooBig => SyncError::TooBig,
            other => SyncError::Server(other.as_wire().to_owned()),
        }
    }
}

/// Convenience alias for engine results.
pub type SyncResult<T> = Result<T, SyncError>;
