//! Error types for the connection layer.

use thiserror::Error;

/// Result type for connection operations.
pub type ConnResult<T> = Result<T, ConnError>;

/// Errors from the connection layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnError {
    /// The transport could not send or open.
    #[error("transport error: {0}")]
    Transport(String),

    /// Fetching a credential context failed.
    #[error("credential fetch failed: {0}")]
    Credential(String),

    /// The connection has been disposed.
    #[error("connection disposed")]
    Disposed,

    /// No connection was available within the allowed time.
    #[error("client is offline")]
    Offline,
}
