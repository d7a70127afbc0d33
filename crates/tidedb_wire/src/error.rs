//! Error types for wire parsing.

use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors from parsing inbound frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The frame did not match the expected envelope shape.
    #[error("malformed message: {0}")]
    Malformed(String),
}
