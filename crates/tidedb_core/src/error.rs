//! Error types for core value operations.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors from constructing or validating core values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A path contained invalid segments.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A query parameter combination is not allowed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A value could not be represented as a node.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
