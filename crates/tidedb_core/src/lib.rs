//! # TideDB Core
//!
//! Core value types for the TideDB client sync engine.
//!
//! This crate provides:
//! - Hierarchical paths and immutable tree values
//! - Query identity (ordering, range bounds, limits)
//! - The path-keyed tree utility used across the engine
//! - Compound writes (path-disjoint write sets)
//! - Deferred server-value placeholders and their resolution
//!
//! ## Key Invariants
//!
//! - Every value type is immutable; mutation produces a new value
//! - Equality and hashing are structural everywhere
//! - A write at an ancestor path shadows writes below it
//! - Query parameter equality treats an absent bound and the
//!   no-constraint sentinel identically

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compound_write;
mod error;
mod index;
mod node;
mod path;
mod query;
mod server_values;
mod tree;

pub use compound_write::CompoundWrite;
pub use error::{CoreError, CoreResult};
pub use index::{compare_child_keys, compare_nodes, Index};
pub use node::{Node, Scalar};
pub use path::Path;
pub use query::{Bound, LimitAnchor, QueryParams, QuerySpec};
pub use server_values::{
    increment, is_deferred_value, resolve_deferred_compound_write, resolve_deferred_node,
    server_timestamp, SnapshotSource, SyncedSource,
};
pub use tree::PathTree;
