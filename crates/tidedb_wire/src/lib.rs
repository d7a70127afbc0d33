//! # TideDB Wire
//!
//! Semantic wire-protocol shapes for the TideDB client sync engine.
//!
//! This crate provides:
//! - The numbered request envelope and action codes
//! - Response statuses and asynchronous server pushes
//! - Connection-level control messages
//! - Simple and compound digests of cached data for listen requests
//!
//! The exact byte encoding belongs to the backend; this crate covers the
//! semantic shape the engine produces and consumes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod hash;
mod messages;

pub use error::{WireError, WireResult};
pub use hash::{
    estimate_serialized_size, simple_hash, CompoundHash, ListenHash, COMPOUND_HASH_THRESHOLD,
};
pub use messages::{
    parse_server_message, Action, ControlMessage, RangeMergeUpdate, Request, Response,
    ServerMessage, ServerPush, Status,
};
