//! Realtime connection layer: a persistent, self-healing link to the
//! backend that queues and replays client state across network drops.
//!
//! The centerpiece is [`PersistentConnection`], a synchronous state machine
//! over a pluggable [`Transport`]. Credentials come from a
//! [`CredentialProvider`], reconnect pacing from [`backoff::Backoff`], and
//! wall-clock time from [`ConnectionDriver`] when running under tokio.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use config::ConnectionConfig;
pub use connection::{
    ignore_status, ConnectionDelegate, ConnectionState, HashProvider, ListenCallback,
    PersistentConnection, StatusCallback, INTERRUPT_BACKGROUND, INTERRUPT_REPO,
    INTERRUPT_SERVER_KILL,
};
pub use credentials::{CredentialContext, CredentialProvider, StaticCredentials};
pub use driver::ConnectionDriver;
pub use error::{ConnError, ConnResult};
pub use transport::{MockTransport, Transport};
