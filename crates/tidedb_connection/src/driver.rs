//! Async driver for the connection timer.
//!
//! The connection itself is synchronous and transport-agnostic; this module
//! supplies the one piece of real time it needs, a periodic tick that expires
//! overdue reads and fires scheduled reconnect attempts.

use crate::connection::PersistentConnection;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::trace;

/// Drives a connection's timer on a tokio runtime.
///
/// Dropping the driver stops the tick task. The connection is held weakly so
/// the driver never keeps a disposed connection alive.
pub struct ConnectionDriver {
    handle: JoinHandle<()>,
}

impl ConnectionDriver {
    /// Spawns the tick task on the current runtime.
    pub fn spawn(connection: &Arc<PersistentConnection>, interval: std::time::Duration) -> Self {
        let weak: Weak<PersistentConnection> = Arc::downgrade(connection);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(connection) = weak.upgrade() else {
                    trace!("connection dropped; stopping driver");
                    break;
                };
                if connection.is_disposed() {
                    break;
                }
                connection.tick(Instant::now());
            }
        });
        Self { handle }
    }

    /// Stops the tick task.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for ConnectionDriver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
