//! Connection configuration.

use crate::backoff::BackoffConfig;
use std::time::Duration;

/// Tunables for the persistent connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Reconnection backoff parameters.
    pub backoff: BackoffConfig,
    /// How long a queued one-shot read waits for a connection before it is
    /// failed locally as offline.
    pub get_timeout: Duration,
    /// How often the driver ticks the connection timer.
    pub tick_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            get_timeout: Duration::from_secs(3),
            tick_interval: Duration::from_millis(250),
        }
    }
}

impl ConnectionConfig {
    /// Sets the one-shot read timeout.
    pub fn get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout = timeout;
        self
    }

    /// Sets the backoff parameters.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}
