//! Reconnection backoff with jitter.

use rand::Rng;
use std::time::{Duration, Instant};

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub multiplier: f64,
    /// Fraction of the delay randomized away (0.0 to 1.0).
    pub jitter_factor: f64,
    /// How long a connection must survive before the backoff resets.
    pub stable_connection_threshold: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 1.3,
            jitter_factor: 0.7,
            stable_connection_threshold: Duration::from_secs(30),
        }
    }
}

/// Stateful exponential backoff for connection attempts.
///
/// The delay grows by the configured multiplier on every failed attempt and
/// resets to the minimum after a connection survives the stable threshold,
/// or immediately on a server-initiated reset.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff in its reset state.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: Duration::ZERO,
        }
    }

    /// The delay to wait before the next attempt, with jitter applied.
    ///
    /// Advances the internal state, so each call reflects one more failed
    /// attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = if self.current.is_zero() {
            self.config.min_delay
        } else {
            self.current.mul_f64(self.config.multiplier)
        };
        if self.current > self.config.max_delay {
            self.current = self.config.max_delay;
        }
        if base.is_zero() {
            return Duration::ZERO;
        }
        let jitter = self.config.jitter_factor.clamp(0.0, 1.0);
        let stable_part = base.mul_f64(1.0 - jitter);
        let random_part = base.mul_f64(jitter * rand::thread_rng().gen::<f64>());
        stable_part + random_part
    }

    /// Resets the backoff to its minimum.
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    /// Notes a completed connection; resets if it was stable.
    pub fn note_connection_result(&mut self, established_at: Instant, closed_at: Instant) {
        if closed_at.duration_since(established_at) >= self.config.stable_connection_threshold {
            self.reset();
        }
    }

    /// The stable-connection threshold from the configuration.
    pub fn stable_connection_threshold(&self) -> Duration {
        self.config.stable_connection_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter_factor: 0.5,
            stable_connection_threshold: Duration::from_secs(10),
        }
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = Backoff::new(config());
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut backoff = Backoff::new(config());
        backoff.next_delay(); // immediate
        let d1 = backoff.next_delay();
        assert!(d1 >= Duration::from_millis(50));
        assert!(d1 <= Duration::from_millis(100));
        // Run far past the cap.
        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped <= Duration::from_millis(1000));
    }

    #[test]
    fn reset_restores_immediate_retry() {
        let mut backoff = Backoff::new(config());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn stable_connection_resets() {
        let mut backoff = Backoff::new(config());
        backoff.next_delay();
        backoff.next_delay();
        let start = Instant::now();
        backoff.note_connection_result(start, start + Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn short_connection_keeps_backoff() {
        let mut backoff = Backoff::new(config());
        backoff.next_delay();
        backoff.next_delay();
        let start = Instant::now();
        backoff.note_connection_result(start, start + Duration::from_millis(10));
        assert!(backoff.next_delay() > Duration::ZERO);
    }
}
