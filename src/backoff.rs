//! Reconnect backoff policy.
//!
//! Failed connect attempts are retried with an exponentially growing,
//! capped delay. Any successful connect resets the sequence to the
//! initial delay.

use std::time::Duration;

use crate::config::FeedConfig;

/// Capped exponential backoff.
///
/// Each call to [`next_delay`](BackoffPolicy::next_delay) returns the
/// delay to wait before the next attempt and doubles the stored delay,
/// clamped to the configured cap. With the defaults (1 s initial, 64 s
/// cap) the sequence is 1, 2, 4, ..., 64, 64, ... seconds.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl BackoffPolicy {
    /// Creates a policy with the given initial delay and cap.
    ///
    /// The cap is raised to the initial delay if it is smaller.
    #[must_use]
    pub fn new(initial: Duration, cap: Duration) -> Self {
        let cap = cap.max(initial);
        Self {
            initial,
            cap,
            current: initial,
        }
    }

    /// Creates a policy from a [`FeedConfig`].
    #[must_use]
    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.initial_backoff, config.max_backoff)
    }

    /// Returns the delay to wait before the next attempt and advances
    /// the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Returns the delay the next call to `next_delay` would yield,
    /// without advancing.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Resets the sequence to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
