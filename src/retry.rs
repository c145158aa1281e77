//! Exponential backoff bookkeeping for stream reconnects.
use std::time::Duration;

/// Counts consecutive failures and hands out doubling delays.
///
/// The counter is not synchronized. [`ConnectionStateMachine`](crate::state::ConnectionStateMachine)
/// keeps it under the same lock as the connection state.
#[derive(Debug, Clone)]
pub struct RetryCounter {
    attempt: u32,
    current_delay: Duration,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryCounter {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> RetryCounter {
        RetryCounter {
            attempt: 0,
            current_delay: base_delay,
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Record a failure. Returns `true` while the number of failures does not exceed
    /// `max_attempts`.
    pub fn retry(&mut self) -> bool {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt <= self.max_attempts
    }

    /// Returns the delay to wait before the next attempt and doubles it for the one after.
    ///
    /// The stored delay never exceeds `max_delay`.
    pub fn sleep(&mut self) -> Duration {
        let delay = self.current_delay;
        self.current_delay = self.current_delay.saturating_mul(2).min(self.max_delay);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.base_delay;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
