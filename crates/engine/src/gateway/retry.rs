//! Retry policy for transient upstream failures.

use std::time::Duration;

use conduit_util::backoff_delay;

/// Bounded exponential backoff applied inside the gateway.
///
/// Only transient failures (timeouts, connection errors, 5xx responses) are
/// retried; validation and routing failures never are.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based retry index).
    pub fn delay_for(&self, retry: u32) -> Duration {
        backoff_delay(retry, self.base_delay, self.max_delay)
    }
}

/// Whether an upstream HTTP status is worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    status >= 500
}
