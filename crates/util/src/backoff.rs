//! Exponential backoff computation for retry loops.

use std::time::Duration;

/// Delay before the given retry attempt (1-based), doubling from `base` and
/// saturating at `cap`.
///
/// Attempt 1 waits `base`, attempt 2 waits `2 * base`, and so on. Attempt 0
/// is the initial call and waits nothing.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exponent);
    delay.min(cap)
}
