//! Timestamp utilities

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Exponential backoff for the given failure number (1-based), capped at `max`
///
/// Failure 1 waits `base`, failure 2 waits `2 * base`, and so on.
pub fn exponential_backoff(base: Duration, max: Duration, failure: u32) -> Duration {
    let exp = 2u32.saturating_pow(failure.saturating_sub(1));
    base.checked_mul(exp).unwrap_or(max).min(max)
}
