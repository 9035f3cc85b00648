//! Retry backoff between stream-level attempts.

use std::time::Duration;

use rand::Rng;

use crate::resilience::timeouts::Deadline;

/// Exponential delay for `attempt` (1-based) with up to 10% jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt - 1))
        .min(max_ms);

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay_ms + jitter)
}

/// Backoff for `attempt`, or `None` when sleeping it would leave nothing of
/// the deadline for the next attempt.
pub fn backoff_within(attempt: u32, base_ms: u64, max_ms: u64, deadline: &Deadline) -> Option<Duration> {
    let delay = calculate_backoff(attempt, base_ms, max_ms);
    if delay < deadline.remaining() {
        Some(delay)
    } else {
        None
    }
}
