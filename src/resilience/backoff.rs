//! Retry delay calculation.

use std::time::Duration;
use rand::Rng;
use crate::config::RetryConfig;

/// Delay before the attempt following `attempt` (0-based).
///
/// Exponential (`base * 2^attempt`) when `backoff` is set, constant `base`
/// otherwise; capped at `max_ms`.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64, backoff: bool) -> Duration {
    let delay_ms = if backoff {
        base_ms.saturating_mul(2u64.saturating_pow(attempt))
    } else {
        base_ms
    };
    Duration::from_millis(delay_ms.min(max_ms))
}

/// Delay derived from the retry configuration.
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    calculate_backoff(attempt, config.retry_delay_ms, config.max_delay_ms, config.backoff)
}

/// Add up to 10% random jitter, for background loops that should not align.
pub fn with_jitter(delay: Duration) -> Duration {
    let jitter_range = delay.as_millis() as u64 / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    delay + Duration::from_millis(jitter)
}
