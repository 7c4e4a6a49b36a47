//! Timeout enforcement.
//!
//! # Responsibilities
//! - Derive each attempt's budget from the caller deadline
//! - Race an operation against its timeout and the caller's cancellation
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors
//! - A cancelled or timed-out future is dropped, never left running

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::error::ProxyError;

/// Time left for one attempt: the per-attempt timeout, shortened to the
/// caller's remaining budget. Fails once the deadline has passed.
pub fn attempt_budget(deadline: Option<Instant>, per_attempt: Duration) -> Result<Duration, ProxyError> {
    match deadline {
        None => Ok(per_attempt),
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                Err(ProxyError::DeadlineExceeded)
            } else {
                Ok(remaining.min(per_attempt))
            }
        }
    }
}

/// Outcome of [`run_bounded`] when the operation did not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    TimedOut,
    Cancelled,
}

/// Run `fut` until it completes, `timeout` elapses, or `cancel` fires.
pub async fn run_bounded<F, T>(
    fut: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, Interrupted>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        res = tokio::time::timeout(timeout, fut) => res.map_err(|_| Interrupted::TimedOut),
    }
}

/// Sleep for `delay` unless cancelled first. A delay that would run past
/// `deadline` fails with `DeadlineExceeded` without sleeping.
pub async fn sleep_cancellable(
    delay: Duration,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<(), ProxyError> {
    if let Some(deadline) = deadline {
        if delay >= deadline.saturating_duration_since(Instant::now()) {
            return Err(ProxyError::DeadlineExceeded);
        }
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
