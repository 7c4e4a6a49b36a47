//! Retry bookkeeping.
//!
//! # Responsibilities
//! - Classify attempt outcomes (success, failure kinds)
//! - Keep the request-local exclusion set of tried backends
//! - Keep the ordered attempt record for metrics and logging
//!
//! # Design Decisions
//! - Connection errors, timeouts and 5xx are retryable failures
//! - 4xx are NOT failures (client error, not backend)
//! - State lives in a value owned by one request, never shared

use std::collections::HashSet;
use std::time::Duration;
use axum::http::StatusCode;
use crate::error::ProxyError;

/// True if a backend response counts as a failed attempt.
pub fn is_failure_status(status: StatusCode) -> bool {
    status.is_server_error()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Circuit rejected the attempt before any I/O.
    Rejected,
    PoolExhausted,
    Transport,
    Timeout,
    ServerError(StatusCode),
    Cancelled,
}

impl AttemptOutcome {
    pub fn from_error(err: &ProxyError) -> Self {
        match err {
            ProxyError::CircuitOpen { .. } => AttemptOutcome::Rejected,
            ProxyError::PoolExhausted { .. } => AttemptOutcome::PoolExhausted,
            ProxyError::AttemptTimeout { .. } | ProxyError::DeadlineExceeded => AttemptOutcome::Timeout,
            ProxyError::UpstreamStatus { status, .. } => AttemptOutcome::ServerError(*status),
            ProxyError::Cancelled => AttemptOutcome::Cancelled,
            _ => AttemptOutcome::Transport,
        }
    }

    /// Whether this outcome is charged to the backend's circuit.
    pub fn counts_against_backend(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Transport | AttemptOutcome::Timeout | AttemptOutcome::ServerError(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub backend: String,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
}

/// Per-request retry state.
#[derive(Debug, Default)]
pub struct RetryState {
    tried: HashSet<String>,
    attempts: Vec<AttemptRecord>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_tried(&self, backend: &str) -> bool {
        self.tried.contains(backend)
    }

    /// Forget the exclusion set once every candidate has been tried.
    pub fn reset_exclusions(&mut self) {
        self.tried.clear();
    }

    pub fn record(&mut self, backend: &str, outcome: AttemptOutcome, latency: Duration) {
        self.tried.insert(backend.to_string());
        self.attempts.push(AttemptRecord {
            backend: backend.to_string(),
            outcome,
            latency,
        });
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        let err = ProxyError::UpstreamStatus {
            backend: "a".into(),
            status: StatusCode::BAD_GATEWAY,
        };
        assert!(AttemptOutcome::from_error(&err).counts_against_backend());
        assert!(!AttemptOutcome::from_error(&ProxyError::CircuitOpen { backend: "a".into() }).counts_against_backend());
        assert!(!AttemptOutcome::from_error(&ProxyError::Cancelled).counts_against_backend());
        assert!(is_failure_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_failure_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_retry_state() {
        let mut state = RetryState::new();
        state.record("a", AttemptOutcome::Transport, Duration::from_millis(3));
        state.record("b", AttemptOutcome::Success, Duration::from_millis(5));
        assert!(state.was_tried("a"));
        assert_eq!(state.attempt_count(), 2);

        state.reset_exclusions();
        assert!(!state.was_tried("a"));
        assert_eq!(state.attempts()[1].backend, "b");
    }
}
