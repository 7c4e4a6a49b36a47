//! Error taxonomy for the proxy engine.
//!
//! Callers only ever see these variants; raw transport errors are flattened
//! into `Transport` with a message so they can be mapped to gateway statuses
//! without inspecting internals.

use std::time::Duration;
use axum::http::StatusCode;

/// Errors produced by the forwarding pipeline and the backend registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    /// No backend is eligible (registry empty, all inactive or all circuits open).
    #[error("no backends available")]
    NoBackendsAvailable,

    /// The connection pool stayed at capacity for the whole wait.
    #[error("connection pool exhausted for backend {backend}")]
    PoolExhausted { backend: String },

    /// The backend was selected but its circuit rejected the attempt.
    #[error("circuit open for backend {backend}")]
    CircuitOpen { backend: String },

    /// A single attempt exceeded its deadline.
    #[error("attempt to backend {backend} timed out after {timeout:?}")]
    AttemptTimeout { backend: String, timeout: Duration },

    /// Every attempt failed; carries the last underlying cause.
    #[error("all backends failed after {attempts} attempts: {last}")]
    AllBackendsFailed { attempts: u32, last: Box<ProxyError> },

    /// The caller's overall deadline cannot accommodate another attempt.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Connect or I/O failure talking to a backend.
    #[error("transport error from backend {backend}: {message}")]
    Transport { backend: String, message: String },

    /// The backend answered with a 5xx status.
    #[error("backend {backend} responded with {status}")]
    UpstreamStatus { backend: String, status: StatusCode },

    #[error("backend {0} already registered")]
    DuplicateBackend(String),

    #[error("backend {0} not found")]
    NotFound(String),

    #[error("invalid backend {id}: {reason}")]
    InvalidBackend { id: String, reason: String },
}

impl ProxyError {
    pub fn transport(backend: &str, err: impl std::fmt::Display) -> Self {
        ProxyError::Transport {
            backend: backend.to_string(),
            message: err.to_string(),
        }
    }

    /// True if the error was a timeout of some kind.
    pub fn is_timeout(&self) -> bool {
        match self {
            ProxyError::AttemptTimeout { .. } | ProxyError::DeadlineExceeded => true,
            ProxyError::AllBackendsFailed { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// Gateway-style status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoBackendsAvailable
            | ProxyError::PoolExhausted { .. }
            | ProxyError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::AttemptTimeout { .. } | ProxyError::DeadlineExceeded => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::AllBackendsFailed { last, .. } => match &**last {
                ProxyError::PoolExhausted { .. } | ProxyError::CircuitOpen { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                other if other.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            },
            // nginx's "client closed request"
            ProxyError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ProxyError::Transport { .. } | ProxyError::UpstreamStatus { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::DuplicateBackend(_) => StatusCode::CONFLICT,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::InvalidBackend { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Short stable label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::NoBackendsAvailable => "no_backends",
            ProxyError::PoolExhausted { .. } => "pool_exhausted",
            ProxyError::CircuitOpen { .. } => "circuit_open",
            ProxyError::AttemptTimeout { .. } => "attempt_timeout",
            ProxyError::AllBackendsFailed { .. } => "all_backends_failed",
            ProxyError::DeadlineExceeded => "deadline_exceeded",
            ProxyError::Cancelled => "cancelled",
            ProxyError::Transport { .. } => "transport",
            ProxyError::UpstreamStatus { .. } => "upstream_status",
            ProxyError::DuplicateBackend(_) => "duplicate_backend",
            ProxyError::NotFound(_) => "not_found",
            ProxyError::InvalidBackend { .. } => "invalid_backend",
        }
    }
}
