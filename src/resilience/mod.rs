//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt against a backend:
//!     → circuit_breaker.rs (gate: closed / half-open probe / open rejection)
//!     → timeouts.rs (per-attempt budget from caller deadline, cancellation)
//!     → On failure: retries.rs (classify outcome, record attempt)
//!     → backoff.rs (delay before the next attempt)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every attempt has a deadline
//! - Circuit breaker prevents cascading failures
//! - The retry exclusion set and attempt records are request-local values

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{BreakerSettings, CircuitBreakers, CircuitPermit, CircuitSnapshot, CircuitState};
