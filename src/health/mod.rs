//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer or trigger()
//!     → Probe every registered backend concurrently
//!     → Update the backend's health snapshot
//!     → Eject (trip circuit) once the unhealthy threshold is crossed
//! ```
//!
//! # Design Decisions
//! - State transitions require consecutive successes/failures
//! - Ejection goes through the circuit breaker, so the Load Balancer only
//!   has one notion of "not selectable"
//! - Probe errors are logged and recorded, never surfaced to callers

pub mod active;

pub use active::HealthMonitor;
