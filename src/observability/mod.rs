//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarder, health checker, circuit breakers produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (in-process aggregator + Prometheus facade)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Admin API metrics snapshot
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all log events of a request span
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
