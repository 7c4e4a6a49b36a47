//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarder builds the eligible set
//!     → registry.rs (active backends, registration order)
//!     → circuit breaker filters open circuits
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through backends)
//!         - weighted.rs (rotate, each backend repeated `weight` times)
//!         - least_conn.rs (pick backend with fewest in-flight requests)
//!     → Return backend or NoBackendsAvailable
//! ```
//!
//! # Design Decisions
//! - Strategies only see the candidate slice; eligibility is decided upstream
//! - The Forwarder depends on the trait, never on a concrete strategy
//! - Selection never blocks: a single atomic per strategy

pub mod backend;
pub mod least_conn;
pub mod registry;
pub mod round_robin;
pub mod weighted;

use std::sync::Arc;
use crate::config::Algorithm;
use crate::error::ProxyError;
use self::backend::Backend;

pub use backend::{BackendInfo, HealthState};
pub use registry::{BackendObserver, BackendRegistry};

/// A backend selection strategy.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// Pick one of `backends`, or `None` if the slice is empty.
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    fn name(&self) -> &'static str;

    fn select(&self, backends: &[Arc<Backend>]) -> Result<Arc<Backend>, ProxyError> {
        self.next_server(backends).ok_or(ProxyError::NoBackendsAvailable)
    }
}

/// Build the strategy named by configuration.
pub fn build(algorithm: Algorithm) -> Box<dyn LoadBalancer> {
    match algorithm {
        Algorithm::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        Algorithm::Weighted => Box::new(weighted::WeightedRoundRobin::new()),
        Algorithm::LeastConnections => Box::new(least_conn::LeastConnections::new()),
    }
}
