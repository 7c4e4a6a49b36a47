//! Least Connections load balancing strategy.

use std::sync::Arc;
use crate::load_balancer::{LoadBalancer, backend::Backend};

/// Least connections selector.
/// Selects the backend with the minimum number of in-flight requests.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        // min_by_key keeps the first of equal elements, so ties go to
        // registration order.
        backends.iter().min_by_key(|b| b.in_flight()).cloned()
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}
