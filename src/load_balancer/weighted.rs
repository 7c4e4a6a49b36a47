//! Weighted round-robin load balancing strategy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::load_balancer::{LoadBalancer, backend::Backend};

/// Weighted round-robin selector.
///
/// Each backend occupies `weight` consecutive slots of the cycle. With every
/// weight equal to 1 this is exactly [`RoundRobin`](super::round_robin::RoundRobin).
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counter: AtomicUsize,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let total: usize = backends.iter().map(|b| b.weight.max(1) as usize).sum();
        if total == 0 {
            return None;
        }

        let mut slot = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        for backend in backends {
            let weight = backend.weight.max(1) as usize;
            if slot < weight {
                return Some(backend.clone());
            }
            slot -= weight;
        }
        None
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}
