//! Round-robin load balancing strategy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::load_balancer::{LoadBalancer, backend::Backend};

/// Round-robin selector.
/// Stores an internal counter to rotate through backends.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        // The value returned by fetch_add is this call's slot; no second read.
        let slot = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(backends[slot % backends.len()].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::load_balancer::backend::test_backend;
    use std::collections::HashMap;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let b1 = test_backend("b1", 8080);
        let b2 = test_backend("b2", 8081);
        let backends = vec![b1.clone(), b2.clone()];

        let s1 = lb.next_server(&backends).unwrap();
        assert_eq!(s1.id, b1.id);

        let s2 = lb.next_server(&backends).unwrap();
        assert_eq!(s2.id, b2.id);

        let s3 = lb.next_server(&backends).unwrap();
        assert_eq!(s3.id, b1.id);
    }

    #[test]
    fn test_empty_candidates() {
        let lb = RoundRobin::new();
        assert!(matches!(lb.select(&[]), Err(ProxyError::NoBackendsAvailable)));
    }

    #[test]
    fn test_fairness_under_concurrency() {
        let lb = Arc::new(RoundRobin::new());
        let backends: Arc<Vec<_>> = Arc::new(
            (0..3).map(|i| test_backend(&format!("b{i}"), 9000 + i)).collect(),
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = lb.clone();
                let backends = backends.clone();
                std::thread::spawn(move || {
                    (0..300)
                        .map(|_| lb.next_server(&backends).unwrap().id.clone())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                *counts.entry(id).or_default() += 1;
            }
        }
        // 1200 selections over 3 backends.
        assert!(counts.values().all(|&c| c == 400), "{counts:?}");
    }
}
