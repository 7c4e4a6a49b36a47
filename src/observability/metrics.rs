//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Aggregate per-backend and global counters in-process ([`ProxyMetrics`])
//! - Mirror them to the `metrics` facade for the Prometheus endpoint
//! - Export backend health and circuit state gauges
//!
//! # Metrics
//! - `proxy_requests_total` (counter): inbound requests by method, status
//! - `proxy_request_duration_seconds` (histogram): end-to-end latency
//! - `proxy_upstream_attempts_total` (counter): attempts by backend, outcome
//! - `proxy_retries_total` (counter): attempts after the first
//! - `proxy_cache_lookups_total` (counter): cache hits and misses
//! - `proxy_backend_health` (gauge): 1=healthy, 0=unhealthy
//! - `proxy_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//!
//! # Design Decisions
//! - Atomic increments only; snapshots are not a consistent cut
//! - Counters are monotonic until an explicit [`ProxyMetrics::reset`]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use serde::Serialize;
use crate::load_balancer::BackendObserver;
use crate::resilience::retries::AttemptOutcome;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus metrics endpoint listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    ::metrics::counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    ::metrics::histogram!("proxy_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_backend_health(backend: &str, healthy: bool) {
    ::metrics::gauge!("proxy_backend_health", "backend" => backend.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_circuit_state(backend: &str, state: &str) {
    let value = match state {
        "open" => 2.0,
        "half_open" => 1.0,
        _ => 0.0,
    };
    ::metrics::gauge!("proxy_circuit_state", "backend" => backend.to_string()).set(value);
}

fn outcome_label(outcome: &AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Success => "success",
        AttemptOutcome::Rejected => "rejected",
        AttemptOutcome::PoolExhausted => "pool_exhausted",
        AttemptOutcome::Transport => "transport",
        AttemptOutcome::Timeout => "timeout",
        AttemptOutcome::ServerError(_) => "server_error",
        AttemptOutcome::Cancelled => "cancelled",
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    latency_total_us: AtomicU64,
    latency_count: AtomicU64,
}

impl Counters {
    fn observe_latency(&self, latency: Duration) {
        self.latency_total_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CounterSnapshot {
        let latency_total_us = self.latency_total_us.load(Ordering::Relaxed);
        let latency_count = self.latency_count.load(Ordering::Relaxed);
        let mean_latency_ms = if latency_count == 0 {
            0.0
        } else {
            latency_total_us as f64 / latency_count as f64 / 1000.0
        };
        CounterSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            latency_total_ms: latency_total_us / 1000,
            latency_count,
            mean_latency_ms,
        }
    }

    fn reset(&self) {
        for counter in [
            &self.requests,
            &self.successes,
            &self.failures,
            &self.retries,
            &self.cache_hits,
            &self.cache_misses,
            &self.latency_total_us,
            &self.latency_count,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub latency_total_ms: u64,
    pub latency_count: u64,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub global: CounterSnapshot,
    pub backends: BTreeMap<String, CounterSnapshot>,
}

/// In-process request metrics.
///
/// Global counters describe client requests (one per `forward` call). Backend
/// counters describe upstream attempts sent to that backend.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    global: Counters,
    backends: DashMap<String, Arc<Counters>>,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn backend(&self, id: &str) -> Arc<Counters> {
        if let Some(counters) = self.backends.get(id) {
            return counters.clone();
        }
        self.backends.entry(id.to_string()).or_default().clone()
    }

    /// A client request finished, successfully or not.
    pub fn record_request(&self, success: bool, latency: Duration) {
        self.global.requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.global.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.global.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.global.observe_latency(latency);
    }

    /// One upstream attempt against `backend`. `retry` marks attempts after
    /// the first one of a request.
    pub fn record_attempt(&self, backend: &str, outcome: &AttemptOutcome, latency: Duration, retry: bool) {
        ::metrics::counter!(
            "proxy_upstream_attempts_total",
            "backend" => backend.to_string(),
            "outcome" => outcome_label(outcome)
        )
        .increment(1);

        if retry {
            self.global.retries.fetch_add(1, Ordering::Relaxed);
            ::metrics::counter!("proxy_retries_total").increment(1);
        }

        let counters = self.backend(backend);
        if retry {
            counters.retries.fetch_add(1, Ordering::Relaxed);
        }
        match outcome {
            // Never reached the backend.
            AttemptOutcome::Rejected | AttemptOutcome::PoolExhausted | AttemptOutcome::Cancelled => {}
            AttemptOutcome::Success => {
                counters.requests.fetch_add(1, Ordering::Relaxed);
                counters.successes.fetch_add(1, Ordering::Relaxed);
                counters.observe_latency(latency);
            }
            _ => {
                counters.requests.fetch_add(1, Ordering::Relaxed);
                counters.failures.fetch_add(1, Ordering::Relaxed);
                counters.observe_latency(latency);
            }
        }
    }

    pub fn record_cache_hit(&self, backend: &str) {
        self.global.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.backend(backend).cache_hits.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("proxy_cache_lookups_total", "result" => "hit").increment(1);
    }

    pub fn record_cache_miss(&self) {
        self.global.cache_misses.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("proxy_cache_lookups_total", "result" => "miss").increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            global: self.global.snapshot(),
            backends: self
                .backends
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().snapshot()))
                .collect(),
        }
    }

    /// Zero every counter. Backend entries are kept.
    pub fn reset(&self) {
        self.global.reset();
        for entry in self.backends.iter() {
            entry.value().reset();
        }
        tracing::info!("Metrics reset");
    }
}

/// Deregistered backends lose their counters; global counters keep them.
impl BackendObserver for ProxyMetrics {
    fn backend_removed(&self, id: &str) {
        self.backends.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_request_and_attempt_counters() {
        let metrics = ProxyMetrics::new();
        metrics.record_attempt("a", &AttemptOutcome::Timeout, Duration::from_millis(30), false);
        metrics.record_attempt(
            "b",
            &AttemptOutcome::ServerError(StatusCode::BAD_GATEWAY),
            Duration::from_millis(10),
            true,
        );
        metrics.record_attempt("c", &AttemptOutcome::Success, Duration::from_millis(20), true);
        metrics.record_request(true, Duration::from_millis(60));

        let snap = metrics.snapshot();
        assert_eq!(snap.global.requests, 1);
        assert_eq!(snap.global.successes, 1);
        assert_eq!(snap.global.retries, 2);
        assert_eq!(snap.global.latency_total_ms, 60);

        let a = &snap.backends["a"];
        assert_eq!((a.requests, a.failures, a.retries), (1, 1, 0));
        let c = &snap.backends["c"];
        assert_eq!((c.requests, c.successes, c.retries), (1, 1, 1));
        assert_eq!(c.mean_latency_ms, 20.0);
    }

    #[test]
    fn test_rejected_attempt_not_charged_to_backend() {
        let metrics = ProxyMetrics::new();
        metrics.record_attempt("a", &AttemptOutcome::Rejected, Duration::ZERO, false);
        let a = &metrics.snapshot().backends["a"];
        assert_eq!(a.requests, 0);
        assert_eq!(a.failures, 0);
    }

    #[test]
    fn test_cache_counters_and_reset() {
        let metrics = ProxyMetrics::new();
        metrics.record_cache_miss();
        metrics.record_cache_hit("a");
        metrics.record_request(false, Duration::from_millis(5));

        let snap = metrics.snapshot();
        assert_eq!(snap.global.cache_hits, 1);
        assert_eq!(snap.global.cache_misses, 1);
        assert_eq!(snap.global.failures, 1);
        assert_eq!(snap.backends["a"].cache_hits, 1);

        metrics.reset();
        let snap = metrics.snapshot();
        assert_eq!(snap.global, CounterSnapshot::default());
        assert_eq!(snap.backends["a"], CounterSnapshot::default());
    }

    #[test]
    fn test_removed_backend_counters_dropped() {
        let metrics = ProxyMetrics::new();
        metrics.record_attempt("a", &AttemptOutcome::Success, Duration::from_millis(3), false);
        metrics.record_attempt("b", &AttemptOutcome::Success, Duration::from_millis(3), false);
        metrics.record_request(true, Duration::from_millis(3));

        metrics.backend_removed("a");
        let snap = metrics.snapshot();
        assert!(!snap.backends.contains_key("a"));
        assert_eq!(snap.backends["b"].successes, 1);
        assert_eq!(snap.global.successes, 1);
    }

    #[test]
    fn test_facade_calls_without_recorder() {
        record_request("GET", 200, Instant::now());
        record_backend_health("a", true);
        record_circuit_state("a", "open");
    }
}
