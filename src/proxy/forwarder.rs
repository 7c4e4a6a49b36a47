//! Request forwarding: cache probe, backend selection, retry loop.
//!
//! # Responsibilities
//! - Serve GETs from the response cache when any eligible backend has a
//!   fresh entry
//! - Run up to `max_retries + 1` attempts across eligible backends
//! - Bound every attempt by the per-attempt timeout and the caller deadline
//! - Report each attempt to the circuit breaker and the metrics aggregator
//!
//! # Design Decisions
//! - Failure classes charged to a backend: connect errors, timeouts, 5xx
//! - A circuit rejection uses up an attempt but is not charged
//! - Cancellation ends the request immediately and charges nothing
//! - Backends tried by this request are skipped until all eligible ones have
//!   been tried, then the exclusion set starts over

use std::sync::Arc;
use std::time::{Duration, Instant};
use axum::http::Method;
use crate::error::ProxyError;
use crate::load_balancer::backend::Backend;
use crate::proxy::message::{ProxyRequest, ProxyResponse};
use crate::proxy::ProxyManager;
use crate::resilience::backoff::retry_delay;
use crate::resilience::retries::{is_failure_status, AttemptOutcome, RetryState};
use crate::resilience::timeouts::{attempt_budget, run_bounded, sleep_cancellable, Interrupted};

impl ProxyManager {
    /// Forward `request` to a backend and return its response.
    pub async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let started = Instant::now();
        let result = self.forward_inner(&request).await;
        self.metrics.record_request(result.is_ok(), started.elapsed());

        if let Err(e) = &result {
            tracing::warn!(
                method = %request.method,
                uri = %request.uri,
                error = %e,
                kind = e.kind(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request failed"
            );
        }
        result
    }

    /// Backends that may receive traffic right now, in registry order.
    pub fn eligible_backends(&self) -> Vec<Arc<Backend>> {
        self.registry
            .all()
            .iter()
            .filter(|b| b.is_active() && !self.breakers.is_open(&b.id))
            .cloned()
            .collect()
    }

    async fn forward_inner(&self, request: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let context = &request.context;
        if context.cancel.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }

        if request.method == Method::GET && self.cache.is_some() {
            if let Some((backend, response)) = self.cached(request).await {
                self.metrics.record_cache_hit(&backend);
                tracing::debug!(backend = %backend, uri = %request.uri, "Cache hit");
                return Ok(response);
            }
            self.metrics.record_cache_miss();
        }

        let max_attempts = self.retries.max_retries.saturating_add(1);
        let mut state = RetryState::new();
        let mut last_error: Option<ProxyError> = None;

        for attempt in 0..max_attempts {
            if context.cancel.is_cancelled() {
                return Err(ProxyError::Cancelled);
            }
            let budget = attempt_budget(context.deadline, self.request_timeout)?;

            let eligible = self.eligible_backends();
            if eligible.is_empty() {
                break;
            }
            let mut candidates: Vec<_> = eligible.iter().filter(|b| !state.was_tried(&b.id)).cloned().collect();
            if candidates.is_empty() {
                state.reset_exclusions();
                candidates = eligible;
            }
            let backend = self.balancer.select(&candidates)?;

            let attempt_started = Instant::now();
            let result = self.attempt(&backend, request, budget).await;
            let latency = attempt_started.elapsed();

            match result {
                Ok(response) => {
                    state.record(&backend.id, AttemptOutcome::Success, latency);
                    self.metrics
                        .record_attempt(&backend.id, &AttemptOutcome::Success, latency, attempt > 0);
                    tracing::debug!(
                        backend = %backend.id,
                        status = %response.status,
                        attempts = state.attempt_count(),
                        latency_ms = latency.as_millis() as u64,
                        "Request forwarded"
                    );
                    if let Some(cache) = &self.cache {
                        cache.store(&backend.id, request, &response).await;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    let outcome = AttemptOutcome::from_error(&err);
                    state.record(&backend.id, outcome, latency);
                    self.metrics.record_attempt(&backend.id, &outcome, latency, attempt > 0);
                    if outcome == AttemptOutcome::Cancelled {
                        return Err(ProxyError::Cancelled);
                    }

                    tracing::warn!(
                        backend = %backend.id,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %err,
                        "Attempt failed"
                    );
                    last_error = Some(err);

                    if attempt + 1 < max_attempts {
                        let delay = retry_delay(&self.retries, attempt);
                        sleep_cancellable(delay, context.deadline, &context.cancel).await?;
                    }
                }
            }
        }

        match last_error {
            None => Err(ProxyError::NoBackendsAvailable),
            Some(last) => {
                for record in state.attempts() {
                    tracing::debug!(
                        backend = %record.backend,
                        outcome = ?record.outcome,
                        latency_ms = record.latency.as_millis() as u64,
                        "Attempt record"
                    );
                }
                Err(ProxyError::AllBackendsFailed {
                    attempts: state.attempt_count(),
                    last: Box::new(last),
                })
            }
        }
    }

    /// First fresh cache entry among the eligible backends.
    async fn cached(&self, request: &ProxyRequest) -> Option<(String, ProxyResponse)> {
        let cache = self.cache.as_ref()?;
        for backend in self.eligible_backends() {
            if let Some(response) = cache.lookup(&backend.id, request).await {
                return Some((backend.id.clone(), response));
            }
        }
        None
    }

    /// One attempt against `backend`, bounded by `budget` and the caller's
    /// cancellation. Reports the outcome to the backend's circuit.
    async fn attempt(
        &self,
        backend: &Arc<Backend>,
        request: &ProxyRequest,
        budget: Duration,
    ) -> Result<ProxyResponse, ProxyError> {
        let permit = self.breakers.try_acquire(&backend.id)?;
        let _in_flight = backend.track_request();

        let exchange = async {
            let mut conn = self.pool.acquire(backend).await?;
            match conn.send(backend, request).await {
                Ok(response) => Ok::<_, ProxyError>((conn, response)),
                Err(e) => {
                    conn.release(false);
                    Err(e)
                }
            }
        };

        // A dropped exchange drops its connection, which discards it.
        match run_bounded(exchange, budget, &request.context.cancel).await {
            Err(Interrupted::Cancelled) => Err(ProxyError::Cancelled),
            Err(Interrupted::TimedOut) => {
                permit.failure();
                Err(ProxyError::AttemptTimeout {
                    backend: backend.id.clone(),
                    timeout: budget,
                })
            }
            Ok(Err(e @ ProxyError::PoolExhausted { .. })) => Err(e),
            Ok(Err(e)) => {
                permit.failure();
                Err(e)
            }
            Ok(Ok((conn, response))) if is_failure_status(response.status) => {
                conn.release(false);
                permit.failure();
                Err(ProxyError::UpstreamStatus {
                    backend: backend.id.clone(),
                    status: response.status,
                })
            }
            Ok(Ok((conn, response))) => {
                conn.release(true);
                permit.success();
                Ok(response)
            }
        }
    }
}
