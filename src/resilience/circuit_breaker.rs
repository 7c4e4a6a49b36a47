//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: testing if backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold within window
//! Open → Half-Open: after recovery timeout
//! Half-Open → Closed: probe request succeeds
//! Half-Open → Open: probe request fails
//! ```
//!
//! # Design Decisions
//! - Per-backend circuit breaker (not global), each behind its own mutex
//! - Fail fast in Open state (no waiting for timeout)
//! - Single probe in Half-Open, admitted by a compare-and-swap gate that is
//!   only reset when the probe completes or is abandoned
//! - Every open or close starts a new generation; permits carry the
//!   generation they were issued in and outcomes from an earlier one are
//!   ignored, so only the admitted probe decides a half-open circuit

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use dashmap::DashMap;
use serde::Serialize;
use crate::config::CircuitBreakerConfig;
use crate::error::ProxyError;
use crate::load_balancer::BackendObserver;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Runtime settings, in durations rather than config units.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub threshold: u32,
    pub timeout: Duration,
    pub window: Duration,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold: config.threshold.max(1),
            timeout: config.timeout(),
            window: config.window(),
        }
    }
}

/// Operator-facing view of one circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub forced: bool,
    pub probe_in_flight: bool,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    /// Held open by an operator; no automatic half-open.
    forced: bool,
    /// Bumped on every open and close.
    generation: u64,
}

/// The admission an outcome report belongs to.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    generation: u64,
    probe: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            window_start: None,
            opened_at: None,
            forced: false,
            generation: 0,
        }
    }

    /// Move Open → HalfOpen once the timeout has run out.
    fn advance(&mut self, timeout: Duration) {
        if self.state == CircuitState::Open && !self.forced {
            if let Some(opened) = self.opened_at {
                if opened.elapsed() >= timeout {
                    self.state = CircuitState::HalfOpen;
                }
            }
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.window_start = None;
        self.generation = self.generation.wrapping_add(1);
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.window_start = None;
        self.opened_at = None;
        self.forced = false;
        self.generation = self.generation.wrapping_add(1);
    }

    /// False for reports from an earlier generation. Direct reports
    /// (no ticket) always count.
    fn accepts(&self, ticket: Option<Ticket>) -> bool {
        ticket.map_or(true, |t| t.generation == self.generation)
    }
}

#[derive(Debug)]
struct Breaker {
    id: String,
    inner: Mutex<Inner>,
    probe_admitted: AtomicBool,
}

impl Breaker {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            inner: Mutex::new(Inner::new()),
            probe_admitted: AtomicBool::new(false),
        }
    }

    fn lock(&self, settings: &BreakerSettings) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.advance(settings.timeout);
        inner
    }

    fn transition(&self, from: CircuitState, to: CircuitState) {
        if from != to {
            tracing::info!(backend = %self.id, from = from.as_str(), to = to.as_str(), "Circuit state changed");
            metrics::record_circuit_state(&self.id, to.as_str());
        }
    }

    fn on_success(&self, settings: &BreakerSettings, ticket: Option<Ticket>) {
        let mut inner = self.lock(settings);
        if !inner.accepts(ticket) {
            tracing::debug!(backend = %self.id, "Ignoring success from an earlier circuit generation");
            return;
        }
        let probe = ticket.map_or(true, |t| t.probe);
        let from = inner.state;
        match inner.state {
            CircuitState::HalfOpen if probe => {
                inner.close();
                self.probe_admitted.store(false, Ordering::Release);
            }
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {
                inner.failures = 0;
                inner.window_start = None;
            }
            // A late success from a request admitted before the circuit
            // opened does not close it.
            CircuitState::Open => {}
        }
        self.transition(from, inner.state);
    }

    fn on_failure(&self, settings: &BreakerSettings, ticket: Option<Ticket>) {
        let mut inner = self.lock(settings);
        if !inner.accepts(ticket) {
            tracing::debug!(backend = %self.id, "Ignoring failure from an earlier circuit generation");
            return;
        }
        let probe = ticket.map_or(true, |t| t.probe);
        let from = inner.state;
        match inner.state {
            CircuitState::Closed => {
                let now = Instant::now();
                match inner.window_start {
                    Some(start) if now.duration_since(start) <= settings.window => {}
                    _ => {
                        inner.window_start = Some(now);
                        inner.failures = 0;
                    }
                }
                inner.failures = inner.failures.saturating_add(1);
                if inner.failures >= settings.threshold {
                    inner.open();
                }
            }
            CircuitState::HalfOpen if probe => {
                inner.failures = inner.failures.saturating_add(1);
                inner.open();
                self.probe_admitted.store(false, Ordering::Release);
            }
            CircuitState::HalfOpen => {}
            CircuitState::Open => {
                inner.failures = inner.failures.saturating_add(1);
            }
        }
        self.transition(from, inner.state);
    }

    fn blocks_selection(&self, settings: &BreakerSettings) -> bool {
        let inner = self.lock(settings);
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => true,
            CircuitState::HalfOpen => self.probe_admitted.load(Ordering::Acquire),
        }
    }

    /// Returns a ticket when the attempt may proceed.
    fn admit(&self, settings: &BreakerSettings) -> Option<Ticket> {
        let inner = self.lock(settings);
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => return None,
            CircuitState::HalfOpen => {
                self.probe_admitted
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .ok()?;
                true
            }
        };
        Some(Ticket {
            generation: inner.generation,
            probe,
        })
    }

    /// Reopen the probe gate, unless the circuit has moved on since the
    /// probe was admitted.
    fn abandon_probe(&self, settings: &BreakerSettings, generation: u64) {
        let inner = self.lock(settings);
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            tracing::debug!(backend = %self.id, "Half-open probe abandoned");
            self.probe_admitted.store(false, Ordering::Release);
        }
    }

    fn snapshot(&self, settings: &BreakerSettings) -> CircuitSnapshot {
        let inner = self.lock(settings);
        let open_remaining_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) if !inner.forced => {
                Some(settings.timeout.saturating_sub(opened.elapsed()).as_millis() as u64)
            }
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            failures: inner.failures,
            forced: inner.forced,
            probe_in_flight: self.probe_admitted.load(Ordering::Acquire),
            open_remaining_ms,
        }
    }
}

/// Admission ticket for one attempt.
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping an unreported half-open probe reopens
/// the gate without changing state.
#[must_use]
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: Option<Arc<Breaker>>,
    settings: Arc<BreakerSettings>,
    ticket: Ticket,
}

impl CircuitPermit {
    pub fn is_probe(&self) -> bool {
        self.ticket.probe
    }

    pub fn success(mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.on_success(&self.settings, Some(self.ticket));
        }
    }

    pub fn failure(mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.on_failure(&self.settings, Some(self.ticket));
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            if self.ticket.probe {
                breaker.abandon_probe(&self.settings, self.ticket.generation);
            }
        }
    }
}

/// Circuit breakers for every backend.
#[derive(Debug)]
pub struct CircuitBreakers {
    settings: Arc<BreakerSettings>,
    breakers: DashMap<String, Arc<Breaker>>,
}

impl CircuitBreakers {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            breakers: DashMap::new(),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(BreakerSettings::from(config))
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    fn breaker(&self, id: &str) -> Arc<Breaker> {
        if let Some(existing) = self.breakers.get(id) {
            return existing.clone();
        }
        self.breakers
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(id)))
            .clone()
    }

    pub fn record_success(&self, id: &str) {
        if self.enabled() {
            self.breaker(id).on_success(&self.settings, None);
        }
    }

    pub fn record_failure(&self, id: &str) {
        if self.enabled() {
            self.breaker(id).on_failure(&self.settings, None);
        }
    }

    /// True if the backend must not be selected right now.
    pub fn is_open(&self, id: &str) -> bool {
        if !self.enabled() {
            return false;
        }
        match self.breakers.get(id) {
            Some(breaker) => breaker.blocks_selection(&self.settings),
            None => false,
        }
    }

    pub fn state(&self, id: &str) -> CircuitState {
        self.snapshot(id).state
    }

    pub fn snapshot(&self, id: &str) -> CircuitSnapshot {
        match self.breakers.get(id) {
            Some(breaker) if self.enabled() => breaker.snapshot(&self.settings),
            _ => CircuitSnapshot {
                state: CircuitState::Closed,
                failures: 0,
                forced: false,
                probe_in_flight: false,
                open_remaining_ms: None,
            },
        }
    }

    /// Gate an attempt against `id`.
    pub fn try_acquire(&self, id: &str) -> Result<CircuitPermit, ProxyError> {
        if !self.enabled() {
            return Ok(CircuitPermit {
                breaker: None,
                settings: self.settings.clone(),
                ticket: Ticket {
                    generation: 0,
                    probe: false,
                },
            });
        }
        let breaker = self.breaker(id);
        match breaker.admit(&self.settings) {
            Some(ticket) => {
                if ticket.probe {
                    tracing::debug!(backend = %id, "Half-open probe admitted");
                }
                Ok(CircuitPermit {
                    breaker: Some(breaker),
                    settings: self.settings.clone(),
                    ticket,
                })
            }
            None => Err(ProxyError::CircuitOpen {
                backend: id.to_string(),
            }),
        }
    }

    /// Open the circuit and restart its timeout.
    pub fn trip(&self, id: &str) {
        if !self.enabled() {
            return;
        }
        let breaker = self.breaker(id);
        let mut inner = breaker.lock(&self.settings);
        let from = inner.state;
        inner.open();
        breaker.probe_admitted.store(false, Ordering::Release);
        breaker.transition(from, inner.state);
    }

    /// Hold the circuit open until [`force_close`](Self::force_close).
    pub fn force_open(&self, id: &str) {
        let breaker = self.breaker(id);
        let mut inner = breaker.lock(&self.settings);
        let from = inner.state;
        inner.open();
        inner.forced = true;
        breaker.probe_admitted.store(false, Ordering::Release);
        tracing::warn!(backend = %id, "Circuit forced open");
        breaker.transition(from, inner.state);
    }

    pub fn force_close(&self, id: &str) {
        let breaker = self.breaker(id);
        let mut inner = breaker.lock(&self.settings);
        let from = inner.state;
        inner.close();
        breaker.probe_admitted.store(false, Ordering::Release);
        tracing::warn!(backend = %id, "Circuit forced closed");
        breaker.transition(from, inner.state);
    }

    /// Forget all state for `id`.
    pub fn remove(&self, id: &str) {
        self.breakers.remove(id);
    }
}

impl BackendObserver for CircuitBreakers {
    fn backend_removed(&self, id: &str) {
        self.remove(id);
    }
}
