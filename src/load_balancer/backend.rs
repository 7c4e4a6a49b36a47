//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single registered backend server
//! - Track in-flight requests (for Least Connections LB)
//! - Hold the administrative active flag
//! - Track health state (Healthy/Unhealthy) and the last probe outcome

use url::Url;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::ops::Deref;
use std::time::{SystemTime, UNIX_EPOCH};
use crate::config::BackendConfig;
use crate::config::validation::validate_address;
use crate::error::ProxyError;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

#[derive(Debug, Default)]
struct ProbeRecord {
    last_check: Option<SystemTime>,
    last_error: Option<String>,
}

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    /// Unique identifier.
    pub id: String,
    /// Base URL requests are forwarded to.
    pub address: Url,
    /// Relative weight for weighted selection.
    pub weight: u32,

    active: AtomicBool,
    /// Number of requests currently being served.
    in_flight: AtomicUsize,

    /// Current health state (0=Unknown, 1=Healthy, 2=Unhealthy).
    state: AtomicU8,
    /// Consecutive failure count.
    consecutive_failures: AtomicUsize,
    /// Consecutive success count.
    consecutive_successes: AtomicUsize,
    probe: Mutex<ProbeRecord>,
}

impl Backend {
    /// Create a new backend.
    pub fn new(id: impl Into<String>, address: Url, weight: u32) -> Self {
        Self {
            id: id.into(),
            address,
            weight: weight.max(1),
            active: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
            probe: Mutex::new(ProbeRecord::default()),
        }
    }

    /// Build a backend from its configuration entry.
    pub fn from_config(config: &BackendConfig) -> Result<Self, ProxyError> {
        if config.id.trim().is_empty() {
            return Err(ProxyError::InvalidBackend {
                id: config.id.clone(),
                reason: "id must not be empty".into(),
            });
        }
        let address = validate_address(&config.address).map_err(|reason| ProxyError::InvalidBackend {
            id: config.id.clone(),
            reason,
        })?;
        let backend = Self::new(config.id.clone(), address, config.weight);
        backend.set_active(config.active);
        Ok(backend)
    }

    /// `host:port` of the backend, used for dialing and the Host header.
    pub fn authority(&self) -> String {
        let host = self.address.host_str().unwrap_or("localhost");
        match self.address.port_or_known_default() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Get the current number of in-flight requests.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Count a request against this backend until the guard drops.
    pub fn track_request(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            backend: self.clone(),
        }
    }

    // --- Health Logic ---

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Relaxed))
    }

    /// Return true if backend is considered healthy (Healthy or Unknown).
    pub fn is_healthy(&self) -> bool {
        self.health() != HealthState::Unhealthy
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Report a successful probe. Returns true if the backend became healthy.
    pub fn mark_success(&self, healthy_threshold: usize) -> bool {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.record_probe(None);

        if self.health() == HealthState::Healthy {
            return false;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= healthy_threshold {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            self.state.store(HealthState::Healthy as u8, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Report a failed probe. Returns true if the backend became unhealthy.
    pub fn mark_failure(&self, unhealthy_threshold: usize, error: impl Into<String>) -> bool {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.record_probe(Some(error.into()));

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if self.health() == HealthState::Unhealthy {
            return false;
        }

        if failures >= unhealthy_threshold {
            self.state.store(HealthState::Unhealthy as u8, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn record_probe(&self, error: Option<String>) {
        let mut probe = self.probe.lock().unwrap_or_else(|e| e.into_inner());
        probe.last_check = Some(SystemTime::now());
        probe.last_error = error;
    }

    /// Point-in-time copy of this backend's state.
    pub fn info(&self) -> BackendInfo {
        let probe = self.probe.lock().unwrap_or_else(|e| e.into_inner());
        BackendInfo {
            id: self.id.clone(),
            address: self.address.to_string(),
            weight: self.weight,
            active: self.is_active(),
            health: self.health(),
            consecutive_failures: self.consecutive_failures(),
            last_check_unix_ms: probe.last_check.map(unix_millis),
            last_error: probe.last_error.clone(),
            in_flight: self.in_flight(),
        }
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Snapshot of a backend, detached from the live registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendInfo {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub active: bool,
    pub health: HealthState,
    pub consecutive_failures: usize,
    pub last_check_unix_ms: Option<u64>,
    pub last_error: Option<String>,
    pub in_flight: usize,
}

/// A RAII guard that manages the in-flight request count.
#[derive(Debug)]
pub struct InFlightGuard {
    backend: Arc<Backend>,
}

impl Deref for InFlightGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) fn test_backend(id: &str, port: u16) -> Arc<Backend> {
    let url = Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
    Arc::new(Backend::new(id, url, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_transitions() {
        let b = test_backend("a", 8080);
        assert_eq!(b.health(), HealthState::Unknown);
        assert!(b.is_healthy());

        assert!(!b.mark_failure(2, "refused"));
        assert!(b.mark_failure(2, "refused"));
        assert_eq!(b.health(), HealthState::Unhealthy);
        assert_eq!(b.consecutive_failures(), 2);
        assert_eq!(b.info().last_error.as_deref(), Some("refused"));

        assert!(b.mark_success(1));
        assert_eq!(b.health(), HealthState::Healthy);
        assert_eq!(b.consecutive_failures(), 0);
        assert!(b.info().last_error.is_none());
        assert!(b.info().last_check_unix_ms.is_some());
    }

    #[test]
    fn test_in_flight_guard() {
        let b = test_backend("a", 8080);
        {
            let _g1 = b.track_request();
            let _g2 = b.track_request();
            assert_eq!(b.in_flight(), 2);
        }
        assert_eq!(b.in_flight(), 0);
    }

    #[test]
    fn test_from_config() {
        let mut config = BackendConfig::new("api", "https://example.com");
        config.active = false;
        let b = Backend::from_config(&config).unwrap();
        assert_eq!(b.authority(), "example.com:443");
        assert!(!b.is_active());

        let bad = Backend::from_config(&BackendConfig::new("x", "nope"));
        assert!(matches!(bad, Err(ProxyError::InvalidBackend { .. })));
    }
}
