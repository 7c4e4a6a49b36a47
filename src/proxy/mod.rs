//! Proxy manager: the request orchestrator and its administrative surface.
//!
//! # Data Flow
//! ```text
//! ProxyRequest
//!     → forwarder.rs (cache probe, retry loop)
//!         → load_balancer (eligible = active && circuit not open)
//!         → resilience::circuit_breaker (gate)
//!         → pool (acquire, send, release)
//!     → cache store on success
//!     → ProxyResponse / ProxyError
//! ```
//!
//! # Design Decisions
//! - The manager owns every subsystem; the HTTP layer and the admin API
//!   only hold an `Arc<ProxyManager>`
//! - Breakers and pool subscribe to registry removals so a re-registered
//!   id starts with fresh state

pub mod forwarder;
pub mod message;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use crate::cache::{CacheStore, MemoryCacheStore, ResponseCache};
use crate::config::{BackendConfig, ProxyConfig, RetryConfig};
use crate::error::ProxyError;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::{self as lb, BackendInfo, BackendRegistry, LoadBalancer};
use crate::observability::metrics::{MetricsSnapshot, ProxyMetrics};
use crate::pool::{ConnectionPool, Connector, Http1Connector, PoolSettings, PoolStats};
use crate::resilience::{CircuitBreakers, CircuitSnapshot};

pub use message::{ProxyRequest, ProxyResponse, RequestContext};

/// Operator view of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    #[serde(flatten)]
    pub info: BackendInfo,
    pub circuit: CircuitSnapshot,
    pub pool: Option<PoolStats>,
}

/// What a backend reconciliation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

pub struct ProxyManagerBuilder {
    config: ProxyConfig,
    connector: Option<Arc<dyn Connector>>,
    cache_store: Option<Arc<dyn CacheStore>>,
}

impl ProxyManagerBuilder {
    /// Replace the upstream connector (defaults to [`Http1Connector`]).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the cache store (defaults to [`MemoryCacheStore`]).
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn build(self) -> Result<ProxyManager, ProxyError> {
        let config = self.config;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(Http1Connector::default()));

        let registry = Arc::new(BackendRegistry::new());
        let breakers = Arc::new(CircuitBreakers::from_config(&config.circuit_breaker));
        let pool = Arc::new(ConnectionPool::new(connector, PoolSettings::from(&config.pool)));
        let metrics = Arc::new(ProxyMetrics::new());
        registry.subscribe(breakers.clone());
        registry.subscribe(pool.clone());
        registry.subscribe(metrics.clone());

        for backend in &config.backends {
            registry.add(Backend::from_config(backend)?)?;
        }

        let cache = if config.cache.enabled {
            let store = self
                .cache_store
                .unwrap_or_else(|| Arc::new(MemoryCacheStore::new(config.cache.max_entries)));
            Some(ResponseCache::from_config(store, &config.cache))
        } else {
            None
        };

        let balancer = lb::build(config.load_balancer.algorithm);
        tracing::info!(
            backends = registry.len(),
            algorithm = balancer.name(),
            cache = cache.is_some(),
            circuit_breaker = breakers.enabled(),
            max_retries = config.retries.max_retries,
            "Proxy manager initialized"
        );

        Ok(ProxyManager {
            registry,
            breakers,
            pool,
            balancer,
            cache,
            metrics,
            retries: config.retries.clone(),
            request_timeout: config.timeouts.request(),
        })
    }
}

/// Owns the backend set and every per-backend subsystem.
pub struct ProxyManager {
    registry: Arc<BackendRegistry>,
    breakers: Arc<CircuitBreakers>,
    pool: Arc<ConnectionPool>,
    balancer: Box<dyn LoadBalancer>,
    cache: Option<ResponseCache>,
    metrics: Arc<ProxyMetrics>,
    retries: RetryConfig,
    request_timeout: Duration,
}

impl std::fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyManager")
            .field("backends", &self.registry.len())
            .field("balancer", &self.balancer.name())
            .field("cache", &self.cache)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ProxyManager {
    pub fn builder(config: ProxyConfig) -> ProxyManagerBuilder {
        ProxyManagerBuilder {
            config,
            connector: None,
            cache_store: None,
        }
    }

    /// Manager with the default connector and cache store.
    pub fn from_config(config: ProxyConfig) -> Result<Self, ProxyError> {
        Self::builder(config).build()
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub fn algorithm(&self) -> &'static str {
        self.balancer.name()
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn add_backend(&self, config: &BackendConfig) -> Result<BackendInfo, ProxyError> {
        let backend = self.registry.add(Backend::from_config(config)?)?;
        Ok(backend.info())
    }

    pub fn remove_backend(&self, id: &str) -> Result<(), ProxyError> {
        self.registry.remove(id).map(|_| ())
    }

    pub fn set_backend_active(&self, id: &str, active: bool) -> Result<(), ProxyError> {
        self.registry.set_active(id, active)
    }

    fn status_of(&self, backend: &Backend) -> BackendStatus {
        BackendStatus {
            info: backend.info(),
            circuit: self.breakers.snapshot(&backend.id),
            pool: self.pool.stats(&backend.id),
        }
    }

    /// Every backend with its health, circuit and pool state.
    pub fn list_backends(&self) -> Vec<BackendStatus> {
        self.registry.all().iter().map(|b| self.status_of(b)).collect()
    }

    pub fn backend_status(&self, id: &str) -> Result<BackendStatus, ProxyError> {
        self.registry
            .get(id)
            .map(|b| self.status_of(&b))
            .ok_or_else(|| ProxyError::NotFound(id.to_string()))
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn force_open_circuit(&self, id: &str) -> Result<(), ProxyError> {
        self.registry.get(id).ok_or_else(|| ProxyError::NotFound(id.to_string()))?;
        self.breakers.force_open(id);
        Ok(())
    }

    pub fn force_close_circuit(&self, id: &str) -> Result<(), ProxyError> {
        self.registry.get(id).ok_or_else(|| ProxyError::NotFound(id.to_string()))?;
        self.breakers.force_close(id);
        Ok(())
    }

    /// Bring the registry in line with `desired`.
    ///
    /// Unknown ids are added, missing ones removed. An entry whose address or
    /// weight changed is re-registered (fresh circuit and pool); one whose
    /// only change is the active flag is toggled in place. Invalid entries are
    /// logged and skipped.
    pub fn reconcile_backends(&self, desired: &[BackendConfig]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let wanted: HashMap<&str, &BackendConfig> = desired.iter().map(|b| (b.id.as_str(), b)).collect();

        for current in self.registry.all().iter() {
            if !wanted.contains_key(current.id.as_str()) && self.registry.remove(&current.id).is_ok() {
                summary.removed += 1;
            }
        }

        for config in desired {
            let replacement = match Backend::from_config(config) {
                Ok(backend) => backend,
                Err(e) => {
                    tracing::warn!(backend = %config.id, error = %e, "Skipping invalid backend during reconcile");
                    continue;
                }
            };

            match self.registry.get(&config.id) {
                None => {
                    if self.registry.add(replacement).is_ok() {
                        summary.added += 1;
                    }
                }
                Some(existing) if existing.address != replacement.address || existing.weight != replacement.weight => {
                    let _ = self.registry.remove(&config.id);
                    if self.registry.add(replacement).is_ok() {
                        summary.updated += 1;
                    }
                }
                Some(existing) if existing.is_active() != config.active => {
                    existing.set_active(config.active);
                    summary.updated += 1;
                }
                Some(_) => {}
            }
        }

        summary
    }
}
