//! Outbound connection pooling.
//!
//! # Data Flow
//! ```text
//! acquire(backend)
//!     → wait for a checkout slot (bounded by connect timeout)
//!     → reuse newest idle connection (stale / closed ones are dropped)
//!     → or dial a new one via connector.rs
//! release(conn, healthy)
//!     → healthy: back onto the idle list, then the slot is freed
//!     → unhealthy: connection closed
//! reaper: periodically drops idle connections past the idle timeout
//! ```
//!
//! # Design Decisions
//! - One small pool per backend, found through a sharded map
//! - Checkout slots are a semaphore sized to the per-backend maximum; a
//!   released connection reaches the idle list before its slot is freed, so
//!   idle + checked-out never exceeds the maximum
//! - A checked-out connection is owned by its holder; dropping it without a
//!   release discards it
//! - Removing a backend retires its pool but keeps the slot semaphore while
//!   connections are still checked out; a pool re-created for the same id
//!   inherits it, so old and new connections share one bound

pub mod connector;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use crate::config::PoolConfig;
use crate::error::ProxyError;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::BackendObserver;
use crate::proxy::message::{ProxyRequest, ProxyResponse};
use crate::resilience::backoff::with_jitter;

pub use connector::{Connector, Http1Connector, UpstreamConnection};

/// Runtime settings, in durations rather than config units.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections_per_backend: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_connections_per_backend: config.max_connections_per_backend.max(1),
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.idle_timeout(),
            reap_interval: Duration::from_secs(config.reap_interval_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub closed: u64,
}

struct IdleConnection {
    conn: Box<dyn UpstreamConnection>,
    created_at: Instant,
    last_used: Instant,
}

struct BackendPool {
    id: String,
    max: usize,
    idle: Mutex<Vec<IdleConnection>>,
    slots: Arc<Semaphore>,
    retired: AtomicBool,
    created: AtomicU64,
    closed: AtomicU64,
}

impl BackendPool {
    fn new(id: &str, max: usize, slots: Arc<Semaphore>) -> Self {
        Self {
            id: id.to_string(),
            max,
            idle: Mutex::new(Vec::new()),
            slots,
            retired: AtomicBool::new(false),
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<IdleConnection>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Newest idle connection that is still usable.
    fn take_idle(&self, idle_timeout: Duration) -> Option<IdleConnection> {
        let mut idle = self.idle();
        while let Some(candidate) = idle.pop() {
            if candidate.last_used.elapsed() <= idle_timeout && candidate.conn.is_open() {
                return Some(candidate);
            }
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn reap(&self, idle_timeout: Duration) -> usize {
        let mut idle = self.idle();
        let before = idle.len();
        idle.retain(|c| c.last_used.elapsed() <= idle_timeout && c.conn.is_open());
        let reaped = before - idle.len();
        self.closed.fetch_add(reaped as u64, Ordering::Relaxed);
        reaped
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        let drained = {
            let mut idle = self.idle();
            let n = idle.len();
            idle.clear();
            n
        };
        self.closed.fetch_add(drained as u64, Ordering::Relaxed);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle().len(),
            in_use: self.max - self.slots.available_permits().min(self.max),
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}

/// A connection checked out of the pool.
///
/// Return it with [`release`](Self::release). Dropping it instead counts as an
/// unhealthy release: the connection is closed.
pub struct PooledConnection {
    conn: Option<Box<dyn UpstreamConnection>>,
    pool: Arc<BackendPool>,
    created_at: Instant,
    last_used: Instant,
    reused: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("backend", &self.pool.id)
            .field("reused", &self.reused)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl PooledConnection {
    pub fn backend_id(&self) -> &str {
        &self.pool.id
    }

    /// True if this connection came from the idle list.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub async fn send(&mut self, backend: &Backend, request: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ProxyError::transport(&backend.id, "connection already released"))?;
        let result = conn.send(backend, request).await;
        self.last_used = Instant::now();
        result
    }

    /// Hand the connection back. Only healthy, open connections are pooled.
    pub fn release(mut self, healthy: bool) {
        let Some(conn) = self.conn.take() else { return };
        let reusable = healthy && conn.is_open() && !self.pool.retired.load(Ordering::Acquire);
        if reusable {
            self.pool.idle().push(IdleConnection {
                conn,
                created_at: self.created_at,
                last_used: Instant::now(),
            });
        } else {
            self.pool.closed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(backend = %self.pool.id, healthy, "Connection discarded");
        }
        // The slot frees only after the connection is back on the idle list.
        self.permit.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.closed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(backend = %self.pool.id, "Connection dropped without release, closing");
        }
    }
}

/// Connection pools for every backend.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    pools: DashMap<String, Arc<BackendPool>>,
    /// Slot semaphores of removed backends with connections still out.
    draining: DashMap<String, Arc<Semaphore>>,
    acquires: AtomicU64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("backends", &self.pools.len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, settings: PoolSettings) -> Self {
        Self {
            connector,
            settings,
            pools: DashMap::new(),
            draining: DashMap::new(),
            acquires: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn backend_pool(&self, id: &str) -> Arc<BackendPool> {
        if let Some(pool) = self.pools.get(id) {
            return pool.clone();
        }
        self.pools
            .entry(id.to_string())
            .or_insert_with(|| {
                let max = self.settings.max_connections_per_backend;
                let slots = self
                    .draining
                    .remove(id)
                    .map(|(_, slots)| slots)
                    .unwrap_or_else(|| Arc::new(Semaphore::new(max)));
                Arc::new(BackendPool::new(id, max, slots))
            })
            .clone()
    }

    /// Check out a connection to `backend`, waiting up to the connect timeout
    /// for a free slot.
    pub async fn acquire(&self, backend: &Backend) -> Result<PooledConnection, ProxyError> {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        let pool = self.backend_pool(&backend.id);

        let exhausted = || ProxyError::PoolExhausted {
            backend: backend.id.clone(),
        };
        let permit = match tokio::time::timeout(self.settings.connect_timeout, pool.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(exhausted()),
            Err(_) => {
                tracing::warn!(backend = %backend.id, max = pool.max, "Connection pool exhausted");
                return Err(exhausted());
            }
        };

        // The backend was removed while we waited for the slot.
        if pool.retired.load(Ordering::Acquire) {
            return Err(exhausted());
        }

        if let Some(idle) = pool.take_idle(self.settings.idle_timeout) {
            return Ok(PooledConnection {
                conn: Some(idle.conn),
                pool,
                created_at: idle.created_at,
                last_used: idle.last_used,
                reused: true,
                permit: Some(permit),
            });
        }

        let conn = match tokio::time::timeout(self.settings.connect_timeout, self.connector.connect(backend)).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(ProxyError::transport(
                    &backend.id,
                    format!("connect timed out after {:?}", self.settings.connect_timeout),
                ))
            }
        };
        pool.created.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        Ok(PooledConnection {
            conn: Some(conn),
            pool,
            created_at: now,
            last_used: now,
            reused: false,
            permit: Some(permit),
        })
    }

    /// Return a connection; see [`PooledConnection::release`].
    pub fn release(&self, conn: PooledConnection, healthy: bool) {
        conn.release(healthy);
    }

    /// Close idle connections past the idle timeout. Returns how many closed.
    pub fn reap_idle(&self) -> usize {
        let pools: Vec<_> = self.pools.iter().map(|p| p.value().clone()).collect();
        let reaped: usize = pools.iter().map(|p| p.reap(self.settings.idle_timeout)).sum();
        let max = self.settings.max_connections_per_backend;
        self.draining.retain(|_, slots| slots.available_permits() < max);
        if reaped > 0 {
            tracing::debug!(reaped, "Reaped idle connections");
        }
        reaped
    }

    /// Run [`reap_idle`](Self::reap_idle) periodically until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(with_jitter(pool.settings.reap_interval)) => {
                        pool.reap_idle();
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Connection reaper received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        })
    }

    /// Close idle connections for `id` and forget its pool. Connections still
    /// checked out are closed when released, and keep holding their slots
    /// until then.
    pub fn remove_backend(&self, id: &str) {
        if let Some((_, pool)) = self.pools.remove(id) {
            pool.retire();
            if pool.slots.available_permits() < pool.max {
                self.draining.insert(id.to_string(), pool.slots.clone());
            }
        }
    }

    pub fn stats(&self, id: &str) -> Option<PoolStats> {
        self.pools.get(id).map(|p| p.stats())
    }

    /// Total number of `acquire` calls.
    pub fn acquire_count(&self) -> u64 {
        self.acquires.load(Ordering::Relaxed)
    }
}

impl BackendObserver for ConnectionPool {
    fn backend_removed(&self, id: &str) {
        self.remove_backend(id);
    }
}
