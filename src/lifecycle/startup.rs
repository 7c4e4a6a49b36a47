//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems in dependency order
//! - Start background tasks (health checks, pool reaper)
//! - Register them with the shutdown coordinator
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners are bound by the caller once this returns (traffic only
//!   when ready)

use std::sync::Arc;
use crate::config::{ConfigError, ProxyConfig};
use crate::error::ProxyError;
use crate::health::HealthMonitor;
use crate::lifecycle::Shutdown;
use crate::proxy::ProxyManager;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to initialize proxy: {0}")]
    Proxy(#[from] ProxyError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

/// Handles to the running core services.
#[derive(Debug, Clone)]
pub struct Services {
    pub manager: Arc<ProxyManager>,
    pub health: Arc<HealthMonitor>,
}

/// Build the proxy manager and start its background tasks.
pub fn start(config: &ProxyConfig, shutdown: &Shutdown) -> Result<Services, StartupError> {
    start_with(Arc::new(ProxyManager::from_config(config.clone())?), config, shutdown)
}

/// Start background tasks around an already built manager.
pub fn start_with(
    manager: Arc<ProxyManager>,
    config: &ProxyConfig,
    shutdown: &Shutdown,
) -> Result<Services, StartupError> {
    let health = Arc::new(HealthMonitor::new(
        manager.registry().clone(),
        manager.breakers().clone(),
        config.health_check.clone(),
    ));
    shutdown.track("health-monitor", tokio::spawn(health.clone().run(shutdown.subscribe())));
    shutdown.track("pool-reaper", manager.pool().spawn_reaper(shutdown.subscribe()));

    tracing::info!(
        backends = manager.registry().len(),
        health_checks = config.health_check.enabled,
        "Core services started"
    );
    Ok(Services { manager, health })
}
