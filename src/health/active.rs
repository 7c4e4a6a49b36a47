//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe backends (`GET {address}{path}`)
//! - Update backend health state based on results
//! - Trip the circuit of backends that turned unhealthy

use std::sync::Arc;
use std::time::Duration;
use axum::body::Body;
use axum::http::{header, Request};
use futures_util::future::join_all;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::{broadcast, Notify};
use tokio::time;
use crate::config::HealthCheckConfig;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::BackendRegistry;
use crate::observability::metrics;
use crate::resilience::CircuitBreakers;

pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    breakers: Arc<CircuitBreakers>,
    config: HealthCheckConfig,
    client: Client<HttpConnector, Body>,
    wake: Notify,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").field("config", &self.config).finish()
    }
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, breakers: Arc<CircuitBreakers>, config: HealthCheckConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self {
            registry,
            breakers,
            config,
            client,
            wake: Notify::new(),
        }
    }

    /// Ask the running monitor for an immediate cycle.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval = self.config.interval_secs,
            path = %self.config.path,
            "Health monitor starting"
        );

        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = self.wake.notified() => {
                    tracing::debug!("Health check triggered");
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every registered backend once, concurrently.
    pub async fn check_all(&self) {
        let backends = self.registry.all();
        join_all(backends.iter().map(|backend| self.check(backend))).await;
    }

    async fn probe(&self, backend: &Backend) -> Result<(), String> {
        let uri = format!(
            "{}{}",
            backend.address.as_str().trim_end_matches('/'),
            self.config.path
        );
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(header::USER_AGENT, "forward-proxy-health-check")
            .body(Body::empty())
            .map_err(|e| format!("invalid probe request: {e}"))?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(format!("non-success status {}", response.status())),
            Ok(Err(e)) => Err(format!("connection error: {e}")),
            Err(_) => Err(format!("timed out after {timeout:?}")),
        }
    }

    async fn check(&self, backend: &Arc<Backend>) {
        match self.probe(backend).await {
            Ok(()) => {
                if backend.mark_success(self.config.healthy_threshold as usize) {
                    tracing::info!(backend = %backend.id, "Backend marked healthy");
                }
            }
            Err(error) => {
                tracing::warn!(backend = %backend.id, error = %error, "Health check failed");
                let became_unhealthy = backend.mark_failure(self.config.unhealthy_threshold as usize, error);
                if became_unhealthy {
                    tracing::warn!(
                        backend = %backend.id,
                        failures = backend.consecutive_failures(),
                        "Backend marked unhealthy"
                    );
                }
                // Keep an unhealthy backend's circuit open while probes fail.
                if self.config.eject_unhealthy && !backend.is_healthy() {
                    self.breakers.trip(&backend.id);
                }
            }
        }

        metrics::record_backend_health(&backend.id, backend.is_healthy());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::load_balancer::HealthState;
    use crate::resilience::CircuitState;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;
    use url::Url;

    async fn spawn_backend(status: StatusCode) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/health", get(move || async move { status }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn backend(id: &str, port: u16) -> Backend {
        Backend::new(id, Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(), 1)
    }

    fn monitor(unhealthy_threshold: u32) -> (Arc<BackendRegistry>, Arc<CircuitBreakers>, HealthMonitor) {
        let registry = Arc::new(BackendRegistry::new());
        let breakers = Arc::new(CircuitBreakers::from_config(&CircuitBreakerConfig::default()));
        let config = HealthCheckConfig {
            enabled: true,
            interval_secs: 3600,
            timeout_secs: 1,
            path: "/health".into(),
            unhealthy_threshold,
            healthy_threshold: 1,
            eject_unhealthy: true,
        };
        let monitor = HealthMonitor::new(registry.clone(), breakers.clone(), config);
        (registry, breakers, monitor)
    }

    #[tokio::test]
    async fn test_probe_results_update_health() {
        let (registry, breakers, monitor) = monitor(2);
        let up = spawn_backend(StatusCode::OK).await;
        let failing = spawn_backend(StatusCode::SERVICE_UNAVAILABLE).await;
        let down = closed_port().await;
        registry.add(backend("up", up)).unwrap();
        registry.add(backend("failing", failing)).unwrap();
        registry.add(backend("down", down)).unwrap();

        monitor.check_all().await;
        assert_eq!(registry.get("up").unwrap().health(), HealthState::Healthy);
        // One failure is below the threshold of two.
        assert_eq!(registry.get("down").unwrap().health(), HealthState::Unknown);
        assert_eq!(breakers.state("down"), CircuitState::Closed);

        monitor.check_all().await;
        for id in ["failing", "down"] {
            let info = registry.get(id).unwrap().info();
            assert_eq!(info.health, HealthState::Unhealthy);
            assert_eq!(info.consecutive_failures, 2);
            assert!(info.last_error.is_some());
            assert!(info.last_check_unix_ms.is_some());
            assert_eq!(breakers.state(id), CircuitState::Open);
        }
        assert_eq!(breakers.state("up"), CircuitState::Closed);
        assert!(registry.get("up").unwrap().info().last_error.is_none());
    }

    #[tokio::test]
    async fn test_recovery_clears_failures() {
        let (registry, _breakers, monitor) = monitor(1);
        let port = closed_port().await;
        registry.add(backend("a", port)).unwrap();

        monitor.check_all().await;
        assert_eq!(registry.get("a").unwrap().health(), HealthState::Unhealthy);

        // Bring a server up on the same port.
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let app = Router::new().route("/health", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        monitor.check_all().await;
        let info = registry.get("a").unwrap().info();
        assert_eq!(info.health, HealthState::Healthy);
        assert_eq!(info.consecutive_failures, 0);
        assert!(info.last_error.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_honours_trigger() {
        let (registry, _breakers, monitor) = monitor(1);
        let port = spawn_backend(StatusCode::OK).await;
        registry.add(backend("a", port)).unwrap();

        let monitor = Arc::new(monitor);
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(monitor.clone().run(rx));

        // The first interval tick fires immediately.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.get("a").unwrap().health(), HealthState::Healthy);

        registry.add(backend("b", port)).unwrap();
        monitor.trigger();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.get("b").unwrap().health(), HealthState::Healthy);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
