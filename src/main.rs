//! Forward proxy (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────────┐
//!                     │                    FORWARD PROXY                     │
//!                     │                                                      │
//!   Client Request    │  ┌─────────┐    ┌──────────────┐   ┌─────────────┐   │
//!   ──────────────────┼─▶│  http   │───▶│ proxy manager│──▶│    cache    │   │
//!                     │  │ server  │    │  (forwarder) │   │  (GET/200)  │   │
//!                     │  └─────────┘    └──────┬───────┘   └─────────────┘   │
//!                     │                        │                             │
//!                     │                        ▼                             │
//!                     │                ┌───────────────┐                     │
//!                     │                │ load_balancer │ ◀── circuit breaker │
//!                     │                └──────┬────────┘                     │
//!                     │                       ▼                              │
//!   Client Response   │                ┌───────────────┐                     │
//!   ◀─────────────────┼────────────────│ pool (hyper)  │◀────────────────────┼──── Backend
//!                     │                └───────────────┘                     │
//!                     │                                                      │
//!                     │  config · health · observability · lifecycle · admin │
//!                     └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use tokio::net::TcpListener;
use forward_proxy::admin::{setup_admin_router, AdminState};
use forward_proxy::config::watcher::{spawn_reload_loop, ConfigWatcher};
use forward_proxy::config::{load_config, ProxyConfig};
use forward_proxy::lifecycle::{signals, startup, Shutdown, StartupError};
use forward_proxy::observability::{logging, metrics};
use forward_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "forward-proxy")]
#[command(about = "Load-balancing forward proxy", long_about = None)]
struct Args {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long, env = "PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Seconds to wait for background tasks on shutdown.
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,
}

async fn bind(address: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(address).await.map_err(|source| StartupError::Bind {
        address: address.to_string(),
        source,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "forward-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        backends = config.backends.len(),
        algorithm = ?config.load_balancer.algorithm,
        request_timeout_ms = config.timeouts.request_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr).map_err(StartupError::from)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Arc::new(Shutdown::new());
    let services = startup::start(&config, &shutdown)?;

    // Hot reload of the backend set.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => {
                    shutdown.track(
                        "config-reload",
                        spawn_reload_loop(services.manager.clone(), updates, shutdown.subscribe()),
                    );
                    Some(handle)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    if config.admin.enabled {
        let listener = bind(&config.admin.bind_address).await?;
        let router = setup_admin_router(AdminState::new(
            services.manager.clone(),
            Some(services.health.clone()),
            &config.admin.api_key,
        ));
        let mut admin_shutdown = shutdown.subscribe();
        tracing::info!(address = %config.admin.bind_address, "Admin API listening");
        shutdown.track(
            "admin-api",
            tokio::spawn(async move {
                let served = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = admin_shutdown.recv().await;
                    })
                    .await;
                if let Err(e) = served {
                    tracing::error!(error = %e, "Admin API server failed");
                }
            }),
        );
    }

    let listener = bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { signals::forward_signals(&shutdown).await });
    }

    let server = HttpServer::new(services.manager.clone(), &config);
    server.run(listener, shutdown.subscribe()).await?;

    shutdown.complete(Duration::from_secs(args.shutdown_timeout)).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
