//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router with the catch-all proxy handler
//! - Wire up middleware (tracing, body limit, request ID)
//! - Hand each request to the proxy manager with a deadline and a
//!   cancellation token tied to the client connection
//! - Serve until the shutdown broadcast fires

use std::sync::Arc;
use std::time::{Duration, Instant};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, Request},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use crate::config::ProxyConfig;
use crate::http::request::{
    into_proxy_request, propagate_request_id_layer, request_id, set_request_id_layer, X_REQUEST_ID,
};
use crate::observability::metrics;
use crate::proxy::message::RequestContext;
use crate::proxy::ProxyManager;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ProxyManager>,
    pub max_body_bytes: usize,
    /// Overall budget for one client request, retries included.
    pub request_deadline: Duration,
}

impl AppState {
    pub fn new(manager: Arc<ProxyManager>, config: &ProxyConfig) -> Self {
        let attempts = config.retries.max_retries.saturating_add(1);
        Self {
            manager,
            max_body_bytes: config.listener.max_body_bytes,
            request_deadline: config.timeouts.request().saturating_mul(attempts),
        }
    }
}

/// Inbound HTTP front end of the proxy.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(manager: Arc<ProxyManager>, config: &ProxyConfig) -> Self {
        let state = AppState::new(manager, config);
        Self {
            router: Self::build_router(state),
        }
    }

    /// Build the Axum router with all middleware layers.
    pub fn build_router(state: AppState) -> Router {
        let max_body_bytes = state.max_body_bytes;
        Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(max_body_bytes))
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server until `shutdown` fires, then drain in-flight requests.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server received shutdown signal, draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Main proxy handler.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start_time = Instant::now();
    let request_id = request_id(request.headers()).to_string();
    let method = request.method().clone();
    let method_str = method.to_string();

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        uri = %request.uri(),
        "Proxying request"
    );

    // Dropping the handler (client went away) cancels the forward.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let context = RequestContext::new()
        .with_timeout(state.request_deadline)
        .with_cancel(cancel);

    let mut proxied = match into_proxy_request(request, state.max_body_bytes, context).await {
        Ok(proxied) => proxied,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Rejecting request body");
            metrics::record_request(&method_str, 413, start_time);
            return (axum::http::StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response();
        }
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        proxied.headers.insert(X_REQUEST_ID, value);
    }

    let response = match state.manager.forward(proxied).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Upstream request failed");
            e.into_response()
        }
    };

    metrics::record_request(&method_str, response.status().as_u16(), start_time);
    response
}
