//! Administrative HTTP API.
//!
//! # Routes
//! - `GET /admin/status`
//! - `GET|POST /admin/backends`, `GET|DELETE /admin/backends/{id}`
//! - `PUT /admin/backends/{id}/active`
//! - `POST /admin/backends/{id}/circuit/open|close`
//! - `GET /admin/metrics`, `POST /admin/metrics/reset`
//! - `POST /admin/health/check`
//!
//! Every route requires `Authorization: Bearer <admin.api_key>`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;
use crate::health::HealthMonitor;
use crate::proxy::ProxyManager;
use self::auth::admin_auth_middleware;
use self::handlers::*;

#[derive(Clone)]
pub struct AdminState {
    pub manager: Arc<ProxyManager>,
    pub health: Option<Arc<HealthMonitor>>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(manager: Arc<ProxyManager>, health: Option<Arc<HealthMonitor>>, api_key: &str) -> Self {
        Self {
            manager,
            health,
            api_key: Arc::from(api_key),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/backends", get(list_backends).post(add_backend))
        .route("/admin/backends/{id}", get(get_backend).delete(remove_backend))
        .route("/admin/backends/{id}/active", put(set_active))
        .route("/admin/backends/{id}/circuit/open", post(open_circuit))
        .route("/admin/backends/{id}/circuit/close", post(close_circuit))
        .route("/admin/metrics", get(get_metrics))
        .route("/admin/metrics/reset", post(reset_metrics))
        .route("/admin/health/check", post(trigger_health_check))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
