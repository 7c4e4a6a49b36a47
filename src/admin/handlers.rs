use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use crate::admin::AdminState;
use crate::config::BackendConfig;
use crate::error::ProxyError;
use crate::load_balancer::BackendInfo;
use crate::observability::metrics::MetricsSnapshot;
use crate::proxy::BackendStatus;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub algorithm: &'static str,
    pub backends: usize,
    pub eligible_backends: usize,
    pub cache_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetActive {
    pub active: bool,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        algorithm: state.manager.algorithm(),
        backends: state.manager.registry().len(),
        eligible_backends: state.manager.eligible_backends().len(),
        cache_enabled: state.manager.cache_enabled(),
    })
}

pub async fn list_backends(State(state): State<AdminState>) -> Json<Vec<BackendStatus>> {
    Json(state.manager.list_backends())
}

pub async fn get_backend(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<BackendStatus>, ProxyError> {
    state.manager.backend_status(&id).map(Json)
}

pub async fn add_backend(
    State(state): State<AdminState>,
    Json(config): Json<BackendConfig>,
) -> Result<(StatusCode, Json<BackendInfo>), ProxyError> {
    let info = state.manager.add_backend(&config)?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn remove_backend(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ProxyError> {
    state.manager.remove_backend(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_active(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<SetActive>,
) -> Result<Json<BackendStatus>, ProxyError> {
    state.manager.set_backend_active(&id, body.active)?;
    state.manager.backend_status(&id).map(Json)
}

pub async fn open_circuit(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<BackendStatus>, ProxyError> {
    state.manager.force_open_circuit(&id)?;
    state.manager.backend_status(&id).map(Json)
}

pub async fn close_circuit(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<BackendStatus>, ProxyError> {
    state.manager.force_close_circuit(&id)?;
    state.manager.backend_status(&id).map(Json)
}

pub async fn get_metrics(State(state): State<AdminState>) -> Json<MetricsSnapshot> {
    Json(state.manager.metrics_snapshot())
}

pub async fn reset_metrics(State(state): State<AdminState>) -> StatusCode {
    state.manager.reset_metrics();
    StatusCode::NO_CONTENT
}

pub async fn trigger_health_check(State(state): State<AdminState>) -> StatusCode {
    match &state.health {
        Some(monitor) => {
            monitor.trigger();
            StatusCode::ACCEPTED
        }
        None => StatusCode::CONFLICT,
    }
}
