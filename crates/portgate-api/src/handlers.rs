use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use portgate_control::{
    ClientPage, ClientQuery, ControlError, Dashboard, Orchestrator, TunnelPage, TunnelQuery,
};
use std::sync::Arc;
use tracing::{debug, error};

use crate::models::*;
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn orchestrator(state: &AppState) -> Result<Arc<Orchestrator>, ApiError> {
    state.orchestrator.upgrade().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("broker is shutting down", "SHUTTING_DOWN")),
        )
    })
}

fn internal(e: ControlError) -> ApiError {
    error!("Status query failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(e.to_string(), "INTERNAL_ERROR")),
    )
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    let orchestrator = orchestrator(&state)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        running_tasks: orchestrator.running_count(),
    }))
}

/// Aggregate counters
pub async fn dashboard(State(state): State<Arc<AppState>>) -> Result<Json<Dashboard>, ApiError> {
    debug!("Dashboard requested");
    let orchestrator = orchestrator(&state)?;
    orchestrator.dashboard().await.map(Json).map_err(internal)
}

/// Persisted tasks with live run status, filtered and paginated
pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TunnelQuery>,
) -> Result<Json<TunnelPage>, ApiError> {
    debug!(?query, "Listing tunnels");
    let orchestrator = orchestrator(&state)?;
    orchestrator.get_tunnel(&query).await.map(Json).map_err(internal)
}

pub async fn list_clients(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClientQuery>,
) -> Result<Json<ClientPage>, ApiError> {
    debug!(?query, "Listing clients");
    let orchestrator = orchestrator(&state)?;
    orchestrator
        .get_client_list(&query)
        .await
        .map(Json)
        .map_err(internal)
}
