//! Admin endpoint handlers.
//!
//! Read endpoints return the mesh's own serde types as JSON. Unknown ids map
//! to 404; the gateway endpoint answers 200 with the `GatewayResponse` in the
//! body, whatever status the routed call produced. Endpoints that act on the
//! mesh answer 503 once the server is draining.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use meshkit_core::{
    CircuitBreakerSnapshot, DeadLetter, GatewayRequest, GatewayResponse, MeshStatus,
    ServiceHealthReport, ServiceInstance, ServiceRoute, Span,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::lifecycle::{AdminLifecycle, ServerState};
use crate::gateway::middleware::GatewayPipeline;
use crate::mesh::ServiceMesh;

const DEFAULT_TRACE_LIMIT: usize = 100;

/// Shared state carried through axum extractors. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub mesh: Arc<ServiceMesh>,
    pub pipeline: GatewayPipeline,
    pub lifecycle: Arc<AdminLifecycle>,
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(mesh: Arc<ServiceMesh>, lifecycle: Arc<AdminLifecycle>) -> Self {
        Self {
            pipeline: mesh.gateway_service(),
            mesh,
            lifecycle,
            start_time: Instant::now(),
        }
    }
}

/// Server lifecycle plus mesh counts. 503 while draining or stopped.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let server_state = state.lifecycle.state();
    let status = state.mesh.status();
    let code = match server_state {
        ServerState::Starting | ServerState::Ready => StatusCode::OK,
        ServerState::Draining | ServerState::Stopped => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = json!({
        "state": server_state,
        "nodeId": state.mesh.config().node_id,
        "meshShuttingDown": state.mesh.is_shutting_down(),
        "services": status.services,
        "healthyInstances": status.healthy_instances,
        "openBreakers": status.circuit_breakers.open,
        "inFlight": state.lifecycle.in_flight(),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    });
    (code, Json(body))
}

pub async fn status_handler(State(state): State<AppState>) -> Json<MeshStatus> {
    Json(state.mesh.status())
}

pub async fn services_handler(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, Vec<ServiceInstance>>> {
    Json(state.mesh.registry().list_all())
}

pub async fn mesh_health_handler(State(state): State<AppState>) -> Json<Vec<ServiceHealthReport>> {
    Json(state.mesh.check_all())
}

pub async fn breakers_handler(State(state): State<AppState>) -> Json<Vec<CircuitBreakerSnapshot>> {
    Json(state.mesh.breaker_states())
}

pub async fn reset_breaker_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<CircuitBreakerSnapshot>, StatusCode> {
    if !state.mesh.reset_breaker(&service) {
        return Err(StatusCode::NOT_FOUND);
    }
    state
        .mesh
        .breaker_state(&service)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn routes_handler(State(state): State<AppState>) -> Json<Vec<ServiceRoute>> {
    Json(state.mesh.routes().all())
}

#[derive(Debug, Deserialize)]
pub struct TracesQuery {
    pub limit: Option<usize>,
}

/// Most recent spans, newest first.
pub async fn traces_handler(
    State(state): State<AppState>,
    Query(query): Query<TracesQuery>,
) -> Json<Vec<Span>> {
    Json(
        state
            .mesh
            .tracer()
            .recent(query.limit.unwrap_or(DEFAULT_TRACE_LIMIT)),
    )
}

pub async fn dead_letters_handler(State(state): State<AppState>) -> Json<Vec<DeadLetter>> {
    Json(state.mesh.dead_letters())
}

pub async fn retry_dead_letter_handler(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let _guard = state.lifecycle.track().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    state
        .mesh
        .retry_dead_letter(&event_id)
        .await
        .map(|new_id| Json(json!({ "eventId": new_id, "retriedFrom": event_id })))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Routes a request through the gateway pipeline.
pub async fn gateway_handler(
    State(state): State<AppState>,
    Json(request): Json<GatewayRequest>,
) -> Result<Json<GatewayResponse>, StatusCode> {
    let _guard = state.lifecycle.track().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    match state.pipeline.clone().oneshot(request).await {
        Ok(response) => Ok(Json(response)),
        Err(never) => match never {},
    }
}

/// Runs the heartbeat sweep immediately.
pub async fn sweep_handler(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let _guard = state.lifecycle.track().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    let marked = state
        .mesh
        .sweep_now()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let marked: Vec<Value> = marked
        .into_iter()
        .map(|(service, instance_id)| json!({ "service": service, "instanceId": instance_id }))
        .collect();
    Ok(Json(json!({ "markedUnhealthy": marked })))
}

/// Publishes a metrics snapshot immediately and returns it.
pub async fn snapshot_handler(State(state): State<AppState>) -> Result<Json<MeshStatus>, StatusCode> {
    let _guard = state.lifecycle.track().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    state
        .mesh
        .snapshot_now()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}
