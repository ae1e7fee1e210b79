//! Admin HTTP API
//!
//! Health checks, cluster and placement inspection, operator actions and
//! the heartbeat endpoint node agents push to.

use crate::cluster::{NodeRegistry, QuorumMonitor};
use crate::common::{timestamp_now_millis, ConditionLog, Error, METRICS};
use crate::controller::scheduler::Scheduler;
use crate::manifest::Manifest;
use crate::reconcile::{EntityRef, Reconciler};
use crate::router::FailoverRouter;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<NodeRegistry>,
    pub quorum: Arc<QuorumMonitor>,
    pub reconciler: Arc<Reconciler>,
    pub router: Arc<FailoverRouter>,
    pub scheduler: Arc<Scheduler>,
    pub conditions: Arc<ConditionLog>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (
            self.to_http_status(),
            Json(json!({ "error": self.to_string(), "kind": self.kind() })),
        )
            .into_response()
    }
}

pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        // Node agents
        .route("/nodes/:id/heartbeat", post(heartbeat))
        // Inspection
        .route("/admin/status", get(admin_status))
        .route("/admin/nodes", get(admin_nodes))
        .route("/admin/placement", get(admin_placement))
        .route("/admin/endpoints", get(admin_endpoints))
        .route("/admin/conditions", get(admin_conditions))
        // Operator actions
        .route("/admin/nodes/:id/drain", post(admin_drain))
        .route("/admin/nodes/:id/ready", post(admin_undrain))
        .route("/admin/nodes/:id", delete(admin_decommission))
        .route("/admin/reconcile", post(admin_reconcile))
        .route("/admin/reset/:kind/:id", post(admin_reset))
        .route("/admin/manifest", post(admin_manifest))
        .route("/metrics", get(metrics))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "alive": true,
        "version": crate::VERSION,
        "uptime_seconds": METRICS.uptime_seconds(),
    }))
}

/// Ready while a majority of voters is reachable
async fn health_ready(State(state): State<AdminState>) -> impl IntoResponse {
    let quorum = state.quorum.check();
    let status = if quorum.is_safe() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "ready": quorum.is_safe(),
            "voting_members": quorum.voting_members.len(),
            "reachable_voting_members": quorum.reachable_voting_members.len(),
        })),
    )
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatRequest {
    /// Milliseconds since epoch; defaults to receive time, never later
    timestamp: Option<u64>,
}

async fn heartbeat(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<Json<serde_json::Value>, Error> {
    let now = timestamp_now_millis();
    // A clock running ahead must not keep the node alive past its timeout
    let timestamp = body
        .and_then(|Json(req)| req.timestamp)
        .map_or(now, |ts| ts.min(now));
    let recovered = state.registry.record_heartbeat(&id, timestamp)?;
    if recovered {
        state.scheduler.trigger();
    }
    Ok(Json(json!({ "node_id": id, "recovered": recovered })))
}

async fn admin_status(State(state): State<AdminState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let quorum = state.quorum.evaluate();
    let statuses = state.reconciler.statuses();
    let count = |name: &str| statuses.iter().filter(|s| s.state == name).count();
    let endpoints = state.router.endpoints().await;

    Json(json!({
        "generation": snapshot.generation,
        "nodes": snapshot.nodes.len(),
        "quorum": {
            "safe": quorum.is_safe(),
            "voting_members": quorum.voting_members,
            "reachable_voting_members": quorum.reachable_voting_members,
        },
        "replicas": {
            "total": statuses.len(),
            "active": count("active"),
            "provisioning": count("provisioning"),
            "migrating": count("migrating"),
            "failed": count("failed"),
            "stuck": statuses.iter().filter(|s| s.stuck).count(),
        },
        "endpoints": endpoints.len(),
        "passes": state.scheduler.passes(),
        "last_pass": state.reconciler.last_report(),
    }))
}

async fn admin_nodes(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}

async fn admin_placement(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({
        "desired": state.reconciler.desired(),
        "replicas": state.reconciler.statuses(),
    }))
}

async fn admin_endpoints(State(state): State<AdminState>) -> impl IntoResponse {
    let endpoints = state.router.endpoints().await;
    Json(endpoints.iter().cloned().collect::<Vec<_>>())
}

#[derive(Debug, Deserialize)]
struct ConditionsQuery {
    limit: Option<usize>,
}

async fn admin_conditions(
    State(state): State<AdminState>,
    Query(query): Query<ConditionsQuery>,
) -> impl IntoResponse {
    Json(state.conditions.recent(query.limit.unwrap_or(50)))
}

async fn admin_drain(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Error> {
    let changed = state.registry.mark_draining(&id)?;
    state.scheduler.trigger();
    Ok(Json(json!({ "node_id": id, "draining": true, "changed": changed })))
}

async fn admin_undrain(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Error> {
    let changed = state.registry.mark_ready(&id)?;
    state.scheduler.trigger();
    Ok(Json(json!({ "node_id": id, "draining": false, "changed": changed })))
}

async fn admin_decommission(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Error> {
    // Membership changes need a voter majority
    state.quorum.ensure_safe()?;
    let node = state.registry.decommission(&id)?;
    state.scheduler.trigger();
    Ok(Json(json!({ "decommissioned": node })))
}

/// Run a pass now and return its report
async fn admin_reconcile(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.reconciler.run_pass().await)
}

async fn admin_reset(
    State(state): State<AdminState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, Error> {
    let entity: EntityRef = format!("{}/{}", kind, id)
        .parse()
        .map_err(|e: Error| Error::InvalidConfig(e.to_string()))?;
    let reset = state.reconciler.reset_stuck(&entity).await;
    if reset > 0 {
        state.scheduler.trigger();
    }
    Ok(Json(json!({ "entity": entity.to_string(), "reset": reset })))
}

async fn admin_manifest(
    State(state): State<AdminState>,
    Json(manifest): Json<Manifest>,
) -> Result<Json<serde_json::Value>, Error> {
    let summary = manifest.apply(&state.registry, &state.quorum)?;
    state.reconciler.set_desired(manifest.desired_state());
    state.scheduler.trigger();
    Ok(Json(json!({ "status": "applied", "nodes": summary })))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}
