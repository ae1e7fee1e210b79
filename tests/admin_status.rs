//! Admin HTTP API, driven in-process through the axum router

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use minifleet::cluster::{NodeRegistry, NodeTag::*};
use minifleet::common::timestamp_now_millis;
use minifleet::controller::{create_router, Components};
use minifleet::placement::{ServiceSpec, VolumeSpec};
use minifleet::reconcile::{DesiredState, MemoryRuntime};
use minifleet::router::MemoryIngress;
use minifleet::ControllerConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn setup() -> (Components, Router) {
    let registry = Arc::new(NodeRegistry::new());
    registry.register_node("A", [Voter, Storage, Workload], 100).unwrap();
    registry.register_node("B", [Voter, Storage, Workload], 100).unwrap();
    registry.register_node("C", [Voter], 0).unwrap();

    let config = ControllerConfig {
        retry_jitter: false,
        ..Default::default()
    };
    let components = Components::new(
        &config,
        registry,
        Arc::new(MemoryRuntime::new()),
        Arc::new(MemoryIngress::new()),
    );
    components.reconciler.set_desired(DesiredState {
        volumes: vec![VolumeSpec::new("pgdata", 2, 10)],
        services: vec![ServiceSpec::new("web", 2)],
    });
    let app = create_router(components.admin_state());
    (components, app)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_admin_status() {
    let (_components, app) = setup();

    let (status, _) = call(&app, Method::POST, "/admin/reconcile", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = call(&app, Method::GET, "/admin/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["nodes"], 3);
    assert_eq!(json["quorum"]["safe"], true);
    assert_eq!(json["replicas"]["total"], 4);
    assert_eq!(json["replicas"]["provisioning"], 4);
    assert!(json.get("last_pass").is_some());
}

#[tokio::test]
async fn test_reconcile_returns_report() {
    let (_components, app) = setup();

    let (_, report) = call(&app, Method::POST, "/admin/reconcile", None).await;
    assert_eq!(report["actions"].as_array().unwrap().len(), 4);
    assert_eq!(report["quorum_lost"], false);

    let (_, placement) = call(&app, Method::GET, "/admin/placement", None).await;
    assert_eq!(placement["replicas"].as_array().unwrap().len(), 4);
    assert_eq!(placement["desired"]["volumes"][0]["id"], "pgdata");
}

#[tokio::test]
async fn test_readiness_follows_quorum() {
    let (components, app) = setup();

    let (status, json) = call(&app, Method::GET, "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["reachable_voting_members"], 3);

    components.registry.mark_unreachable("A").unwrap();
    components.registry.mark_unreachable("C").unwrap();
    let (status, json) = call(&app, Method::GET, "/health/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["ready"], false);

    let (_, report) = call(&app, Method::POST, "/admin/reconcile", None).await;
    assert_eq!(report["quorum_lost"], true);
    assert!(report["actions"].as_array().unwrap().is_empty());

    let (_, conditions) = call(&app, Method::GET, "/admin/conditions?limit=10", None).await;
    assert!(conditions
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c["kind"] == "QuorumLost"));
}

#[tokio::test]
async fn test_heartbeat_endpoint() {
    let (components, app) = setup();
    components.registry.mark_unreachable("B").unwrap();

    let (status, json) = call(
        &app,
        Method::POST,
        "/nodes/B/heartbeat",
        Some(json!({ "timestamp": u64::MAX / 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["recovered"], true);
    let b = components.registry.get("B").unwrap();
    assert!(b.health.is_ready());
    // Future timestamps are clamped to receive time
    assert!(b.last_heartbeat <= timestamp_now_millis());

    let (status, _) = call(&app, Method::POST, "/nodes/A/heartbeat", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = call(&app, Method::POST, "/nodes/Z/heartbeat", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["kind"], "UnknownNode");
}

#[tokio::test]
async fn test_operator_actions() {
    let (components, app) = setup();

    let (status, _) = call(&app, Method::POST, "/admin/nodes/B/drain", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!components.registry.get("B").unwrap().health.is_ready());

    let (status, _) = call(&app, Method::POST, "/admin/nodes/B/ready", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = call(&app, Method::POST, "/admin/reset/volume/pgdata", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["reset"], 0);

    let (status, _) = call(&app, Method::POST, "/admin/reset/pod/pgdata", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // No voter majority: membership is frozen
    components.registry.mark_unreachable("A").unwrap();
    components.registry.mark_unreachable("B").unwrap();
    let (status, json) = call(&app, Method::DELETE, "/admin/nodes/C", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["kind"], "QuorumLost");
    assert!(components.registry.get("C").is_some());
    components.registry.mark_ready("A").unwrap();
    components.registry.mark_ready("B").unwrap();

    let (status, _) = call(&app, Method::DELETE, "/admin/nodes/C", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(components.registry.get("C").is_none());

    let (status, _) = call(&app, Method::DELETE, "/admin/nodes/C", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manifest_apply() {
    let (components, app) = setup();
    let manifest = json!({
        "nodes": [
            { "id": "A", "tags": ["voter", "storage", "workload"], "capacity_bytes": 100 },
            { "id": "B", "tags": ["voter", "storage", "workload"], "capacity_bytes": 100 },
            { "id": "D", "tags": ["voter", "workload"], "address": "10.0.0.4" }
        ],
        "volumes": [{ "id": "pgdata", "desired_replica_count": 2, "size_bytes": 10 }],
        "services": [{ "id": "web", "desired_replica_count": 3, "port": 8080 }]
    });

    let (status, json) = call(&app, Method::POST, "/admin/manifest", Some(manifest)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["nodes"]["registered"], json!(["D"]));
    assert_eq!(json["nodes"]["decommissioned"], json!(["C"]));
    assert_eq!(components.reconciler.desired().services[0].desired_replica_count, 3);

    let invalid = json!({ "nodes": [{ "id": "X", "tags": ["gpu"] }] });
    let (status, _) = call(&app, Method::POST, "/admin/manifest", Some(invalid)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_and_health_endpoints() {
    let (_components, app) = setup();

    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("minifleet_passes_total"));
    assert!(text.contains("minifleet_quorum_safe"));

    let (status, json) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");

    let (status, json) = call(&app, Method::GET, "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["alive"], true);
}
