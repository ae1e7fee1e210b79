//! Node failure: endpoints leave the ingress before any replanning

use minifleet::cluster::{HeartbeatDetector, Node, NodeRegistry, NodeTag::*};
use minifleet::controller::Components;
use minifleet::placement::{ServiceSpec, VolumeSpec};
use minifleet::reconcile::{DesiredState, EntityRef, MemoryRuntime};
use minifleet::router::MemoryIngress;
use minifleet::ControllerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

async fn converged() -> (Components, Arc<MemoryIngress>, Arc<MemoryRuntime>) {
    let registry = Arc::new(NodeRegistry::new());
    for (id, tags, addr) in [
        ("A", vec![Voter, Storage, Workload], "10.0.0.1"),
        ("B", vec![Voter, Storage, Workload], "10.0.0.2"),
        ("C", vec![Voter], "10.0.0.3"),
    ] {
        let capacity = if tags.contains(&Storage) { 100 } else { 0 };
        registry.register(Node::new(id, tags, capacity, addr)).unwrap();
    }

    let runtime = Arc::new(MemoryRuntime::with_call_log());
    let ingress = Arc::new(MemoryIngress::new());
    let config = ControllerConfig {
        retry_jitter: false,
        ..Default::default()
    };
    let components = Components::new(&config, registry, runtime.clone(), ingress.clone());
    components.reconciler.set_desired(DesiredState {
        volumes: vec![VolumeSpec::new("pgdata", 2, 10)],
        services: vec![ServiceSpec::new("web", 2).with_port(8080)],
    });
    components.reconciler.run_pass().await;
    components.reconciler.run_pass().await;
    components.router.sync().await;
    (components, ingress, runtime)
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_node_leaves_endpoint_set() {
    let (components, ingress, runtime) = converged().await;
    assert!(ingress.has_node("A") && ingress.has_node("B"));
    runtime.clear_calls();

    components.registry.mark_unreachable("A").unwrap();
    let diff = components.router.sync().await;

    assert_eq!(diff.removed.len(), 1);
    assert_eq!(diff.removed[0].node_id, "A");
    assert!(diff.added.is_empty());
    assert!(!ingress.has_node("A"));
    assert!(ingress.has_node("B"));
    // Rerouting needs no replica actions
    assert!(runtime.mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_router_task_reacts_to_heartbeat_timeout() {
    let (components, ingress, _runtime) = converged().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router = components
        .router
        .clone()
        .start(Duration::from_secs(60), shutdown_rx);

    // Agents on B and C keep reporting, A falls silent
    let base = minifleet::common::timestamp_now_millis() + 1_000_000;
    components.registry.record_heartbeat("B", base + 3_000).unwrap();
    components.registry.record_heartbeat("C", base + 3_000).unwrap();
    let detector = HeartbeatDetector::new(
        components.registry.clone(),
        Duration::from_secs(1),
        Duration::from_secs(3),
    );
    assert_eq!(detector.sweep_at(base + 3_500), vec!["A".to_string()]);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!ingress.has_node("A"));
    assert!(ingress.has_node("B"));

    // A comes back, but stays out of the ingress until a pass re-checks it
    components.registry.record_heartbeat("A", base + 4_000).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!ingress.has_node("A"));

    components.reconciler.run_pass().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(ingress.has_node("A"));

    shutdown_tx.send(true).unwrap();
    router.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_drained_node_stops_receiving_traffic() {
    let (components, ingress, _runtime) = converged().await;

    components.registry.mark_draining("B").unwrap();
    components.router.sync().await;
    assert!(!ingress.has_node("B"));
    assert!(ingress.has_node("A"));
}

#[tokio::test(start_paused = true)]
async fn test_recovered_node_with_dead_replica_not_routed() {
    let (components, ingress, runtime) = converged().await;

    components.registry.mark_unreachable("A").unwrap();
    components.router.sync().await;
    assert!(!ingress.has_node("A"));

    // The web replica on A died during the outage
    runtime.set_healthy(&EntityRef::Service("web".into()), "A", false);
    let base = minifleet::common::timestamp_now_millis();
    components.registry.record_heartbeat("A", base).unwrap();
    components.router.sync().await;
    assert!(!ingress.has_node("A"));

    components.reconciler.run_pass().await;
    components.router.sync().await;
    assert!(!ingress.has_node("A"));
    assert!(ingress.has_node("B"));
}
