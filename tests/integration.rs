//! Integration tests for minifleet: manifest to converged cluster

use minifleet::cluster::{Node, NodeRegistry, NodeTag::*};
use minifleet::controller::Components;
use minifleet::placement::{plan, ServiceSpec, VolumeSpec};
use minifleet::reconcile::{EntityRef, MemoryRuntime};
use minifleet::router::MemoryIngress;
use minifleet::{ControllerConfig, Error, Manifest};
use std::io::Write;
use std::sync::Arc;

const GIB: u64 = 1024 * 1024 * 1024;

fn three_nodes() -> Vec<Node> {
    vec![
        Node::new("A", [Voter, Storage, Workload], 100 * GIB, "10.0.0.1"),
        Node::new("B", [Voter, Storage, Workload], 100 * GIB, "10.0.0.2"),
        Node::new("C", [Voter], 0, "10.0.0.3"),
    ]
}

#[test]
fn test_three_node_placement() {
    let volumes = vec![VolumeSpec::new("pgdata", 2, 10 * GIB)];
    let services = vec![ServiceSpec::new("web", 2).with_anti_affinity("web")];

    let plan = plan(&volumes, &services, &three_nodes()).unwrap();
    assert_eq!(plan.volumes.nodes_for("pgdata"), vec!["A", "B"]);
    assert_eq!(plan.services.nodes_for("web"), vec!["A", "B"]);
    assert!(plan.warnings.is_empty());
    // The voter-only node carries nothing
    assert!(plan.volumes.iter().all(|r| r.node_id != "C"));
    assert!(plan.services.iter().all(|t| t.node_id != "C"));
}

#[test]
fn test_plan_is_deterministic() {
    let volumes = vec![
        VolumeSpec::new("pgdata", 2, 10 * GIB),
        VolumeSpec::new("media", 1, 50 * GIB),
    ];
    let services = vec![ServiceSpec::new("web", 2), ServiceSpec::new("worker", 1)];
    let nodes = three_nodes();

    let first = plan(&volumes, &services, &nodes).unwrap();
    for _ in 0..10 {
        assert_eq!(plan(&volumes, &services, &nodes).unwrap(), first);
    }

    let mut reversed_nodes = nodes.clone();
    reversed_nodes.reverse();
    let mut reversed_volumes = volumes.clone();
    reversed_volumes.reverse();
    let mut reversed_services = services.clone();
    reversed_services.reverse();
    assert_eq!(
        plan(&reversed_volumes, &reversed_services, &reversed_nodes).unwrap(),
        first
    );
}

#[test]
fn test_three_replicas_on_two_storage_nodes() {
    let volumes = vec![VolumeSpec::new("pgdata", 3, 10 * GIB)];
    let result = plan(&volumes, &[], &three_nodes());
    assert!(matches!(
        result,
        Err(Error::InsufficientCapacity {
            needed: 3,
            available: 2,
            ..
        })
    ));
}

const MANIFEST: &str = r#"
[[nodes]]
id = "A"
tags = ["voter", "storage", "workload"]
capacity_bytes = 107374182400
address = "10.0.0.1:9000"

[[nodes]]
id = "B"
tags = ["voter", "storage", "workload"]
capacity_bytes = 107374182400
address = "10.0.0.2:9000"

[[nodes]]
id = "C"
tags = ["voter"]
address = "10.0.0.3:9000"

[[volumes]]
id = "pgdata"
desired_replica_count = 2
size_bytes = 10737418240

[[services]]
id = "web"
desired_replica_count = 2
port = 8080
"#;

#[tokio::test(start_paused = true)]
async fn test_manifest_to_converged_cluster() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(MANIFEST.as_bytes()).unwrap();
    let manifest = Manifest::load(file.path()).unwrap();

    let registry = Arc::new(NodeRegistry::new());
    manifest.bootstrap(&registry).unwrap();

    let runtime = Arc::new(MemoryRuntime::new());
    let ingress = Arc::new(MemoryIngress::new());
    let config = ControllerConfig {
        retry_jitter: false,
        ..Default::default()
    };
    let components = Components::new(&config, registry, runtime.clone(), ingress.clone());
    components.reconciler.set_desired(manifest.desired_state());

    let first = components.reconciler.run_pass().await;
    assert_eq!(first.actions.len(), 4);
    let second = components.reconciler.run_pass().await;
    assert!(second.actions.is_empty());
    assert_eq!(second.pending, 0);

    assert_eq!(
        runtime.running(),
        vec![
            (EntityRef::Volume("pgdata".into()), "A".to_string()),
            (EntityRef::Volume("pgdata".into()), "B".to_string()),
            (EntityRef::Service("web".into()), "A".to_string()),
            (EntityRef::Service("web".into()), "B".to_string()),
        ]
    );

    components.router.sync().await;
    let addresses: Vec<String> = ingress.routes().into_iter().map(|e| e.address).collect();
    assert_eq!(addresses, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
}
