//! Desired-state declarations and placement results

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A replicated storage volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub id: String,
    pub desired_replica_count: usize,
    pub size_bytes: u64,
}

impl VolumeSpec {
    pub fn new(id: impl Into<String>, desired_replica_count: usize, size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            desired_replica_count,
            size_bytes,
        }
    }
}

/// A stateless service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: String,
    pub desired_replica_count: usize,
    /// Replicas sharing a key are spread across nodes; defaults to the service id
    #[serde(default)]
    pub anti_affinity_key: Option<String>,
    /// Port the service listens on; endpoints are `host:port`
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    80
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>, desired_replica_count: usize) -> Self {
        Self {
            id: id.into(),
            desired_replica_count,
            anti_affinity_key: None,
            port: default_port(),
        }
    }

    pub fn with_anti_affinity(mut self, key: impl Into<String>) -> Self {
        self.anti_affinity_key = Some(key.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn spread_key(&self) -> &str {
        self.anti_affinity_key.as_deref().unwrap_or(&self.id)
    }
}

/// One volume replica assigned to one node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeReplica {
    pub volume_id: String,
    pub node_id: String,
}

/// Ordered set of `(volume, node)` assignments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePlacement {
    replicas: BTreeSet<VolumeReplica>,
}

impl VolumePlacement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the volume already has a replica on that node
    pub fn insert(&mut self, volume_id: &str, node_id: &str) -> bool {
        self.replicas.insert(VolumeReplica {
            volume_id: volume_id.to_string(),
            node_id: node_id.to_string(),
        })
    }

    pub fn contains(&self, volume_id: &str, node_id: &str) -> bool {
        self.replicas.iter().any(|r| r.volume_id == volume_id && r.node_id == node_id)
    }

    /// Nodes hosting `volume_id`, ordered by node id
    pub fn nodes_for(&self, volume_id: &str) -> Vec<&str> {
        self.replicas
            .iter()
            .filter(|r| r.volume_id == volume_id)
            .map(|r| r.node_id.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VolumeReplica> {
        self.replicas.iter()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

impl FromIterator<VolumeReplica> for VolumePlacement {
    fn from_iter<T: IntoIterator<Item = VolumeReplica>>(iter: T) -> Self {
        Self {
            replicas: iter.into_iter().collect(),
        }
    }
}

/// One service replica slot assigned to a node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub service_id: String,
    pub node_id: String,
    /// Distinguishes co-located replicas of the same service on one node
    pub ordinal: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTargetSet {
    targets: BTreeSet<ServiceTarget>,
}

impl ServiceTargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: ServiceTarget) {
        self.targets.insert(target);
    }

    pub fn nodes_for(&self, service_id: &str) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| t.service_id == service_id)
            .map(|t| t.node_id.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceTarget> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Soft placement problems; the plan is still usable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanWarning {
    /// Fewer eligible nodes than replicas: some replicas share a node
    DegradedSpread {
        service_id: String,
        replicas: usize,
        distinct_nodes: usize,
    },
}

impl std::fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanWarning::DegradedSpread {
                service_id,
                replicas,
                distinct_nodes,
            } => write!(
                f,
                "service {} has {} replicas on {} distinct nodes",
                service_id, replicas, distinct_nodes
            ),
        }
    }
}

/// Target placement produced by the planner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub volumes: VolumePlacement,
    pub services: ServiceTargetSet,
    pub warnings: Vec<PlanWarning>,
}
