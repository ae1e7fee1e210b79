//! Cluster manifest
//!
//! The operator declares node roles and the desired volumes and services
//! in a single TOML or JSON document:
//!
//! ```toml
//! [[nodes]]
//! id = "a"
//! tags = ["voter", "storage", "workload"]
//! capacity_bytes = 107374182400
//! address = "10.0.0.1:9000"
//!
//! [[volumes]]
//! id = "pgdata"
//! desired_replica_count = 2
//! size_bytes = 10737418240
//!
//! [[services]]
//! id = "web"
//! desired_replica_count = 2
//! port = 8080
//! ```

use crate::cluster::node::{Node, NodeTag};
use crate::cluster::quorum::QuorumMonitor;
use crate::cluster::registry::NodeRegistry;
use crate::common::{Error, Result};
use crate::placement::{ServiceSpec, VolumeSpec};
use crate::reconcile::DesiredState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// One declared node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDecl {
    pub id: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub capacity_bytes: u64,
    /// Agent and endpoint host; defaults to the node id
    #[serde(default)]
    pub address: Option<String>,
}

impl NodeDecl {
    pub fn parsed_tags(&self) -> Result<BTreeSet<NodeTag>> {
        self.tags.iter().map(|t| t.parse()).collect()
    }

    pub fn to_node(&self) -> Result<Node> {
        Ok(Node::new(
            &self.id,
            self.parsed_tags()?,
            self.capacity_bytes,
            self.address.as_deref().unwrap_or(&self.id),
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub nodes: Vec<NodeDecl>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// What applying a manifest changed in the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub registered: Vec<String>,
    pub updated: Vec<String>,
    pub decommissioned: Vec<String>,
}

fn check_unique<'a>(what: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(Error::InvalidManifest(format!("{} with empty id", what)));
        }
        if !seen.insert(id) {
            return Err(Error::InvalidManifest(format!("duplicate {} id: {}", what, id)));
        }
    }
    Ok(())
}

impl Manifest {
    /// Load a `.toml` or `.json` manifest; validated before returning
    pub fn load(path: &Path) -> Result<Self> {
        let manifest: Manifest = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .build()?
            .try_deserialize()?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        check_unique("node", self.nodes.iter().map(|n| n.id.as_str()))?;
        check_unique("volume", self.volumes.iter().map(|v| v.id.as_str()))?;
        check_unique("service", self.services.iter().map(|s| s.id.as_str()))?;

        for decl in &self.nodes {
            decl.to_node()?.validate()?;
        }
        for volume in &self.volumes {
            if volume.desired_replica_count == 0 {
                return Err(Error::InvalidManifest(format!(
                    "volume {} must have at least one replica",
                    volume.id
                )));
            }
            if volume.size_bytes == 0 {
                return Err(Error::InvalidManifest(format!(
                    "volume {} has zero size",
                    volume.id
                )));
            }
        }
        for service in &self.services {
            if service.desired_replica_count == 0 {
                return Err(Error::InvalidManifest(format!(
                    "service {} must have at least one replica",
                    service.id
                )));
            }
            if service.port == 0 {
                return Err(Error::InvalidManifest(format!(
                    "service {} has port 0",
                    service.id
                )));
            }
        }
        Ok(())
    }

    pub fn desired_state(&self) -> DesiredState {
        DesiredState {
            volumes: self.volumes.clone(),
            services: self.services.clone(),
        }
    }

    /// Register every declared node into an empty registry
    pub fn bootstrap(&self, registry: &NodeRegistry) -> Result<()> {
        self.validate()?;
        for decl in &self.nodes {
            registry.register(decl.to_node()?)?;
        }
        tracing::info!(
            nodes = self.nodes.len(),
            volumes = self.volumes.len(),
            services = self.services.len(),
            "Cluster bootstrapped from manifest"
        );
        Ok(())
    }

    /// Bring registry membership in line with this manifest
    ///
    /// New nodes are registered, existing nodes get their tags and capacity
    /// updated, undeclared nodes are decommissioned. Refused with
    /// `QuorumLost` unless a majority of voters is reachable.
    pub fn apply(&self, registry: &NodeRegistry, quorum: &QuorumMonitor) -> Result<ApplySummary> {
        self.validate()?;
        quorum.ensure_safe()?;
        let mut summary = ApplySummary::default();

        for decl in &self.nodes {
            let Some(current) = registry.get(&decl.id) else {
                registry.register(decl.to_node()?)?;
                summary.registered.push(decl.id.clone());
                continue;
            };

            let tags = decl.parsed_tags()?;
            if current.tags == tags && current.capacity_bytes == decl.capacity_bytes {
                continue;
            }
            // Keep the node valid between the two updates
            if tags.contains(&NodeTag::Storage) {
                registry.update_capacity(&decl.id, decl.capacity_bytes)?;
                registry.set_tags(&decl.id, tags)?;
            } else {
                registry.set_tags(&decl.id, tags)?;
                registry.update_capacity(&decl.id, decl.capacity_bytes)?;
            }
            summary.updated.push(decl.id.clone());
        }

        let declared: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        for node in registry.snapshot().nodes {
            if !declared.contains(node.id.as_str()) {
                registry.decommission(&node.id)?;
                summary.decommissioned.push(node.id);
            }
        }

        tracing::info!(
            registered = summary.registered.len(),
            updated = summary.updated.len(),
            decommissioned = summary.decommissioned.len(),
            "Manifest applied"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ConditionLog;
    use std::io::Write;
    use std::sync::Arc;

    const MANIFEST: &str = r#"
[[nodes]]
id = "a"
tags = ["voter", "storage", "workload"]
capacity_bytes = 1000
address = "10.0.0.1:9000"

[[nodes]]
id = "b"
tags = ["voter", "storage", "workload"]
capacity_bytes = 1000

[[nodes]]
id = "c"
tags = ["voter"]

[[volumes]]
id = "pgdata"
desired_replica_count = 2
size_bytes = 100

[[services]]
id = "web"
desired_replica_count = 2
port = 8080
"#;

    fn decl(id: &str, tags: &[&str], capacity: u64) -> NodeDecl {
        NodeDecl {
            id: id.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            capacity_bytes: capacity,
            address: None,
        }
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(MANIFEST.as_bytes()).unwrap();

        let manifest = Manifest::load(file.path()).unwrap();
        assert_eq!(manifest.nodes.len(), 3);
        assert_eq!(manifest.nodes[0].address.as_deref(), Some("10.0.0.1:9000"));
        assert_eq!(manifest.volumes[0].size_bytes, 100);
        assert_eq!(manifest.services[0].port, 8080);
        assert_eq!(manifest.services[0].spread_key(), "web");
    }

    #[test]
    fn test_validation_errors() {
        let mut manifest = Manifest {
            nodes: vec![decl("a", &["voter"], 0), decl("a", &["voter"], 0)],
            ..Default::default()
        };
        assert!(matches!(manifest.validate(), Err(Error::InvalidManifest(_))));

        manifest.nodes = vec![decl("a", &["gpu"], 0)];
        assert!(manifest.validate().is_err());

        manifest.nodes = vec![decl("a", &["storage"], 0)];
        assert!(manifest.validate().is_err());

        manifest.nodes = vec![decl("a", &["storage"], 10)];
        manifest.volumes = vec![VolumeSpec::new("v", 0, 10)];
        assert!(manifest.validate().is_err());

        manifest.volumes = vec![VolumeSpec::new("v", 1, 0)];
        assert!(manifest.validate().is_err());

        manifest.volumes = vec![VolumeSpec::new("v", 1, 10)];
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_bootstrap_and_reapply() {
        let registry = Arc::new(NodeRegistry::new());
        let quorum = QuorumMonitor::new(registry.clone(), Arc::new(ConditionLog::new(8)));
        let mut manifest = Manifest {
            nodes: vec![
                decl("a", &["voter", "storage"], 100),
                decl("b", &["voter", "storage"], 100),
                decl("c", &["voter"], 0),
            ],
            ..Default::default()
        };
        manifest.bootstrap(&registry).unwrap();
        assert_eq!(registry.len(), 3);
        assert!(manifest.bootstrap(&registry).is_err());

        manifest.nodes = vec![
            decl("a", &["voter", "storage"], 200),
            decl("b", &["voter"], 0),
            decl("d", &["workload"], 0),
        ];
        let summary = manifest.apply(&registry, &quorum).unwrap();
        assert_eq!(summary.registered, vec!["d".to_string()]);
        assert_eq!(summary.updated, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(summary.decommissioned, vec!["c".to_string()]);
        assert_eq!(registry.get("a").unwrap().capacity_bytes, 200);
        assert!(!registry.get("b").unwrap().can_host_volumes());
    }

    #[test]
    fn test_apply_refused_without_quorum() {
        let registry = Arc::new(NodeRegistry::new());
        let quorum = QuorumMonitor::new(registry.clone(), Arc::new(ConditionLog::new(8)));
        let manifest = Manifest {
            nodes: vec![
                decl("a", &["voter"], 0),
                decl("b", &["voter"], 0),
                decl("c", &["voter"], 0),
            ],
            ..Default::default()
        };
        manifest.bootstrap(&registry).unwrap();
        registry.mark_unreachable("a").unwrap();
        registry.mark_unreachable("c").unwrap();

        // b alone must not drop a and c to regain a majority
        let minority = Manifest {
            nodes: vec![decl("b", &["voter"], 0), decl("d", &["voter"], 0)],
            ..Default::default()
        };
        assert!(matches!(
            minority.apply(&registry, &quorum),
            Err(Error::QuorumLost { reachable: 1, voting: 3 })
        ));
        assert_eq!(registry.len(), 3);
        assert!(registry.get("d").is_none());
    }

    #[test]
    fn test_from_json() {
        let manifest = Manifest::from_json(
            r#"{"nodes":[{"id":"a","tags":["workload"]}],
                "services":[{"id":"web","desired_replica_count":1}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.services[0].port, 80);
        assert_eq!(manifest.desired_state().services.len(), 1);
        assert_eq!(manifest.nodes[0].to_node().unwrap().address, "a");
    }
}
