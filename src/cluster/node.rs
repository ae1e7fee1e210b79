//! Node model: identity, capability tags and health

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Capability tag carried by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTag {
    /// Counts toward quorum
    Voter,
    /// May host volume replicas
    Storage,
    /// May host service replicas
    Workload,
}

impl std::fmt::Display for NodeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeTag::Voter => write!(f, "voter"),
            NodeTag::Storage => write!(f, "storage"),
            NodeTag::Workload => write!(f, "workload"),
        }
    }
}

impl FromStr for NodeTag {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voter" => Ok(NodeTag::Voter),
            "storage" => Ok(NodeTag::Storage),
            "workload" => Ok(NodeTag::Workload),
            other => Err(crate::Error::InvalidManifest(format!("unknown tag: {}", other))),
        }
    }
}

/// Node health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Ready,
    Unreachable,
    /// Reachable, but taking no new placement
    Draining,
}

impl NodeHealth {
    /// Eligible for new placement
    pub fn is_ready(&self) -> bool {
        matches!(self, NodeHealth::Ready)
    }

    /// Still answering heartbeats; counts toward quorum
    pub fn is_reachable(&self) -> bool {
        matches!(self, NodeHealth::Ready | NodeHealth::Draining)
    }
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeHealth::Ready => write!(f, "ready"),
            NodeHealth::Unreachable => write!(f, "unreachable"),
            NodeHealth::Draining => write!(f, "draining"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub tags: BTreeSet<NodeTag>,
    pub capacity_bytes: u64,
    /// Host the node agent and service endpoints listen on
    pub address: String,
    pub health: NodeHealth,
    /// Unix millis of the last heartbeat (registration counts as one)
    pub last_heartbeat: u64,
    /// Registry generation of the last return from `Unreachable`
    #[serde(default)]
    pub recovered_at: u64,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        tags: impl IntoIterator<Item = NodeTag>,
        capacity_bytes: u64,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tags: tags.into_iter().collect(),
            capacity_bytes,
            address: address.into(),
            health: NodeHealth::Ready,
            last_heartbeat: 0,
            recovered_at: 0,
        }
    }

    pub fn has_tag(&self, tag: NodeTag) -> bool {
        self.tags.contains(&tag)
    }

    pub fn is_voter(&self) -> bool {
        self.has_tag(NodeTag::Voter)
    }

    /// Ready and tagged `storage`
    pub fn can_host_volumes(&self) -> bool {
        self.health.is_ready() && self.has_tag(NodeTag::Storage)
    }

    /// Ready and tagged `workload`
    pub fn can_host_services(&self) -> bool {
        self.health.is_ready() && self.has_tag(NodeTag::Workload)
    }

    /// A storage node must advertise capacity
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.trim().is_empty() {
            return Err(crate::Error::InvalidNode {
                node: self.id.clone(),
                reason: "empty node id".into(),
            });
        }
        if self.has_tag(NodeTag::Storage) && self.capacity_bytes == 0 {
            return Err(crate::Error::InvalidNode {
                node: self.id.clone(),
                reason: "storage node must report capacity_bytes > 0".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_parse() {
        assert_eq!("Voter".parse::<NodeTag>().unwrap(), NodeTag::Voter);
        assert_eq!(" storage ".parse::<NodeTag>().unwrap(), NodeTag::Storage);
        assert!("gpu".parse::<NodeTag>().is_err());
    }

    #[test]
    fn test_eligibility() {
        let mut node = Node::new("a", [NodeTag::Voter, NodeTag::Storage], 100, "10.0.0.1");
        assert!(node.can_host_volumes());
        assert!(!node.can_host_services());

        node.health = NodeHealth::Draining;
        assert!(!node.can_host_volumes());
        assert!(node.health.is_reachable());

        let voter_only = Node::new("c", [NodeTag::Voter], 0, "10.0.0.3");
        assert!(!voter_only.can_host_volumes());
        assert!(!voter_only.can_host_services());
        assert!(voter_only.validate().is_ok());
    }

    #[test]
    fn test_storage_requires_capacity() {
        let node = Node::new("b", [NodeTag::Storage], 0, "10.0.0.2");
        assert!(node.validate().is_err());
    }
}
