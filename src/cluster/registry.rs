//! Node registry
//!
//! Authoritative map of node identity to capability tags and live health.
//! The registry is the only writer of [`NodeHealth`]; every membership, tag
//! or health change bumps a generation counter and is broadcast as a
//! [`HealthEvent`] so the quorum monitor, reconciler and failover router can
//! react without polling.

use crate::cluster::node::{Node, NodeHealth, NodeTag};
use crate::common::{Error, Result, METRICS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What changed about a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeChange {
    Registered,
    Health { from: NodeHealth, to: NodeHealth },
    /// Tags or capacity changed
    Updated,
    Decommissioned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub node_id: String,
    pub change: NodeChange,
    /// Registry generation after this change
    pub generation: u64,
}

impl HealthEvent {
    /// The node stopped being reachable
    pub fn is_loss(&self) -> bool {
        matches!(
            self.change,
            NodeChange::Health { to: NodeHealth::Unreachable, .. } | NodeChange::Decommissioned
        )
    }
}

/// Point-in-time copy of the registry
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterSnapshot {
    pub generation: u64,
    /// Sorted by node id
    pub nodes: Vec<Node>,
}

impl ClusterSnapshot {
    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

struct Inner {
    nodes: BTreeMap<String, Node>,
    generation: u64,
}

pub struct NodeRegistry {
    inner: RwLock<Inner>,
    events: broadcast::Sender<HealthEvent>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                nodes: BTreeMap::new(),
                generation: 0,
            }),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to membership and health changes
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    fn emit(&self, inner: &mut Inner, node_id: &str, change: NodeChange) -> HealthEvent {
        inner.generation += 1;
        let event = HealthEvent {
            node_id: node_id.to_string(),
            change,
            generation: inner.generation,
        };
        if let NodeChange::Health { from, to } = change {
            METRICS.health_transitions.inc();
            tracing::info!(node_id = %node_id, from = %from, to = %to, "Node health changed");
        }
        // No subscribers is fine: nothing is running yet
        let _ = self.events.send(event.clone());
        event
    }

    /// Register a node with the given tags and capacity
    pub fn register_node(
        &self,
        id: &str,
        tags: impl IntoIterator<Item = NodeTag>,
        capacity_bytes: u64,
    ) -> Result<()> {
        self.register(Node::new(id, tags, capacity_bytes, id))
    }

    /// Register a fully described node; it starts `Ready`
    pub fn register(&self, mut node: Node) -> Result<()> {
        node.validate()?;

        let mut inner = self.write();
        if inner.nodes.contains_key(&node.id) {
            return Err(Error::DuplicateNode(node.id));
        }

        node.health = NodeHealth::Ready;
        if node.last_heartbeat == 0 {
            node.last_heartbeat = crate::common::timestamp_now_millis();
        }
        let id = node.id.clone();
        tracing::info!(
            node_id = %id,
            tags = ?node.tags,
            capacity = %crate::common::format_bytes(node.capacity_bytes),
            "Node registered"
        );
        inner.nodes.insert(id.clone(), node);
        self.emit(&mut inner, &id, NodeChange::Registered);
        Ok(())
    }

    /// Record a heartbeat; an unreachable node becomes `Ready` again
    ///
    /// Returns `true` when the heartbeat caused a health transition.
    pub fn record_heartbeat(&self, id: &str, timestamp: u64) -> Result<bool> {
        METRICS.heartbeats_total.inc();

        let mut inner = self.write();
        let next_generation = inner.generation + 1;
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;

        node.last_heartbeat = node.last_heartbeat.max(timestamp);
        if node.health != NodeHealth::Unreachable {
            return Ok(false);
        }

        node.health = NodeHealth::Ready;
        node.recovered_at = next_generation;
        self.emit(
            &mut inner,
            id,
            NodeChange::Health {
                from: NodeHealth::Unreachable,
                to: NodeHealth::Ready,
            },
        );
        Ok(true)
    }

    /// Mark a node unreachable; idempotent
    pub fn mark_unreachable(&self, id: &str) -> Result<bool> {
        self.set_health(id, NodeHealth::Unreachable)
    }

    /// Operator drain: node keeps voting but takes no new placement
    pub fn mark_draining(&self, id: &str) -> Result<bool> {
        self.set_health(id, NodeHealth::Draining)
    }

    /// Undo a drain
    pub fn mark_ready(&self, id: &str) -> Result<bool> {
        self.set_health(id, NodeHealth::Ready)
    }

    fn set_health(&self, id: &str, health: NodeHealth) -> Result<bool> {
        let mut inner = self.write();
        let next_generation = inner.generation + 1;
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;

        let from = node.health;
        if from == health {
            return Ok(false);
        }
        if from == NodeHealth::Unreachable {
            node.recovered_at = next_generation;
        }
        node.health = health;
        self.emit(&mut inner, id, NodeChange::Health { from, to: health });
        Ok(true)
    }

    /// Replace a node's capability tags
    pub fn set_tags(&self, id: &str, tags: impl IntoIterator<Item = NodeTag>) -> Result<()> {
        let mut inner = self.write();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;

        let mut updated = node.clone();
        updated.tags = tags.into_iter().collect();
        updated.validate()?;
        if updated.tags == node.tags {
            return Ok(());
        }
        tracing::info!(node_id = %id, tags = ?updated.tags, "Node tags changed");
        *node = updated;
        self.emit(&mut inner, id, NodeChange::Updated);
        Ok(())
    }

    /// Change advertised capacity (disk added or lost)
    pub fn update_capacity(&self, id: &str, capacity_bytes: u64) -> Result<()> {
        let mut inner = self.write();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;

        if node.capacity_bytes == capacity_bytes {
            return Ok(());
        }
        let mut updated = node.clone();
        updated.capacity_bytes = capacity_bytes;
        updated.validate()?;
        tracing::info!(
            node_id = %id,
            from = node.capacity_bytes,
            to = capacity_bytes,
            "Node capacity changed"
        );
        *node = updated;
        self.emit(&mut inner, id, NodeChange::Updated);
        Ok(())
    }

    /// Remove a node from membership
    pub fn decommission(&self, id: &str) -> Result<Node> {
        let mut inner = self.write();
        let node = inner
            .nodes
            .remove(id)
            .ok_or_else(|| Error::UnknownNode(id.to_string()))?;
        tracing::info!(node_id = %id, "Node decommissioned");
        self.emit(&mut inner, id, NodeChange::Decommissioned);
        Ok(node)
    }

    /// Mark every node silent for longer than `timeout` as unreachable
    pub fn expire_stale(&self, now_ms: u64, timeout: Duration) -> Vec<String> {
        let timeout_ms = timeout.as_millis() as u64;
        let mut inner = self.write();

        let stale: Vec<(String, NodeHealth)> = inner
            .nodes
            .values()
            .filter(|n| n.health != NodeHealth::Unreachable)
            .filter(|n| now_ms.saturating_sub(n.last_heartbeat) > timeout_ms)
            .map(|n| (n.id.clone(), n.health))
            .collect();

        for (id, from) in &stale {
            if let Some(node) = inner.nodes.get_mut(id) {
                node.health = NodeHealth::Unreachable;
            }
            tracing::warn!(node_id = %id, timeout_ms, "Heartbeat timeout");
            self.emit(
                &mut inner,
                id,
                NodeChange::Health {
                    from: *from,
                    to: NodeHealth::Unreachable,
                },
            );
        }

        stale.into_iter().map(|(id, _)| id).collect()
    }

    pub fn get(&self, id: &str) -> Option<Node> {
        self.read().nodes.get(id).cloned()
    }

    /// Nodes carrying `tag`, ordered by id
    pub fn list_by_tag(&self, tag: NodeTag) -> Vec<Node> {
        self.read()
            .nodes
            .values()
            .filter(|n| n.has_tag(tag))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let inner = self.read();
        ClusterSnapshot {
            generation: inner.generation,
            nodes: inner.nodes.values().cloned().collect(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeTag::*;

    fn registry() -> NodeRegistry {
        let registry = NodeRegistry::new();
        registry
            .register_node("a", [Voter, Storage, Workload], 1_000)
            .unwrap();
        registry
            .register_node("b", [Voter, Storage, Workload], 1_000)
            .unwrap();
        registry.register_node("c", [Voter], 0).unwrap();
        registry
    }

    #[test]
    fn test_duplicate_node() {
        let registry = registry();
        let err = registry.register_node("a", [Voter], 0).unwrap_err();
        assert!(matches!(err, Error::DuplicateNode(id) if id == "a"));
    }

    #[test]
    fn test_storage_without_capacity_rejected() {
        let registry = NodeRegistry::new();
        assert!(matches!(
            registry.register_node("x", [Storage], 0),
            Err(Error::InvalidNode { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_heartbeat_unknown_node() {
        let registry = registry();
        assert!(matches!(
            registry.record_heartbeat("zz", 1),
            Err(Error::UnknownNode(_))
        ));
    }

    #[test]
    fn test_heartbeat_recovers_unreachable() {
        let registry = registry();
        assert!(registry.mark_unreachable("a").unwrap());
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Unreachable);

        assert!(registry.record_heartbeat("a", u64::MAX / 2).unwrap());
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Ready);
        assert!(!registry.record_heartbeat("a", u64::MAX / 2).unwrap());
    }

    #[test]
    fn test_recovery_records_generation() {
        let registry = registry();
        assert_eq!(registry.get("a").unwrap().recovered_at, 0);

        registry.mark_unreachable("a").unwrap();
        registry.record_heartbeat("a", u64::MAX / 2).unwrap();
        assert_eq!(registry.get("a").unwrap().recovered_at, registry.generation());

        // Draining and undraining is not a recovery
        let before = registry.get("b").unwrap().recovered_at;
        registry.mark_draining("b").unwrap();
        registry.mark_ready("b").unwrap();
        assert_eq!(registry.get("b").unwrap().recovered_at, before);

        registry.mark_unreachable("b").unwrap();
        registry.mark_ready("b").unwrap();
        assert_eq!(registry.get("b").unwrap().recovered_at, registry.generation());
    }

    #[test]
    fn test_mark_unreachable_idempotent() {
        let registry = registry();
        let mut rx = registry.subscribe();

        assert!(registry.mark_unreachable("b").unwrap());
        assert!(!registry.mark_unreachable("b").unwrap());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.node_id, "b");
        assert!(event.is_loss());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_heartbeat_keeps_draining() {
        let registry = registry();
        registry.mark_draining("a").unwrap();
        assert!(!registry.record_heartbeat("a", u64::MAX / 2).unwrap());
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Draining);
    }

    #[test]
    fn test_list_by_tag_sorted() {
        let registry = registry();
        let voters: Vec<String> = registry
            .list_by_tag(Voter)
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(voters, vec!["a", "b", "c"]);

        let storage: Vec<String> = registry
            .list_by_tag(Storage)
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(storage, vec!["a", "b"]);
    }

    #[test]
    fn test_expire_stale() {
        let registry = registry();
        registry.record_heartbeat("a", u64::MAX / 2).unwrap();

        let expired = registry.expire_stale(u64::MAX / 2 + 1_000, Duration::from_secs(3));
        assert_eq!(expired, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Ready);
        assert_eq!(registry.get("c").unwrap().health, NodeHealth::Unreachable);

        // Already unreachable nodes are not reported twice
        let expired = registry.expire_stale(u64::MAX / 2 + 2_000, Duration::from_secs(3));
        assert!(expired.is_empty());
    }

    #[test]
    fn test_generation_tracks_changes() {
        let registry = registry();
        let before = registry.generation();
        registry.set_tags("a", [Voter, Workload]).unwrap();
        assert_eq!(registry.generation(), before + 1);

        // No-op updates do not bump the generation
        registry.set_tags("a", [Voter, Workload]).unwrap();
        registry.update_capacity("b", 1_000).unwrap();
        assert_eq!(registry.generation(), before + 1);

        let node = registry.decommission("c").unwrap();
        assert_eq!(node.id, "c");
        assert_eq!(registry.generation(), before + 2);
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn test_shrinking_storage_capacity_to_zero_rejected() {
        let registry = registry();
        assert!(registry.update_capacity("a", 0).is_err());
        assert_eq!(registry.get("a").unwrap().capacity_bytes, 1_000);
    }
}
