//! Quorum monitor
//!
//! The cluster is safe to mutate only while a strict majority of voting
//! members is reachable. Reconciliation checks this before every pass;
//! when it fails, placement is frozen and only observation continues.

use crate::cluster::node::Node;
use crate::cluster::registry::NodeRegistry;
use crate::common::{ConditionKind, ConditionLog, Error, Result, METRICS};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuorumState {
    pub voting_members: BTreeSet<String>,
    pub reachable_voting_members: BTreeSet<String>,
}

impl QuorumState {
    /// Evaluate quorum over a set of nodes
    ///
    /// A `Draining` voter still answers heartbeats and keeps its vote.
    pub fn evaluate(nodes: &[Node]) -> Self {
        let voters = nodes.iter().filter(|n| n.is_voter());
        let mut state = QuorumState::default();
        for node in voters {
            state.voting_members.insert(node.id.clone());
            if node.health.is_reachable() {
                state.reachable_voting_members.insert(node.id.clone());
            }
        }
        state
    }

    /// Strict majority of voters reachable; no voters means no quorum
    pub fn is_safe(&self) -> bool {
        self.reachable_voting_members.len() * 2 > self.voting_members.len()
    }

    pub fn to_error(&self) -> Error {
        Error::QuorumLost {
            reachable: self.reachable_voting_members.len(),
            voting: self.voting_members.len(),
        }
    }
}

impl std::fmt::Display for QuorumState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} voters reachable ({})",
            self.reachable_voting_members.len(),
            self.voting_members.len(),
            if self.is_safe() { "safe" } else { "unsafe" }
        )
    }
}

pub struct QuorumMonitor {
    registry: Arc<NodeRegistry>,
    conditions: Arc<ConditionLog>,
    /// Last reported safety, to log transitions once
    was_safe: AtomicBool,
}

impl QuorumMonitor {
    pub fn new(registry: Arc<NodeRegistry>, conditions: Arc<ConditionLog>) -> Self {
        Self {
            registry,
            conditions,
            was_safe: AtomicBool::new(true),
        }
    }

    /// Pure evaluation over the current registry snapshot
    pub fn evaluate(&self) -> QuorumState {
        QuorumState::evaluate(&self.registry.snapshot().nodes)
    }

    /// Evaluate, report transitions and update gauges
    pub fn check(&self) -> QuorumState {
        let state = self.evaluate();
        self.observe(&state);
        state
    }

    /// Record an already evaluated state
    pub fn observe(&self, state: &QuorumState) {
        let safe = state.is_safe();
        METRICS.quorum_safe.set(safe as u64);
        METRICS
            .reachable_voters
            .set(state.reachable_voting_members.len() as u64);
        METRICS.voting_members.set(state.voting_members.len() as u64);

        let was_safe = self.was_safe.swap(safe, Ordering::SeqCst);
        match (was_safe, safe) {
            (true, false) => self.conditions.report(
                ConditionKind::QuorumLost,
                None,
                format!("Quorum lost: {}; placement frozen", state),
            ),
            (false, true) => self.conditions.report(
                ConditionKind::QuorumRestored,
                None,
                format!("Quorum restored: {}", state),
            ),
            _ => {}
        }
    }

    /// `Err(QuorumLost)` unless a majority of voters is reachable
    pub fn ensure_safe(&self) -> Result<QuorumState> {
        let state = self.check();
        if state.is_safe() {
            Ok(state)
        } else {
            Err(state.to_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{NodeHealth, NodeTag::*};

    fn three_nodes() -> Arc<NodeRegistry> {
        let registry = Arc::new(NodeRegistry::new());
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
    fn test_majority_rules() {
        let registry = three_nodes();
        let monitor = QuorumMonitor::new(registry.clone(), Arc::new(ConditionLog::default()));
        assert!(monitor.evaluate().is_safe());

        registry.mark_unreachable("a").unwrap();
        let state = monitor.evaluate();
        assert!(state.is_safe());
        assert_eq!(state.reachable_voting_members.len(), 2);

        registry.mark_unreachable("c").unwrap();
        let state = monitor.evaluate();
        assert!(!state.is_safe());
        assert!(state.reachable_voting_members.contains("b"));
    }

    #[test]
    fn test_even_split_is_unsafe() {
        let mut a = Node::new("a", [Voter], 0, "a");
        let mut b = Node::new("b", [Voter], 0, "b");
        a.health = NodeHealth::Ready;
        b.health = NodeHealth::Unreachable;
        assert!(!QuorumState::evaluate(&[a, b]).is_safe());
    }

    #[test]
    fn test_no_voters_is_unsafe() {
        let node = Node::new("w", [Workload], 0, "w");
        let state = QuorumState::evaluate(&[node]);
        assert!(state.voting_members.is_empty());
        assert!(!state.is_safe());
    }

    #[test]
    fn test_draining_voter_keeps_vote() {
        let registry = three_nodes();
        registry.mark_draining("a").unwrap();
        registry.mark_unreachable("b").unwrap();
        let monitor = QuorumMonitor::new(registry, Arc::new(ConditionLog::default()));
        assert!(monitor.evaluate().is_safe());
    }

    #[test]
    fn test_transitions_reported_once() {
        let registry = three_nodes();
        let conditions = Arc::new(ConditionLog::default());
        let monitor = QuorumMonitor::new(registry.clone(), conditions.clone());

        registry.mark_unreachable("a").unwrap();
        registry.mark_unreachable("b").unwrap();
        assert!(matches!(
            monitor.ensure_safe(),
            Err(Error::QuorumLost {
                reachable: 1,
                voting: 3
            })
        ));
        monitor.check();
        assert_eq!(conditions.count(ConditionKind::QuorumLost), 1);

        registry.record_heartbeat("a", u64::MAX / 2).unwrap();
        assert!(monitor.ensure_safe().is_ok());
        assert_eq!(conditions.count(ConditionKind::QuorumRestored), 1);
    }
}
