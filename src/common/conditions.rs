//! Condition log
//!
//! Operator-facing record of the conditions the controller reports rather
//! than retries: lost quorum, capacity shortfalls, exhausted retry budgets
//! and degraded anti-affinity spread. Kept in a bounded in-memory ring and
//! mirrored to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    QuorumLost,
    QuorumRestored,
    InsufficientCapacity,
    NoEligibleNodes,
    PlacementStuck,
    DegradedSpread,
    NodeUnreachable,
    NodeRecovered,
}

impl ConditionKind {
    /// Conditions that need an operator or block mutation
    pub fn is_severe(&self) -> bool {
        matches!(
            self,
            ConditionKind::QuorumLost
                | ConditionKind::InsufficientCapacity
                | ConditionKind::NoEligibleNodes
                | ConditionKind::PlacementStuck
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub kind: ConditionKind,
    /// Affected node, volume or service, if any
    pub subject: Option<String>,
    pub message: String,
}

pub struct ConditionLog {
    entries: Mutex<VecDeque<Condition>>,
    capacity: usize,
}

impl ConditionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn report(&self, kind: ConditionKind, subject: Option<String>, message: impl Into<String>) {
        let entry = Condition {
            timestamp: Utc::now(),
            kind,
            subject,
            message: message.into(),
        };

        if kind.is_severe() {
            tracing::warn!(condition = ?entry.kind, subject = ?entry.subject, "{}", entry.message);
        } else {
            tracing::info!(condition = ?entry.kind, subject = ?entry.subject, "{}", entry.message);
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent first
    pub fn recent(&self, limit: usize) -> Vec<Condition> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn count(&self, kind: ConditionKind) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().filter(|c| c.kind == kind).count()
    }
}

impl Default for ConditionLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
