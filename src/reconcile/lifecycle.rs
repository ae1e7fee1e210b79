//! Per-replica lifecycle
//!
//! Every managed replica carries an explicit state value:
//!
//! ```text
//! Absent ─► Provisioning ─► Active ─► Migrating ─► (deleted)
//!               ▲   │          │
//!               │   ▼          ▼
//!               └─ Failed ◄────┘
//! ```
//!
//! `Migrating` marks a replica that is no longer desired but is kept until
//! its replacement is `Active`.

use crate::reconcile::runtime::ReplicaHandle;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::time::Instant;

/// The thing a replica belongs to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityRef {
    Volume(String),
    Service(String),
}

impl EntityRef {
    pub fn id(&self) -> &str {
        match self {
            EntityRef::Volume(id) | EntityRef::Service(id) => id,
        }
    }

    pub fn is_volume(&self) -> bool {
        matches!(self, EntityRef::Volume(_))
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityRef::Volume(id) => write!(f, "volume/{}", id),
            EntityRef::Service(id) => write!(f, "service/{}", id),
        }
    }
}

impl FromStr for EntityRef {
    type Err = crate::Error;

    /// Parses `volume/<id>` or `service/<id>`
    fn from_str(s: &str) -> crate::Result<Self> {
        match s.split_once('/') {
            Some(("volume", id)) if !id.is_empty() => Ok(EntityRef::Volume(id.to_string())),
            Some(("service", id)) if !id.is_empty() => Ok(EntityRef::Service(id.to_string())),
            _ => Err(crate::Error::Other(format!(
                "expected volume/<id> or service/<id>, got {}",
                s
            ))),
        }
    }
}

/// Identity of one replica: entity, host node and slot on that node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaKey {
    pub entity: EntityRef,
    pub node_id: String,
    pub ordinal: u32,
}

impl ReplicaKey {
    pub fn new(entity: EntityRef, node_id: impl Into<String>, ordinal: u32) -> Self {
        Self {
            entity,
            node_id: node_id.into(),
            ordinal,
        }
    }
}

impl std::fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.entity, self.node_id, self.ordinal)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaState {
    Absent,
    Provisioning {
        handle: ReplicaHandle,
        /// Failed attempts before this one
        attempts: u32,
        since: Instant,
    },
    Active {
        handle: ReplicaHandle,
    },
    Migrating {
        handle: ReplicaHandle,
        delete_attempts: u32,
        retry_at: Option<Instant>,
        stuck: bool,
    },
    Failed {
        attempts: u32,
        retry_at: Instant,
        error: String,
        /// Retry budget exhausted; waits for an operator reset
        stuck: bool,
        /// Half-provisioned replica to clean up before retrying
        leftover: Option<ReplicaHandle>,
    },
}

impl ReplicaState {
    pub fn name(&self) -> &'static str {
        match self {
            ReplicaState::Absent => "absent",
            ReplicaState::Provisioning { .. } => "provisioning",
            ReplicaState::Active { .. } => "active",
            ReplicaState::Migrating { .. } => "migrating",
            ReplicaState::Failed { .. } => "failed",
        }
    }

    pub fn handle(&self) -> Option<&ReplicaHandle> {
        match self {
            ReplicaState::Provisioning { handle, .. }
            | ReplicaState::Active { handle }
            | ReplicaState::Migrating { handle, .. } => Some(handle),
            ReplicaState::Failed { leftover, .. } => leftover.as_ref(),
            ReplicaState::Absent => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ReplicaState::Active { .. })
    }

    /// Running and able to serve, even if on its way out
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            ReplicaState::Active { .. } | ReplicaState::Migrating { .. }
        )
    }

    pub fn is_stuck(&self) -> bool {
        matches!(
            self,
            ReplicaState::Failed { stuck: true, .. } | ReplicaState::Migrating { stuck: true, .. }
        )
    }

    /// Legal lifecycle edges
    pub fn can_transition_to(&self, next: &ReplicaState) -> bool {
        use ReplicaState::*;
        matches!(
            (self, next),
            (Absent, Provisioning { .. })
                | (Absent, Failed { .. })
                | (Provisioning { .. }, Active { .. })
                | (Provisioning { .. }, Failed { .. })
                | (Provisioning { .. }, Absent)
                | (Active { .. }, Migrating { .. })
                | (Active { .. }, Failed { .. })
                | (Migrating { .. }, Migrating { .. })
                | (Migrating { .. }, Active { .. })
                | (Migrating { .. }, Absent)
                | (Failed { .. }, Provisioning { .. })
                | (Failed { .. }, Failed { .. })
                | (Failed { .. }, Absent)
        )
    }
}

/// A replica under management
#[derive(Debug, Clone)]
pub struct ManagedReplica {
    pub key: ReplicaKey,
    pub state: ReplicaState,
    /// Last health poll of a running replica failed or errored
    pub suspect: bool,
}

impl ManagedReplica {
    pub fn new(key: ReplicaKey) -> Self {
        Self {
            key,
            state: ReplicaState::Absent,
            suspect: false,
        }
    }

    /// Running, and its last health poll passed
    pub fn is_serving(&self) -> bool {
        self.state.is_serving() && !self.suspect
    }

    /// Move to `next`, logging the edge
    pub fn transition(&mut self, next: ReplicaState) {
        if !self.state.can_transition_to(&next) {
            tracing::error!(
                replica = %self.key,
                from = self.state.name(),
                to = next.name(),
                "Illegal replica transition"
            );
        }
        tracing::debug!(
            replica = %self.key,
            from = self.state.name(),
            to = next.name(),
            "Replica transition"
        );
        if !next.is_serving() {
            self.suspect = false;
        }
        self.state = next;
    }

    pub fn status(&self) -> ReplicaStatus {
        let (attempts, error) = match &self.state {
            ReplicaState::Provisioning { attempts, .. } => (*attempts, None),
            ReplicaState::Migrating {
                delete_attempts, ..
            } => (*delete_attempts, None),
            ReplicaState::Failed {
                attempts, error, ..
            } => (*attempts, Some(error.clone())),
            _ => (0, None),
        };
        ReplicaStatus {
            key: self.key.clone(),
            state: self.state.name(),
            handle: self.state.handle().map(|h| h.id.clone()),
            attempts,
            stuck: self.state.is_stuck(),
            suspect: self.suspect,
            error,
        }
    }
}

/// Serializable view for the admin API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    pub key: ReplicaKey,
    pub state: &'static str,
    pub handle: Option<String>,
    pub attempts: u32,
    pub stuck: bool,
    pub suspect: bool,
    pub error: Option<String>,
}
