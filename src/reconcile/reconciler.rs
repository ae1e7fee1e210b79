//! Reconciliation loop
//!
//! One pass diffs the desired placement against observed replicas and
//! issues corrective actions:
//!
//! 1. Observe: poll health of provisioning and active replicas.
//! 2. Gate: with no quorum, stop here and report `QuorumLost`.
//! 3. Plan: compute the target placement; capacity shortfalls are reported,
//!    never retried blindly.
//! 4. Create: missing desired replicas are provisioned, failed ones retried
//!    with bounded exponential backoff.
//! 5. Retire: replicas no longer desired are deleted only once their entity
//!    has its full count of `Active`, healthy desired replicas on `Ready`
//!    nodes, so a migration never drops an entity below its replica count.
//!
//! Passes are serialized by the observed-state lock. A pass stops early when
//! the registry generation moves under it; actions already dispatched stand
//! and the next pass picks up from the new snapshot.

use crate::cluster::node::{Node, NodeHealth};
use crate::cluster::quorum::{QuorumMonitor, QuorumState};
use crate::cluster::registry::{ClusterSnapshot, NodeRegistry};
use crate::common::{
    timestamp_now_millis, ConditionKind, ConditionLog, ControllerConfig, Error, Result,
    RetryPolicy, METRICS,
};
use crate::placement::{plan_with_hint, PlanWarning, ServiceSpec, VolumePlacement, VolumeSpec};
use crate::reconcile::lifecycle::{
    EntityRef, ManagedReplica, ReplicaKey, ReplicaState, ReplicaStatus,
};
use crate::reconcile::runtime::{ReplicaHandle, WorkloadRuntime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// Declared volumes and services
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl DesiredState {
    fn replica_count(&self, entity: &EntityRef) -> usize {
        match entity {
            EntityRef::Volume(id) => self
                .volumes
                .iter()
                .find(|v| &v.id == id)
                .map_or(0, |v| v.desired_replica_count),
            EntityRef::Service(id) => self
                .services
                .iter()
                .find(|s| &s.id == id)
                .map_or(0, |s| s.desired_replica_count),
        }
    }

    fn service_port(&self, service_id: &str) -> Option<u16> {
        self.services
            .iter()
            .find(|s| s.id == service_id)
            .map(|s| s.port)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Unreachable nodes keep their placement this long
    pub unreachable_grace: Duration,
    pub action_timeout: Duration,
    pub provision_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for ReconcilerConfig {
    fn from(conf: &ControllerConfig) -> Self {
        Self {
            unreachable_grace: conf.unreachable_grace(),
            action_timeout: conf.action_timeout(),
            provision_timeout: conf.provision_timeout(),
            retry: conf.retry_policy(),
        }
    }
}

/// A running service replica, as seen by the failover router
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ServiceReplica {
    pub service_id: String,
    pub node_id: String,
    pub ordinal: u32,
    pub port: u16,
}

/// Serving service replicas as of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServingSet {
    /// Registry generation the pass observed; replicas on nodes that
    /// recovered after it have not been health-checked since
    pub generation: u64,
    pub replicas: Vec<ServiceReplica>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionVerb {
    Create,
    Delete,
}

impl ActionVerb {
    fn as_str(&self) -> &'static str {
        match self {
            ActionVerb::Create => "create",
            ActionVerb::Delete => "delete",
        }
    }
}

/// Create or delete dispatched during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub verb: ActionVerb,
    pub key: ReplicaKey,
    pub ok: bool,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    /// Correlates log lines of one pass
    pub pass_id: String,
    pub generation: u64,
    pub quorum: QuorumState,
    pub quorum_lost: bool,
    /// Superseded by a newer registry snapshot
    pub aborted: bool,
    pub plan_error: Option<String>,
    pub warnings: Vec<PlanWarning>,
    pub actions: Vec<Action>,
    /// Replicas still provisioning or migrating
    pub pending: usize,
    pub stuck: usize,
}

/// Plan problems already surfaced, so each is reported once per occurrence
#[derive(Default)]
struct Reported {
    plan_error: Option<String>,
    warnings: Vec<PlanWarning>,
}

pub struct Reconciler {
    registry: Arc<NodeRegistry>,
    quorum: Arc<QuorumMonitor>,
    runtime: Arc<dyn WorkloadRuntime>,
    conditions: Arc<ConditionLog>,
    config: ReconcilerConfig,
    desired: RwLock<DesiredState>,
    /// Observed placement; held for the whole pass
    observed: Mutex<BTreeMap<ReplicaKey, ManagedReplica>>,
    statuses: RwLock<Vec<ReplicaStatus>>,
    last_report: RwLock<Option<PassReport>>,
    reported: std::sync::Mutex<Reported>,
    serving: watch::Sender<Arc<ServingSet>>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        quorum: Arc<QuorumMonitor>,
        runtime: Arc<dyn WorkloadRuntime>,
        conditions: Arc<ConditionLog>,
        config: ReconcilerConfig,
    ) -> Self {
        let (serving, _rx) = watch::channel(Arc::new(ServingSet::default()));
        Self {
            registry,
            quorum,
            runtime,
            conditions,
            config,
            desired: RwLock::new(DesiredState::default()),
            observed: Mutex::new(BTreeMap::new()),
            statuses: RwLock::new(Vec::new()),
            last_report: RwLock::new(None),
            reported: std::sync::Mutex::new(Reported::default()),
            serving,
        }
    }

    pub fn set_desired(&self, desired: DesiredState) {
        tracing::info!(
            volumes = desired.volumes.len(),
            services = desired.services.len(),
            "Desired state updated"
        );
        *self.desired.write().unwrap_or_else(PoisonError::into_inner) = desired;
    }

    pub fn desired(&self) -> DesiredState {
        self.desired
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Running service replicas, updated after every pass
    pub fn subscribe_serving(&self) -> watch::Receiver<Arc<ServingSet>> {
        self.serving.subscribe()
    }

    /// Replica states as of the last completed pass
    pub fn statuses(&self) -> Vec<ReplicaStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_report(&self) -> Option<PassReport> {
        self.last_report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear `PlacementStuck` for every replica of `entity`
    pub async fn reset_stuck(&self, entity: &EntityRef) -> usize {
        let mut observed = self.observed.lock().await;
        let now = Instant::now();
        let mut reset = 0;
        for replica in observed.values_mut().filter(|r| &r.key.entity == entity) {
            match &replica.state {
                ReplicaState::Failed {
                    stuck: true,
                    error,
                    leftover,
                    ..
                } => {
                    let next = ReplicaState::Failed {
                        attempts: 0,
                        retry_at: now,
                        error: error.clone(),
                        stuck: false,
                        leftover: leftover.clone(),
                    };
                    replica.transition(next);
                    reset += 1;
                }
                ReplicaState::Migrating {
                    stuck: true,
                    handle,
                    ..
                } => {
                    let next = ReplicaState::Migrating {
                        handle: handle.clone(),
                        delete_attempts: 0,
                        retry_at: None,
                        stuck: false,
                    };
                    replica.transition(next);
                    reset += 1;
                }
                _ => {}
            }
        }
        if reset > 0 {
            tracing::info!(entity = %entity, replicas = reset, "Stuck replicas reset");
        }
        let generation = self.serving.borrow().generation;
        self.publish(&observed, generation);
        reset
    }

    pub async fn run_pass(&self) -> PassReport {
        self.run_pass_at(timestamp_now_millis()).await
    }

    /// Run one pass with `now_ms` as wall-clock time for heartbeat grace
    pub async fn run_pass_at(&self, now_ms: u64) -> PassReport {
        let started = std::time::Instant::now();
        let mut observed = self.observed.lock().await;

        let snapshot = self.registry.snapshot();
        let quorum = QuorumState::evaluate(&snapshot.nodes);
        self.quorum.observe(&quorum);

        let mut report = PassReport {
            pass_id: uuid::Uuid::new_v4().to_string(),
            generation: snapshot.generation,
            quorum: quorum.clone(),
            ..Default::default()
        };

        self.observe(&mut observed, &snapshot).await;

        if !quorum.is_safe() {
            report.quorum_lost = true;
            METRICS.passes_skipped_quorum.inc();
            tracing::warn!(pass_id = %report.pass_id, quorum = %quorum, "Quorum lost; observing only");
        } else {
            self.converge(&mut observed, &snapshot, now_ms, &mut report)
                .await;
        }

        if report.aborted {
            METRICS.passes_aborted.inc();
            tracing::info!(
                pass_id = %report.pass_id,
                generation = snapshot.generation,
                "Pass superseded by newer cluster state"
            );
        }

        report.pending = observed
            .values()
            .filter(|r| {
                matches!(
                    r.state,
                    ReplicaState::Provisioning { .. } | ReplicaState::Migrating { .. }
                )
            })
            .count();
        report.stuck = observed.values().filter(|r| r.state.is_stuck()).count();

        self.publish(&observed, snapshot.generation);
        METRICS.record_pass(started.elapsed());
        tracing::debug!(
            pass_id = %report.pass_id,
            actions = report.actions.len(),
            pending = report.pending,
            stuck = report.stuck,
            "Reconciliation pass complete"
        );

        *self
            .last_report
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    /// Poll runtime health; no create/delete here
    async fn observe(
        &self,
        observed: &mut BTreeMap<ReplicaKey, ManagedReplica>,
        snapshot: &ClusterSnapshot,
    ) {
        let now = Instant::now();
        for replica in observed.values_mut() {
            let node_unreachable = snapshot
                .get(&replica.key.node_id)
                .map_or(true, |n| n.health == NodeHealth::Unreachable);

            match replica.state.clone() {
                ReplicaState::Provisioning {
                    handle,
                    attempts,
                    since,
                } => {
                    let healthy = !node_unreachable
                        && matches!(self.timed(self.runtime.health_of(&handle)).await, Ok(true));
                    if healthy {
                        tracing::info!(replica = %replica.key, "Replica active");
                        replica.transition(ReplicaState::Active { handle });
                    } else if now.duration_since(since) >= self.config.provision_timeout {
                        let error = Error::Timeout(format!(
                            "not healthy after {:?}",
                            self.config.provision_timeout
                        ));
                        let next = self.failed(&replica.key, attempts + 1, &error, Some(handle));
                        replica.transition(next);
                    }
                }
                ReplicaState::Active { handle } if !node_unreachable => {
                    match self.timed(self.runtime.health_of(&handle)).await {
                        Ok(false) => {
                            tracing::warn!(replica = %replica.key, "Active replica unhealthy");
                            let error = Error::Runtime {
                                node: replica.key.node_id.clone(),
                                reason: "replica reported unhealthy".into(),
                            };
                            let next = self.failed(&replica.key, 1, &error, Some(handle));
                            replica.transition(next);
                        }
                        Ok(true) => self.confirm(replica),
                        Err(e) => self.suspect(replica, &e),
                    }
                }
                // Still serves until deleted, so its health decides routing
                ReplicaState::Migrating { handle, .. } if !node_unreachable => {
                    match self.timed(self.runtime.health_of(&handle)).await {
                        Ok(true) => self.confirm(replica),
                        Ok(false) => self.suspect(replica, &"replica reported unhealthy"),
                        Err(e) => self.suspect(replica, &e),
                    }
                }
                _ => {}
            }
        }
    }

    async fn converge(
        &self,
        observed: &mut BTreeMap<ReplicaKey, ManagedReplica>,
        snapshot: &ClusterSnapshot,
        now_ms: u64,
        report: &mut PassReport,
    ) {
        let desired = self.desired();
        let planning_nodes = self.planning_view(snapshot, now_ms);

        let current: VolumePlacement = observed
            .values()
            .filter(|r| r.key.entity.is_volume())
            .filter(|r| {
                matches!(
                    r.state,
                    ReplicaState::Active { .. } | ReplicaState::Provisioning { .. }
                )
            })
            .map(|r| crate::placement::VolumeReplica {
                volume_id: r.key.entity.id().to_string(),
                node_id: r.key.node_id.clone(),
            })
            .collect();

        let plan = match plan_with_hint(
            &desired.volumes,
            &desired.services,
            &planning_nodes,
            Some(&current),
        ) {
            Ok(plan) => plan,
            Err(e) => {
                report.plan_error = Some(e.to_string());
                self.report_plan_problem(&e);
                return;
            }
        };
        self.note_plan(&plan.warnings);
        report.warnings = plan.warnings.clone();

        let mut desired_keys: BTreeSet<ReplicaKey> = BTreeSet::new();
        for r in plan.volumes.iter() {
            desired_keys.insert(ReplicaKey::new(
                EntityRef::Volume(r.volume_id.clone()),
                &r.node_id,
                0,
            ));
        }
        for t in plan.services.iter() {
            desired_keys.insert(ReplicaKey::new(
                EntityRef::Service(t.service_id.clone()),
                &t.node_id,
                t.ordinal,
            ));
        }

        // Create missing replicas
        for key in &desired_keys {
            if self.superseded(snapshot) {
                report.aborted = true;
                return;
            }
            let replica = observed
                .entry(key.clone())
                .or_insert_with(|| ManagedReplica::new(key.clone()));
            self.drive_desired(replica, snapshot, report).await;
        }

        // Retire replicas no longer desired
        let stale: Vec<ReplicaKey> = observed
            .keys()
            .filter(|k| !desired_keys.contains(*k))
            .cloned()
            .collect();

        for key in stale {
            if self.superseded(snapshot) {
                report.aborted = true;
                return;
            }
            // Replacements on a node inside its grace period do not count
            let needed = desired.replica_count(&key.entity);
            let active = desired_keys
                .iter()
                .filter(|k| k.entity == key.entity)
                .filter(|k| {
                    snapshot
                        .get(&k.node_id)
                        .is_some_and(|n| n.health == NodeHealth::Ready)
                })
                .filter(|k| {
                    observed
                        .get(*k)
                        .is_some_and(|r| r.state.is_active() && !r.suspect)
                })
                .count();

            let remove = match observed.get_mut(&key) {
                Some(replica) => {
                    self.retire(replica, snapshot, active >= needed, report)
                        .await
                }
                None => false,
            };
            if remove {
                observed.remove(&key);
            }
        }
    }

    /// Move a desired replica toward `Active`
    async fn drive_desired(
        &self,
        replica: &mut ManagedReplica,
        snapshot: &ClusterSnapshot,
        report: &mut PassReport,
    ) {
        let now = Instant::now();
        let (attempts, leftover) = match &replica.state {
            ReplicaState::Absent => (0, None),
            ReplicaState::Failed {
                attempts,
                retry_at,
                stuck: false,
                leftover,
                ..
            } if *retry_at <= now => (*attempts, leftover.clone()),
            ReplicaState::Migrating { handle, .. } => {
                // Desired again before it was deleted
                tracing::info!(replica = %replica.key, "Migration cancelled");
                let handle = handle.clone();
                replica.transition(ReplicaState::Active { handle });
                return;
            }
            _ => return,
        };

        // Within the grace period the node stays planned, but nothing can be started there
        let Some(node) = snapshot
            .get(&replica.key.node_id)
            .filter(|n| n.health == NodeHealth::Ready)
        else {
            return;
        };

        if let Some(leftover) = leftover {
            if let Err(e) = self.timed(self.runtime.delete_replica(&leftover)).await {
                tracing::warn!(replica = %replica.key, error = %e, "Cleanup of failed replica failed");
            }
        }

        tracing::info!(replica = %replica.key, attempt = attempts + 1, "Creating replica");
        let result = self
            .timed(self.runtime.create_replica(&replica.key.entity, node))
            .await;
        self.record_action(report, ActionVerb::Create, &replica.key, result.is_ok());

        let next = match result {
            Ok(handle) => ReplicaState::Provisioning {
                handle,
                attempts,
                since: Instant::now(),
            },
            Err(e) => self.failed(&replica.key, attempts + 1, &e, None),
        };
        replica.transition(next);
    }

    /// Handle a replica that is no longer desired; returns true once it is gone
    async fn retire(
        &self,
        replica: &mut ManagedReplica,
        snapshot: &ClusterSnapshot,
        replacements_ready: bool,
        report: &mut PassReport,
    ) -> bool {
        if let ReplicaState::Active { handle } = &replica.state {
            tracing::info!(replica = %replica.key, "Replica migrating");
            let handle = handle.clone();
            replica.transition(ReplicaState::Migrating {
                handle,
                delete_attempts: 0,
                retry_at: None,
                stuck: false,
            });
        }

        match replica.state.clone() {
            ReplicaState::Absent | ReplicaState::Active { .. } => true,
            ReplicaState::Failed { leftover: None, .. } => {
                replica.transition(ReplicaState::Absent);
                true
            }
            ReplicaState::Failed {
                leftover: Some(handle),
                ..
            }
            | ReplicaState::Provisioning { handle, .. } => {
                // Never served; nothing to protect
                let result = self.timed(self.runtime.delete_replica(&handle)).await;
                self.record_action(report, ActionVerb::Delete, &replica.key, result.is_ok());
                if let Err(e) = result {
                    tracing::warn!(replica = %replica.key, error = %e, "Delete of unused replica failed");
                }
                replica.transition(ReplicaState::Absent);
                true
            }
            ReplicaState::Migrating {
                handle,
                delete_attempts,
                retry_at,
                stuck,
            } => {
                if stuck || !replacements_ready || retry_at.is_some_and(|t| t > Instant::now()) {
                    return false;
                }
                match snapshot.get(&replica.key.node_id).map(|n| n.health) {
                    // Decommissioned: nothing left to call
                    None => {
                        tracing::info!(replica = %replica.key, "Host decommissioned; replica forgotten");
                        replica.transition(ReplicaState::Absent);
                        return true;
                    }
                    // Deleted once the node is back
                    Some(NodeHealth::Unreachable) => return false,
                    Some(_) => {}
                }

                tracing::info!(replica = %replica.key, "Deleting replaced replica");
                let result = self.timed(self.runtime.delete_replica(&handle)).await;
                self.record_action(report, ActionVerb::Delete, &replica.key, result.is_ok());
                match result {
                    Ok(()) => {
                        replica.transition(ReplicaState::Absent);
                        true
                    }
                    Err(e) => {
                        let delete_attempts = delete_attempts + 1;
                        let stuck =
                            !e.is_retryable() || self.config.retry.exhausted(delete_attempts);
                        if stuck {
                            self.report_stuck(&replica.key, delete_attempts, &e);
                        } else {
                            tracing::warn!(replica = %replica.key, attempt = delete_attempts, error = %e, "Delete failed; will retry");
                        }
                        replica.transition(ReplicaState::Migrating {
                            handle,
                            delete_attempts,
                            retry_at: Some(
                                Instant::now() + self.config.retry.backoff(delete_attempts),
                            ),
                            stuck,
                        });
                        false
                    }
                }
            }
        }
    }

    /// Nodes as the planner should see them: short outages keep their placement
    fn planning_view(&self, snapshot: &ClusterSnapshot, now_ms: u64) -> Vec<Node> {
        let grace_ms = self.config.unreachable_grace.as_millis() as u64;
        snapshot
            .nodes
            .iter()
            .cloned()
            .map(|mut node| {
                if node.health == NodeHealth::Unreachable
                    && now_ms.saturating_sub(node.last_heartbeat) < grace_ms
                {
                    node.health = NodeHealth::Ready;
                }
                node
            })
            .collect()
    }

    fn superseded(&self, snapshot: &ClusterSnapshot) -> bool {
        self.registry.generation() != snapshot.generation
    }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.action_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "runtime call exceeded {:?}",
                self.config.action_timeout
            ))),
        }
    }

    /// Failed state after `attempts` tries; permanent errors are stuck at once
    fn failed(
        &self,
        key: &ReplicaKey,
        attempts: u32,
        error: &Error,
        leftover: Option<ReplicaHandle>,
    ) -> ReplicaState {
        let stuck = !error.is_retryable() || self.config.retry.exhausted(attempts);
        if stuck {
            self.report_stuck(key, attempts, error);
        } else {
            tracing::warn!(replica = %key, attempt = attempts, error = %error, "Replica failed; will retry");
        }
        ReplicaState::Failed {
            attempts,
            retry_at: Instant::now() + self.config.retry.backoff(attempts),
            error: error.to_string(),
            stuck,
            leftover,
        }
    }

    fn confirm(&self, replica: &mut ManagedReplica) {
        if replica.suspect {
            tracing::info!(replica = %replica.key, "Replica healthy again");
            replica.suspect = false;
        }
    }

    fn suspect(&self, replica: &mut ManagedReplica, reason: &dyn std::fmt::Display) {
        if !replica.suspect {
            tracing::warn!(replica = %replica.key, reason = %reason, "Replica health unconfirmed");
            replica.suspect = true;
        }
    }

    fn record_action(&self, report: &mut PassReport, verb: ActionVerb, key: &ReplicaKey, ok: bool) {
        METRICS.action(verb.as_str()).inc();
        if !ok {
            METRICS.action_failures.inc();
        }
        report.actions.push(Action {
            verb,
            key: key.clone(),
            ok,
        });
    }

    fn report_stuck(&self, key: &ReplicaKey, attempts: u32, error: &dyn std::fmt::Display) {
        let err = Error::PlacementStuck {
            entity: key.entity.to_string(),
            node: key.node_id.clone(),
            attempts,
        };
        self.conditions.report(
            ConditionKind::PlacementStuck,
            Some(key.to_string()),
            format!("{} (last error: {})", err, error),
        );
    }

    fn reported(&self) -> std::sync::MutexGuard<'_, Reported> {
        self.reported.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_plan_problem(&self, err: &Error) {
        let message = err.to_string();
        let mut reported = self.reported();
        if reported.plan_error.as_deref() == Some(message.as_str()) {
            return;
        }
        let (kind, subject) = match err {
            Error::InsufficientCapacity { volume, .. } => {
                (ConditionKind::InsufficientCapacity, Some(volume.clone()))
            }
            Error::NoEligibleNodes(service) => {
                (ConditionKind::NoEligibleNodes, Some(service.clone()))
            }
            _ => (ConditionKind::InsufficientCapacity, None),
        };
        self.conditions
            .report(kind, subject, format!("{}; placement paused", message));
        reported.plan_error = Some(message);
    }

    /// Plan succeeded: clear any previous error and report warnings not seen last pass
    fn note_plan(&self, warnings: &[PlanWarning]) {
        let mut reported = self.reported();
        if reported.plan_error.take().is_some() {
            tracing::info!("Placement problem cleared");
        }
        for warning in warnings.iter().filter(|w| !reported.warnings.contains(w)) {
            let PlanWarning::DegradedSpread { service_id, .. } = warning;
            self.conditions.report(
                ConditionKind::DegradedSpread,
                Some(service_id.clone()),
                warning.to_string(),
            );
        }
        reported.warnings = warnings.to_vec();
    }

    fn publish(&self, observed: &BTreeMap<ReplicaKey, ManagedReplica>, generation: u64) {
        let desired = self.desired();

        let mut replicas: Vec<ServiceReplica> = observed
            .values()
            .filter(|r| r.is_serving())
            .filter_map(|r| match &r.key.entity {
                EntityRef::Service(id) => Some(ServiceReplica {
                    service_id: id.clone(),
                    node_id: r.key.node_id.clone(),
                    ordinal: r.key.ordinal,
                    port: desired.service_port(id)?,
                }),
                EntityRef::Volume(_) => None,
            })
            .collect();
        replicas.sort();
        let serving = ServingSet {
            generation,
            replicas,
        };

        let statuses: Vec<ReplicaStatus> = observed.values().map(|r| r.status()).collect();
        METRICS
            .active_replicas
            .set(observed.values().filter(|r| r.state.is_active()).count() as u64);
        METRICS
            .stuck_replicas
            .set(observed.values().filter(|r| r.state.is_stuck()).count() as u64);

        *self.statuses.write().unwrap_or_else(PoisonError::into_inner) = statuses;
        self.serving.send_if_modified(|current| {
            if **current == serving {
                false
            } else {
                *current = Arc::new(serving);
                true
            }
        });
    }
}
