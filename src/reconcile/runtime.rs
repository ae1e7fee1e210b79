//! Workload execution boundary
//!
//! The reconciler only speaks three verbs to whatever actually runs
//! replicas: create, delete and health. [`HttpRuntime`] talks to a node
//! agent over HTTP; [`MemoryRuntime`] runs everything in-process for tests
//! and simulation.

use crate::cluster::node::Node;
use crate::common::{Error, Result};
use crate::reconcile::lifecycle::EntityRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Opaque reference to a running replica
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaHandle {
    /// Runtime-assigned id
    pub id: String,
    pub node_id: String,
    /// Agent address of the hosting node
    pub address: String,
}

#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    async fn create_replica(&self, entity: &EntityRef, node: &Node) -> Result<ReplicaHandle>;

    async fn delete_replica(&self, handle: &ReplicaHandle) -> Result<()>;

    async fn health_of(&self, handle: &ReplicaHandle) -> Result<bool>;
}

// === HTTP node agent ===

#[derive(Serialize)]
struct CreateRequest<'a> {
    entity: &'a EntityRef,
    node_id: &'a str,
}

#[derive(Deserialize)]
struct CreateResponse {
    handle: String,
}

#[derive(Deserialize)]
struct HealthResponse {
    healthy: bool,
}

/// Runtime backed by the node agent HTTP API
///
/// - `POST   http://{address}/replicas`              -> `{"handle": ".."}`
/// - `DELETE http://{address}/replicas/{handle}`
/// - `GET    http://{address}/replicas/{handle}/health` -> `{"healthy": bool}`
pub struct HttpRuntime {
    client: reqwest::Client,
}

impl HttpRuntime {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    fn base_url(address: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address)
        }
    }

    /// 4xx answers are permanent, anything else unsuccessful is transient
    fn check(node: &str, resp: &reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = format!("agent returned {}", status);
        let transient = status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
        if status.is_client_error() && !transient {
            Err(Error::Rejected {
                node: node.to_string(),
                reason,
            })
        } else {
            Err(Error::Runtime {
                node: node.to_string(),
                reason,
            })
        }
    }
}

#[async_trait]
impl WorkloadRuntime for HttpRuntime {
    async fn create_replica(&self, entity: &EntityRef, node: &Node) -> Result<ReplicaHandle> {
        let url = format!("{}/replicas", Self::base_url(&node.address));
        let resp = self
            .client
            .post(&url)
            .json(&CreateRequest {
                entity,
                node_id: &node.id,
            })
            .send()
            .await?;
        Self::check(&node.id, &resp)?;
        let body: CreateResponse = resp.json().await?;
        Ok(ReplicaHandle {
            id: body.handle,
            node_id: node.id.clone(),
            address: node.address.clone(),
        })
    }

    async fn delete_replica(&self, handle: &ReplicaHandle) -> Result<()> {
        let url = format!("{}/replicas/{}", Self::base_url(&handle.address), handle.id);
        let resp = self.client.delete(&url).send().await?;
        // Already gone counts as deleted
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(&handle.node_id, &resp)
    }

    async fn health_of(&self, handle: &ReplicaHandle) -> Result<bool> {
        let url = format!(
            "{}/replicas/{}/health",
            Self::base_url(&handle.address),
            handle.id
        );
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(&handle.node_id, &resp)?;
        let body: HealthResponse = resp.json().await?;
        Ok(body.healthy)
    }
}

// === In-process runtime ===

/// Call recorded by [`MemoryRuntime`], in dispatch order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Create { entity: EntityRef, node_id: String },
    Delete { handle: String, node_id: String },
    Health { handle: String, healthy: bool },
}

#[derive(Debug, Clone)]
struct MemoryReplica {
    entity: EntityRef,
    node_id: String,
    healthy: bool,
}

#[derive(Default)]
struct MemoryState {
    replicas: BTreeMap<String, MemoryReplica>,
    /// Only kept with `with_call_log`
    calls: Option<Vec<RuntimeCall>>,
    /// Nodes whose create/delete calls fail
    failing: BTreeSet<String>,
    /// Nodes whose create/delete calls are refused outright
    rejecting: BTreeSet<String>,
    /// Nodes whose calls never return
    hanging: BTreeSet<String>,
    /// New replicas start unhealthy until marked otherwise
    start_unhealthy: bool,
    next_id: u64,
}

/// In-process runtime used by tests and `serve --simulate`
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every call for later inspection
    pub fn with_call_log() -> Self {
        let runtime = Self::default();
        runtime.lock().calls = Some(Vec::new());
        runtime
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(state: &mut MemoryState, call: RuntimeCall) {
        if let Some(calls) = state.calls.as_mut() {
            calls.push(call);
        }
    }

    pub fn fail_node(&self, node_id: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(node_id.to_string());
        } else {
            state.failing.remove(node_id);
        }
    }

    pub fn reject_node(&self, node_id: &str, rejecting: bool) {
        let mut state = self.lock();
        if rejecting {
            state.rejecting.insert(node_id.to_string());
        } else {
            state.rejecting.remove(node_id);
        }
    }

    pub fn hang_node(&self, node_id: &str, hanging: bool) {
        let mut state = self.lock();
        if hanging {
            state.hanging.insert(node_id.to_string());
        } else {
            state.hanging.remove(node_id);
        }
    }

    pub fn set_start_unhealthy(&self, unhealthy: bool) {
        self.lock().start_unhealthy = unhealthy;
    }

    /// Flip health of every replica of `entity` on `node_id`
    pub fn set_healthy(&self, entity: &EntityRef, node_id: &str, healthy: bool) {
        let mut state = self.lock();
        for replica in state.replicas.values_mut() {
            if &replica.entity == entity && replica.node_id == node_id {
                replica.healthy = healthy;
            }
        }
    }

    /// Empty unless built `with_call_log`
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone().unwrap_or_default()
    }

    /// Create and delete calls only
    pub fn mutations(&self) -> Vec<RuntimeCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, RuntimeCall::Health { .. }))
            .collect()
    }

    pub fn clear_calls(&self) {
        if let Some(calls) = self.lock().calls.as_mut() {
            calls.clear();
        }
    }

    /// `(entity, node)` pairs currently running
    pub fn running(&self) -> Vec<(EntityRef, String)> {
        let mut running: Vec<_> = self
            .lock()
            .replicas
            .values()
            .map(|r| (r.entity.clone(), r.node_id.clone()))
            .collect();
        running.sort();
        running
    }

    async fn maybe_hang(&self, node_id: &str) {
        let hanging = self.lock().hanging.contains(node_id);
        if hanging {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl WorkloadRuntime for MemoryRuntime {
    async fn create_replica(&self, entity: &EntityRef, node: &Node) -> Result<ReplicaHandle> {
        self.maybe_hang(&node.id).await;

        let mut state = self.lock();
        Self::record(
            &mut state,
            RuntimeCall::Create {
                entity: entity.clone(),
                node_id: node.id.clone(),
            },
        );
        if state.rejecting.contains(&node.id) {
            return Err(Error::Rejected {
                node: node.id.clone(),
                reason: "injected rejection".into(),
            });
        }
        if state.failing.contains(&node.id) {
            return Err(Error::Runtime {
                node: node.id.clone(),
                reason: "injected create failure".into(),
            });
        }

        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        let healthy = !state.start_unhealthy;
        state.replicas.insert(
            id.clone(),
            MemoryReplica {
                entity: entity.clone(),
                node_id: node.id.clone(),
                healthy,
            },
        );
        Ok(ReplicaHandle {
            id,
            node_id: node.id.clone(),
            address: node.address.clone(),
        })
    }

    async fn delete_replica(&self, handle: &ReplicaHandle) -> Result<()> {
        self.maybe_hang(&handle.node_id).await;

        let mut state = self.lock();
        Self::record(
            &mut state,
            RuntimeCall::Delete {
                handle: handle.id.clone(),
                node_id: handle.node_id.clone(),
            },
        );
        if state.rejecting.contains(&handle.node_id) {
            return Err(Error::Rejected {
                node: handle.node_id.clone(),
                reason: "injected rejection".into(),
            });
        }
        if state.failing.contains(&handle.node_id) {
            return Err(Error::Runtime {
                node: handle.node_id.clone(),
                reason: "injected delete failure".into(),
            });
        }
        state.replicas.remove(&handle.id);
        Ok(())
    }

    async fn health_of(&self, handle: &ReplicaHandle) -> Result<bool> {
        self.maybe_hang(&handle.node_id).await;

        let mut state = self.lock();
        let healthy = state
            .replicas
            .get(&handle.id)
            .map(|r| r.healthy)
            .unwrap_or(false);
        Self::record(
            &mut state,
            RuntimeCall::Health {
                handle: handle.id.clone(),
                healthy,
            },
        );
        Ok(healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::NodeTag;

    #[tokio::test]
    async fn test_memory_runtime_lifecycle() {
        let runtime = MemoryRuntime::with_call_log();
        let node = Node::new("a", [NodeTag::Storage], 10, "10.0.0.1");
        let entity = EntityRef::Volume("pgdata".into());

        let handle = runtime.create_replica(&entity, &node).await.unwrap();
        assert_eq!(handle.node_id, "a");
        assert!(runtime.health_of(&handle).await.unwrap());

        runtime.set_healthy(&entity, "a", false);
        assert!(!runtime.health_of(&handle).await.unwrap());

        runtime.delete_replica(&handle).await.unwrap();
        assert!(runtime.running().is_empty());
        assert_eq!(runtime.mutations().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_runtime_injected_failure() {
        let runtime = MemoryRuntime::new();
        let node = Node::new("b", [NodeTag::Workload], 0, "10.0.0.2");
        runtime.fail_node("b", true);

        let err = runtime
            .create_replica(&EntityRef::Service("web".into()), &node)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(runtime.running().is_empty());

        runtime.fail_node("b", false);
        runtime.reject_node("b", true);
        let err = runtime
            .create_replica(&EntityRef::Service("web".into()), &node)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_memory_runtime_calls_unrecorded_by_default() {
        let runtime = MemoryRuntime::new();
        let node = Node::new("a", [NodeTag::Workload], 0, "10.0.0.1");
        let handle = runtime
            .create_replica(&EntityRef::Service("web".into()), &node)
            .await
            .unwrap();
        for _ in 0..10 {
            runtime.health_of(&handle).await.unwrap();
        }
        assert!(runtime.calls().is_empty());
        assert_eq!(runtime.running().len(), 1);
    }

    #[test]
    fn test_base_url() {
        assert_eq!(HttpRuntime::base_url("10.0.0.1:9000"), "http://10.0.0.1:9000");
        assert_eq!(
            HttpRuntime::base_url("https://agent.local/"),
            "https://agent.local"
        );
    }
}
