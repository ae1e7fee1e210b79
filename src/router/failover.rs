//! Failover router
//!
//! Keeps the endpoint set equal to the running service replicas whose host
//! is `Ready`, and pushes every change to the ingress. Runs apart from the
//! reconciler: a node loss is routed around on the health event itself,
//! without waiting for a planning pass. The way back is slower: a node that
//! returns from `Unreachable` gets its endpoints again only once a pass run
//! after the recovery has re-checked its replicas.

use crate::cluster::node::NodeHealth;
use crate::cluster::registry::NodeRegistry;
use crate::common::METRICS;
use crate::reconcile::ServingSet;
use crate::router::endpoints::{Endpoint, EndpointDiff, EndpointSet};
use crate::router::ingress::Ingress;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};

#[derive(Default)]
struct RouterState {
    /// Authoritative endpoint set
    endpoints: EndpointSet,
    /// What the ingress has acknowledged
    published: EndpointSet,
}

pub struct FailoverRouter {
    registry: Arc<NodeRegistry>,
    ingress: Arc<dyn Ingress>,
    serving: watch::Receiver<Arc<ServingSet>>,
    /// Upper bound for one ingress call
    timeout: Duration,
    state: Mutex<RouterState>,
}

/// Host part of a node address: scheme and port stripped
fn host_of(address: &str) -> &str {
    let address = address
        .strip_prefix("http://")
        .or_else(|| address.strip_prefix("https://"))
        .unwrap_or(address);
    let address = address.trim_end_matches('/');
    match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => address,
    }
}

impl FailoverRouter {
    pub fn new(
        registry: Arc<NodeRegistry>,
        ingress: Arc<dyn Ingress>,
        serving: watch::Receiver<Arc<ServingSet>>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            ingress,
            serving,
            timeout,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Endpoints the cluster should expose right now
    pub fn target(&self) -> EndpointSet {
        let snapshot = self.registry.snapshot();
        let serving = self.serving.borrow().clone();
        serving
            .replicas
            .iter()
            .filter_map(|r| {
                let node = snapshot.get(&r.node_id).filter(|n| {
                    n.health == NodeHealth::Ready && n.recovered_at <= serving.generation
                })?;
                Some(Endpoint::new(
                    &r.service_id,
                    &r.node_id,
                    host_of(&node.address),
                    r.port,
                ))
            })
            .collect()
    }

    pub async fn endpoints(&self) -> EndpointSet {
        self.state.lock().await.endpoints.clone()
    }

    /// Recompute the endpoint set and publish the difference
    ///
    /// Removals reach the ingress before additions. Failed ingress calls are
    /// retried on the next sync; the returned diff covers the local set only.
    pub async fn sync(&self) -> EndpointDiff {
        let target = self.target();
        let mut state = self.state.lock().await;

        let diff = state.endpoints.diff(&target);
        for endpoint in &diff.removed {
            tracing::info!(
                service_id = %endpoint.service_id,
                node_id = %endpoint.node_id,
                "Endpoint removed"
            );
        }
        for endpoint in &diff.added {
            tracing::info!(
                service_id = %endpoint.service_id,
                node_id = %endpoint.node_id,
                address = %endpoint.address,
                "Endpoint added"
            );
        }
        if !diff.is_empty() {
            METRICS
                .endpoint_updates
                .add((diff.added.len() + diff.removed.len()) as u64);
        }
        METRICS.live_endpoints.set(target.len() as u64);
        state.endpoints = target.clone();

        let publish = state.published.diff(&target);
        // Removals go out together and all settle before any addition
        let removals = publish.removed.iter().map(|endpoint| async move {
            let call = self.ingress.remove(&endpoint.service_id, &endpoint.node_id);
            let result = tokio::time::timeout(self.timeout, call).await;
            (endpoint, result)
        });
        for (endpoint, result) in join_all(removals).await {
            match result {
                Ok(Ok(())) => {
                    state
                        .published
                        .remove(&endpoint.service_id, &endpoint.node_id);
                }
                Ok(Err(e)) => {
                    tracing::warn!(node_id = %endpoint.node_id, error = %e, "Ingress removal failed")
                }
                Err(_) => tracing::warn!(node_id = %endpoint.node_id, "Ingress removal timed out"),
            }
        }
        for endpoint in publish.added {
            match tokio::time::timeout(self.timeout, self.ingress.upsert(&endpoint)).await {
                Ok(Ok(())) => {
                    state.published.insert(endpoint);
                }
                Ok(Err(e)) => {
                    tracing::warn!(node_id = %endpoint.node_id, error = %e, "Ingress update failed")
                }
                Err(_) => tracing::warn!(node_id = %endpoint.node_id, "Ingress update timed out"),
            }
        }

        diff
    }

    /// Run until `shutdown` flips to true
    pub fn start(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_ms = interval.as_millis() as u64,
                "Failover router started"
            );
            let mut events = self.registry.subscribe();
            let mut serving = self.serving.clone();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    event = events.recv() => match event {
                        Ok(event) if event.is_loss() => {
                            tracing::debug!(node_id = %event.node_id, "Node lost; rerouting");
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Router lagged behind health events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = serving.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {}
                }
                self.sync().await;
            }
            tracing::info!("Failover router stopped");
        })
    }
}
