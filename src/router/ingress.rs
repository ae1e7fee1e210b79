//! External entry point boundary
//!
//! The router publishes endpoint changes to whatever directs external
//! traffic. Implementations must be idempotent: the same upsert or removal
//! may be retried.

use crate::common::{Error, Result};
use crate::router::endpoints::Endpoint;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[async_trait]
pub trait Ingress: Send + Sync {
    async fn upsert(&self, endpoint: &Endpoint) -> Result<()>;

    async fn remove(&self, service_id: &str, node_id: &str) -> Result<()>;
}

/// Ingress controller reached over HTTP
///
/// `PUT {base}/endpoints/{service}/{node}` with the endpoint as JSON body,
/// `DELETE {base}/endpoints/{service}/{node}`.
pub struct HttpIngress {
    base_url: String,
    client: reqwest::Client,
}

impl HttpIngress {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, service_id: &str, node_id: &str) -> String {
        format!("{}/endpoints/{}/{}", self.base_url, service_id, node_id)
    }
}

#[async_trait]
impl Ingress for HttpIngress {
    async fn upsert(&self, endpoint: &Endpoint) -> Result<()> {
        let resp = self
            .client
            .put(self.url(&endpoint.service_id, &endpoint.node_id))
            .json(endpoint)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Ingress(format!(
                "upsert {}/{} returned {}",
                endpoint.service_id,
                endpoint.node_id,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn remove(&self, service_id: &str, node_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(service_id, node_id))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Ingress(format!(
                "remove {}/{} returned {}",
                service_id, node_id, status
            )));
        }
        Ok(())
    }
}

/// Ingress that only logs; used when no ingress URL is configured
pub struct LogIngress;

#[async_trait]
impl Ingress for LogIngress {
    async fn upsert(&self, endpoint: &Endpoint) -> Result<()> {
        tracing::info!(
            service_id = %endpoint.service_id,
            node_id = %endpoint.node_id,
            address = %endpoint.address,
            "Endpoint up"
        );
        Ok(())
    }

    async fn remove(&self, service_id: &str, node_id: &str) -> Result<()> {
        tracing::info!(service_id = %service_id, node_id = %node_id, "Endpoint down");
        Ok(())
    }
}

/// Ingress recording its routing table in memory
#[derive(Default)]
pub struct MemoryIngress {
    routes: Mutex<BTreeMap<(String, String), Endpoint>>,
    failing: Mutex<bool>,
}

impl MemoryIngress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until cleared
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }

    pub fn routes(&self) -> Vec<Endpoint> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.routes().iter().any(|e| e.node_id == node_id)
    }

    fn check(&self) -> Result<()> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(Error::Ingress("injected ingress failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ingress for MemoryIngress {
    async fn upsert(&self, endpoint: &Endpoint) -> Result<()> {
        self.check()?;
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (endpoint.service_id.clone(), endpoint.node_id.clone()),
                endpoint.clone(),
            );
        Ok(())
    }

    async fn remove(&self, service_id: &str, node_id: &str) -> Result<()> {
        self.check()?;
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(service_id.to_string(), node_id.to_string()));
        Ok(())
    }
}
