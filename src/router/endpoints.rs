//! Live service endpoints

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reachable address of one live service replica
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub service_id: String,
    pub node_id: String,
    /// `host:port`
    pub address: String,
}

impl Endpoint {
    pub fn new(service_id: &str, node_id: &str, host: &str, port: u16) -> Self {
        Self {
            service_id: service_id.to_string(),
            node_id: node_id.to_string(),
            address: format!("{}:{}", host, port),
        }
    }

    fn key(&self) -> (String, String) {
        (self.service_id.clone(), self.node_id.clone())
    }
}

/// Changes between two endpoint sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointDiff {
    pub added: Vec<Endpoint>,
    pub removed: Vec<Endpoint>,
}

impl EndpointDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Endpoints keyed by `(service, node)`
///
/// Co-located replicas of one service share a single endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSet {
    endpoints: BTreeMap<(String, String), Endpoint>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, endpoint: Endpoint) -> Option<Endpoint> {
        self.endpoints.insert(endpoint.key(), endpoint)
    }

    pub fn remove(&mut self, service_id: &str, node_id: &str) -> Option<Endpoint> {
        self.endpoints
            .remove(&(service_id.to_string(), node_id.to_string()))
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.endpoints.values().any(|e| e.node_id == node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// What must change to turn `self` into `target`
    ///
    /// An endpoint whose address changed shows up as removed and added.
    pub fn diff(&self, target: &EndpointSet) -> EndpointDiff {
        let removed = self
            .endpoints
            .iter()
            .filter(|(k, e)| target.endpoints.get(*k) != Some(*e))
            .map(|(_, e)| e.clone())
            .collect();
        let added = target
            .endpoints
            .iter()
            .filter(|(k, e)| self.endpoints.get(*k) != Some(*e))
            .map(|(_, e)| e.clone())
            .collect();
        EndpointDiff { added, removed }
    }
}

impl FromIterator<Endpoint> for EndpointSet {
    fn from_iter<T: IntoIterator<Item = Endpoint>>(iter: T) -> Self {
        let mut set = EndpointSet::new();
        for endpoint in iter {
            set.insert(endpoint);
        }
        set
    }
}
