//! Traffic failover: endpoint set and ingress publishing

pub mod endpoints;
pub mod failover;
pub mod ingress;

pub use endpoints::{Endpoint, EndpointDiff, EndpointSet};
pub use failover::FailoverRouter;
pub use ingress::{HttpIngress, Ingress, LogIngress, MemoryIngress};
