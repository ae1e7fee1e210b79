//! Cluster membership, health and quorum
//!
//! - [`registry::NodeRegistry`]: node identity, tags and health
//! - [`quorum::QuorumMonitor`]: strict-majority safety check over voters
//! - [`detector::HeartbeatDetector`]: heartbeat timeout sweeps

pub mod detector;
pub mod node;
pub mod quorum;
pub mod registry;

pub use detector::HeartbeatDetector;
pub use node::{Node, NodeHealth, NodeTag};
pub use quorum::{QuorumMonitor, QuorumState};
pub use registry::{ClusterSnapshot, HealthEvent, NodeChange, NodeRegistry};
