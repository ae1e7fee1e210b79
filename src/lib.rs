//! # minifleet
//!
//! Placement and failover reconciliation for a small heterogeneous cluster:
//! - Node registry with capability tags (voter, storage, workload) and
//!   heartbeat-driven health
//! - Strict-majority quorum gate over voting nodes
//! - Deterministic placement of replicated volumes and spread services
//! - Reconciliation loop that migrates replicas without ever dropping a
//!   volume below its replica count
//! - Failover router that pulls endpoints of unreachable nodes from the
//!   ingress immediately
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!   node agents ── heartbeats ──► NodeRegistry ──► HealthEvent (broadcast)
//!                                     │                 │          │
//!                                     ▼                 ▼          ▼
//!                              QuorumMonitor       Scheduler   FailoverRouter
//!                                     │                 │          │
//!                                     └──► Reconciler ◄─┘          │
//!                                           │    │                 │
//!                               PlacementPlanner  WorkloadRuntime  Ingress
//! ```
//!
//! ## Usage
//!
//! ### Check and preview a manifest
//! ```bash
//! minifleet validate --manifest ./cluster.toml
//! minifleet plan --manifest ./cluster.toml
//! ```
//!
//! ### Run the controller
//! ```bash
//! minifleet serve \
//!   --manifest ./cluster.toml \
//!   --bind 0.0.0.0:7400
//!
//! # Without node agents: replicas run in-process
//! minifleet serve --manifest ./cluster.toml --simulate
//! ```

pub mod cluster;
pub mod common;
pub mod controller;
pub mod manifest;
pub mod placement;
pub mod reconcile;
pub mod router;

// Re-export commonly used types
pub use common::{ControllerConfig, Error, Result};
pub use controller::Controller;
pub use manifest::Manifest;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
