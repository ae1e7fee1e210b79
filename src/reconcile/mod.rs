//! Reconciliation of desired placement against running replicas

pub mod lifecycle;
pub mod reconciler;
pub mod runtime;

pub use lifecycle::{EntityRef, ManagedReplica, ReplicaKey, ReplicaState, ReplicaStatus};
pub use reconciler::{
    Action, ActionVerb, DesiredState, PassReport, Reconciler, ReconcilerConfig, ServiceReplica,
    ServingSet,
};
pub use runtime::{HttpRuntime, MemoryRuntime, ReplicaHandle, RuntimeCall, WorkloadRuntime};
