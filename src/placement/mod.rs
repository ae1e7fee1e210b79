//! Placement planning
//!
//! Declared volume/service specs plus the node set in, target placement out.

pub mod planner;
pub mod types;

pub use planner::{plan, plan_with_hint};
pub use types::{
    Plan, PlanWarning, ServiceSpec, ServiceTarget, ServiceTargetSet, VolumePlacement,
    VolumeReplica, VolumeSpec,
};
