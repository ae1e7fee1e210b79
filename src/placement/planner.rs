//! Placement planner
//!
//! Computes the target placement for volumes and services from the node
//! set. Planning is a pure function: identical inputs always produce an
//! identical [`Plan`], regardless of input ordering, which keeps
//! reconciliation idempotent.
//!
//! - Volumes go to `storage` + `Ready` nodes, never two replicas of one
//!   volume on the same node, preferring nodes that already hold a replica,
//!   then the most free capacity, then the lowest node id.
//! - Services go to `workload` + `Ready` nodes, spreading replicas that
//!   share an anti-affinity key; when spread is impossible replicas are
//!   co-located and a `DegradedSpread` warning is returned.
//! - Nodes tagged only `voter` never receive data or workloads.

use crate::cluster::node::Node;
use crate::common::{Error, Result};
use crate::placement::types::{
    Plan, PlanWarning, ServiceSpec, ServiceTarget, ServiceTargetSet, VolumePlacement, VolumeSpec,
};
use std::collections::{BTreeMap, BTreeSet};

/// Plan from scratch
pub fn plan(volumes: &[VolumeSpec], services: &[ServiceSpec], nodes: &[Node]) -> Result<Plan> {
    plan_with_hint(volumes, services, nodes, None)
}

/// Plan, keeping volume replicas where `current` already has them if still eligible
///
/// Either the whole plan succeeds or an error is returned; no partial
/// placement escapes.
pub fn plan_with_hint(
    volumes: &[VolumeSpec],
    services: &[ServiceSpec],
    nodes: &[Node],
    current: Option<&VolumePlacement>,
) -> Result<Plan> {
    validate_specs(volumes, services)?;

    let mut plan = Plan {
        volumes: place_volumes(volumes, nodes, current)?,
        ..Default::default()
    };
    let (services, warnings) = place_services(services, nodes)?;
    plan.services = services;
    plan.warnings = warnings;

    Ok(plan)
}

fn validate_specs(volumes: &[VolumeSpec], services: &[ServiceSpec]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for v in volumes {
        if v.desired_replica_count == 0 {
            return Err(Error::InvalidManifest(format!(
                "volume {} must have desired_replica_count >= 1",
                v.id
            )));
        }
        if !seen.insert(v.id.as_str()) {
            return Err(Error::InvalidManifest(format!("duplicate volume {}", v.id)));
        }
    }

    let mut seen = BTreeSet::new();
    for s in services {
        if s.desired_replica_count == 0 {
            return Err(Error::InvalidManifest(format!(
                "service {} must have desired_replica_count >= 1",
                s.id
            )));
        }
        if !seen.insert(s.id.as_str()) {
            return Err(Error::InvalidManifest(format!("duplicate service {}", s.id)));
        }
    }
    Ok(())
}

fn sorted_by_id<'a, T: 'a>(items: &'a [T], id: impl Fn(&T) -> &str) -> Vec<&'a T> {
    let mut sorted: Vec<&T> = items.iter().collect();
    sorted.sort_by(|a, b| id(a).cmp(id(b)));
    sorted
}

fn place_volumes(
    volumes: &[VolumeSpec],
    nodes: &[Node],
    current: Option<&VolumePlacement>,
) -> Result<VolumePlacement> {
    let storage: Vec<&Node> = sorted_by_id(nodes, |n| n.id.as_str())
        .into_iter()
        .filter(|n| n.can_host_volumes())
        .collect();

    let mut used: BTreeMap<&str, u64> = BTreeMap::new();
    let mut placement = VolumePlacement::new();

    for volume in sorted_by_id(volumes, |v| v.id.as_str()) {
        let mut candidates: Vec<(&Node, u64, bool)> = storage
            .iter()
            .map(|node| {
                let free = node
                    .capacity_bytes
                    .saturating_sub(used.get(node.id.as_str()).copied().unwrap_or(0));
                let hosted = current.is_some_and(|c| c.contains(&volume.id, &node.id));
                (*node, free, hosted)
            })
            .filter(|(_, free, _)| *free >= volume.size_bytes)
            .collect();

        if candidates.len() < volume.desired_replica_count {
            return Err(Error::InsufficientCapacity {
                volume: volume.id.clone(),
                needed: volume.desired_replica_count,
                available: candidates.len(),
            });
        }

        candidates.sort_by(|(a, a_free, a_hosted), (b, b_free, b_hosted)| {
            b_hosted
                .cmp(a_hosted)
                .then(b_free.cmp(a_free))
                .then_with(|| a.id.cmp(&b.id))
        });

        for (node, _, _) in candidates.into_iter().take(volume.desired_replica_count) {
            *used.entry(node.id.as_str()).or_insert(0) += volume.size_bytes;
            placement.insert(&volume.id, &node.id);
        }
    }

    Ok(placement)
}

fn place_services(
    services: &[ServiceSpec],
    nodes: &[Node],
) -> Result<(ServiceTargetSet, Vec<PlanWarning>)> {
    let workload: Vec<&Node> = sorted_by_id(nodes, |n| n.id.as_str())
        .into_iter()
        .filter(|n| n.can_host_services())
        .collect();

    let mut key_load: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    let mut total_load: BTreeMap<&str, usize> = BTreeMap::new();
    let mut targets = ServiceTargetSet::new();
    let mut warnings = Vec::new();

    for service in sorted_by_id(services, |s| s.id.as_str()) {
        if workload.is_empty() {
            return Err(Error::NoEligibleNodes(service.id.clone()));
        }

        let key = service.spread_key();
        let mut own: BTreeMap<&str, u32> = BTreeMap::new();
        let mut degraded = false;

        for _ in 0..service.desired_replica_count {
            let node = workload
                .iter()
                .map(|node| node.id.as_str())
                .min_by_key(|id| {
                    (
                        key_load.get(&(key, *id)).copied().unwrap_or(0),
                        own.get(*id).copied().unwrap_or(0),
                        total_load.get(*id).copied().unwrap_or(0),
                        *id,
                    )
                })
                .ok_or_else(|| Error::NoEligibleNodes(service.id.clone()))?;

            let shared = key_load.entry((key, node)).or_insert(0);
            degraded |= *shared > 0;
            *shared += 1;
            *total_load.entry(node).or_insert(0) += 1;

            let ordinal = own.entry(node).or_insert(0);
            targets.insert(ServiceTarget {
                service_id: service.id.clone(),
                node_id: node.to_string(),
                ordinal: *ordinal,
            });
            *ordinal += 1;
        }

        if degraded {
            warnings.push(PlanWarning::DegradedSpread {
                service_id: service.id.clone(),
                replicas: service.desired_replica_count,
                distinct_nodes: own.len(),
            });
        }
    }

    Ok((targets, warnings))
}
