//! Pod-to-fleet assignment and capacity planning.
//!
//! Allocation happens in two phases. First every blocking pod is assigned
//! to the fleets it is suitable for with a fractional cost against a single
//! node of that fleet. Then members of smaller fleets are repacked into
//! integer-rounding slack of larger fleets in the same sector so the
//! cluster runs fewer, larger nodes where that is free.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use serde::Serialize;

use crate::cloud::CloudProvider;
use crate::cluster::ClusterApi;
use crate::config::ManagerConfigs;
use crate::errors::AllocationError;
use crate::fleets::FleetRequirements;
use crate::observer::{get_fleet, get_nodes, get_pods};
use crate::types::{CapacityItem, FleetNode};

/// Tolerance absorbing float error from cost sums against whole-node
/// boundaries. Both the slack check and the fit check depend on it.
const PACK_SLACK: f64 = 0.05;

/// A pod allocated to a fleet at a fractional node cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub item: CapacityItem,
    pub cost: f64,
}

/// Fleet membership keyed by pod id.
pub type Membership = BTreeMap<String, Member>;

/// Computed capacity plan for one fleet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetAllocation {
    pub fleet: String,
    pub is_empty: bool,
    pub capacity: CapacityPlan,
    pub pod_capacities: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityPlan {
    pub raw: i64,
    pub computed: f64,
    pub target: i64,
}

/// Determine whether a pod is suitable for being run in the specified
/// fleet.
///
/// A pod already bound to a node keeps that node's fleet so live pods are
/// never re-balanced implicitly. Unbound pods must match the fleet's
/// sector, any explicit size pin, and the fleet's resource band.
pub fn is_suitable(
    item: &CapacityItem,
    fleet: &FleetRequirements,
    nodes: &HashMap<String, FleetNode>,
) -> bool {
    let node = item.node_name.as_deref().and_then(|name| nodes.get(name));
    let size = fleet.size_spec.size.as_str();
    let in_sector = fleet.sector == item.sector;
    let in_fleet = item.size.is_none() || item.size.as_deref() == Some(size);
    let will_fit = item.memory < fleet.memory_max && item.cpu < fleet.cpu_max;
    let no_smaller = item.memory >= fleet.memory_min || item.cpu >= fleet.cpu_min;
    let running_in_fleet = node.map(|n| n.requirements == *fleet).unwrap_or(false);
    // Prevent the pod from being selected by a larger-than-necessary fleet
    // unless this fleet has been explicitly set on the pod's nodeSelector.
    let only_this_fleet = item.size.as_deref() == Some(size);

    running_in_fleet
        || (node.is_none()
            && in_fleet
            && in_sector
            && will_fit
            && (no_smaller || only_this_fleet))
}

/// Create the membership of capacity items that fit within the specified
/// fleet, each at its fractional node cost.
pub fn allocate(
    fleet: &FleetRequirements,
    capacities: &[CapacityItem],
    nodes: &HashMap<String, FleetNode>,
) -> Membership {
    capacities
        .iter()
        .filter(|item| is_suitable(item, fleet, nodes))
        .map(|item| {
            // The clamp ensures a suitable pod never allocates more than a
            // whole node provides. That can actually happen when the
            // control plane schedules a pod that only fits without the
            // over-subscription factor applied.
            let cost = (item.cpu / fleet.cpu_max)
                .max(item.memory as f64 / fleet.memory_max as f64)
                .min(1.0);
            (
                item.pod_id.clone(),
                Member {
                    item: item.clone(),
                    cost,
                },
            )
        })
        .collect()
}

/// Determine the overall capacity requirement for the fleet as a fractional
/// node count.
///
/// Costs are packed decreasing first-fit: not a perfect solution to the
/// bin-packing problem, but deterministic, and it outperforms plain
/// first-forward packing while staying simple.
pub fn compute_fleet_capacity(fleet: &FleetRequirements, members: &Membership) -> f64 {
    let mut costs: Vec<f64> = members
        .values()
        .filter(|m| m.item.needs_resources)
        .map(|m| m.cost)
        .collect();
    costs.sort_by(|a, b| b.total_cmp(a));

    // One bin per cost is an upper bound on the nodes needed.
    let mut bins = vec![0.0_f64; costs.len()];
    for value in costs {
        if let Some(index) = bins.iter().position(|bin| bin + value <= 1.0) {
            bins[index] += value;
        }
    }

    let used = bins.iter().filter(|bin| **bin > 0.0).count();
    (fleet.capacity_min as f64).max(used as f64)
}

/// Repack members of the specified fleet into larger fleets in the same
/// sector where excess allocated capacity exists.
///
/// Memberships are mutated in place; allocating fleets individually can
/// strand capacity that a larger fleet's integer rounding already paid for.
pub fn repack(
    fleet: &FleetRequirements,
    fleets: &[FleetRequirements],
    memberships: &mut HashMap<String, Membership>,
) {
    for other_fleet in fleets {
        let is_packable = other_fleet != fleet
            && other_fleet.sector == fleet.sector
            && other_fleet.capacity_weight > fleet.capacity_weight;
        if is_packable {
            pack_into(fleet, other_fleet, memberships);
        }
    }
}

/// Try to move members of `from_fleet` into rounding slack of `to_fleet`.
///
/// Members move only while they fit inside the slack that already exists in
/// the destination's whole-node capacity, so the move never increases the
/// destination's node count.
fn pack_into(
    from_fleet: &FleetRequirements,
    to_fleet: &FleetRequirements,
    memberships: &mut HashMap<String, Membership>,
) {
    let to_name = to_fleet.name();
    let from_name = from_fleet.name();
    let to_raw: f64 = memberships
        .get(&to_name)
        .map(|m| m.values().map(|member| member.cost).sum())
        .unwrap_or(0.0);
    let to_desired = to_raw.ceil();
    if (to_desired - to_raw) <= PACK_SLACK {
        return;
    }

    // Scale the smaller fleet's costs down to the larger node size.
    let scale = to_fleet.capacity_weight / from_fleet.capacity_weight;
    let mut shrunk: Vec<(f64, String)> = memberships
        .get(&from_name)
        .map(|members| {
            members
                .values()
                .filter(|m| m.item.size.is_none() && m.item.node_name.is_none())
                .map(|m| (m.cost / scale, m.item.pod_id.clone()))
                .collect()
        })
        .unwrap_or_default();
    shrunk.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut running_total = to_raw;
    let mut moves: Vec<(String, f64)> = Vec::new();
    for (cost, pod_id) in shrunk {
        if (running_total + cost) >= (to_desired - PACK_SLACK) {
            // If this pod won't pack then none of the remaining ones will
            // either, since they are scanned in ascending cost order.
            break;
        }
        running_total += cost;
        moves.push((pod_id, cost));
    }

    for (pod_id, cost) in moves {
        let member = memberships
            .get_mut(&from_name)
            .and_then(|members| members.remove(&pod_id));
        if let (Some(member), Some(to_members)) = (member, memberships.get_mut(&to_name)) {
            to_members.insert(
                pod_id,
                Member {
                    item: member.item,
                    cost,
                },
            );
        }
    }
}

/// Create the capacity plan for the given fleet and its membership.
pub fn create_fleet_allocation(fleet: &FleetRequirements, members: &Membership) -> FleetAllocation {
    // Zero out allocations for pods that do not need resources: completed
    // pods lingering on a node for grace-period reasons occupy membership
    // but cost nothing.
    let pod_capacities: BTreeMap<String, f64> = members
        .iter()
        .map(|(pod_id, member)| {
            (
                pod_id.clone(),
                if member.item.needs_resources {
                    member.cost
                } else {
                    0.0
                },
            )
        })
        .collect();
    let raw_sum: f64 = pod_capacities.values().sum();
    let raw = fleet.capacity_min.max(raw_sum.ceil() as i64);
    let computed = compute_fleet_capacity(fleet, members);
    let target = computed.ceil() as i64;
    FleetAllocation {
        fleet: fleet.name(),
        is_empty: raw == 0 && computed == 0.0,
        capacity: CapacityPlan {
            raw,
            computed,
            target,
        },
        pod_capacities,
    }
}

/// Determine the desired capacity for every configured fleet.
pub async fn get_capacity_targets(
    configs: &ManagerConfigs,
    cluster: &dyn ClusterApi,
    cloud: &dyn CloudProvider,
) -> Result<BTreeMap<String, FleetAllocation>> {
    let capacities = get_pods(configs, cluster, None).await?;
    let mut nodes: HashMap<String, FleetNode> = HashMap::new();
    for requirements in &configs.fleets {
        if let Some(fleet) = get_fleet(configs, cloud, requirements).await? {
            for node in get_nodes(configs, cluster, cloud, &fleet).await? {
                nodes.insert(node.name.clone(), node);
            }
        }
    }

    // Allocate pods into their ideal fleet and then repack smaller pods
    // into larger nodes where there is excess allocated capacity.
    let mut memberships: HashMap<String, Membership> = configs
        .fleets
        .iter()
        .map(|fleet| (fleet.name(), allocate(fleet, &capacities, &nodes)))
        .collect();
    for fleet in &configs.fleets {
        repack(fleet, &configs.fleets, &mut memberships);
    }

    let allocated: usize = memberships.values().map(Membership::len).sum();
    if capacities.len() != allocated {
        return Err(AllocationError::Unschedulable {
            expected: capacities.len(),
            allocated,
        }
        .into());
    }

    Ok(configs
        .fleets
        .iter()
        .map(|fleet| {
            let members = memberships.remove(&fleet.name()).unwrap_or_default();
            (fleet.name(), create_fleet_allocation(fleet, &members))
        })
        .collect())
}
