//! Node observation.
//!
//! Fleet nodes come from two places: cluster nodes labeled for the fleet,
//! and provider instances that are in the fleet but have not joined the
//! cluster. The latter could be warming up or shutting down, but could also
//! be unhealthy instances that never connected; including them lets their
//! lifecycle be managed instead of persisting in the dark.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;

use crate::cloud::{CloudProvider, InstanceDescription};
use crate::cluster::ClusterApi;
use crate::config::ManagerConfigs;
use crate::observer::pods::get_pods;
use crate::types::{CapacityItem, Fleet, FleetNode, NodeState, FLEET_LABEL, STATE_KEY};

/// Age after which an out-of-cluster instance counts as unblocked.
const EXTERNAL_UNBLOCKED_SECONDS: i64 = 300;

/// Window in which a DNS-less instance is still assumed to be launching.
const WARMING_UP_WINDOW_SECONDS: i64 = 20;

/// Create a `FleetNode` for each node currently in the specified fleet,
/// in the cluster or not.
pub async fn get_nodes(
    configs: &ManagerConfigs,
    cluster: &dyn ClusterApi,
    cloud: &dyn CloudProvider,
    fleet: &Fleet,
) -> Result<Vec<FleetNode>> {
    let grace_period = configs.get_inactive_grace_period(None);
    let now = Utc::now();
    let pod_capacities = get_pods(configs, cluster, Some(grace_period)).await?;
    let cluster_nodes = cluster.list_nodes().await?;

    let mut nodes =
        fleet_nodes_from_cluster(fleet, &cluster_nodes, &pod_capacities, grace_period, now);

    let known_ids: HashSet<String> = nodes.iter().map(|n| n.instance_id.clone()).collect();
    let instances = cloud.describe_fleet_instances(&fleet.identifier).await?;
    nodes.extend(external_fleet_nodes(
        fleet,
        &instances,
        &known_ids,
        grace_period,
        now,
    ));

    Ok(nodes)
}

/// Map cluster nodes labeled for the fleet into `FleetNode` values.
pub fn fleet_nodes_from_cluster(
    fleet: &Fleet,
    cluster_nodes: &[Node],
    pod_capacities: &[CapacityItem],
    grace_period: i64,
    now: DateTime<Utc>,
) -> Vec<FleetNode> {
    let fleet_name = fleet.name();
    let mut nodes = Vec::new();
    for node in cluster_nodes {
        let labels = node.metadata.labels.as_ref();
        if labels.and_then(|l| l.get(FLEET_LABEL)) != Some(&fleet_name) {
            continue;
        }

        let name = node.metadata.name.clone().unwrap_or_default();
        let age = node
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|created| (now - created.0).num_seconds())
            .unwrap_or(0);
        let pods: BTreeMap<String, CapacityItem> = pod_capacities
            .iter()
            .filter(|item| item.node_name.as_deref() == Some(name.as_str()))
            .map(|item| (item.pod_id.clone(), item.clone()))
            .collect();

        nodes.push(FleetNode {
            instance_id: instance_id_from_provider(node),
            seconds_old: age,
            requirements: fleet.requirements.clone(),
            is_unblocked: pods.is_empty() && age > grace_period,
            is_retirable: age > grace_period,
            state: NodeState::from_label(
                labels.and_then(|l| l.get(STATE_KEY)).map(String::as_str),
            ),
            resource: Some(node.clone()),
            pods,
            name,
        });
    }
    nodes
}

/// Synthesize `FleetNode` values for fleet instances that are not part of
/// the cluster.
pub fn external_fleet_nodes(
    fleet: &Fleet,
    instances: &[InstanceDescription],
    known_instance_ids: &HashSet<String>,
    grace_period: i64,
    now: DateTime<Utc>,
) -> Vec<FleetNode> {
    instances
        .iter()
        .filter(|instance| !known_instance_ids.contains(&instance.instance_id))
        .map(|instance| {
            let age = instance
                .launched_at
                .map(|launched| (now - launched).num_seconds().max(0))
                .unwrap_or(0);
            FleetNode {
                name: instance.private_dns_name.clone(),
                seconds_old: age,
                instance_id: instance.instance_id.clone(),
                requirements: fleet.requirements.clone(),
                is_unblocked: age > EXTERNAL_UNBLOCKED_SECONDS,
                is_retirable: age > grace_period,
                state: external_instance_state(&instance.private_dns_name, age),
                resource: None,
                pods: BTreeMap::new(),
            }
        })
        .collect()
}

/// Classify an out-of-cluster instance from the noisy signals the provider
/// exposes. An instance with a private DNS name, or one younger than the
/// launch window, is assumed to be on its way in; everything else is on its
/// way out.
fn external_instance_state(private_dns_name: &str, age: i64) -> NodeState {
    if !private_dns_name.is_empty() || age < WARMING_UP_WINDOW_SECONDS {
        NodeState::WarmingUp
    } else {
        NodeState::ShuttingDown
    }
}

fn instance_id_from_provider(node: &Node) -> String {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_ref())
        .and_then(|id| id.rsplit('/').next())
        .unwrap_or("unknown-instance-id")
        .to_string()
}
