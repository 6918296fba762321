//! Fleet contraction through a graceful taint, drain, terminate sequence.
//!
//! Surplus nodes are never terminated directly. They are first labeled and
//! tainted so kubernetes evicts their pods, and only nodes already observed
//! draining are handed to the provider for termination. Taints applied in
//! one tick therefore turn into terminations in a later tick, and that lag
//! is what makes the drain graceful.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use k8s_openapi::api::core::v1::Taint;
use serde_json::json;
use tracing::warn;

use crate::cloud::CloudProvider;
use crate::cluster::ClusterApi;
use crate::config::ManagerConfigs;
use crate::fleets::FleetRequirements;
use crate::observer::get_nodes;
use crate::types::{Fleet, FleetNode, NodeState, STATE_KEY};

/// Nodes with no blocking pods that are actively part of the cluster,
/// keyed in observation order.
fn unblocked_nodes<'a>(fleet_nodes: &'a [FleetNode]) -> Vec<&'a FleetNode> {
    fleet_nodes
        .iter()
        .filter(|n| n.is_unblocked && n.resource.is_some())
        .collect()
}

/// Blocked nodes whose every pod could be rescheduled elsewhere, ordered by
/// increasing pod count to minimize the impact of a bounce.
fn bouncable_nodes<'a>(fleet_nodes: &'a [FleetNode]) -> Vec<&'a FleetNode> {
    let unblocked: HashSet<&str> = unblocked_nodes(fleet_nodes)
        .iter()
        .map(|n| n.ident())
        .collect();
    let mut nodes: Vec<&FleetNode> = fleet_nodes
        .iter()
        .filter(|n| {
            !unblocked.contains(n.ident())
                && n.resource.is_some()
                && n.is_retirable
                && n.pods.values().all(|p| p.is_bouncable)
        })
        .collect();
    nodes.sort_by_key(|n| n.pods.len());
    nodes
}

/// Find the fleet nodes that can and should be terminated to shed
/// `reduce_by` nodes.
///
/// Unblocked nodes always go first. Bouncable nodes are only considered in
/// fleets that have opted into bouncing deployment pods.
pub fn nodes_to_terminate<'a>(
    requirements: &FleetRequirements,
    fleet_nodes: &'a [FleetNode],
    reduce_by: usize,
) -> Vec<&'a FleetNode> {
    let mut candidates = unblocked_nodes(fleet_nodes);
    if requirements.bounce_deployment_pods {
        candidates.extend(bouncable_nodes(fleet_nodes));
    }
    candidates.truncate(reduce_by);
    candidates
}

/// Terminate nodes that have already progressed through the drain states.
///
/// This is idempotent: it only acts on nodes observed as terminating or
/// shutting down (or instances that never joined the cluster and are past
/// their warm-up), and the provider accepts termination of instances that
/// are already going away.
pub async fn terminate_nodes(
    configs: &ManagerConfigs,
    cloud: &dyn CloudProvider,
    fleet: &Fleet,
    fleet_nodes: &[FleetNode],
) -> Result<Vec<FleetNode>> {
    let nodes_to_terminate: Vec<FleetNode> = fleet_nodes
        .iter()
        .filter(|n| {
            n.state == NodeState::Terminating
                || n.state == NodeState::ShuttingDown
                || (n.state == NodeState::WarmingUp && n.is_unblocked)
        })
        .cloned()
        .collect();

    if nodes_to_terminate.is_empty() {
        return Ok(Vec::new());
    }

    let instance_ids: Vec<String> = nodes_to_terminate
        .iter()
        .map(|n| n.instance_id.clone())
        .collect();
    cloud.terminate_instances(&instance_ids).await?;

    configs.log(
        "terminating_nodes",
        json!({
            "action": "terminating_nodes",
            "fleet": fleet.name(),
            "nodes": nodes_to_terminate
                .iter()
                .map(|n| (n.name.clone(), n.instance_id.clone()))
                .collect::<BTreeMap<_, _>>(),
        }),
    );

    Ok(nodes_to_terminate)
}

/// Taint unneeded nodes so they stop accepting work and drain.
///
/// The NoSchedule taint keeps new pods off the node and the NoExecute taint
/// evicts the pods it still carries. Nodes already labeled terminating are
/// skipped, making this the only state-altering write and an idempotent
/// one.
pub async fn prepare_nodes_for_termination(
    configs: &ManagerConfigs,
    cluster: &dyn ClusterApi,
    fleet: &Fleet,
    fleet_nodes: &[FleetNode],
    target_capacity: i64,
) -> Result<()> {
    let reduce_by = fleet_nodes.len().saturating_sub(target_capacity.max(0) as usize);
    let chosen = nodes_to_terminate(&fleet.requirements, fleet_nodes, reduce_by);

    let taints = vec![
        Taint {
            effect: "NoSchedule".to_string(),
            key: STATE_KEY.to_string(),
            value: Some(NodeState::Terminating.as_str().to_string()),
            time_added: None,
        },
        Taint {
            effect: "NoExecute".to_string(),
            key: STATE_KEY.to_string(),
            value: Some(NodeState::Terminating.as_str().to_string()),
            time_added: None,
        },
    ];
    let labels = BTreeMap::from([(
        STATE_KEY.to_string(),
        NodeState::Terminating.as_str().to_string(),
    )]);

    let mut tainted: Vec<&FleetNode> = Vec::new();
    for node in chosen {
        if node.resource.is_none() || node.state == NodeState::Terminating {
            continue;
        }
        cluster
            .patch_node(&node.name, labels.clone(), taints.clone())
            .await?;
        tainted.push(node);
    }

    if !tainted.is_empty() {
        configs.log(
            "tainted_nodes_for_termination",
            json!({
                "state": NodeState::Terminating,
                "taints": ["NoSchedule", "NoExecute"],
                "nodes": tainted
                    .iter()
                    .map(|n| {
                        (
                            n.name.clone(),
                            json!({
                                "id": n.instance_id,
                                "seconds_old": n.seconds_old,
                                "fleet": n.requirements.name(),
                            }),
                        )
                    })
                    .collect::<BTreeMap<_, _>>(),
            }),
        );
    }

    Ok(())
}

/// Reduce the fleet to the target capacity.
///
/// The capacity adjustment lands first; if the provider refuses it, the
/// whole shrink aborts for this cycle so the reduction process is not
/// fighting the fleet while it maintains its old capacity. Fleets are
/// configured not to delete instances themselves on capacity changes,
/// which leaves node selection and graceful draining to this code instead
/// of the provider removing instances at random.
pub async fn shrink_fleet(
    configs: &ManagerConfigs,
    cluster: &dyn ClusterApi,
    cloud: &dyn CloudProvider,
    fleet: &Fleet,
    target_capacity: i64,
) -> Result<Vec<FleetNode>> {
    if fleet.capacity > target_capacity {
        let success = cloud
            .modify_fleet_capacity(&fleet.identifier, target_capacity)
            .await?;
        if !success {
            warn!("Failed to shrink {} capacity.", fleet.name());
            return Ok(Vec::new());
        }
    }

    let fleet_nodes = get_nodes(configs, cluster, cloud, fleet).await?;

    // Terminate nodes drained in previous cycles, then taint the next batch
    // so they are ready for the following contraction cycle.
    let terminated = terminate_nodes(configs, cloud, fleet, &fleet_nodes).await?;
    prepare_nodes_for_termination(configs, cluster, fleet, &fleet_nodes, target_capacity).await?;

    Ok(terminated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloudProvider;
    use crate::cluster::MockClusterApi;
    use crate::config::{CliArgs, ManagerConfigs, StaticEnvironment};
    use crate::fleets::{fleets_from_config, SectorConfig, SectorFleetConfig};
    use crate::types::CapacityItem;
    use k8s_openapi::api::core::v1::Node;

    fn requirements(bounce: bool) -> FleetRequirements {
        let sectors = BTreeMap::from([(
            "primary".to_string(),
            SectorConfig {
                kind: Some("memory".to_string()),
                fleets: vec![SectorFleetConfig {
                    size: Some("small".to_string()),
                    bounce_deployment_pods: Some(bounce),
                    ..Default::default()
                }],
            },
        )]);
        fleets_from_config(&sectors, 1.0, 0).unwrap().remove(0)
    }

    fn fleet(capacity: i64, bounce: bool) -> Fleet {
        Fleet {
            requirements: requirements(bounce),
            identifier: "fleet-123".to_string(),
            capacity,
            tags: BTreeMap::new(),
        }
    }

    fn configs() -> ManagerConfigs {
        let args = CliArgs {
            cluster_name: Some("test".to_string()),
            config_path: Some("/does/not/exist.yaml".into()),
            ..Default::default()
        };
        ManagerConfigs::load(&args, &StaticEnvironment::default(), None).unwrap()
    }

    fn pod(pod_id: &str, bouncable: bool) -> (String, CapacityItem) {
        (
            pod_id.to_string(),
            CapacityItem {
                pod_id: pod_id.to_string(),
                sector: "primary".to_string(),
                size: None,
                memory: 1024,
                cpu: 0.1,
                node_name: None,
                phase: "running".to_string(),
                is_bouncable: bouncable,
                needs_resources: true,
            },
        )
    }

    fn node(
        name: &str,
        is_unblocked: bool,
        state: NodeState,
        bouncable_pods: usize,
        blocked: bool,
    ) -> FleetNode {
        let mut pods = BTreeMap::new();
        for index in 0..bouncable_pods {
            let (id, item) = pod(&format!("apps:{name}-{index}"), true);
            pods.insert(id, item);
        }
        if blocked {
            let (id, item) = pod(&format!("apps:{name}-stuck"), false);
            pods.insert(id, item);
        }
        FleetNode {
            name: name.to_string(),
            instance_id: format!("i-{name}"),
            seconds_old: 3600,
            requirements: requirements(true),
            is_unblocked,
            is_retirable: true,
            state,
            resource: Some(Node::default()),
            pods,
        }
    }

    fn scenario_nodes() -> Vec<FleetNode> {
        vec![
            node("blocked", false, NodeState::Active, 0, true),
            node("unblocked", true, NodeState::Active, 0, false),
            node("bounce-two", false, NodeState::Active, 2, false),
            node("bounce-one", false, NodeState::Active, 1, false),
        ]
    }

    #[test]
    fn test_no_reduction_selects_nothing() {
        let nodes = scenario_nodes();
        let selected = nodes_to_terminate(&requirements(true), &nodes, 0);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_unblocked_nodes_selected_before_bouncable() {
        let nodes = scenario_nodes();
        let selected = nodes_to_terminate(&requirements(true), &nodes, 1);
        let names: Vec<&str> = selected.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["unblocked"]);
    }

    #[test]
    fn test_bouncable_nodes_ordered_by_pod_count() {
        let nodes = scenario_nodes();
        let selected = nodes_to_terminate(&requirements(true), &nodes, 2);
        let names: Vec<&str> = selected.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["unblocked", "bounce-one"]);
    }

    #[test]
    fn test_blocked_nodes_never_selected() {
        let nodes = scenario_nodes();
        let selected = nodes_to_terminate(&requirements(true), &nodes, 4);
        let names: Vec<&str> = selected.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["unblocked", "bounce-one", "bounce-two"]);
    }

    #[test]
    fn test_bouncing_disabled_limits_to_unblocked() {
        let nodes = scenario_nodes();
        let selected = nodes_to_terminate(&requirements(false), &nodes, 4);
        let names: Vec<&str> = selected.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["unblocked"]);
    }

    #[tokio::test]
    async fn test_terminate_selects_draining_states() {
        let cloud = MockCloudProvider::new();
        let nodes = vec![
            node("active", false, NodeState::Active, 0, true),
            node("draining", false, NodeState::Terminating, 0, true),
            node("gone", false, NodeState::ShuttingDown, 0, false),
            node("warming-stuck", false, NodeState::WarmingUp, 0, false),
            node("warming-done", true, NodeState::WarmingUp, 0, false),
        ];
        let terminated = terminate_nodes(&configs(), &cloud, &fleet(5, true), &nodes)
            .await
            .unwrap();

        let names: Vec<&str> = terminated.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["draining", "gone", "warming-done"]);
        // A single provider call carries every instance id.
        let calls = cloud.recorded_terminations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["i-draining", "i-gone", "i-warming-done"]);
    }

    #[tokio::test]
    async fn test_terminate_noop_without_candidates() {
        let cloud = MockCloudProvider::new();
        let nodes = vec![node("active", false, NodeState::Active, 0, true)];
        let terminated = terminate_nodes(&configs(), &cloud, &fleet(1, true), &nodes)
            .await
            .unwrap();
        assert!(terminated.is_empty());
        assert!(cloud.recorded_terminations().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_taints_chosen_nodes() {
        let cluster = MockClusterApi::new();
        let nodes = scenario_nodes();
        prepare_nodes_for_termination(&configs(), &cluster, &fleet(4, true), &nodes, 2)
            .await
            .unwrap();

        let patches = cluster.recorded_patches();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].name, "unblocked");
        assert_eq!(patches[1].name, "bounce-one");
        assert_eq!(
            patches[0].labels.get(STATE_KEY).map(String::as_str),
            Some("terminating")
        );
        let effects: Vec<&str> = patches[0]
            .taints
            .iter()
            .map(|t| t.effect.as_str())
            .collect();
        assert_eq!(effects, vec!["NoSchedule", "NoExecute"]);
        assert!(patches[0]
            .taints
            .iter()
            .all(|t| t.key == STATE_KEY && t.value.as_deref() == Some("terminating")));
    }

    #[tokio::test]
    async fn test_prepare_skips_already_terminating_nodes() {
        let cluster = MockClusterApi::new();
        let mut nodes = scenario_nodes();
        nodes[1].state = NodeState::Terminating;
        prepare_nodes_for_termination(&configs(), &cluster, &fleet(4, true), &nodes, 3)
            .await
            .unwrap();
        assert!(cluster.recorded_patches().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_noop_at_target() {
        let cluster = MockClusterApi::new();
        let nodes = scenario_nodes();
        prepare_nodes_for_termination(&configs(), &cluster, &fleet(4, true), &nodes, 4)
            .await
            .unwrap();
        assert!(cluster.recorded_patches().is_empty());
    }

    #[tokio::test]
    async fn test_shrink_aborts_when_capacity_change_refused() {
        let mut cloud = MockCloudProvider::new();
        cloud.refuse_capacity_changes = true;
        let cluster = MockClusterApi::new();
        let terminated = shrink_fleet(&configs(), &cluster, &cloud, &fleet(4, true), 2)
            .await
            .unwrap();
        assert!(terminated.is_empty());
        assert!(cloud.recorded_terminations().is_empty());
        assert!(cluster.recorded_patches().is_empty());
    }

    #[tokio::test]
    async fn test_shrink_skips_capacity_change_at_target() {
        let cloud = MockCloudProvider::new();
        let cluster = MockClusterApi::new();
        shrink_fleet(&configs(), &cluster, &cloud, &fleet(2, true), 2)
            .await
            .unwrap();
        assert!(cloud.recorded_capacity_changes().is_empty());
    }
}
