//! The reconciliation loop.
//!
//! Each tick observes the cluster, computes capacity targets, and drives
//! every fleet toward its target with a shrink followed by a grow. Errors
//! are absorbed at the tick boundary; the loop itself is the retry
//! mechanism, and only an accumulation of consecutive failures stops the
//! process.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::error;

use crate::allocator::get_capacity_targets;
use crate::cloud::{CloudProvider, Ec2Provider};
use crate::cluster::{self, ClusterApi};
use crate::config::{CliArgs, ManagerConfigs, ProcessEnvironment};
use crate::contractor::shrink_fleet;
use crate::expander::grow_fleet;
use crate::fleets::FleetRequirements;
use crate::observer::{get_fleet, get_nodes};
use crate::types::NodeState;

/// Cross-tick status owned by the reconciler.
#[derive(Debug, Clone)]
pub struct Status {
    pub recent_error_count: i64,
    pub last_logged: DateTime<Utc>,
    pub previous_allocations: BTreeMap<String, Value>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            recent_error_count: 0,
            last_logged: DateTime::UNIX_EPOCH,
            previous_allocations: BTreeMap::new(),
        }
    }
}

impl Status {
    /// Number of seconds since the last logged reallocation.
    pub fn seconds_since_logged(&self) -> i64 {
        (Utc::now() - self.last_logged).num_seconds()
    }
}

/// Apply the desired capacity to one fleet.
///
/// Operations are idempotent and expressed in terms of a desired capacity
/// to prevent race conditions from wildly auto-scaling resources. The
/// shrink completes its writes before the grow so the provider sees a
/// consistent new target. In dry-run mode both writes are skipped while
/// the plan is still reported.
pub async fn update_fleet(
    configs: &ManagerConfigs,
    cluster: &dyn ClusterApi,
    cloud: &dyn CloudProvider,
    requirements: &FleetRequirements,
    desired_capacity: i64,
) -> Result<Value> {
    let Some(fleet) = get_fleet(configs, cloud, requirements).await? else {
        return Ok(json!({
            "fleet": requirements.name(),
            "error": "FLEET_NOT_FOUND",
            "nodes": [],
            "node_capacities": {},
        }));
    };

    let fleet_nodes = get_nodes(configs, cluster, cloud, &fleet).await?;
    let active_count = fleet_nodes
        .iter()
        .filter(|n| n.state == NodeState::Active)
        .count() as i64;

    let node_log_data: Vec<Value> = fleet_nodes
        .iter()
        .map(|node| {
            json!({
                "name": node.name,
                "instance_id": node.instance_id,
                "current_state": node.state.as_str().to_uppercase(),
                "is_unblocked": node.is_unblocked,
                "pods": node.pods.keys().collect::<Vec<_>>(),
            })
        })
        .collect();

    if !configs.dry_run() {
        shrink_fleet(configs, cluster, cloud, &fleet, desired_capacity).await?;
        grow_fleet(configs, cloud, &fleet, desired_capacity).await?;
    }

    Ok(json!({
        "node_capacities": {
            "active": active_count,
            "desired": desired_capacity,
            "fleet_current": fleet_nodes.len(),
            "fleet_target": fleet.capacity,
            "unfilled": (desired_capacity - active_count).max(0),
        },
        "nodes": node_log_data,
    }))
}

/// Execute one management tick: allocate, update every fleet, account for
/// the outcome, and log when something changed or the logging interval has
/// elapsed.
pub async fn execute(
    configs: &ManagerConfigs,
    cluster: &dyn ClusterApi,
    cloud: &dyn CloudProvider,
    status: &mut Status,
) -> Result<()> {
    let allocations = get_capacity_targets(configs, cluster, cloud).await?;

    let mut reports: BTreeMap<String, Value> = BTreeMap::new();
    for (fleet_name, allocation) in &allocations {
        let requirements = configs
            .get_fleet_requirements_by_name(fleet_name)
            .ok_or_else(|| anyhow!("Unknown fleet '{fleet_name}' in allocations."))?;
        let update = update_fleet(
            configs,
            cluster,
            cloud,
            requirements,
            allocation.capacity.target,
        )
        .await?;
        let mut report = serde_json::to_value(allocation)?;
        merge_objects(&mut report, &update);
        reports.insert(fleet_name.clone(), report);
    }

    status.recent_error_count = (status.recent_error_count - 1).max(0);
    let changing = status.previous_allocations != reports;
    status.previous_allocations = reports.clone();

    if changing || status.seconds_since_logged() >= configs.max_logging_interval {
        status.last_logged = Utc::now();
        let mut data = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "recent_error_count": status.recent_error_count,
            "changing": changing,
        });
        if let Some(object) = data.as_object_mut() {
            for (fleet_name, report) in &reports {
                if report.get("is_empty").and_then(Value::as_bool) != Some(true) {
                    object.insert(fleet_name.clone(), report.clone());
                }
            }
        }
        configs.log("Reallocating", data);
    }

    Ok(())
}

/// Iterate the unending loop that keeps the cluster's fleets sized to their
/// workloads. Returns the process exit code.
pub async fn run(args: &CliArgs, config_path_override: Option<&Path>) -> Result<i32> {
    let env = ProcessEnvironment;
    let mut configs = ManagerConfigs::load(args, &env, config_path_override)?;
    configs.log("starting", configs.to_log_data());

    let cloud = Ec2Provider::new(configs.aws_profile.as_deref()).await;
    let mut status = Status::default();

    while status.recent_error_count < configs.critical_error_threshold {
        tokio::time::sleep(Duration::from_secs(configs.sleep_interval)).await;

        if configs.seconds_old() > configs.config_refresh_interval {
            // Refresh so configuration changes delivered through a mounted
            // ConfigMap apply to future allocations without a restart.
            configs.reload(args, &env, config_path_override)?;
        }

        if let Err(tick_error) = tick(&configs, &cloud, &mut status).await {
            // Transient failures are expected here; the accumulation of
            // many in a row is what becomes critical.
            error!("Reconciliation tick failed: {tick_error:#}");
            status.recent_error_count += 1;
        }
    }

    Ok(if status.recent_error_count >= configs.critical_error_threshold {
        1
    } else {
        0
    })
}

async fn tick(
    configs: &ManagerConfigs,
    cloud: &dyn CloudProvider,
    status: &mut Status,
) -> Result<()> {
    // Cluster credentials are established within the loop because
    // in-cluster tokens are temporary and do not survive for an extended
    // period outside of it.
    let cluster_api = cluster::connect(configs.external).await?;
    execute(configs, &cluster_api, cloud, status).await
}

fn merge_objects(base: &mut Value, extra: &Value) {
    if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{FleetState, MockCloudProvider};
    use crate::cluster::MockClusterApi;
    use crate::config::StaticEnvironment;
    use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
    use std::io::Write;

    const CONFIG: &str = r#"
cluster_name: test
default_sector: primary
sectors:
  primary:
    kind: memory
    fleets:
      - size: small
"#;

    fn configs(live: bool) -> ManagerConfigs {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let args = CliArgs {
            live,
            ..Default::default()
        };
        ManagerConfigs::load(&args, &StaticEnvironment::default(), Some(file.path())).unwrap()
    }

    fn fleet_state(capacity: i64) -> FleetState {
        FleetState {
            identifier: "fleet-123".to_string(),
            capacity,
            tags: BTreeMap::new(),
        }
    }

    fn running_pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("apps".to_string());
        pod.metadata.name = Some(name.to_string());
        pod.spec = Some(PodSpec::default());
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_status_starts_overdue_for_logging() {
        let status = Status::default();
        assert!(status.seconds_since_logged() > 3600);
        assert_eq!(status.recent_error_count, 0);
    }

    #[tokio::test]
    async fn test_update_fleet_reports_missing_fleet() {
        let configs = configs(false);
        let cluster = MockClusterApi::new();
        let cloud = MockCloudProvider::new();
        let report = update_fleet(&configs, &cluster, &cloud, &configs.fleets[0], 1)
            .await
            .unwrap();
        assert_eq!(report["error"], "FLEET_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_update_fleet_dry_run_writes_nothing() {
        let configs = configs(false);
        let cluster = MockClusterApi::new();
        let cloud =
            MockCloudProvider::new().with_fleet("primary-small", fleet_state(3));
        let report = update_fleet(&configs, &cluster, &cloud, &configs.fleets[0], 1)
            .await
            .unwrap();

        assert!(cloud.recorded_capacity_changes().is_empty());
        assert!(cloud.recorded_terminations().is_empty());
        assert!(cluster.recorded_patches().is_empty());
        assert_eq!(report["node_capacities"]["desired"], 1);
        assert_eq!(report["node_capacities"]["fleet_target"], 3);
    }

    #[tokio::test]
    async fn test_update_fleet_live_shrinks_to_target() {
        let configs = configs(true);
        let cluster = MockClusterApi::new();
        let cloud =
            MockCloudProvider::new().with_fleet("primary-small", fleet_state(3));
        update_fleet(&configs, &cluster, &cloud, &configs.fleets[0], 1)
            .await
            .unwrap();

        let changes = cloud.recorded_capacity_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].target_capacity, 1);
    }

    #[tokio::test]
    async fn test_update_fleet_live_grows_to_target() {
        let configs = configs(true);
        let cluster = MockClusterApi::new();
        let cloud =
            MockCloudProvider::new().with_fleet("primary-small", fleet_state(0));
        update_fleet(&configs, &cluster, &cloud, &configs.fleets[0], 2)
            .await
            .unwrap();

        let changes = cloud.recorded_capacity_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].target_capacity, 2);
    }

    #[tokio::test]
    async fn test_execute_decrements_error_count() {
        let configs = configs(false);
        let cluster = MockClusterApi::new().with_pods(vec![running_pod("web")]);
        let cloud =
            MockCloudProvider::new().with_fleet("primary-small", fleet_state(1));
        let mut status = Status {
            recent_error_count: 3,
            ..Default::default()
        };
        execute(&configs, &cluster, &cloud, &mut status).await.unwrap();
        assert_eq!(status.recent_error_count, 2);
        assert!(!status.previous_allocations.is_empty());
    }

    #[tokio::test]
    async fn test_execute_error_count_floor_is_zero() {
        let configs = configs(false);
        let cluster = MockClusterApi::new();
        let cloud =
            MockCloudProvider::new().with_fleet("primary-small", fleet_state(0));
        let mut status = Status::default();
        execute(&configs, &cluster, &cloud, &mut status).await.unwrap();
        assert_eq!(status.recent_error_count, 0);
    }

    #[tokio::test]
    async fn test_execute_fails_when_pods_unschedulable() {
        let configs = configs(false);
        // A pod pinned to a size no fleet in the sector provides.
        let mut pod = running_pod("web");
        pod.spec.as_mut().unwrap().node_selector = Some(BTreeMap::from([(
            "size".to_string(),
            "xlarge".to_string(),
        )]));
        let cluster = MockClusterApi::new().with_pods(vec![pod]);
        let cloud =
            MockCloudProvider::new().with_fleet("primary-small", fleet_state(0));
        let mut status = Status::default();
        let result = execute(&configs, &cluster, &cloud, &mut status).await;
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Not all pods"));
    }
}
