//! Pod observation and classification.
//!
//! Each cluster pod is classified as blocking (it must be accounted for
//! when sizing fleets), bouncable (it may be evicted because its controller
//! will reschedule it), or ignored, and blocking pods are converted into
//! capacity items with their computed resource demand.

use anyhow::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::cluster::ClusterApi;
use crate::config::ManagerConfigs;
use crate::conversions::{to_bytes, to_cpus};
use crate::types::CapacityItem;

/// Namespace owned by the control plane; its pods are ignored unless they
/// carry a fleet-compatible node selector.
const CONTROL_PLANE_NAMESPACE: &str = "kube-system";

/// How long a pod must have been running before it may be bounced.
const BOUNCE_GRACE_SECONDS: i64 = 1800;

/// Create the list of pods in the cluster that contribute to capacity.
pub async fn get_pods(
    configs: &ManagerConfigs,
    cluster: &dyn ClusterApi,
    inactive_grace_period: Option<i64>,
) -> Result<Vec<CapacityItem>> {
    let pods = cluster.list_pods().await?;
    let grace_period =
        inactive_grace_period.unwrap_or_else(|| configs.get_inactive_grace_period(None));
    Ok(capacity_items_from_pods(configs, &pods, grace_period, Utc::now()))
}

/// Classify pre-listed pods into capacity items for all blocking pods.
pub fn capacity_items_from_pods(
    configs: &ManagerConfigs,
    pods: &[Pod],
    inactive_grace_period: i64,
    now: DateTime<Utc>,
) -> Vec<CapacityItem> {
    pods.iter()
        .filter(|pod| is_blocking_pod(pod, inactive_grace_period, now))
        .map(|pod| to_capacity_item(configs, pod, now))
        .collect()
}

/// Determine if the specified pod should be considered in fleet capacity
/// allocation.
pub fn is_blocking_pod(pod: &Pod, inactive_grace_period: i64, now: DateTime<Utc>) -> bool {
    let recently = now.timestamp() - inactive_grace_period;
    let recently_transitioned = last_transition_timestamp(pod) >= recently;
    let phase = pod_phase(pod);

    // Anything in the control-plane namespace is ignored unless it has a
    // fleet-compatible node selector, which is the case for add-ons like
    // the metrics server that reside there without being part of the
    // managed control plane.
    (namespace(pod) != CONTROL_PLANE_NAMESPACE || has_compatible_selector(pod))
        // DaemonSets run on every node and should not be included in
        // considerations for scaling capacity.
        && !owner_kinds(pod).iter().any(|kind| *kind == "DaemonSet")
        // Pods in the running or pending states block, as do pods that
        // have recently transitioned when a grace period is in effect.
        && (matches!(phase.as_str(), "running" | "pending")
            || (inactive_grace_period > 0 && recently_transitioned))
}

/// Determine if the specified pod could be rescheduled on a different node.
pub fn is_bouncable_pod(pod: &Pod, now: DateTime<Utc>) -> bool {
    let recently = now.timestamp() - BOUNCE_GRACE_SECONDS;
    let recently_transitioned = last_transition_timestamp(pod) >= recently;

    let controller_kind = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
        .map(|r| r.kind.as_str());

    (namespace(pod) != CONTROL_PLANE_NAMESPACE || has_compatible_selector(pod))
        // Only pods inside a ReplicaSet will be rescheduled when bounced.
        && controller_kind == Some("ReplicaSet")
        && pod_phase(pod) == "running"
        // Don't bounce pods that have recently transitioned into a
        // running state.
        && !recently_transitioned
}

/// Convert a pod into a capacity item by determining how many resources
/// are needed collectively by its containers.
pub fn to_capacity_item(configs: &ManagerConfigs, pod: &Pod, now: DateTime<Utc>) -> CapacityItem {
    let mut memory: f64 = 0.0;
    let mut cpus: f64 = 0.0;
    if let Some(spec) = pod.spec.as_ref() {
        for container in &spec.containers {
            let requests = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref());
            let limits = container.resources.as_ref().and_then(|r| r.limits.as_ref());
            let quantity = |key: &str| {
                let requested = requests
                    .and_then(|map| map.get(key))
                    .map(|q| q.0.as_str())
                    .unwrap_or("");
                let limited = limits
                    .and_then(|map| map.get(key))
                    .map(|q| q.0.as_str())
                    .unwrap_or("");
                (requested.to_string(), limited.to_string())
            };
            let (requested, limited) = quantity("memory");
            memory += to_bytes(&requested).max(to_bytes(&limited)) as f64;
            let (requested, limited) = quantity("cpu");
            cpus += to_cpus(&requested).max(to_cpus(&limited));
        }
    }

    let selector = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_selector.as_ref());
    let (sector, size) = if let Some(fleet) = selector.and_then(|s| s.get("fleet")) {
        match fleet.split_once('-') {
            Some((sector, size)) => (sector.to_string(), Some(size.to_string())),
            None => (fleet.clone(), None),
        }
    } else {
        (
            selector
                .and_then(|s| s.get("sector"))
                .cloned()
                .unwrap_or_else(|| configs.default_fleet_sector()),
            selector.and_then(|s| s.get("size")).cloned(),
        )
    };

    let scale = 1.0 + configs.default_over_subscription;
    let phase = pod_phase(pod);
    CapacityItem {
        pod_id: format!(
            "{}:{}",
            namespace(pod),
            pod.metadata.name.as_deref().unwrap_or_default()
        ),
        sector,
        size,
        memory: (scale * memory) as i64,
        cpu: scale * cpus,
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        needs_resources: matches!(phase.as_str(), "running" | "pending"),
        phase,
        is_bouncable: is_bouncable_pod(pod, now),
    }
}

/// The kinds of all owner references on the pod.
fn owner_kinds(pod: &Pod) -> Vec<&str> {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().map(|r| r.kind.as_str()).collect())
        .unwrap_or_default()
}

fn namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or_default()
}

fn pod_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
        .to_lowercase()
}

/// The latest condition transition time of the pod as a unix timestamp.
fn last_transition_timestamp(pod: &Pod) -> i64 {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .filter_map(|c| c.last_transition_time.as_ref())
                .map(|t| t.0.timestamp())
                .fold(0, i64::max)
        })
        .unwrap_or(0)
}

/// Whether the pod's node selector names any fleet-management key.
fn has_compatible_selector(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_selector.as_ref())
        .map(|selector| {
            ["sector", "fleet", "size"]
                .iter()
                .any(|key| selector.contains_key(*key))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, ManagerConfigs, StaticEnvironment};
    use chrono::Duration;
    use k8s_openapi::api::core::v1::{Container, PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use std::collections::BTreeMap;
    use std::io::Write;

    fn configs() -> ManagerConfigs {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"cluster_name: test\ndefault_sector: primary\nsectors:\n  primary:\n    kind: memory\n    fleets:\n      - size: small\n",
        )
        .unwrap();
        ManagerConfigs::load(&CliArgs::default(), &StaticEnvironment::default(), Some(file.path()))
            .unwrap()
    }

    struct PodBuilder {
        pod: Pod,
    }

    impl PodBuilder {
        fn new(namespace: &str, name: &str, phase: &str) -> Self {
            let mut pod = Pod::default();
            pod.metadata.namespace = Some(namespace.to_string());
            pod.metadata.name = Some(name.to_string());
            pod.spec = Some(PodSpec::default());
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
            Self { pod }
        }

        fn transitioned_at(mut self, at: DateTime<Utc>) -> Self {
            let status = self.pod.status.get_or_insert_with(Default::default);
            status.conditions = Some(vec![PodCondition {
                last_transition_time: Some(Time(at)),
                status: "True".to_string(),
                type_: "Ready".to_string(),
                ..Default::default()
            }]);
            self
        }

        fn owned_by(mut self, kind: &str, controller: bool) -> Self {
            let refs = self
                .pod
                .metadata
                .owner_references
                .get_or_insert_with(Vec::new);
            refs.push(OwnerReference {
                kind: kind.to_string(),
                controller: Some(controller),
                ..Default::default()
            });
            self
        }

        fn selector(mut self, key: &str, value: &str) -> Self {
            let spec = self.pod.spec.get_or_insert_with(Default::default);
            spec.node_selector
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
            self
        }

        fn on_node(mut self, node: &str) -> Self {
            let spec = self.pod.spec.get_or_insert_with(Default::default);
            spec.node_name = Some(node.to_string());
            self
        }

        fn container(mut self, requests: &[(&str, &str)], limits: &[(&str, &str)]) -> Self {
            let to_map = |entries: &[(&str, &str)]| {
                if entries.is_empty() {
                    return None;
                }
                Some(
                    entries
                        .iter()
                        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                        .collect::<BTreeMap<_, _>>(),
                )
            };
            let spec = self.pod.spec.get_or_insert_with(Default::default);
            spec.containers.push(Container {
                name: format!("c{}", spec.containers.len()),
                resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                    requests: to_map(requests),
                    limits: to_map(limits),
                    ..Default::default()
                }),
                ..Default::default()
            });
            self
        }

        fn build(self) -> Pod {
            self.pod
        }
    }

    #[test]
    fn test_running_and_pending_pods_block() {
        let now = Utc::now();
        assert!(is_blocking_pod(
            &PodBuilder::new("apps", "a", "Running").build(),
            0,
            now
        ));
        assert!(is_blocking_pod(
            &PodBuilder::new("apps", "b", "Pending").build(),
            0,
            now
        ));
        assert!(!is_blocking_pod(
            &PodBuilder::new("apps", "c", "Succeeded").build(),
            0,
            now
        ));
    }

    #[test]
    fn test_control_plane_pods_need_compatible_selector() {
        let now = Utc::now();
        assert!(!is_blocking_pod(
            &PodBuilder::new("kube-system", "dns", "Running").build(),
            0,
            now
        ));
        assert!(is_blocking_pod(
            &PodBuilder::new("kube-system", "metrics", "Running")
                .selector("sector", "primary")
                .build(),
            0,
            now
        ));
    }

    #[test]
    fn test_daemonset_pods_never_block() {
        let pod = PodBuilder::new("apps", "agent", "Running")
            .owned_by("DaemonSet", true)
            .build();
        assert!(!is_blocking_pod(&pod, 0, Utc::now()));
    }

    #[test]
    fn test_completed_pods_block_inside_grace_window() {
        let now = Utc::now();
        let pod = PodBuilder::new("apps", "job", "Succeeded")
            .transitioned_at(now - Duration::seconds(120))
            .build();
        assert!(is_blocking_pod(&pod, 600, now));
        assert!(!is_blocking_pod(&pod, 60, now));
        assert!(!is_blocking_pod(&pod, 0, now));
    }

    #[test]
    fn test_bouncable_requires_stable_replicaset_pod() {
        let now = Utc::now();
        let stable = PodBuilder::new("apps", "web", "Running")
            .owned_by("ReplicaSet", true)
            .transitioned_at(now - Duration::seconds(3600))
            .build();
        assert!(is_bouncable_pod(&stable, now));

        let recent = PodBuilder::new("apps", "web", "Running")
            .owned_by("ReplicaSet", true)
            .transitioned_at(now - Duration::seconds(60))
            .build();
        assert!(!is_bouncable_pod(&recent, now));

        let job = PodBuilder::new("apps", "job", "Running")
            .owned_by("Job", true)
            .transitioned_at(now - Duration::seconds(3600))
            .build();
        assert!(!is_bouncable_pod(&job, now));

        let pending = PodBuilder::new("apps", "web", "Pending")
            .owned_by("ReplicaSet", true)
            .transitioned_at(now - Duration::seconds(3600))
            .build();
        assert!(!is_bouncable_pod(&pending, now));
    }

    #[test]
    fn test_demand_takes_max_of_requests_and_limits() {
        let configs = configs();
        let pod = PodBuilder::new("apps", "web", "Running")
            .container(
                &[("memory", "1Gi"), ("cpu", "500m")],
                &[("memory", "2Gi")],
            )
            .container(&[("cpu", "1")], &[])
            .build();
        let item = to_capacity_item(&configs, &pod, Utc::now());

        let expected_memory = (1.2 * 2.0 * 1024.0 * 1024.0 * 1024.0) as i64;
        assert_eq!(item.memory, expected_memory);
        assert!((item.cpu - 1.2 * 1.5).abs() < 1e-9);
        assert_eq!(item.pod_id, "apps:web");
        assert!(item.needs_resources);
    }

    #[test]
    fn test_completed_pods_do_not_need_resources() {
        let configs = configs();
        let pod = PodBuilder::new("apps", "job", "Succeeded").build();
        let item = to_capacity_item(&configs, &pod, Utc::now());
        assert!(!item.needs_resources);
    }

    #[test]
    fn test_fleet_hint_from_fleet_selector() {
        let configs = configs();
        let pod = PodBuilder::new("apps", "web", "Running")
            .selector("fleet", "coordinator-xsmall")
            .build();
        let item = to_capacity_item(&configs, &pod, Utc::now());
        assert_eq!(item.sector, "coordinator");
        assert_eq!(item.size.as_deref(), Some("xsmall"));
    }

    #[test]
    fn test_fleet_hint_from_sector_and_size_selectors() {
        let configs = configs();
        let pod = PodBuilder::new("apps", "web", "Running")
            .selector("sector", "coordinator")
            .selector("size", "large")
            .build();
        let item = to_capacity_item(&configs, &pod, Utc::now());
        assert_eq!(item.sector, "coordinator");
        assert_eq!(item.size.as_deref(), Some("large"));

        let bare = PodBuilder::new("apps", "web", "Running").build();
        let item = to_capacity_item(&configs, &bare, Utc::now());
        assert_eq!(item.sector, "primary");
        assert_eq!(item.size, None);
    }

    #[test]
    fn test_capacity_items_filter_to_blocking_pods() {
        let configs = configs();
        let now = Utc::now();
        let pods = vec![
            PodBuilder::new("apps", "web", "Running").on_node("node-a").build(),
            PodBuilder::new("apps", "done", "Succeeded").build(),
            PodBuilder::new("kube-system", "dns", "Running").build(),
        ];
        let items = capacity_items_from_pods(&configs, &pods, 0, now);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].pod_id, "apps:web");
        assert_eq!(items[0].node_name.as_deref(), Some("node-a"));
    }
}
