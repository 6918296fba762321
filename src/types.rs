use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use serde::Serialize;

use crate::fleets::FleetRequirements;

/// Label key used to track the manager's view of a node's lifecycle. The
/// same key is used for the NoSchedule/NoExecute taints applied while a
/// node drains.
pub const STATE_KEY: &str = "fleet-manager-state";

/// Label key that binds a node to its fleet.
pub const FLEET_LABEL: &str = "fleet";

/// Lifecycle state of a fleet node.
///
/// Nodes are labeled with a terminating state before they are actually
/// terminated. This introduces a bit of lag between identifying a node for
/// termination and terminating it, giving Kubernetes a graceful window in
/// which taints evict pods instead of the instance disappearing under them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Active,
    WarmingUp,
    Terminating,
    ShuttingDown,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Active => "active",
            NodeState::WarmingUp => "warming_up",
            NodeState::Terminating => "terminating",
            NodeState::ShuttingDown => "shutting_down",
        }
    }

    /// Parse a node's state label value. Missing or unrecognized labels are
    /// treated as active.
    pub fn from_label(value: Option<&str>) -> NodeState {
        match value {
            Some("terminating") => NodeState::Terminating,
            Some("warming_up") => NodeState::WarmingUp,
            Some("shutting_down") => NodeState::ShuttingDown,
            _ => NodeState::Active,
        }
    }
}

/// A pod and its computed resource demand.
///
/// Capacity is determined from the container definitions within the pod and
/// scaled by the configured over-subscription factor.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityItem {
    /// Unique identity in the form `{namespace}:{name}`.
    pub pod_id: String,
    /// Fleet sector in which the item resides.
    pub sector: String,
    /// An optional fleet size in which the item must be scheduled.
    pub size: Option<String>,
    /// Memory demand in bytes, over-subscription applied.
    pub memory: i64,
    /// CPU demand in vCPU units, over-subscription applied.
    pub cpu: f64,
    /// Node the pod is bound to, if the scheduler has placed it.
    pub node_name: Option<String>,
    /// Lower-cased pod phase at observation time.
    pub phase: String,
    /// Whether the pod may be evicted from a node when excess capacity is
    /// found. Only pods in ReplicaSets are allowed to be bounced to avoid
    /// long-running deployments clogging up excess node capacity.
    pub is_bouncable: bool,
    /// False for pods that are completed but still lingering on a node for
    /// grace-period reasons; they occupy membership but cost nothing.
    pub needs_resources: bool,
}

/// A cluster node within a managed fleet.
///
/// Instances that exist in the cloud provider but have not joined the
/// cluster are represented with a `None` resource.
#[derive(Debug, Clone)]
pub struct FleetNode {
    pub name: String,
    pub instance_id: String,
    pub seconds_old: i64,
    pub requirements: FleetRequirements,
    /// No blocking pods and past the activation grace period.
    pub is_unblocked: bool,
    /// Old enough to be retired.
    pub is_retirable: bool,
    pub state: NodeState,
    pub resource: Option<Node>,
    /// Blocking pods bound to this node, keyed by pod id.
    pub pods: BTreeMap<String, CapacityItem>,
}

impl FleetNode {
    /// Identity used when collating nodes: the kubernetes name when one has
    /// been assigned, otherwise the EC2 instance id.
    pub fn ident(&self) -> &str {
        if self.name.is_empty() {
            &self.instance_id
        } else {
            &self.name
        }
    }
}

/// An EC2 fleet on which to operate, as observed from the cloud provider.
#[derive(Debug, Clone)]
pub struct Fleet {
    pub requirements: FleetRequirements,
    pub identifier: String,
    /// Current total target capacity of the EC2 fleet.
    pub capacity: i64,
    /// Tags applied to the EC2 fleet by provisioning.
    pub tags: BTreeMap<String, String>,
}

impl Fleet {
    /// Name of the fleet in the format `{sector}-{size}`.
    pub fn name(&self) -> String {
        self.requirements.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_from_label() {
        assert_eq!(NodeState::from_label(None), NodeState::Active);
        assert_eq!(NodeState::from_label(Some("active")), NodeState::Active);
        assert_eq!(
            NodeState::from_label(Some("terminating")),
            NodeState::Terminating
        );
        assert_eq!(
            NodeState::from_label(Some("warming_up")),
            NodeState::WarmingUp
        );
        assert_eq!(
            NodeState::from_label(Some("shutting_down")),
            NodeState::ShuttingDown
        );
        assert_eq!(NodeState::from_label(Some("bogus")), NodeState::Active);
    }
}
