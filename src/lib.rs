// Public modules
pub mod allocator;
pub mod catalog;
pub mod cloud;
pub mod cluster;
pub mod config;
pub mod contractor;
pub mod conversions;
pub mod errors;
pub mod expander;
pub mod fleets;
pub mod logging;
pub mod observer;
pub mod periods;
pub mod runner;
pub mod types;

// Re-export commonly used items
pub use allocator::{
    allocate, compute_fleet_capacity, create_fleet_allocation, get_capacity_targets, is_suitable,
    repack, FleetAllocation, Member, Membership,
};
pub use catalog::{fleet_size_spec, FleetKind, FleetSize, FleetSizeSpec, InstanceType};
pub use cloud::{
    CloudProvider, Ec2Provider, FleetState, InstanceDescription, MockCloudProvider,
};
pub use cluster::{ClusterApi, KubeClusterApi, MockClusterApi};
pub use config::{
    CliArgs, Environment, ManagerConfigs, ProcessEnvironment, StaticEnvironment,
};
pub use contractor::{nodes_to_terminate, shrink_fleet};
pub use conversions::{format_bytes, format_cpus, to_bytes, to_cpus};
pub use errors::{AllocationError, ConfigError};
pub use expander::grow_fleet;
pub use fleets::{fleets_from_config, FleetRequirements, SectorConfig, SectorFleetConfig};
pub use periods::{grace_periods_from_config, inactive_grace_period, InactiveGracePeriod};
pub use runner::{execute, update_fleet, Status};
pub use types::{CapacityItem, Fleet, FleetNode, NodeState, FLEET_LABEL, STATE_KEY};
