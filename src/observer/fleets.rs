//! Fleet observation.

use anyhow::Result;

use crate::cloud::CloudProvider;
use crate::config::ManagerConfigs;
use crate::fleets::FleetRequirements;
use crate::types::Fleet;

/// Fetch the current cloud-provider state for the specified fleet.
///
/// Returns `None` when no operable fleet carries the cluster and fleet
/// tags, which the caller reports rather than treating as a tick failure.
pub async fn get_fleet(
    configs: &ManagerConfigs,
    cloud: &dyn CloudProvider,
    requirements: &FleetRequirements,
) -> Result<Option<Fleet>> {
    let state = cloud
        .describe_fleet(&configs.cluster_name, &requirements.name())
        .await?;
    Ok(state.map(|state| Fleet {
        requirements: requirements.clone(),
        identifier: state.identifier,
        capacity: state.capacity,
        tags: state.tags,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{FleetState, MockCloudProvider};
    use crate::config::{CliArgs, ManagerConfigs, StaticEnvironment};
    use crate::fleets::{fleets_from_config, SectorConfig, SectorFleetConfig};
    use std::collections::BTreeMap;

    fn requirements() -> FleetRequirements {
        let sectors = BTreeMap::from([(
            "primary".to_string(),
            SectorConfig {
                kind: Some("memory".to_string()),
                fleets: vec![SectorFleetConfig {
                    size: Some("small".to_string()),
                    ..Default::default()
                }],
            },
        )]);
        fleets_from_config(&sectors, 1.0, 0).unwrap().remove(0)
    }

    fn configs() -> ManagerConfigs {
        let args = CliArgs {
            cluster_name: Some("test".to_string()),
            config_path: Some("/does/not/exist.yaml".into()),
            ..Default::default()
        };
        ManagerConfigs::load(&args, &StaticEnvironment::default(), None).unwrap()
    }

    #[tokio::test]
    async fn test_get_fleet_maps_provider_state() {
        let cloud = MockCloudProvider::new().with_fleet(
            "primary-small",
            FleetState {
                identifier: "fleet-abc".to_string(),
                capacity: 4,
                tags: BTreeMap::from([("fleet".to_string(), "primary-small".to_string())]),
            },
        );
        let fleet = get_fleet(&configs(), &cloud, &requirements())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fleet.identifier, "fleet-abc");
        assert_eq!(fleet.capacity, 4);
        assert_eq!(fleet.name(), "primary-small");
    }

    #[tokio::test]
    async fn test_get_fleet_missing() {
        let cloud = MockCloudProvider::new();
        let fleet = get_fleet(&configs(), &cloud, &requirements()).await.unwrap();
        assert!(fleet.is_none());
    }
}
