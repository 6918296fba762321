//! Fleet capacity growth.

use anyhow::Result;
use serde_json::json;

use crate::cloud::CloudProvider;
use crate::config::ManagerConfigs;
use crate::types::Fleet;

/// Raise the fleet's target capacity when demand exceeds supply.
///
/// A fleet already at or above the target is left alone. A refused change
/// is logged and not raised: the operation is idempotent and the next tick
/// retries it.
pub async fn grow_fleet(
    configs: &ManagerConfigs,
    cloud: &dyn CloudProvider,
    fleet: &Fleet,
    target_capacity: i64,
) -> Result<bool> {
    if fleet.capacity >= target_capacity {
        return Ok(true);
    }

    let success = cloud
        .modify_fleet_capacity(&fleet.identifier, target_capacity)
        .await?;
    if success {
        configs.log(
            "growing",
            json!({
                "fleet": fleet.name(),
                "previous_capacity": fleet.capacity,
                "target_capacity": target_capacity,
            }),
        );
    } else {
        configs.log(
            "grow_failed",
            json!({
                "fleet": fleet.name(),
                "target_capacity": target_capacity,
            }),
        );
    }
    Ok(success)
}
