//! Cloud provider access for EC2 fleets.
//!
//! The reconciliation core only sees the `CloudProvider` trait; the
//! production implementation wraps the AWS SDK and the mock records calls
//! for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_ec2::types::{Filter, TargetCapacitySpecificationRequest};
use chrono::{DateTime, TimeZone, Utc};

/// Observed state of an EC2 fleet resource.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetState {
    pub identifier: String,
    pub capacity: i64,
    pub tags: BTreeMap<String, String>,
}

/// Description of a single fleet instance as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub private_dns_name: String,
    pub launched_at: Option<DateTime<Utc>>,
}

/// Capabilities the reconciliation core needs from the cloud provider.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Fetch the fleet tagged for the given cluster and fleet name, if one
    /// exists in an operable state.
    async fn describe_fleet(
        &self,
        cluster_name: &str,
        fleet_name: &str,
    ) -> Result<Option<FleetState>>;

    /// Set the fleet's total target capacity. Returns whether the provider
    /// accepted the change.
    async fn modify_fleet_capacity(&self, fleet_id: &str, target_capacity: i64) -> Result<bool>;

    /// List descriptions for the fleet's currently active instances.
    async fn describe_fleet_instances(&self, fleet_id: &str) -> Result<Vec<InstanceDescription>>;

    /// Terminate the given instances. Termination of instances that are
    /// already shutting down is accepted by the provider.
    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()>;
}

/// Production provider backed by the AWS EC2 API.
pub struct Ec2Provider {
    client: aws_sdk_ec2::Client,
}

impl Ec2Provider {
    /// Build a provider from the ambient AWS configuration, optionally
    /// pinned to a named profile for local execution.
    pub async fn new(profile: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;
        Self {
            client: aws_sdk_ec2::Client::new(&config),
        }
    }
}

#[async_trait]
impl CloudProvider for Ec2Provider {
    async fn describe_fleet(
        &self,
        cluster_name: &str,
        fleet_name: &str,
    ) -> Result<Option<FleetState>> {
        let response = self
            .client
            .describe_fleets()
            .filters(
                Filter::builder()
                    .name("fleet-state")
                    .values("submitted")
                    .values("active")
                    .values("modifying")
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("tag:cluster")
                    .values(cluster_name)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("tag:fleet")
                    .values(fleet_name)
                    .build(),
            )
            .send()
            .await
            .context("Describing fleets")?;

        Ok(response.fleets().first().map(|fleet| FleetState {
            identifier: fleet.fleet_id().unwrap_or_default().to_string(),
            capacity: fleet
                .target_capacity_specification()
                .and_then(|spec| spec.total_target_capacity())
                .unwrap_or(0) as i64,
            tags: fleet
                .tags()
                .iter()
                .filter_map(|tag| {
                    Some((tag.key()?.to_string(), tag.value()?.to_string()))
                })
                .collect(),
        }))
    }

    async fn modify_fleet_capacity(&self, fleet_id: &str, target_capacity: i64) -> Result<bool> {
        let response = self
            .client
            .modify_fleet()
            .fleet_id(fleet_id)
            .target_capacity_specification(
                TargetCapacitySpecificationRequest::builder()
                    .total_target_capacity(target_capacity as i32)
                    .build(),
            )
            .send()
            .await
            .context("Modifying fleet capacity")?;
        Ok(response.r#return().unwrap_or(false))
    }

    async fn describe_fleet_instances(&self, fleet_id: &str) -> Result<Vec<InstanceDescription>> {
        let response = self
            .client
            .describe_fleet_instances()
            .fleet_id(fleet_id)
            .send()
            .await
            .context("Describing fleet instances")?;
        let instance_ids: Vec<String> = response
            .active_instances()
            .iter()
            .filter_map(|instance| instance.instance_id().map(str::to_string))
            .collect();

        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .describe_instances()
            .set_instance_ids(Some(instance_ids))
            .send()
            .await
            .context("Describing instances")?;

        Ok(response
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances())
            .map(|instance| InstanceDescription {
                instance_id: instance
                    .instance_id()
                    .unwrap_or("unknown-instance-id")
                    .to_string(),
                private_dns_name: instance.private_dns_name().unwrap_or_default().to_string(),
                launched_at: instance
                    .launch_time()
                    .and_then(|time| Utc.timestamp_opt(time.secs(), 0).single()),
            })
            .collect())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        self.client
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .context("Terminating instances")?;
        Ok(())
    }
}

/// Recorded capacity change issued against the mock provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityChange {
    pub fleet_id: String,
    pub target_capacity: i64,
}

/// Mock implementation for testing
#[derive(Default)]
pub struct MockCloudProvider {
    pub fleets: BTreeMap<String, FleetState>,
    pub instances: BTreeMap<String, Vec<InstanceDescription>>,
    /// When true, capacity changes report as refused by the provider.
    pub refuse_capacity_changes: bool,
    pub capacity_changes: Mutex<Vec<CapacityChange>>,
    pub terminated: Mutex<Vec<Vec<String>>>,
}

impl MockCloudProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fleet(mut self, fleet_name: &str, state: FleetState) -> Self {
        self.fleets.insert(fleet_name.to_string(), state);
        self
    }

    pub fn with_instances(mut self, fleet_id: &str, instances: Vec<InstanceDescription>) -> Self {
        self.instances.insert(fleet_id.to_string(), instances);
        self
    }

    pub fn recorded_capacity_changes(&self) -> Vec<CapacityChange> {
        self.capacity_changes.lock().unwrap().clone()
    }

    pub fn recorded_terminations(&self) -> Vec<Vec<String>> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudProvider for MockCloudProvider {
    async fn describe_fleet(
        &self,
        _cluster_name: &str,
        fleet_name: &str,
    ) -> Result<Option<FleetState>> {
        Ok(self.fleets.get(fleet_name).cloned())
    }

    async fn modify_fleet_capacity(&self, fleet_id: &str, target_capacity: i64) -> Result<bool> {
        self.capacity_changes.lock().unwrap().push(CapacityChange {
            fleet_id: fleet_id.to_string(),
            target_capacity,
        });
        Ok(!self.refuse_capacity_changes)
    }

    async fn describe_fleet_instances(&self, fleet_id: &str) -> Result<Vec<InstanceDescription>> {
        Ok(self.instances.get(fleet_id).cloned().unwrap_or_default())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        self.terminated
            .lock()
            .unwrap()
            .push(instance_ids.to_vec());
        Ok(())
    }
}
