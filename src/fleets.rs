//! Fleet requirements resolved from sector configuration.
//!
//! All derived bounds are computed once at configuration load. Configs are
//! reloaded wholesale, so the resolved values never go stale relative to
//! the reservations or the sector layout they were derived from.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use serde_json::json;

use crate::catalog::{fleet_size_spec, FleetKind, FleetSize, FleetSizeSpec};
use crate::errors::ConfigError;

/// A sector entry from the `sectors` block of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SectorConfig {
    pub kind: Option<String>,
    #[serde(default)]
    pub fleets: Vec<SectorFleetConfig>,
}

/// A fleet entry within a sector config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SectorFleetConfig {
    pub size: Option<String>,
    pub capacity_min: Option<i64>,
    pub bounce_deployment_pods: Option<bool>,
}

/// Resource capacity bounds and scaling policy for a single EC2 fleet.
///
/// `memory_max`/`cpu_max` are the size spec's conservative bounds less the
/// cluster-wide reservations. `memory_min`/`cpu_min` equal the effective
/// maxima of the next-smaller fleet in the same sector, or 0 when this is
/// the smallest. `capacity_weight` is 1.0 for the smallest fleet in the
/// sector and the ratio of dominant-resource maxima against it otherwise.
#[derive(Debug, Clone)]
pub struct FleetRequirements {
    pub sector: String,
    pub size_spec: FleetSizeSpec,
    /// Minimum capacity allowed for this fleet. If zero, the fleet may
    /// scale down to no nodes when not under scheduling pressure.
    pub capacity_min: i64,
    /// Whether deployments may be bounced from nodes that are not needed
    /// to meet target capacity requirements.
    pub bounce_deployment_pods: bool,
    pub memory_min: i64,
    pub memory_max: i64,
    pub cpu_min: f64,
    pub cpu_max: f64,
    pub capacity_weight: f64,
}

impl FleetRequirements {
    /// Uniquely identifying name in the format `{sector}-{size}`, matching
    /// the tag applied to the EC2 fleet.
    pub fn name(&self) -> String {
        format!("{}-{}", self.sector, self.size_spec.size)
    }

    pub fn size(&self) -> FleetSize {
        self.size_spec.size
    }

    pub fn kind(&self) -> FleetKind {
        self.size_spec.kind
    }

    pub fn to_log_data(&self) -> serde_json::Value {
        json!({
            "name": self.name(),
            "sector": self.sector,
            "size": self.size_spec.size,
            "kind": self.size_spec.kind,
            "capacity_min": self.capacity_min,
            "memory_min": self.memory_min,
            "memory_max": self.memory_max,
            "cpu_min": self.cpu_min,
            "cpu_max": self.cpu_max,
            "capacity_weight": self.capacity_weight,
        })
    }
}

impl PartialEq for FleetRequirements {
    fn eq(&self, other: &Self) -> bool {
        self.sector == other.sector && self.size_spec.size == other.size_spec.size
    }
}

impl Eq for FleetRequirements {}

/// Convert the sectors config data into resolved fleet requirements.
///
/// Unknown sizes or kinds and duplicate `(sector, size)` pairs reject the
/// configuration.
pub fn fleets_from_config(
    sectors: &BTreeMap<String, SectorConfig>,
    reserved_cpus: f64,
    reserved_memory: i64,
) -> Result<Vec<FleetRequirements>, ConfigError> {
    let mut fleets: Vec<FleetRequirements> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (sector, sector_config) in sectors {
        let kind: FleetKind = sector_config
            .kind
            .as_deref()
            .unwrap_or("memory")
            .parse()?;
        for fleet_config in &sector_config.fleets {
            let size: FleetSize = fleet_config.size.as_deref().unwrap_or("small").parse()?;
            let size_spec = fleet_size_spec(size, kind);
            let requirements = FleetRequirements {
                sector: sector.clone(),
                memory_max: size_spec.memory_max() - reserved_memory,
                cpu_max: size_spec.cpu_max() - reserved_cpus,
                size_spec,
                capacity_min: fleet_config.capacity_min.unwrap_or(0),
                bounce_deployment_pods: fleet_config.bounce_deployment_pods.unwrap_or(false),
                memory_min: 0,
                cpu_min: 0.0,
                capacity_weight: 1.0,
            };
            if !seen.insert(requirements.name()) {
                return Err(ConfigError::DuplicateFleetName(requirements.name()));
            }
            fleets.push(requirements);
        }
    }

    resolve_sector_bounds(&mut fleets);
    Ok(fleets)
}

/// Fill in the derived per-sector bounds on each fleet.
fn resolve_sector_bounds(fleets: &mut [FleetRequirements]) {
    let snapshot = fleets.to_vec();
    for fleet in fleets.iter_mut() {
        if let Some(smaller) = next_smaller_fleet(&snapshot, fleet) {
            fleet.memory_min = smaller.memory_max;
            fleet.cpu_min = smaller.cpu_max;
        }
        if let Some(smallest) = smallest_sector_fleet(&snapshot, fleet) {
            fleet.capacity_weight =
                fleet.size_spec.dominant_max() / smallest.size_spec.dominant_max();
        }
    }
}

/// Find the largest fleet in the same sector that is still smaller than the
/// specified one.
fn next_smaller_fleet<'a>(
    fleets: &'a [FleetRequirements],
    fleet: &FleetRequirements,
) -> Option<&'a FleetRequirements> {
    fleets
        .iter()
        .filter(|f| f.sector == fleet.sector && f.size_spec.smaller_than(&fleet.size_spec))
        .max_by(|a, b| {
            a.size_spec
                .dominant_max()
                .total_cmp(&b.size_spec.dominant_max())
        })
}

/// Find the smallest fleet in the same sector, excluding the fleet itself.
fn smallest_sector_fleet<'a>(
    fleets: &'a [FleetRequirements],
    fleet: &FleetRequirements,
) -> Option<&'a FleetRequirements> {
    fleets
        .iter()
        .filter(|f| f.sector == fleet.sector && f.size_spec.smaller_than(&fleet.size_spec))
        .min_by(|a, b| {
            a.size_spec
                .dominant_max()
                .total_cmp(&b.size_spec.dominant_max())
        })
}

/// List all fleets in the specified sector ordered by capacity weight.
pub fn sector_fleets<'a>(
    fleets: &'a [FleetRequirements],
    sector: &str,
) -> Vec<&'a FleetRequirements> {
    let mut matches: Vec<&FleetRequirements> =
        fleets.iter().filter(|f| f.sector == sector).collect();
    matches.sort_by(|a, b| a.capacity_weight.total_cmp(&b.capacity_weight));
    matches
}
