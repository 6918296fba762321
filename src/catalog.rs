//! Static registry of fleet size specifications.
//!
//! The catalog is closed: every valid `(size, kind)` pair resolves to a
//! specification with a fixed set of candidate EC2 instance types, and
//! configuration load rejects anything outside it.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::errors::ConfigError;

/// T-shirt size of a fleet's nodes, which identifies the fleet within its
/// sector as each sector should only have one fleet for a given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetSize {
    Xsmall,
    Small,
    Medium,
    Large,
    Xlarge,
}

impl FleetSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            FleetSize::Xsmall => "xsmall",
            FleetSize::Small => "small",
            FleetSize::Medium => "medium",
            FleetSize::Large => "large",
            FleetSize::Xlarge => "xlarge",
        }
    }
}

impl fmt::Display for FleetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FleetSize {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "xsmall" => Ok(FleetSize::Xsmall),
            "small" => Ok(FleetSize::Small),
            "medium" => Ok(FleetSize::Medium),
            "large" => Ok(FleetSize::Large),
            "xlarge" => Ok(FleetSize::Xlarge),
            _ => Err(ConfigError::UnknownFleetSize(value.to_string())),
        }
    }
}

/// The optimized resource allocation for a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetKind {
    Memory,
    Cpu,
}

impl FleetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FleetKind::Memory => "memory",
            FleetKind::Cpu => "cpu",
        }
    }
}

impl fmt::Display for FleetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FleetKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "memory" => Ok(FleetKind::Memory),
            "cpu" => Ok(FleetKind::Cpu),
            _ => Err(ConfigError::UnknownFleetKind(value.to_string())),
        }
    }
}

/// An EC2 instance type a fleet may launch.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceType {
    pub name: &'static str,
    pub cpu: f64,
    pub memory: i64,
}

impl InstanceType {
    const fn new(name: &'static str, cpu: f64, memory: i64) -> Self {
        Self { name, cpu, memory }
    }
}

/// Size-specific bounds and candidate instance types for a fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSizeSpec {
    pub size: FleetSize,
    pub kind: FleetKind,
    pub instance_types: Vec<InstanceType>,
}

impl FleetSizeSpec {
    /// Maximum memory in bytes for the nodes in this fleet.
    ///
    /// The minimum over the instance set, so scheduling decisions hold for
    /// whichever instance type actually launches. Nothing should be
    /// scheduled in this fleet that meets or exceeds this limit.
    pub fn memory_max(&self) -> i64 {
        self.instance_types
            .iter()
            .map(|t| t.memory)
            .min()
            .unwrap_or(0)
    }

    /// Maximum vCPU units for the nodes in this fleet.
    ///
    /// Nothing should be scheduled in this fleet that meets or exceeds
    /// this limit.
    pub fn cpu_max(&self) -> f64 {
        self.instance_types
            .iter()
            .map(|t| t.cpu)
            .fold(f64::MAX, f64::min)
    }

    /// Whether this fleet size spec is smaller than the other one, compared
    /// by the kind's dominant resource.
    pub fn smaller_than(&self, other: &FleetSizeSpec) -> bool {
        match self.kind {
            FleetKind::Memory => self.memory_max() < other.memory_max(),
            FleetKind::Cpu => self.cpu_max() < other.cpu_max(),
        }
    }

    /// The dominant-resource maximum used for capacity weighting.
    pub fn dominant_max(&self) -> f64 {
        match self.kind {
            FleetKind::Memory => self.memory_max() as f64,
            FleetKind::Cpu => self.cpu_max(),
        }
    }
}

fn gib(value: f64) -> i64 {
    (value * (1_i64 << 30) as f64) as i64
}

/// Resolve the size specification for the given size and kind values.
pub fn fleet_size_spec(size: FleetSize, kind: FleetKind) -> FleetSizeSpec {
    let instance_types = match (size, kind) {
        (FleetSize::Xsmall, FleetKind::Memory) => vec![
            InstanceType::new("r4.large", 2.0, gib(15.25)),
            InstanceType::new("r5.large", 2.0, gib(16.0)),
            InstanceType::new("m4.xlarge", 4.0, gib(16.0)),
            InstanceType::new("m5.xlarge", 4.0, gib(16.0)),
        ],
        (FleetSize::Xsmall, FleetKind::Cpu) => vec![
            InstanceType::new("c4.xlarge", 4.0, gib(7.5)),
            InstanceType::new("c5.xlarge", 4.0, gib(8.0)),
            InstanceType::new("m4.xlarge", 4.0, gib(16.0)),
            InstanceType::new("m5.xlarge", 4.0, gib(16.0)),
        ],
        (FleetSize::Small, FleetKind::Memory) => vec![
            InstanceType::new("r4.xlarge", 4.0, gib(30.5)),
            InstanceType::new("r5.xlarge", 4.0, gib(32.0)),
            InstanceType::new("m4.2xlarge", 8.0, gib(32.0)),
            InstanceType::new("m5.2xlarge", 8.0, gib(32.0)),
        ],
        (FleetSize::Small, FleetKind::Cpu) => vec![
            InstanceType::new("c4.2xlarge", 8.0, gib(15.0)),
            InstanceType::new("c5.2xlarge", 8.0, gib(16.0)),
            InstanceType::new("m4.2xlarge", 8.0, gib(32.0)),
            InstanceType::new("m5.2xlarge", 8.0, gib(32.0)),
        ],
        (FleetSize::Medium, FleetKind::Memory) => vec![
            InstanceType::new("r4.2xlarge", 8.0, gib(61.0)),
            InstanceType::new("r5.2xlarge", 8.0, gib(64.0)),
            InstanceType::new("m4.4xlarge", 16.0, gib(64.0)),
            InstanceType::new("m5.4xlarge", 16.0, gib(64.0)),
        ],
        (FleetSize::Medium, FleetKind::Cpu) => vec![
            InstanceType::new("c4.4xlarge", 16.0, gib(30.0)),
            InstanceType::new("c5.4xlarge", 16.0, gib(32.0)),
            InstanceType::new("m4.4xlarge", 16.0, gib(64.0)),
            InstanceType::new("m5.4xlarge", 16.0, gib(64.0)),
        ],
        (FleetSize::Large, FleetKind::Memory) => vec![
            InstanceType::new("r4.4xlarge", 16.0, gib(122.0)),
            InstanceType::new("r5.4xlarge", 16.0, gib(128.0)),
            InstanceType::new("m4.10xlarge", 40.0, gib(160.0)),
            InstanceType::new("m5.8xlarge", 32.0, gib(128.0)),
        ],
        (FleetSize::Large, FleetKind::Cpu) => vec![
            InstanceType::new("c4.8xlarge", 36.0, gib(60.0)),
            InstanceType::new("c5.9xlarge", 36.0, gib(72.0)),
            InstanceType::new("m4.10xlarge", 40.0, gib(160.0)),
            InstanceType::new("m5.12xlarge", 48.0, gib(192.0)),
        ],
        (FleetSize::Xlarge, FleetKind::Memory) => vec![
            InstanceType::new("r4.8xlarge", 32.0, gib(244.0)),
            InstanceType::new("r5.8xlarge", 32.0, gib(256.0)),
            InstanceType::new("m4.16xlarge", 64.0, gib(256.0)),
            InstanceType::new("m5.16xlarge", 64.0, gib(256.0)),
        ],
        (FleetSize::Xlarge, FleetKind::Cpu) => vec![
            InstanceType::new("c5.18xlarge", 72.0, gib(144.0)),
            InstanceType::new("m4.16xlarge", 64.0, gib(256.0)),
            InstanceType::new("m5.16xlarge", 64.0, gib(256.0)),
        ],
    };
    FleetSizeSpec {
        size,
        kind,
        instance_types,
    }
}
