use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;

use crate::conversions::{to_bytes, to_cpus};
use crate::errors::ConfigError;
use crate::fleets::{fleets_from_config, FleetRequirements, SectorConfig};
use crate::logging;
use crate::periods::{
    grace_periods_from_config, inactive_grace_period, to_day_seconds, InactiveGracePeriod,
    DEFAULT_GRACE_SECONDS,
};

const DEFAULT_CONFIG_PATH: &str = "/application/config/config.yaml";

/// Command line arguments for the fleet manager. These take precedence over
/// environment variables and the config file.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "kube-fleet-manager")]
pub struct CliArgs {
    /// Name of the cluster whose fleets should be managed.
    #[arg(long)]
    pub cluster_name: Option<String>,
    /// AWS profile to use when running with local credentials.
    #[arg(short = 'p', long = "profile")]
    pub aws_profile: Option<String>,
    /// Run outside the cluster using local kubeconfig credentials.
    #[arg(long)]
    pub external: bool,
    /// Apply capacity writes. Without this flag the manager runs dry and
    /// only logs the plans it would execute.
    #[arg(long)]
    pub live: bool,
    /// Indent the JSON log records for readability.
    #[arg(long)]
    pub pretty_print: bool,
    /// Path to the YAML configuration file.
    #[arg(long)]
    pub config_path: Option<PathBuf>,
}

/// The two environment fallbacks the manager honors, behind a seam so the
/// CLI > environment > file precedence can be tested without mutating the
/// process environment.
pub trait Environment {
    /// `CLUSTER_NAME`, the fallback for `--cluster-name`.
    fn cluster_name(&self) -> Option<String>;

    /// `CONFIG_PATH`, the fallback for `--config-path`.
    fn config_path(&self) -> Option<String>;
}

/// Reads the real process environment.
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn cluster_name(&self) -> Option<String> {
        std::env::var("CLUSTER_NAME").ok()
    }

    fn config_path(&self) -> Option<String> {
        std::env::var("CONFIG_PATH").ok()
    }
}

/// Fixed environment values for tests.
#[derive(Debug, Default)]
pub struct StaticEnvironment {
    pub cluster_name: Option<String>,
    pub config_path: Option<String>,
}

impl Environment for StaticEnvironment {
    fn cluster_name(&self) -> Option<String> {
        self.cluster_name.clone()
    }

    fn config_path(&self) -> Option<String> {
        self.config_path.clone()
    }
}

/// A grace period entry as written in the config file. Times accept either
/// `HH[:MM[:SS]]` strings or raw seconds since midnight.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawGracePeriod {
    starts: Option<serde_yaml::Value>,
    ends: Option<serde_yaml::Value>,
    value: Option<i64>,
    days: Option<Vec<u32>>,
}

/// Top-level shape of the YAML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    cluster_name: Option<String>,
    default_sector: Option<String>,
    critical_error_threshold: Option<i64>,
    sleep_interval: Option<u64>,
    default_over_subscription: Option<f64>,
    reserved_cpus: Option<serde_yaml::Value>,
    reserved_memory: Option<serde_yaml::Value>,
    config_refresh_interval: Option<i64>,
    max_logging_interval: Option<i64>,
    #[serde(default)]
    sectors: BTreeMap<String, SectorConfig>,
    #[serde(default)]
    inactive_grace_periods: Vec<RawGracePeriod>,
}

/// Runtime configuration for fleet manager operation.
///
/// Lives across reconciliation ticks and mutates only through `reload`,
/// which replaces the derived state wholesale.
#[derive(Debug, Clone)]
pub struct ManagerConfigs {
    pub cluster_name: String,
    pub aws_profile: Option<String>,
    pub default_sector: Option<String>,
    pub external: bool,
    pub live: bool,
    pub pretty_print: bool,
    pub critical_error_threshold: i64,
    pub sleep_interval: u64,
    pub default_over_subscription: f64,
    pub reserved_cpus: f64,
    pub reserved_memory: i64,
    pub config_refresh_interval: i64,
    pub max_logging_interval: i64,
    pub fleets: Vec<FleetRequirements>,
    pub inactive_grace_periods: Vec<InactiveGracePeriod>,
    pub last_loaded_at: DateTime<Utc>,
}

impl ManagerConfigs {
    /// Populate manager configs from CLI arguments, the environment and the
    /// config file.
    ///
    /// Config path lookup is prioritized in the following way:
    /// - `config_path_override` argument (testing and embedding hook).
    /// - `--config-path` command line argument.
    /// - `CONFIG_PATH` environment variable.
    /// - Default value of `/application/config/config.yaml`.
    ///
    /// A missing config file loads as an empty configuration, but the
    /// cluster name remains required from one of the sources.
    pub fn load<E: Environment>(
        args: &CliArgs,
        env: &E,
        config_path_override: Option<&Path>,
    ) -> Result<Self> {
        let raw = load_raw_config(args, env, config_path_override)?;

        let cluster_name = args
            .cluster_name
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| env.cluster_name().filter(|v| !v.is_empty()))
            .or_else(|| raw.cluster_name.clone().filter(|v| !v.is_empty()))
            .ok_or(ConfigError::MissingClusterName)?;

        let reserved_cpus = raw
            .reserved_cpus
            .as_ref()
            .map(yaml_to_cpus)
            .unwrap_or(1.0);
        let reserved_memory = raw
            .reserved_memory
            .as_ref()
            .map(yaml_to_bytes)
            .unwrap_or(2_500_000_000);

        let fleets = fleets_from_config(&raw.sectors, reserved_cpus, reserved_memory)?;
        let inactive_grace_periods = grace_periods_from_config(
            raw.inactive_grace_periods
                .iter()
                .map(raw_grace_period)
                .collect::<Result<Vec<_>, _>>()?,
        );

        Ok(Self {
            cluster_name,
            aws_profile: args.aws_profile.clone(),
            default_sector: raw.default_sector,
            external: args.external,
            live: args.live,
            pretty_print: args.pretty_print,
            critical_error_threshold: raw.critical_error_threshold.unwrap_or(100),
            sleep_interval: raw.sleep_interval.unwrap_or(20),
            default_over_subscription: raw.default_over_subscription.unwrap_or(0.2),
            reserved_cpus,
            reserved_memory,
            config_refresh_interval: raw.config_refresh_interval.unwrap_or(60),
            max_logging_interval: raw.max_logging_interval.unwrap_or(120),
            fleets,
            inactive_grace_periods,
            last_loaded_at: Utc::now(),
        })
    }

    /// Refresh this config from its sources, replacing derived state
    /// wholesale. Allows a ConfigMap-mounted file to change while the
    /// manager keeps running.
    pub fn reload<E: Environment>(
        &mut self,
        args: &CliArgs,
        env: &E,
        config_path_override: Option<&Path>,
    ) -> Result<()> {
        *self = Self::load(args, env, config_path_override)?;
        Ok(())
    }

    /// Whether this manager is in dry-run mode.
    ///
    /// When running in dry-run mode, the manager computes and echoes fleet
    /// changes without executing any resizing actions.
    pub fn dry_run(&self) -> bool {
        !self.live
    }

    /// Number of seconds since this config was loaded or refreshed.
    pub fn seconds_old(&self) -> i64 {
        (Utc::now() - self.last_loaded_at).num_seconds()
    }

    /// Get the applicable inactive grace period for the given time, or for
    /// now when no time is specified.
    pub fn get_inactive_grace_period(&self, date_time: Option<DateTime<Utc>>) -> i64 {
        if self.inactive_grace_periods.is_empty() {
            return DEFAULT_GRACE_SECONDS;
        }
        inactive_grace_period(
            &self.inactive_grace_periods,
            date_time.unwrap_or_else(Utc::now),
        )
    }

    /// Name of the sector to apply for pods not assigned to one.
    pub fn default_fleet_sector(&self) -> String {
        if let Some(sector) = &self.default_sector {
            return sector.clone();
        }
        self.fleets
            .first()
            .map(|f| f.sector.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Find the fleet requirements given sector and size values.
    pub fn get_fleet_requirements(&self, sector: &str, size: &str) -> Option<&FleetRequirements> {
        self.fleets
            .iter()
            .find(|f| f.sector == sector && f.size_spec.size.as_str() == size)
    }

    /// Find the fleet requirements for the given `{sector}-{size}` name.
    pub fn get_fleet_requirements_by_name(&self, fleet_name: &str) -> Option<&FleetRequirements> {
        let (sector, size) = fleet_name.split_once('-')?;
        self.get_fleet_requirements(sector, size)
    }

    /// Log the message and data as a structured record.
    pub fn log(&self, message: &str, data: serde_json::Value) {
        logging::emit(message, data, self.pretty_print);
    }

    pub fn to_log_data(&self) -> serde_json::Value {
        let now = Utc::now();
        json!({
            "cluster_name": self.cluster_name,
            "aws_profile": self.aws_profile,
            "external": self.external,
            "live": self.live,
            "critical_error_threshold": self.critical_error_threshold,
            "sleep_interval": self.sleep_interval,
            "default_over_subscription": self.default_over_subscription,
            "reserved_cpus": self.reserved_cpus,
            "reserved_memory": self.reserved_memory,
            "last_loaded_at": self.last_loaded_at.to_rfc3339(),
            "inactive_grace_periods": self
                .inactive_grace_periods
                .iter()
                .map(|p| p.to_log_data(now))
                .collect::<Vec<_>>(),
            "fleets": self.fleets.iter().map(|f| f.to_log_data()).collect::<Vec<_>>(),
        })
    }
}

fn load_raw_config<E: Environment>(
    args: &CliArgs,
    env: &E,
    config_path_override: Option<&Path>,
) -> Result<RawConfig> {
    let path: PathBuf = config_path_override
        .map(Path::to_path_buf)
        .or_else(|| args.config_path.clone())
        .or_else(|| env.config_path().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RawConfig::default())
        }
        Err(error) => {
            return Err(error).with_context(|| format!("Reading config file {}", path.display()))
        }
    };
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Parsing config file {}", path.display()))
}

/// Accept either a number or a resource string for a cpu reservation.
fn yaml_to_cpus(value: &serde_yaml::Value) -> f64 {
    match value {
        serde_yaml::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_yaml::Value::String(s) => to_cpus(s),
        _ => 0.0,
    }
}

/// Accept either a number or a resource string for a memory reservation.
fn yaml_to_bytes(value: &serde_yaml::Value) -> i64 {
    match value {
        serde_yaml::Value::Number(n) => n.as_i64().unwrap_or(0),
        serde_yaml::Value::String(s) => to_bytes(s),
        _ => 0,
    }
}

fn raw_grace_period(raw: &RawGracePeriod) -> Result<InactiveGracePeriod, ConfigError> {
    Ok(InactiveGracePeriod {
        day_seconds_starts: raw
            .starts
            .as_ref()
            .map(yaml_to_day_seconds)
            .transpose()?
            .unwrap_or(0),
        day_seconds_ends: raw
            .ends
            .as_ref()
            .map(yaml_to_day_seconds)
            .transpose()?
            .unwrap_or(86_400),
        value: raw.value.unwrap_or(DEFAULT_GRACE_SECONDS),
        days_of_week: raw.days.clone().unwrap_or_default(),
    })
}

fn yaml_to_day_seconds(value: &serde_yaml::Value) -> Result<i64, ConfigError> {
    match value {
        serde_yaml::Value::Number(n) => Ok(n.as_i64().unwrap_or(0)),
        serde_yaml::Value::String(s) => to_day_seconds(s),
        other => Err(ConfigError::InvalidTimeValue(format!("{other:?}"))),
    }
}
