use thiserror::Error;

/// Errors that make a configuration unusable. These are fatal at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown fleet size '{0}'.")]
    UnknownFleetSize(String),
    #[error("Unknown fleet kind '{0}'.")]
    UnknownFleetKind(String),
    #[error("Duplicate fleet name '{0}'.")]
    DuplicateFleetName(String),
    #[error("A cluster name must be supplied.")]
    MissingClusterName,
    #[error("Unable to parse time value '{0}'.")]
    InvalidTimeValue(String),
}

/// Errors raised while planning fleet capacity.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Raised when blocking pods could not all be placed into a fleet, so
    /// that monitors can observe that scheduling is not working right now.
    #[error(
        "Not all pods were able to be allocated to a fleet due to mismatched \
         resource constraints ({allocated} of {expected} placed)."
    )]
    Unschedulable { expected: usize, allocated: usize },
}
