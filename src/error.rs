use thiserror::Error;

/// Conditions after which the service must exit and be restarted by its supervisor.
#[derive(Debug, Error, PartialEq)]
pub enum FatalError {
    #[error("no monitoring devices found after {trials} search trials")]
    NoDevicesFound { trials: u32 },

    #[error("{failures} consecutive aggregation passes failed to read device data")]
    ReadFailures { failures: u32 },

    #[error("battery capacity could not be read from any device")]
    CapacityUnreadable,
}

/// Every problem found while reading the environment configuration.
#[derive(Debug, Error, PartialEq)]
#[error("invalid configuration: {}", .errors.join("; "))]
pub struct ConfigError {
    pub errors: Vec<String>,
}
