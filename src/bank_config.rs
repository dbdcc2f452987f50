//! Startup read of the bank's configuration: total capacity and a cross-device consistency check.

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::bus_gateway::DeviceBus;
use crate::config_reader::{CapacityReader, ConfigParam, ShuntConfig};
use crate::discovery::{classify, FoundDevice};
use crate::error::FatalError;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Safety relevant: the conservative value is used.
    Critical,
    /// Informational only.
    Recommended,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsistencyRule {
    pub param: ConfigParam,
    pub severity: Severity,
    pub unit: &'static str,
    pub decimals: usize,
}

impl ConsistencyRule {
    pub fn tolerance(&self) -> f64 {
        if self.decimals > 0 {
            0.01
        } else {
            0.5
        }
    }
}

pub const CONSISTENCY_RULES: [ConsistencyRule; 6] = [
    ConsistencyRule {
        param: ConfigParam::ChargedVoltage,
        severity: Severity::Critical,
        unit: "V",
        decimals: 1,
    },
    ConsistencyRule {
        param: ConfigParam::TailCurrent,
        severity: Severity::Recommended,
        unit: "%",
        decimals: 1,
    },
    ConsistencyRule {
        param: ConfigParam::ChargeEfficiency,
        severity: Severity::Recommended,
        unit: "%",
        decimals: 0,
    },
    ConsistencyRule {
        param: ConfigParam::PeukertExponent,
        severity: Severity::Recommended,
        unit: "",
        decimals: 2,
    },
    ConsistencyRule {
        param: ConfigParam::CurrentThreshold,
        severity: Severity::Recommended,
        unit: "A",
        decimals: 2,
    },
    ConsistencyRule {
        param: ConfigParam::DischargeFloor,
        severity: Severity::Recommended,
        unit: "%",
        decimals: 0,
    },
];

/// A parameter whose values differ between devices by more than its tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub rule: ConsistencyRule,
    /// `(device name, value)` for every device that reported the parameter.
    pub values: Vec<(String, f64)>,
}

impl Mismatch {
    pub fn minimum(&self) -> Option<f64> {
        self.values.iter().map(|(_, v)| *v).reduce(f64::min)
    }
}

/// Checks every rule of [`CONSISTENCY_RULES`] across the named configs.
pub fn check_consistency(configs: &[(String, ShuntConfig)]) -> Vec<Mismatch> {
    CONSISTENCY_RULES
        .iter()
        .filter_map(|rule| {
            let values: Vec<(String, f64)> = configs
                .iter()
                .filter_map(|(name, config)| config.get(rule.param).map(|v| (name.clone(), v)))
                .collect();
            let min = values.iter().map(|(_, v)| *v).reduce(f64::min)?;
            let max = values.iter().map(|(_, v)| *v).reduce(f64::max)?;
            (max - min > rule.tolerance()).then(|| Mismatch { rule: *rule, values })
        })
        .collect()
}

fn log_mismatch(mismatch: &Mismatch) {
    let rule = &mismatch.rule;
    let listing = mismatch
        .values
        .iter()
        .map(|(name, v)| format!("{name}={v:.prec$}{unit}", prec = rule.decimals, unit = rule.unit))
        .collect::<Vec<_>>()
        .join(", ");
    match rule.severity {
        Severity::Critical => {
            warn!("CRITICAL: {} differs between devices: {}", rule.param.name(), listing);
            if let Some(min) = mismatch.minimum() {
                warn!(
                    "Using the most conservative {} of {:.prec$}{}",
                    rule.param.name(),
                    min,
                    rule.unit,
                    prec = rule.decimals
                );
            }
        }
        Severity::Recommended => {
            info!("{} differs between devices (recommended to match): {}", rule.param.name(), listing);
        }
    }
}

/// Bank-wide configuration established once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct BankConfig {
    pub total_capacity_ah: f64,
    /// Minimum over all devices, published as `/Settings/ChargedVoltage`.
    pub charged_voltage: Option<f64>,
    /// Raw firmware word of the first device, mirrored on the aggregate.
    pub firmware_version: Option<u32>,
}

/// Sums capacities and checks consistency over `devices`.
pub async fn read_bank_config<R: CapacityReader>(
    reader: &R,
    devices: &[FoundDevice],
) -> Result<BankConfig, FatalError> {
    let mut total_capacity_ah = 0.0;
    let mut readable = 0usize;
    let mut configs = Vec::with_capacity(devices.len());

    for device in devices {
        match reader.read_config(device).await {
            Ok(config) => {
                match config.capacity_ah() {
                    Some(capacity) => {
                        total_capacity_ah += capacity;
                        readable += 1;
                    }
                    None => warn!("{}: capacity unreadable, excluded from the bank capacity", device.name),
                }
                configs.push((device.name.clone(), config));
            }
            Err(e) => warn!("{}: configuration unreadable: {e:#}", device.name),
        }
    }

    if readable == 0 {
        error!("Could not read the capacity of any of {} device(s)", devices.len());
        return Err(FatalError::CapacityUnreadable);
    }
    info!(
        "Total bank capacity {:.0}Ah from {}/{} device(s)",
        total_capacity_ah,
        readable,
        devices.len()
    );

    let mismatches = check_consistency(&configs);
    mismatches.iter().for_each(log_mismatch);

    let charged_voltage = configs
        .iter()
        .filter_map(|(_, config)| config.get(ConfigParam::ChargedVoltage))
        .reduce(f64::min);

    Ok(BankConfig {
        total_capacity_ah,
        charged_voltage,
        firmware_version: devices.first().and_then(|d| d.firmware_version),
    })
}

/// Enumerates the bank within the search budget, then reads its configuration.
pub async fn load_bank_config<B: DeviceBus, R: CapacityReader>(
    bus: &B,
    reader: &R,
    settings: &Settings,
) -> Result<BankConfig, FatalError> {
    for trial in 1..=settings.search_trials {
        let devices = match bus.list_candidates().await {
            Ok(candidates) => classify(&candidates, &settings.service_name, &settings.exclude),
            Err(e) => {
                warn!("Device enumeration failed: {e:#}");
                Vec::new()
            }
        };
        if !devices.is_empty() {
            info!("Found {} battery monitor(s) for the capacity read", devices.len());
            return read_bank_config(reader, &devices).await;
        }
        if trial < settings.search_trials {
            warn!(
                "No battery monitors found yet (trial {}/{}), retrying in {:?}",
                trial, settings.search_trials, settings.find_devices_interval
            );
            sleep(settings.find_devices_interval).await;
        }
    }
    Err(FatalError::NoDevicesFound {
        trials: settings.search_trials,
    })
}
