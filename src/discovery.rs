//! Device classification and the discovery polling state machine.

use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::FatalError;
use crate::settings::DeviceSelector;

pub const BATTERY_SERVICE_PREFIX: &str = "com.victronenergy.battery";
pub const SMARTSHUNT_PRODUCT_ID: u32 = 0xA389;

/// How long the found set must stay unchanged before the interval doubles.
pub const STABILITY_WINDOW: Duration = Duration::from_secs(30);

/// One service as listed by the bus gateway.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub address: String,
    #[serde(default)]
    pub product_id: Option<u32>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub device_instance: Option<u32>,
    #[serde(default)]
    pub firmware_version: Option<u32>,
    /// Modbus unit serving the device's configuration registers.
    #[serde(default)]
    pub unit_id: Option<u8>,
}

impl Candidate {
    /// Custom name, else product name, else the bus address.
    pub fn display_name(&self) -> String {
        self.custom_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or(self.product_name.as_deref())
            .unwrap_or(&self.address)
            .to_string()
    }

    pub fn is_battery_monitor(&self) -> bool {
        self.address.starts_with(BATTERY_SERVICE_PREFIX)
            && (self.product_id == Some(SMARTSHUNT_PRODUCT_ID)
                || self
                    .product_name
                    .as_deref()
                    .is_some_and(|name| name.contains("SmartShunt")))
    }
}

/// A classified, non-excluded battery monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct FoundDevice {
    pub instance: u32,
    pub name: String,
    pub address: String,
    pub product_id: Option<u32>,
    pub product_name: Option<String>,
    pub firmware_version: Option<u32>,
    pub unit_id: Option<u8>,
}

/// Keeps the battery monitors among `candidates`, dropping our own service and excluded devices.
pub fn classify(candidates: &[Candidate], own_service: &str, exclude: &[DeviceSelector]) -> Vec<FoundDevice> {
    let mut found = Vec::new();
    for candidate in candidates {
        if candidate.address == own_service || !candidate.is_battery_monitor() {
            continue;
        }
        let Some(instance) = candidate.device_instance else {
            debug!("Skipping {}: no device instance", candidate.address);
            continue;
        };
        let name = candidate.display_name();
        // names only exclude by the user-set custom name
        let custom_name = candidate.custom_name.as_deref().filter(|n| !n.is_empty());
        if exclude.iter().any(|selector| selector.matches(Some(instance), custom_name)) {
            debug!("Skipping excluded device {name} (instance {instance})");
            continue;
        }
        found.push(FoundDevice {
            instance,
            name,
            address: candidate.address.clone(),
            product_id: candidate.product_id,
            product_name: candidate.product_name.clone(),
            firmware_version: candidate.firmware_version,
            unit_id: candidate.unit_id,
        });
    }
    found.sort_by_key(|device| device.instance);
    found
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Searching,
    StableBackoff,
    Failed,
}

/// What the caller should do after a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub next_interval: Duration,
    pub membership_changed: bool,
    /// First scan of the process that found anything.
    pub first_discovery: bool,
}

#[derive(Debug)]
pub struct Discovery {
    initial_interval: Duration,
    max_interval: Duration,
    search_trials: u32,
    interval: Duration,
    stable_since: Instant,
    trials: u32,
    previous: BTreeSet<u32>,
    phase: Phase,
    ever_found: bool,
}

impl Discovery {
    pub fn new(initial_interval: Duration, max_interval: Duration, search_trials: u32, now: Instant) -> Self {
        Self {
            initial_interval,
            max_interval: max_interval.max(initial_interval),
            search_trials,
            interval: initial_interval,
            stable_since: now,
            trials: 0,
            previous: BTreeSet::new(),
            phase: Phase::Searching,
            ever_found: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn trials(&self) -> u32 {
        self.trials
    }

    /// Feeds the instances found by one scan.
    ///
    /// Fails once `search_trials` consecutive scans found nothing.
    pub fn on_scan(&mut self, found: &BTreeSet<u32>, now: Instant) -> Result<ScanOutcome, FatalError> {
        let membership_changed = *found != self.previous;
        if membership_changed {
            self.previous.clone_from(found);
            self.interval = self.initial_interval;
            self.stable_since = now;
            self.phase = Phase::Searching;
        }

        if found.is_empty() {
            self.trials += 1;
            if self.trials >= self.search_trials {
                self.phase = Phase::Failed;
                return Err(FatalError::NoDevicesFound { trials: self.trials });
            }
            warn!(
                "No battery monitors found (trial {}/{}), retrying in {:?}",
                self.trials, self.search_trials, self.initial_interval
            );
            self.interval = self.initial_interval;
            return Ok(ScanOutcome {
                next_interval: self.interval,
                membership_changed,
                first_discovery: false,
            });
        }

        self.trials = 0;
        let first_discovery = !self.ever_found;
        self.ever_found = true;

        if membership_changed {
            info!("Device set changed: {} device(s) {:?}", found.len(), found);
        } else if now.duration_since(self.stable_since) >= STABILITY_WINDOW {
            let doubled = (self.interval * 2).min(self.max_interval);
            if doubled != self.interval {
                debug!("Device set stable, discovery interval {:?} -> {:?}", self.interval, doubled);
            }
            self.interval = doubled;
            self.stable_since = now;
            self.phase = Phase::StableBackoff;
        }

        Ok(ScanOutcome {
            next_interval: self.interval,
            membership_changed,
            first_discovery,
        })
    }
}
