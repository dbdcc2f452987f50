//! Event loop of the service: discovery scans, control changes and single-flight aggregation passes.

use anyhow::Context;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bank_config::BankConfig;
use crate::bus_gateway::DeviceBus;
use crate::change_watcher::WatchTarget;
use crate::combiner::{fuse, PassContext};
use crate::discovery::{classify, Discovery};
use crate::error::FatalError;
use crate::estimator::RemainingTimeEstimator;
use crate::inclusion::{DeviceHandle, DeviceRegistry, InclusionPolicy};
use crate::persistence::SettingsStore;
use crate::publisher::{
    cleared_device_entries, device_entries, switch_state_path, Identity, PublishedStore, Value,
    CHARGED_VOLTAGE_PATH, COLD_POSITION_PATH, DISCOVERY_ENABLED_PATH, HOT_POSITION_PATH,
};
use crate::selector::{celsius_to_position, TemperatureThresholds};
use crate::settings::Settings;
use crate::snapshot::{AggregateResult, DeviceSnapshot, Field};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdBound {
    Cold,
    Hot,
}

/// Everything the orchestrator reacts to besides its own timers.
#[derive(Debug)]
pub enum Event {
    /// A watched path of a registered device changed.
    ValueChanged { instance: u32, path: String },
    SwitchToggled { switch_index: u16, enabled: bool },
    ThresholdPositionChanged { bound: ThresholdBound, position: u8 },
    DiscoveryEnabledChanged(bool),
    PassCompleted(PassReport),
}

/// Why a pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ValueChanged,
    DeviceSetChanged,
    ManualToggle,
    LogTick,
}

#[derive(Debug, Clone)]
pub struct DeviceReading {
    pub device: DeviceHandle,
    pub snapshot: DeviceSnapshot,
}

/// Reads of one pass, sent back to the loop by the pass task.
#[derive(Debug)]
pub struct PassReport {
    pub trigger: Trigger,
    pub result: anyhow::Result<Vec<DeviceReading>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassState {
    Idle,
    Running { trigger: Trigger, started: Instant },
}

/// Reads every device of a pass; any failing device fails the whole pass.
async fn read_devices<B: DeviceBus>(bus: &B, devices: Vec<DeviceHandle>) -> anyhow::Result<Vec<DeviceReading>> {
    let mut readings = Vec::with_capacity(devices.len());
    for device in devices {
        let values = bus
            .read_values(&device.address)
            .await
            .with_context(|| format!("reading {} ({})", device.name, device.address))?;
        readings.push(DeviceReading {
            snapshot: DeviceSnapshot::from_values(&values),
            device,
        });
    }
    Ok(readings)
}

pub struct UpdateOrchestrator<B> {
    bus: Arc<B>,
    settings: Settings,
    bank: BankConfig,
    registry: DeviceRegistry,
    discovery: Discovery,
    policy: InclusionPolicy,
    default_thresholds: TemperatureThresholds,
    thresholds: TemperatureThresholds,
    estimator: RemainingTimeEstimator,
    store: PublishedStore,
    persisted: SettingsStore,
    pass: PassState,
    log_pending: bool,
    /// Inclusion or membership changed under a running pass.
    rerun_pending: bool,
    log_started: bool,
    read_failures: u32,
    passes_completed: u64,
    next_scan: Instant,
    events: Sender<Event>,
    watch_targets: watch::Sender<Vec<WatchTarget>>,
}

impl<B: DeviceBus> UpdateOrchestrator<B> {
    /// Builds the orchestrator and publishes the identity and control paths.
    pub fn new(
        bus: Arc<B>,
        settings: Settings,
        bank: BankConfig,
        persisted: SettingsStore,
        store: PublishedStore,
        events: Sender<Event>,
    ) -> Self {
        let now = Instant::now();
        let default_thresholds = TemperatureThresholds::new(settings.temp_cold_danger, settings.temp_hot_danger);
        let saved = persisted.settings();
        let thresholds =
            TemperatureThresholds::from_positions(saved.cold_position, saved.hot_position, default_thresholds);
        let policy = InclusionPolicy {
            discovery_enabled: saved.discovery_enabled,
        };
        let discovery = Discovery::new(
            settings.find_devices_interval,
            settings.max_find_devices_interval,
            settings.search_trials,
            now,
        );
        let (watch_targets, _) = watch::channel(Vec::new());

        let identity = Identity {
            device_name: settings.device_name.clone(),
            firmware_version: bank.firmware_version,
        };
        let mut entries = identity.entries();
        entries.push((
            COLD_POSITION_PATH.to_string(),
            Value::Int(i64::from(saved.cold_position.unwrap_or_else(|| celsius_to_position(thresholds.cold)))),
        ));
        entries.push((
            HOT_POSITION_PATH.to_string(),
            Value::Int(i64::from(saved.hot_position.unwrap_or_else(|| celsius_to_position(thresholds.hot)))),
        ));
        entries.push((
            DISCOVERY_ENABLED_PATH.to_string(),
            Value::Int(i64::from(policy.discovery_enabled)),
        ));
        entries.push((
            CHARGED_VOLTAGE_PATH.to_string(),
            bank.charged_voltage.map_or(Value::Empty, Value::Float),
        ));
        store.commit(entries);

        info!(
            "Aggregating with {:.0}Ah total capacity, thresholds cold {:.1}C hot {:.1}C, discovery {}",
            bank.total_capacity_ah,
            thresholds.cold,
            thresholds.hot,
            if policy.discovery_enabled { "enabled" } else { "disabled" }
        );

        Self {
            bus,
            settings,
            bank,
            registry: DeviceRegistry::new(),
            discovery,
            policy,
            default_thresholds,
            thresholds,
            estimator: RemainingTimeEstimator::new(),
            store,
            persisted,
            pass: PassState::Idle,
            log_pending: false,
            rerun_pending: false,
            log_started: false,
            read_failures: 0,
            passes_completed: 0,
            next_scan: now,
            events,
            watch_targets,
        }
    }

    /// Devices the change watcher should poll.
    pub fn watch_targets(&self) -> watch::Receiver<Vec<WatchTarget>> {
        self.watch_targets.subscribe()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn thresholds(&self) -> TemperatureThresholds {
        self.thresholds
    }

    pub fn is_running(&self) -> bool {
        matches!(self.pass, PassState::Running { .. })
    }

    pub fn passes_completed(&self) -> u64 {
        self.passes_completed
    }

    /// One discovery tick. Returns the delay until the next one.
    pub async fn scan(&mut self) -> Result<Duration, FatalError> {
        if !self.policy.discovery_enabled {
            debug!("Discovery disabled, skipping scan");
            return Ok(self.discovery.interval());
        }

        let candidates = match self.bus.list_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Device enumeration failed: {e:#}");
                Vec::new()
            }
        };
        let found = classify(&candidates, &self.settings.service_name, &self.settings.exclude);
        let reconciled = self.registry.reconcile(&found, self.persisted.settings());

        if !reconciled.is_empty() {
            let entries = reconciled
                .removed
                .iter()
                .flat_map(cleared_device_entries)
                .chain(reconciled.added.iter().flat_map(device_entries));
            self.store.commit(entries);
            self.refresh_watch_targets();
        }

        let outcome = self.discovery.on_scan(&self.registry.instances(), Instant::now())?;
        if outcome.first_discovery {
            info!("First discovery: {} device(s)", self.registry.len());
            self.log_started = true;
        }
        if outcome.membership_changed && !self.registry.is_empty() {
            self.trigger(Trigger::DeviceSetChanged);
        }
        Ok(outcome.next_interval)
    }

    fn refresh_watch_targets(&self) {
        let next: Vec<WatchTarget> = self
            .registry
            .devices()
            .map(|device| WatchTarget {
                instance: device.instance,
                address: device.address.clone(),
            })
            .collect();
        self.watch_targets.send_if_modified(|targets| {
            if *targets == next {
                return false;
            }
            *targets = next;
            true
        });
    }

    /// Starts a pass unless one is running. Returns whether a pass was started.
    pub fn trigger(&mut self, trigger: Trigger) -> bool {
        if let PassState::Running { trigger: running, .. } = self.pass {
            match trigger {
                Trigger::LogTick => self.log_pending = true,
                Trigger::ManualToggle | Trigger::DeviceSetChanged => {
                    debug!("{trigger:?} during a {running:?} pass, rerunning once it completes");
                    self.rerun_pending = true;
                    return false;
                }
                Trigger::ValueChanged => {}
            }
            debug!("Dropping {trigger:?} trigger, {running:?} pass in progress");
            return false;
        }
        if !self.policy.discovery_enabled {
            debug!("Discovery disabled, keeping the last published values");
            return false;
        }

        let devices = self.registry.included(&self.policy);
        let bus = Arc::clone(&self.bus);
        let events = self.events.clone();
        self.pass = PassState::Running {
            trigger,
            started: Instant::now(),
        };
        tokio::spawn(async move {
            let result = read_devices(bus.as_ref(), devices).await;
            // the loop owns a sender too, so this only fails during shutdown
            let _ = events.send(Event::PassCompleted(PassReport { trigger, result })).await;
        });
        true
    }

    pub fn handle(&mut self, event: Event) -> Result<(), FatalError> {
        match event {
            Event::ValueChanged { instance, path } => {
                let included = self
                    .registry
                    .get(instance)
                    .is_some_and(|device| self.policy.is_included(device));
                if included {
                    debug!("{path} changed on device {instance}");
                    self.trigger(Trigger::ValueChanged);
                }
            }
            Event::SwitchToggled { switch_index, enabled } => self.toggle_device(switch_index, enabled),
            Event::ThresholdPositionChanged { bound, position } => self.set_threshold(bound, position),
            Event::DiscoveryEnabledChanged(enabled) => self.set_discovery_enabled(enabled),
            Event::PassCompleted(report) => return self.complete_pass(report),
        }
        Ok(())
    }

    fn toggle_device(&mut self, switch_index: u16, enabled: bool) {
        let Some(device) = self.registry.set_enabled(switch_index, enabled) else {
            warn!("Switch {switch_index} has no device");
            return;
        };
        info!(
            "Device {} (instance {}) {}",
            device.name,
            device.instance,
            if enabled { "enabled" } else { "disabled" }
        );
        let key = device.key();
        if let Err(e) = self.persisted.update(|s| s.set_device_enabled(&key, enabled)) {
            warn!("Could not persist switch {switch_index}: {e:#}");
        }
        self.store
            .commit([(switch_state_path(switch_index), Value::Int(i64::from(enabled)))]);
        self.trigger(Trigger::ManualToggle);
    }

    fn set_threshold(&mut self, bound: ThresholdBound, position: u8) {
        let saved = self.persisted.settings();
        let (cold, hot) = match bound {
            ThresholdBound::Cold => (Some(position), saved.hot_position),
            ThresholdBound::Hot => (saved.cold_position, Some(position)),
        };
        let thresholds = TemperatureThresholds::from_positions(cold, hot, self.default_thresholds);
        if thresholds.cold >= thresholds.hot {
            warn!(
                "Rejecting {bound:?} position {position}: cold {:.1}C would not be below hot {:.1}C",
                thresholds.cold, thresholds.hot
            );
            return;
        }
        info!(
            "Temperature thresholds now cold {:.1}C, hot {:.1}C",
            thresholds.cold, thresholds.hot
        );
        self.thresholds = thresholds;
        if let Err(e) = self.persisted.update(|s| {
            s.cold_position = cold;
            s.hot_position = hot;
        }) {
            warn!("Could not persist temperature thresholds: {e:#}");
        }
        let path = match bound {
            ThresholdBound::Cold => COLD_POSITION_PATH,
            ThresholdBound::Hot => HOT_POSITION_PATH,
        };
        self.store.commit([(path.to_string(), Value::Int(i64::from(position)))]);
        self.trigger(Trigger::ManualToggle);
    }

    fn set_discovery_enabled(&mut self, enabled: bool) {
        if self.policy.discovery_enabled == enabled {
            return;
        }
        info!("Discovery {}", if enabled { "enabled" } else { "disabled" });
        self.policy.discovery_enabled = enabled;
        if let Err(e) = self.persisted.update(|s| s.discovery_enabled = enabled) {
            warn!("Could not persist discovery gate: {e:#}");
        }
        self.store
            .commit([(DISCOVERY_ENABLED_PATH.to_string(), Value::Int(i64::from(enabled)))]);
        if enabled {
            self.next_scan = Instant::now();
            if !self.registry.is_empty() {
                self.trigger(Trigger::ManualToggle);
            }
        }
    }

    fn complete_pass(&mut self, report: PassReport) -> Result<(), FatalError> {
        if let PassState::Running { started, .. } = self.pass {
            debug!("{:?} pass finished in {:?}", report.trigger, started.elapsed());
        }
        self.pass = PassState::Idle;
        self.apply_report(report)?;
        if std::mem::take(&mut self.rerun_pending) {
            self.trigger(Trigger::ManualToggle);
        }
        Ok(())
    }

    fn apply_report(&mut self, report: PassReport) -> Result<(), FatalError> {
        if !self.policy.discovery_enabled {
            debug!("Discovery disabled during the pass, discarding its result");
            return Ok(());
        }
        let log_requested = report.trigger == Trigger::LogTick || std::mem::take(&mut self.log_pending);

        let readings = match report.result {
            Ok(readings) => readings,
            Err(e) => {
                self.read_failures += 1;
                warn!(
                    "Aggregation pass failed ({}/{}): {e:#}",
                    self.read_failures, self.settings.read_trials
                );
                if self.read_failures > self.settings.read_trials {
                    return Err(FatalError::ReadFailures {
                        failures: self.read_failures,
                    });
                }
                return Ok(());
            }
        };
        self.read_failures = 0;

        // devices disabled or gone while the pass was reading
        let readings: Vec<DeviceReading> = readings
            .into_iter()
            .filter(|reading| {
                self.registry
                    .get(reading.device.instance)
                    .is_some_and(|device| self.policy.is_included(device))
            })
            .collect();
        let snapshots: Vec<DeviceSnapshot> = readings.iter().map(|r| r.snapshot.clone()).collect();
        let context = PassContext {
            thresholds: self.thresholds,
            total_capacity_ah: self.bank.total_capacity_ah,
        };
        let result = fuse(&snapshots, &context, &mut self.estimator);
        self.store.commit(result.to_entries());
        self.passes_completed += 1;

        if log_requested {
            log_status(&result, &readings);
        }
        Ok(())
    }

    /// Runs until a fatal condition occurs.
    pub async fn run(mut self, mut events: Receiver<Event>) -> Result<(), FatalError> {
        let mut log_interval: Option<Interval> = None;
        loop {
            if self.log_started && log_interval.is_none() {
                if let Some(period) = self.settings.log_period {
                    let mut ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    log_interval = Some(ticker);
                }
            }

            tokio::select! {
                _ = sleep_until(self.next_scan) => {
                    let next = self.scan().await?;
                    self.next_scan = Instant::now() + next;
                }
                _ = next_log_tick(&mut log_interval) => {
                    self.trigger(Trigger::LogTick);
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event)?,
                    None => return Ok(()),
                },
            }
        }
    }
}

async fn next_log_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

fn show(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.decimals$}"))
}

fn log_status(result: &AggregateResult, readings: &[DeviceReading]) {
    info!(
        "Aggregate: {}V {}A SoC {}% TTG {}s from {} device(s)",
        show(result.voltage(), 2),
        show(result.get(Field::Current), 1),
        show(result.get(Field::Soc), 1),
        show(result.time_to_go(), 0),
        readings.len()
    );
    for reading in readings {
        info!(
            "  {} (instance {}): {}V {}A SoC {}%",
            reading.device.name,
            reading.device.instance,
            show(reading.snapshot.get(Field::Voltage), 2),
            show(reading.snapshot.get(Field::Current), 1),
            show(reading.snapshot.get(Field::Soc), 1)
        );
    }
}
