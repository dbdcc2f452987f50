use crate::bus_gateway::DeviceBus;
use crate::orchestrator::Event;
use crate::snapshot::{DeviceValues, Field};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// A device whose watched paths are polled.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchTarget {
    pub instance: u32,
    pub address: String,
}

/// Polls the registered devices and reports changes of the watched paths as events.
pub struct ChangeWatcher<B> {
    bus: Arc<B>,
    targets: watch::Receiver<Vec<WatchTarget>>,
    events: Sender<Event>,
    period: Duration,
    last_seen: HashMap<u32, Vec<serde_json::Value>>,
}

impl<B: DeviceBus> ChangeWatcher<B> {
    pub fn new(
        bus: Arc<B>,
        targets: watch::Receiver<Vec<WatchTarget>>,
        events: Sender<Event>,
        period: Duration,
    ) -> Self {
        Self {
            bus,
            targets,
            events,
            period,
            last_seen: HashMap::new(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        info!("Starting change watcher, polling every {:?}", self.period);
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.poll_once().await {
                break;
            }
        }
        info!("Change watcher exiting");
    }

    /// Reads every target once. Returns `false` once nobody listens for events anymore.
    ///
    /// The first read of a device only records a baseline; registering it already triggered a pass.
    pub async fn poll_once(&mut self) -> bool {
        let targets = self.targets.borrow_and_update().clone();
        self.last_seen
            .retain(|instance, _| targets.iter().any(|t| t.instance == *instance));

        for target in targets {
            let values = match self.bus.read_values(&target.address).await {
                Ok(values) => values,
                Err(e) => {
                    debug!("Change watcher could not read {}: {e}", target.address);
                    continue;
                }
            };
            let current = watched_values(&values);
            let changed_path = match self.last_seen.get(&target.instance) {
                Some(previous) => first_difference(previous, &current),
                None => None,
            };
            self.last_seen.insert(target.instance, current);

            if let Some(path) = changed_path {
                let event = Event::ValueChanged {
                    instance: target.instance,
                    path: path.to_string(),
                };
                if self.events.send(event).await.is_err() {
                    return false;
                }
            }
        }
        !self.events.is_closed()
    }
}

fn watched_values(values: &DeviceValues) -> Vec<serde_json::Value> {
    Field::WATCHED
        .iter()
        .map(|field| values.get(field.path()).cloned().unwrap_or_default())
        .collect()
}

fn first_difference(previous: &[serde_json::Value], current: &[serde_json::Value]) -> Option<&'static str> {
    Field::WATCHED
        .iter()
        .zip(previous.iter().zip(current))
        .find(|(_, (before, after))| before != after)
        .map(|(field, _)| field.path())
}
