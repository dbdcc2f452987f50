//! In-memory store of every published path, plus the identity and per-device sub-records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::inclusion::DeviceHandle;

/// Product id the aggregate announces itself with (a SmartShunt).
pub const PRODUCT_ID: u32 = 0xA389;
pub const DEVICE_INSTANCE: u32 = 100;
pub const SERIAL: &str = "AGGREGATE01";

pub const DISCOVERY_ENABLED_PATH: &str = "/Settings/DiscoveryEnabled";
pub const COLD_POSITION_PATH: &str = "/Settings/ColdThresholdPosition";
pub const HOT_POSITION_PATH: &str = "/Settings/HotThresholdPosition";
pub const CHARGED_VOLTAGE_PATH: &str = "/Settings/ChargedVoltage";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    Int(i64),
    Text(String),
    /// Published but currently unknown.
    Empty,
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Text(_) | Value::Empty => None,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    fn optional_int(value: Option<u32>) -> Self {
        value.map_or(Value::Empty, |v| Value::Int(i64::from(v)))
    }
}

#[derive(Debug, Default)]
struct Published {
    values: HashMap<String, Value>,
    generation: u64,
}

/// Shared view of the published paths. Cloning shares the same store.
///
/// Every [`commit`](PublishedStore::commit) lands under one lock, so a reader never
/// observes half of an aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct PublishedStore {
    inner: Arc<Mutex<Published>>,
}

impl PublishedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Published> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies all entries atomically and bumps the generation once.
    pub fn commit<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut published = self.lock();
        for (path, value) in entries {
            published.values.insert(path, value);
        }
        published.generation += 1;
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.lock().values.get(path).cloned()
    }

    pub fn number(&self, path: &str) -> Option<f64> {
        self.lock().values.get(path).and_then(Value::as_f64)
    }

    /// Resolves every path under one lock, so all values come from the same commit.
    pub fn numbers(&self, paths: &[&str]) -> Vec<Option<f64>> {
        let published = self.lock();
        paths
            .iter()
            .map(|path| published.values.get(*path).and_then(Value::as_f64))
            .collect()
    }

    /// Number of commits so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }
}

/// Formats a raw `0xMMNN` firmware word, e.g. `0x419` as `v4.19`.
pub fn format_firmware(raw: u32) -> String {
    let major = (raw >> 8) & 0xFF;
    let minor = raw & 0xFF;
    format!("v{major}.{minor:x}")
}

/// Static identity of the aggregate device.
#[derive(Debug, Clone)]
pub struct Identity {
    pub device_name: String,
    pub firmware_version: Option<u32>,
}

impl Identity {
    pub fn entries(&self) -> Vec<(String, Value)> {
        let firmware = self
            .firmware_version
            .map_or_else(|| Value::text(env!("CARGO_PKG_VERSION")), |raw| Value::Text(format_firmware(raw)));
        vec![
            ("/Mgmt/ProcessName".into(), Value::text(env!("CARGO_PKG_NAME"))),
            ("/Mgmt/ProcessVersion".into(), Value::text(env!("CARGO_PKG_VERSION"))),
            ("/Mgmt/Connection".into(), Value::text("Virtual SmartShunt Aggregator")),
            ("/DeviceInstance".into(), Value::Int(i64::from(DEVICE_INSTANCE))),
            ("/ProductId".into(), Value::Int(i64::from(PRODUCT_ID))),
            ("/ProductName".into(), Value::text(&self.device_name)),
            ("/CustomName".into(), Value::text(&self.device_name)),
            ("/FirmwareVersion".into(), firmware),
            ("/Connected".into(), Value::Int(1)),
            ("/Serial".into(), Value::text(SERIAL)),
            ("/Settings/HasTemperature".into(), Value::Int(1)),
            ("/Settings/HasStarterVoltage".into(), Value::Int(0)),
            ("/Settings/HasMidVoltage".into(), Value::Int(0)),
        ]
    }
}

/// `/Devices/{instance}/*` and `/SwitchableOutput/{index}/*` for a present device.
pub fn device_entries(device: &DeviceHandle) -> Vec<(String, Value)> {
    let base = format!("/Devices/{}", device.instance);
    let switch = format!("/SwitchableOutput/{}", device.switch_index);
    vec![
        (format!("{base}/CustomName"), Value::text(&device.name)),
        (format!("{base}/DeviceInstance"), Value::Int(i64::from(device.instance))),
        (
            format!("{base}/FirmwareVersion"),
            device
                .firmware_version
                .map_or(Value::Empty, |raw| Value::Text(format_firmware(raw))),
        ),
        (format!("{base}/ProductId"), Value::optional_int(device.product_id)),
        (
            format!("{base}/ProductName"),
            device.product_name.as_deref().map_or(Value::Empty, Value::text),
        ),
        (format!("{base}/ServiceName"), Value::text(&device.address)),
        (format!("{switch}/Name"), Value::text(&device.name)),
        (format!("{switch}/State"), Value::Int(i64::from(device.enabled))),
        (format!("{switch}/DeviceInstance"), Value::Int(i64::from(device.instance))),
    ]
}

/// The same paths as [`device_entries`], all cleared.
pub fn cleared_device_entries(device: &DeviceHandle) -> Vec<(String, Value)> {
    device_entries(device)
        .into_iter()
        .map(|(path, _)| (path, Value::Empty))
        .collect()
}

pub fn switch_state_path(switch_index: u16) -> String {
    format!("/SwitchableOutput/{switch_index}/State")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> DeviceHandle {
        DeviceHandle {
            instance: 277,
            name: "House".into(),
            address: "com.victronenergy.battery.ttyS5".into(),
            product_id: Some(PRODUCT_ID),
            product_name: Some("SmartShunt 500A/50mV".into()),
            firmware_version: Some(0x419),
            enabled: true,
            switch_index: 2,
        }
    }

    #[test]
    fn test_format_firmware() {
        assert_eq!(format_firmware(0x419), "v4.19");
        assert_eq!(format_firmware(1049), "v4.19");
        assert_eq!(format_firmware(0x40a), "v4.a");
    }

    #[test]
    fn test_commit_is_one_generation() {
        let store = PublishedStore::new();
        assert_eq!(store.generation(), 0);
        store.commit(vec![
            ("/Dc/0/Voltage".to_string(), Value::Float(13.1)),
            ("/TimeToGo".to_string(), Value::Empty),
        ]);
        assert_eq!(store.generation(), 1);
        assert_eq!(store.number("/Dc/0/Voltage"), Some(13.1));
        assert_eq!(store.get("/TimeToGo"), Some(Value::Empty));
        assert_eq!(store.number("/TimeToGo"), None);
        assert_eq!(store.get("/Unknown"), None);
    }

    #[test]
    fn test_numbers_in_path_order() {
        let store = PublishedStore::new();
        store.commit(vec![
            ("/Dc/0/Current".to_string(), Value::Float(-8.0)),
            ("/Soc".to_string(), Value::Int(75)),
        ]);
        assert_eq!(
            store.numbers(&["/Soc", "/Unknown", "/Dc/0/Current"]),
            vec![Some(75.0), None, Some(-8.0)]
        );
    }

    #[test]
    fn test_clones_share_the_store() {
        let store = PublishedStore::new();
        let reader = store.clone();
        store.commit([("/Soc".to_string(), Value::Float(75.0))]);
        assert_eq!(reader.number("/Soc"), Some(75.0));
    }

    #[test]
    fn test_identity_entries() {
        let identity = Identity {
            device_name: "Bank".into(),
            firmware_version: Some(0x419),
        };
        let entries = identity.entries();
        assert!(entries.contains(&("/FirmwareVersion".to_string(), Value::text("v4.19"))));
        assert!(entries.contains(&("/ProductId".to_string(), Value::Int(0xA389))));
        assert!(entries.contains(&("/Serial".to_string(), Value::text("AGGREGATE01"))));
        assert!(entries.contains(&("/CustomName".to_string(), Value::text("Bank"))));
    }

    #[test]
    fn test_device_entries_and_clearing() {
        let store = PublishedStore::new();
        store.commit(device_entries(&handle()));
        assert_eq!(store.get("/Devices/277/FirmwareVersion"), Some(Value::text("v4.19")));
        assert_eq!(
            store.get("/Devices/277/ServiceName"),
            Some(Value::text("com.victronenergy.battery.ttyS5"))
        );
        assert_eq!(store.number(&switch_state_path(2)), Some(1.0));

        store.commit(cleared_device_entries(&handle()));
        assert_eq!(store.get("/Devices/277/CustomName"), Some(Value::Empty));
        assert_eq!(store.get("/SwitchableOutput/2/State"), Some(Value::Empty));
    }
}
