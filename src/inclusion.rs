//! Registry of discovered devices and the gate deciding which of them feed a pass.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::info;

use crate::discovery::FoundDevice;
use crate::persistence::PersistedSettings;

/// Identity and inclusion state of one discovered device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHandle {
    pub instance: u32,
    pub name: String,
    pub address: String,
    pub product_id: Option<u32>,
    pub product_name: Option<String>,
    pub firmware_version: Option<u32>,
    /// Manual override, persisted per device.
    pub enabled: bool,
    pub switch_index: u16,
}

impl DeviceHandle {
    pub fn key(&self) -> String {
        stable_key(&self.address)
    }
}

/// Persistence key of a device: its bus address with every non-alphanumeric character replaced by `_`.
pub fn stable_key(address: &str) -> String {
    address
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Outcome of applying one scan to the registry.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub added: Vec<DeviceHandle>,
    pub removed: Vec<DeviceHandle>,
}

impl Reconciled {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Present devices keyed by instance.
///
/// Switch indices come from a monotonic counter and stay bound to the physical device
/// (its stable key) for the life of the process, so a slot is never handed to another device.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u32, DeviceHandle>,
    switch_indices: HashMap<String, u16>,
    next_switch_index: u16,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the registry match the found set: new devices get a handle, vanished ones are removed.
    pub fn reconcile(&mut self, found: &[FoundDevice], persisted: &PersistedSettings) -> Reconciled {
        let mut reconciled = Reconciled::default();
        let present: BTreeSet<u32> = found.iter().map(|d| d.instance).collect();

        let gone: Vec<u32> = self
            .devices
            .keys()
            .filter(|instance| !present.contains(instance))
            .copied()
            .collect();
        for instance in gone {
            if let Some(handle) = self.devices.remove(&instance) {
                info!("Device {} ({}) disappeared", handle.name, handle.address);
                reconciled.removed.push(handle);
            }
        }

        for device in found {
            if let Some(existing) = self.devices.get_mut(&device.instance) {
                existing.name.clone_from(&device.name);
                existing.product_name.clone_from(&device.product_name);
                existing.firmware_version = device.firmware_version;
                continue;
            }
            let key = stable_key(&device.address);
            let switch_index = self.switch_index_for(&key);
            let handle = DeviceHandle {
                instance: device.instance,
                name: device.name.clone(),
                address: device.address.clone(),
                product_id: device.product_id,
                product_name: device.product_name.clone(),
                firmware_version: device.firmware_version,
                enabled: persisted.device_enabled(&key).unwrap_or(true),
                switch_index,
            };
            info!(
                "Device {} (instance {}) registered on switch {}, enabled={}",
                handle.name, handle.instance, handle.switch_index, handle.enabled
            );
            self.devices.insert(device.instance, handle.clone());
            reconciled.added.push(handle);
        }

        reconciled
    }

    fn switch_index_for(&mut self, key: &str) -> u16 {
        if let Some(index) = self.switch_indices.get(key) {
            return *index;
        }
        let index = self.next_switch_index;
        self.next_switch_index += 1;
        self.switch_indices.insert(key.to_string(), index);
        index
    }

    /// Sets the manual flag of the device on `switch_index`; `None` if no present device owns it.
    pub fn set_enabled(&mut self, switch_index: u16, enabled: bool) -> Option<&DeviceHandle> {
        let handle = self
            .devices
            .values_mut()
            .find(|handle| handle.switch_index == switch_index)?;
        handle.enabled = enabled;
        Some(handle)
    }

    pub fn get(&self, instance: u32) -> Option<&DeviceHandle> {
        self.devices.get(&instance)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.devices.values()
    }

    pub fn instances(&self) -> BTreeSet<u32> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices that feed the next pass, in instance order.
    pub fn included(&self, policy: &InclusionPolicy) -> Vec<DeviceHandle> {
        self.devices
            .values()
            .filter(|handle| policy.is_included(handle))
            .cloned()
            .collect()
    }
}

/// Global discovery gate combined with the per-device manual flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InclusionPolicy {
    pub discovery_enabled: bool,
}

impl InclusionPolicy {
    pub fn is_included(&self, device: &DeviceHandle) -> bool {
        self.discovery_enabled && device.enabled
    }
}
