use anyhow::Context;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Control state that survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedSettings {
    pub discovery_enabled: bool,
    pub cold_position: Option<u8>,
    pub hot_position: Option<u8>,
    /// Stable device key -> manual enable flag.
    pub devices: BTreeMap<String, bool>,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            discovery_enabled: true,
            cold_position: None,
            hot_position: None,
            devices: BTreeMap::new(),
        }
    }
}

impl PersistedSettings {
    pub fn device_enabled(&self, key: &str) -> Option<bool> {
        self.devices.get(key).copied()
    }

    pub fn set_device_enabled(&mut self, key: &str, enabled: bool) {
        self.devices.insert(key.to_string(), enabled);
    }
}

/// JSON file backing [`PersistedSettings`].
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: PersistedSettings,
}

impl SettingsStore {
    /// Loads the file at `path`. A missing or unreadable file yields the defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match read_settings(&path) {
            Ok(Some(settings)) => {
                info!("Loaded persisted settings from {}", path.display());
                settings
            }
            Ok(None) => {
                info!("No persisted settings at {}, using defaults", path.display());
                PersistedSettings::default()
            }
            Err(e) => {
                warn!("Ignoring unreadable settings file {}: {e:#}", path.display());
                PersistedSettings::default()
            }
        };
        Self { path, current }
    }

    pub fn settings(&self) -> &PersistedSettings {
        &self.current
    }

    /// Applies `change` and rewrites the file if anything differs.
    pub fn update<F>(&mut self, change: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut PersistedSettings),
    {
        let mut next = self.current.clone();
        change(&mut next);
        if next == self.current {
            return Ok(());
        }
        self.current = next;
        self.save()
    }

    /// Writes to a sibling temp file, then renames it over the target.
    pub fn save(&self) -> anyhow::Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let body = serde_json::to_vec_pretty(&self.current)?;
        fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

fn read_settings(path: &Path) -> anyhow::Result<Option<PersistedSettings>> {
    let body = match fs::read(path) {
        Ok(body) => body,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    Ok(Some(serde_json::from_slice(&body)?))
}
