use crate::signal::Signal;
use crate::store::{read_json, write_json, StoreError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

/// What happens to a monitor once it goes idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Behavior {
    /// Cover the monitor with an opaque black window
    #[default]
    Blackout,
    /// Lower hardware brightness over DDC/CI
    Dim,
}

/// Per-monitor settings, keyed by hardware id. Stored as one element of the
/// JSON array in `settings.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedMonitorConfig {
    pub hardware_id: String,
    #[serde(default)]
    pub is_managed: bool,
    #[serde(default)]
    pub behavior: Behavior,
    /// Brightness to dim to, as a percentage of the monitor's maximum
    #[serde(default = "default_dim_level")]
    pub dim_level: u8,
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
    #[serde(default = "default_true")]
    pub on_input: bool,
    #[serde(default = "default_true")]
    pub on_mouse_position: bool,
    #[serde(default = "default_true")]
    pub on_active_window: bool,
}

fn default_dim_level() -> u8 {
    10
}

fn default_idle_threshold_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl ManagedMonitorConfig {
    /// Unmanaged record with default settings for a monitor.
    pub fn new(hardware_id: impl Into<String>) -> Self {
        Self {
            hardware_id: hardware_id.into(),
            is_managed: false,
            behavior: Behavior::default(),
            dim_level: default_dim_level(),
            idle_threshold_ms: default_idle_threshold_ms(),
            on_input: true,
            on_mouse_position: true,
            on_active_window: true,
        }
    }

    pub fn has_any_trigger(&self) -> bool {
        self.on_input || self.on_mouse_position || self.on_active_window
    }
}

/// `settings.json` plus the notification fired after every successful save.
pub struct SettingsStore {
    path: PathBuf,
    changed: Signal<Vec<ManagedMonitorConfig>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl SettingsStore {
    pub fn in_dir(dir: &Path) -> Self {
        Self::at(dir.join("settings.json"))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = Mutex::new(modified_time(&path));
        Self {
            path,
            changed: Signal::new(),
            last_modified,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fired with the full configuration list after every save or detected edit.
    pub fn changed(&self) -> &Signal<Vec<ManagedMonitorConfig>> {
        &self.changed
    }

    /// Missing or unreadable settings read as an empty list.
    pub fn load(&self) -> Vec<ManagedMonitorConfig> {
        match read_json::<Vec<ManagedMonitorConfig>>(&self.path) {
            Ok(Some(configs)) => configs,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Ignoring settings: {}", e);
                Vec::new()
            }
        }
    }

    pub fn save(&self, configs: &[ManagedMonitorConfig]) -> Result<(), StoreError> {
        write_json(&self.path, configs)?;
        *self
            .last_modified
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = modified_time(&self.path);
        debug!("Saved {} monitor setting(s) to {}", configs.len(), self.path.display());
        self.changed.emit(&configs.to_vec());
        Ok(())
    }

    /// Insert or replace the record for `config.hardware_id` and save.
    pub fn upsert(&self, config: ManagedMonitorConfig) -> Result<(), StoreError> {
        let mut configs = self.load();
        match configs
            .iter_mut()
            .find(|c| c.hardware_id == config.hardware_id)
        {
            Some(existing) => *existing = config,
            None => configs.push(config),
        }
        self.save(&configs)
    }

    /// Drop the record for `hardware_id`. Returns whether one existed.
    pub fn remove(&self, hardware_id: &str) -> Result<bool, StoreError> {
        let mut configs = self.load();
        let before = configs.len();
        configs.retain(|c| c.hardware_id != hardware_id);
        if configs.len() == before {
            return Ok(false);
        }
        self.save(&configs)?;
        Ok(true)
    }

    /// Pick up edits made by another process. Emits the change signal and
    /// returns `true` when the file's modification time moved.
    pub fn reload_if_modified(&self) -> bool {
        let current = modified_time(&self.path);
        {
            let mut last = self
                .last_modified
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *last == current {
                return false;
            }
            *last = current;
        }
        debug!("Settings file {} changed on disk", self.path.display());
        self.changed.emit(&self.load());
        true
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
