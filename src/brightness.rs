// Hardware brightness over DDC/CI, with a crash-safe ledger of the values
// to restore.
//
// Every operation re-resolves the monitor by hardware id and opens fresh
// physical-monitor handles; handles are never cached between calls because
// hot-plug and driver resets invalidate them. The handles are released when
// the channel is dropped, including on the error paths.

use crate::error::{Error, Result};
use crate::monitor::{find_by_hardware_id, MonitorDirectory};
use crate::worker::lock;
use log::{debug, info, warn};
use oled_sleeper_shared::BrightnessStateFile;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// VCP code for luminance.
pub const VCP_BRIGHTNESS: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpValue {
    pub current: u32,
    pub maximum: u32,
}

/// Open DDC/CI session with one monitor.
pub trait VcpChannel {
    fn read(&mut self, code: u8) -> Result<VcpValue>;
    fn write(&mut self, code: u8, value: u32) -> Result<()>;
}

pub trait DisplayControl: Send + Sync {
    /// Acquire physical-monitor handles for the display currently named
    /// `device_name`. Dropping the channel releases them.
    fn open(&self, device_name: &str) -> Result<Box<dyn VcpChannel>>;
}

/// `hardware_id -> original brightness` for every monitor currently dimmed.
/// Each mutation is written to disk before it returns.
pub struct BrightnessLedger {
    entries: Mutex<HashMap<String, u32>>,
    file: BrightnessStateFile,
}

impl BrightnessLedger {
    /// Load whatever a previous run left behind.
    pub fn load(file: BrightnessStateFile) -> Self {
        let entries = file.load_state();
        Self {
            entries: Mutex::new(entries),
            file,
        }
    }

    pub fn original(&self, hardware_id: &str) -> Option<u32> {
        lock(&self.entries).get(hardware_id).copied()
    }

    pub fn contains(&self, hardware_id: &str) -> bool {
        lock(&self.entries).contains_key(hardware_id)
    }

    pub fn entries(&self) -> HashMap<String, u32> {
        lock(&self.entries).clone()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Remember `original` unless an entry already exists. Returns whether a
    /// new entry was written. Nothing is kept if persisting fails.
    pub fn record(&self, hardware_id: &str, original: u32) -> Result<bool> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(hardware_id) {
            return Ok(false);
        }
        entries.insert(hardware_id.to_string(), original);
        if let Err(e) = self.file.save_state(&entries) {
            entries.remove(hardware_id);
            return Err(e.into());
        }
        Ok(true)
    }

    pub fn remove(&self, hardware_id: &str) -> Result<Option<u32>> {
        let mut entries = lock(&self.entries);
        let removed = entries.remove(hardware_id);
        if removed.is_some() {
            self.file.save_state(&entries)?;
        }
        Ok(removed)
    }
}

pub struct BrightnessController {
    directory: Arc<dyn MonitorDirectory>,
    control: Arc<dyn DisplayControl>,
    ledger: BrightnessLedger,
    /// Held across each dim, undim and recovery, from the ledger read to the
    /// ledger update, so the ledger always matches what the monitor shows.
    io: Mutex<()>,
}

impl BrightnessController {
    pub fn new(
        directory: Arc<dyn MonitorDirectory>,
        control: Arc<dyn DisplayControl>,
        ledger: BrightnessLedger,
    ) -> Self {
        Self {
            directory,
            control,
            ledger,
            io: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &BrightnessLedger {
        &self.ledger
    }

    /// Lower brightness to `level` percent of the monitor's maximum,
    /// remembering the current value first. Failures are logged, never raised.
    pub fn dim(&self, hardware_id: &str, level: u8) {
        let _io = lock(&self.io);
        match self.try_dim(hardware_id, level) {
            Ok(value) => info!("Dimmed {} to {} ({}%)", hardware_id, value, level),
            Err(e) => warn!("Could not dim {}: {}", hardware_id, e),
        }
    }

    /// Write back the value recorded by `dim` and forget it.
    pub fn undim(&self, hardware_id: &str) {
        let _io = lock(&self.io);
        let Some(original) = self.ledger.original(hardware_id) else {
            debug!("{} is not dimmed", hardware_id);
            return;
        };
        if self.write_brightness(hardware_id, original) {
            if let Err(e) = self.ledger.remove(hardware_id) {
                warn!(
                    "Restored {} but could not update brightness state: {}",
                    hardware_id, e
                );
            }
        }
    }

    /// Set brightness to `value` without consulting the ledger. Returns
    /// whether the write reached the monitor.
    pub fn restore_brightness(&self, hardware_id: &str, value: u32) -> bool {
        let _io = lock(&self.io);
        self.write_brightness(hardware_id, value)
    }

    /// Force-restore every ledger entry. Entries whose monitor is not
    /// connected stay in the ledger for a later attempt. Returns how many
    /// monitors were restored.
    pub fn recover(&self) -> usize {
        let pending = self.ledger.entries();
        if pending.is_empty() {
            return 0;
        }
        debug!(
            "Restoring {} monitor(s) found in brightness state",
            pending.len()
        );

        let mut restored = 0;
        for (hardware_id, original) in pending {
            let _io = lock(&self.io);
            // an undim may have got there first
            if self.ledger.original(&hardware_id) != Some(original) {
                continue;
            }
            if self.write_brightness(&hardware_id, original) {
                if let Err(e) = self.ledger.remove(&hardware_id) {
                    warn!("Could not update brightness state: {}", e);
                }
                restored += 1;
            }
        }
        restored
    }

    /// Undim everything currently in the ledger.
    pub fn restore_all(&self) {
        for hardware_id in self.ledger.entries().into_keys() {
            self.undim(&hardware_id);
        }
    }

    fn try_dim(&self, hardware_id: &str, level: u8) -> Result<u32> {
        let mut channel = self.open_channel(hardware_id)?;
        let current = channel.read(VCP_BRIGHTNESS)?;
        let target = level_to_value(level, current.maximum);

        let recorded = self.ledger.record(hardware_id, current.current)?;
        if let Err(e) = channel.write(VCP_BRIGHTNESS, target) {
            if recorded {
                self.ledger.remove(hardware_id)?;
            }
            return Err(e);
        }
        Ok(target)
    }

    /// Caller holds `io`.
    fn write_brightness(&self, hardware_id: &str, value: u32) -> bool {
        let result = self
            .open_channel(hardware_id)
            .and_then(|mut channel| channel.write(VCP_BRIGHTNESS, value));
        match result {
            Ok(()) => {
                info!("Restored brightness of {} to {}", hardware_id, value);
                true
            }
            Err(e) => {
                warn!("Could not restore brightness of {}: {}", hardware_id, e);
                false
            }
        }
    }

    fn open_channel(&self, hardware_id: &str) -> Result<Box<dyn VcpChannel>> {
        let monitors = self.directory.list_monitors();
        let monitor = find_by_hardware_id(&monitors, hardware_id)
            .ok_or_else(|| Error::MonitorNotFound(hardware_id.to_string()))?;
        self.control.open(&monitor.identity.device_name)
    }
}

/// Percentage of the monitor's range, rounded to the nearest step. The
/// maximum is whatever the monitor reports, so the product is taken in `u64`.
fn level_to_value(level: u8, maximum: u32) -> u32 {
    let maximum = if maximum == 0 { 100 } else { maximum };
    let value = (u64::from(level.min(100)) * u64::from(maximum) + 50) / 100;
    u32::try_from(value.min(u64::from(maximum))).unwrap_or(maximum)
}
