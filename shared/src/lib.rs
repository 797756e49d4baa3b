// Persisted data model shared by the daemon and its command-line tools:
// per-monitor settings, the brightness ledger file and the change signal
// used to fan out notifications.

pub mod config;
pub mod signal;
pub mod state;
mod store;

pub use config::{Behavior, ManagedMonitorConfig, SettingsStore};
pub use signal::{Signal, Subscription};
pub use state::BrightnessStateFile;
pub use store::StoreError;

use std::path::PathBuf;

/// Directory holding `settings.json` and `brightness_state.json`.
pub fn app_dir() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("OLED-Sleeper")
}
