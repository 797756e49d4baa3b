// Monitor identity and the directory that enumerates connected monitors.

use crate::geometry::Rect;
use serde::Serialize;
use std::collections::HashSet;

/// DPI Windows treats as 100% scaling.
pub const DEFAULT_DPI: u32 = 96;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MonitorIdentity {
    /// Stable across reboots and driver re-enumeration; the key for settings,
    /// timers, overlays and the brightness ledger.
    pub hardware_id: String,
    /// Session-local device name such as `\\.\DISPLAY2`. May change on
    /// hot-plug, so it is only ever used for the API call at hand.
    pub device_name: String,
    pub display_number: u32,
    pub is_primary: bool,
    pub dpi: u32,
}

impl MonitorIdentity {
    pub fn scale_percent(&self) -> u32 {
        self.dpi * 100 / DEFAULT_DPI
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorInfo {
    #[serde(flatten)]
    pub identity: MonitorIdentity,
    pub bounds: Rect,
    /// DDC/CI support. `None` until probed.
    pub ddc_ci: Option<bool>,
}

impl MonitorInfo {
    pub fn hardware_id(&self) -> &str {
        &self.identity.hardware_id
    }

    pub fn supports_ddc_ci(&self) -> bool {
        self.ddc_ci.unwrap_or(false)
    }
}

/// Enumeration of connected monitors.
pub trait MonitorDirectory: Send + Sync {
    /// Basic info for every connected monitor, without capability probing.
    /// Cheap enough to call on every topology poll.
    fn list_monitors(&self) -> Vec<MonitorInfo>;

    /// Live DDC/CI capabilities query. Any per-monitor failure reads as
    /// "unsupported".
    fn probe_ddc_ci_support(&self, identity: &MonitorIdentity) -> bool;
}

pub fn find_by_hardware_id<'a>(
    monitors: &'a [MonitorInfo],
    hardware_id: &str,
) -> Option<&'a MonitorInfo> {
    monitors.iter().find(|m| m.identity.hardware_id == hardware_id)
}

/// Exact device-name match. Enumeration order is not stable between calls,
/// so position in a previous list must never be used instead.
pub fn find_by_device_name<'a>(
    monitors: &'a [MonitorInfo],
    device_name: &str,
) -> Option<&'a MonitorInfo> {
    monitors.iter().find(|m| m.identity.device_name == device_name)
}

/// Two snapshots describe the same topology when they hold the same number of
/// monitors with the same hardware ids. Geometry and DPI are ignored.
pub fn same_topology(a: &[MonitorInfo], b: &[MonitorInfo]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let ids: HashSet<&str> = a.iter().map(MonitorInfo::hardware_id).collect();
    b.iter().all(|m| ids.contains(m.hardware_id()))
}

/// Trailing ordinal of a device name: `\\.\DISPLAY12` -> 12. Zero when the
/// name carries no number.
pub fn parse_display_number(device_name: &str) -> u32 {
    let digits_start = device_name
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);
    digits_start
        .and_then(|start| device_name[start..].parse().ok())
        .unwrap_or(0)
}
