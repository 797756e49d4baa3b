// In-memory stand-ins for the platform seams, used by unit tests.

use crate::brightness::{DisplayControl, VcpChannel, VcpValue, VCP_BRIGHTNESS};
use crate::error::{Error, Result};
use crate::geometry::{Point, Rect};
use crate::idle::{
    ActiveDisposition, ActivitySnapshot, ActivitySource, ManagedMonitor, MonitorTransition,
    TransitionHandler,
};
use crate::monitor::{
    find_by_device_name, MonitorDirectory, MonitorIdentity, MonitorInfo, DEFAULT_DPI,
};
use crate::overlay::{OverlayWindows, WindowHandle};
use crate::worker::lock;
use oled_sleeper_shared::ManagedMonitorConfig;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Monitor `\\.\DISPLAY{n}` at 100% scaling; display 1 is primary.
pub fn monitor(hardware_id: &str, display_number: u32, bounds: Rect) -> MonitorInfo {
    MonitorInfo {
        identity: MonitorIdentity {
            hardware_id: hardware_id.to_string(),
            device_name: format!(r"\\.\DISPLAY{}", display_number),
            display_number,
            is_primary: display_number == 1,
            dpi: DEFAULT_DPI,
        },
        bounds,
        ddc_ci: None,
    }
}

/// Managed blackout config with every trigger on.
pub fn managed_config(hardware_id: &str, threshold: Duration) -> ManagedMonitorConfig {
    ManagedMonitorConfig {
        is_managed: true,
        idle_threshold_ms: threshold.as_millis() as u64,
        ..ManagedMonitorConfig::new(hardware_id)
    }
}

pub fn managed(hardware_id: &str, bounds: Rect, threshold: Duration) -> ManagedMonitor {
    ManagedMonitor {
        hardware_id: hardware_id.to_string(),
        bounds,
        dpi: DEFAULT_DPI,
        ddc_ci: false,
        config: managed_config(hardware_id, threshold),
    }
}

/// No input for an hour, cursor off every monitor, no foreground window.
pub fn quiet_snapshot() -> ActivitySnapshot {
    ActivitySnapshot {
        system_idle: Duration::from_secs(3600),
        cursor: Some(Point::new(-100_000, -100_000)),
        foreground: None,
    }
}

#[derive(Default)]
struct ListingGate {
    closed: bool,
    waiting: usize,
}

#[derive(Default)]
pub struct FakeDirectory {
    monitors: Mutex<Vec<MonitorInfo>>,
    ddc_support: Mutex<HashMap<String, bool>>,
    probes: Mutex<HashMap<String, usize>>,
    listings: AtomicUsize,
    gate: Mutex<ListingGate>,
    gate_changed: Condvar,
}

impl FakeDirectory {
    pub fn new(monitors: Vec<MonitorInfo>) -> Self {
        Self {
            monitors: Mutex::new(monitors),
            ..Self::default()
        }
    }

    pub fn unplug(&self, hardware_id: &str) {
        lock(&self.monitors).retain(|m| m.hardware_id() != hardware_id);
    }

    pub fn plug(&self, monitor: MonitorInfo) {
        let mut monitors = lock(&self.monitors);
        monitors.retain(|m| m.hardware_id() != monitor.hardware_id());
        monitors.push(monitor);
    }

    pub fn set_bounds(&self, hardware_id: &str, bounds: Rect) {
        for m in lock(&self.monitors).iter_mut().filter(|m| m.hardware_id() == hardware_id) {
            m.bounds = bounds;
        }
    }

    pub fn set_ddc_support(&self, hardware_id: &str, supported: bool) {
        lock(&self.ddc_support).insert(hardware_id.to_string(), supported);
    }

    pub fn probe_count(&self, hardware_id: &str) -> usize {
        lock(&self.probes).get(hardware_id).copied().unwrap_or(0)
    }

    pub fn list_calls(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    /// Make `list_monitors` block until `release_listing`.
    pub fn hold_listing(&self) {
        lock(&self.gate).closed = true;
    }

    /// Wait until some thread is blocked in `list_monitors`.
    pub fn wait_for_held_listing(&self) {
        let gate = lock(&self.gate);
        let _gate = self
            .gate_changed
            .wait_while(gate, |g| g.waiting == 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn release_listing(&self) {
        lock(&self.gate).closed = false;
        self.gate_changed.notify_all();
    }
}

impl MonitorDirectory for FakeDirectory {
    fn list_monitors(&self) -> Vec<MonitorInfo> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        let mut gate = lock(&self.gate);
        if gate.closed {
            gate.waiting += 1;
            self.gate_changed.notify_all();
            gate = self
                .gate_changed
                .wait_while(gate, |g| g.closed)
                .unwrap_or_else(PoisonError::into_inner);
            gate.waiting -= 1;
        }
        drop(gate);
        lock(&self.monitors).clone()
    }

    fn probe_ddc_ci_support(&self, identity: &MonitorIdentity) -> bool {
        *lock(&self.probes).entry(identity.hardware_id.clone()).or_default() += 1;
        lock(&self.ddc_support)
            .get(&identity.hardware_id)
            .copied()
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct DdcState {
    values: Mutex<HashMap<String, VcpValue>>,
    failing_reads: Mutex<HashSet<String>>,
    failing_writes: Mutex<HashSet<String>>,
    open: AtomicUsize,
}

/// Brightness registers per hardware id, reached through the directory's
/// current device names the same way the real control is.
pub struct FakeDisplayControl {
    directory: Arc<FakeDirectory>,
    state: Arc<DdcState>,
}

impl FakeDisplayControl {
    pub fn new(directory: Arc<FakeDirectory>) -> Self {
        Self {
            directory,
            state: Arc::new(DdcState::default()),
        }
    }

    pub fn set_brightness(&self, hardware_id: &str, current: u32, maximum: u32) {
        lock(&self.state.values).insert(hardware_id.to_string(), VcpValue { current, maximum });
    }

    pub fn brightness(&self, hardware_id: &str) -> Option<u32> {
        lock(&self.state.values).get(hardware_id).map(|v| v.current)
    }

    pub fn fail_reads(&self, hardware_id: &str, fail: bool) {
        toggle(&self.state.failing_reads, hardware_id, fail);
    }

    pub fn fail_writes(&self, hardware_id: &str, fail: bool) {
        toggle(&self.state.failing_writes, hardware_id, fail);
    }

    pub fn open_handles(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }
}

fn toggle(set: &Mutex<HashSet<String>>, hardware_id: &str, on: bool) {
    let mut set = lock(set);
    if on {
        set.insert(hardware_id.to_string());
    } else {
        set.remove(hardware_id);
    }
}

impl DisplayControl for FakeDisplayControl {
    fn open(&self, device_name: &str) -> Result<Box<dyn VcpChannel>> {
        let monitors = self.directory.list_monitors();
        let monitor = find_by_device_name(&monitors, device_name)
            .ok_or_else(|| Error::NoPhysicalMonitor(device_name.to_string()))?;
        self.state.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChannel {
            hardware_id: monitor.hardware_id().to_string(),
            device_name: device_name.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct FakeChannel {
    hardware_id: String,
    device_name: String,
    state: Arc<DdcState>,
}

impl FakeChannel {
    fn failure(&self, operation: &'static str, code: u8) -> Error {
        Error::Vcp {
            operation,
            code,
            device: self.device_name.clone(),
        }
    }
}

impl VcpChannel for FakeChannel {
    fn read(&mut self, code: u8) -> Result<VcpValue> {
        if code != VCP_BRIGHTNESS || lock(&self.state.failing_reads).contains(&self.hardware_id) {
            return Err(self.failure("read", code));
        }
        Ok(lock(&self.state.values)
            .get(&self.hardware_id)
            .copied()
            .unwrap_or(VcpValue {
                current: 100,
                maximum: 100,
            }))
    }

    fn write(&mut self, code: u8, value: u32) -> Result<()> {
        if code != VCP_BRIGHTNESS || lock(&self.state.failing_writes).contains(&self.hardware_id) {
            return Err(self.failure("write", code));
        }
        lock(&self.state.values)
            .entry(self.hardware_id.clone())
            .or_insert(VcpValue {
                current: 100,
                maximum: 100,
            })
            .current = value;
        Ok(())
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.state.open.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeOverlayWindows {
    next: AtomicIsize,
    live: Mutex<HashMap<WindowHandle, Rect>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    failing: AtomicBool,
}

impl Default for FakeOverlayWindows {
    fn default() -> Self {
        Self {
            next: AtomicIsize::new(0x1000),
            live: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }
}

impl FakeOverlayWindows {
    pub fn live(&self) -> usize {
        lock(&self.live).len()
    }

    pub fn live_bounds(&self) -> Vec<Rect> {
        lock(&self.live).values().copied().collect()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

impl OverlayWindows for FakeOverlayWindows {
    fn create(&self, bounds: Rect, _dpi: u32) -> Result<WindowHandle> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Overlay("window creation refused".to_string()));
        }
        let handle = WindowHandle(self.next.fetch_add(1, Ordering::SeqCst));
        lock(&self.live).insert(handle, bounds);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn destroy(&self, handle: WindowHandle) {
        if lock(&self.live).remove(&handle).is_some() {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Returns a fixed snapshot, optionally failing the next few reads.
pub struct ScriptedSource {
    snapshot: ActivitySnapshot,
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(snapshot: ActivitySnapshot) -> Self {
        Self {
            snapshot,
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ActivitySource for ScriptedSource {
    fn snapshot(&self) -> Result<ActivitySnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::ActivityState("scripted failure".to_string()));
        }
        Ok(self.snapshot)
    }
}

#[derive(Debug, Clone)]
pub enum HandlerEvent {
    Idle(MonitorTransition),
    Active(MonitorTransition),
    Released(String),
}

impl HandlerEvent {
    pub fn hardware_id(&self) -> &str {
        match self {
            HandlerEvent::Idle(t) | HandlerEvent::Active(t) => &t.monitor.hardware_id,
            HandlerEvent::Released(id) => id,
        }
    }
}

#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<HandlerEvent>>,
    pub ignore_active: AtomicBool,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<HandlerEvent> {
        lock(&self.events).clone()
    }

    pub fn idle_count(&self, hardware_id: &str) -> usize {
        self.count(hardware_id, |e| matches!(e, HandlerEvent::Idle(_)))
    }

    pub fn active_count(&self, hardware_id: &str) -> usize {
        self.count(hardware_id, |e| matches!(e, HandlerEvent::Active(_)))
    }

    fn count(&self, hardware_id: &str, kind: impl Fn(&HandlerEvent) -> bool) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.hardware_id() == hardware_id && kind(e))
            .count()
    }
}

impl TransitionHandler for RecordingHandler {
    fn monitor_became_idle(&self, transition: &MonitorTransition) {
        lock(&self.events).push(HandlerEvent::Idle(transition.clone()));
    }

    fn monitor_became_active(&self, transition: &MonitorTransition) -> ActiveDisposition {
        lock(&self.events).push(HandlerEvent::Active(transition.clone()));
        if self.ignore_active.load(Ordering::SeqCst) {
            ActiveDisposition::Ignore
        } else {
            ActiveDisposition::Accept
        }
    }

    fn monitor_released(&self, monitor: &ManagedMonitor) {
        lock(&self.events).push(HandlerEvent::Released(monitor.hardware_id.clone()));
    }
}
