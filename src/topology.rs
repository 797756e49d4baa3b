// Monitor hot-plug detection by polling the directory and diffing snapshots.

use crate::error::Result;
use crate::monitor::{same_topology, MonitorDirectory, MonitorInfo};
use crate::worker::{lock, CancelToken, Worker};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub const TOPOLOGY_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Connect/disconnect delta between two snapshots.
#[derive(Debug, Clone)]
pub struct TopologyChange {
    pub previous: Vec<MonitorInfo>,
    pub current: Vec<MonitorInfo>,
}

impl TopologyChange {
    pub fn connected(&self) -> impl Iterator<Item = &MonitorInfo> {
        self.current
            .iter()
            .filter(|m| !self.previous.iter().any(|p| p.hardware_id() == m.hardware_id()))
    }

    pub fn disconnected(&self) -> impl Iterator<Item = &MonitorInfo> {
        self.previous
            .iter()
            .filter(|p| !self.current.iter().any(|m| m.hardware_id() == p.hardware_id()))
    }
}

pub trait TopologyListener: Send + Sync {
    /// The set of connected monitors changed. The first call after `start`
    /// has an empty `previous`.
    fn topology_changed(&self, change: &TopologyChange);

    /// Same monitors, but bounds, DPI or device names moved.
    fn layout_changed(&self, _monitors: &[MonitorInfo]) {}
}

struct Snapshot {
    monitors: Vec<MonitorInfo>,
    /// DDC/CI probe results, kept for the whole session
    capabilities: HashMap<String, bool>,
}

struct Shared {
    directory: Arc<dyn MonitorDirectory>,
    listener: Weak<dyn TopologyListener>,
    snapshot: Mutex<Snapshot>,
    refreshing: AtomicBool,
    /// Between `start` and `stop`; refreshes outside it do nothing
    running: AtomicBool,
}

pub struct TopologyWatcher {
    shared: Arc<Shared>,
    interval: Duration,
    /// Held across the whole of `start` and `stop`
    worker: Mutex<Option<Worker>>,
}

impl TopologyWatcher {
    pub fn new(
        directory: Arc<dyn MonitorDirectory>,
        listener: Weak<dyn TopologyListener>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                directory,
                listener,
                snapshot: Mutex::new(Snapshot {
                    monitors: Vec::new(),
                    capabilities: HashMap::new(),
                }),
                refreshing: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            interval: TOPOLOGY_POLL_INTERVAL,
            worker: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Take the initial snapshot, report it, then poll in the background.
    /// Does nothing if already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.refresh(true, None);

        let shared = self.shared.clone();
        *worker = Some(Worker::spawn(
            "topology-watcher",
            self.interval,
            move |token| {
                shared.refresh(false, Some(token));
            },
        )?);
        info!("Topology watcher started");
        Ok(())
    }

    /// Idempotent; may be called from any thread, including the listener.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.stop();
            info!("Topology watcher stopped");
        }
    }

    /// Re-check now, outside the polling cadence. Returns `false` when a
    /// refresh was already in flight, nothing changed, or the watcher is
    /// stopped.
    pub fn refresh(&self) -> bool {
        self.shared.refresh(false, None)
    }

    pub fn snapshot(&self) -> Vec<MonitorInfo> {
        lock(&self.shared.snapshot).monitors.clone()
    }
}

impl Drop for TopologyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Shared {
    fn refresh(&self, initial: bool, token: Option<&CancelToken>) -> bool {
        if self.stopped(token) {
            return false;
        }
        if self.refreshing.swap(true, Ordering::SeqCst) {
            debug!("Topology refresh already in flight, skipping");
            return false;
        }
        let _in_flight = InFlight(&self.refreshing);

        let listed = self.directory.list_monitors();

        let previous = {
            let mut snapshot = lock(&self.snapshot);
            if !initial && same_topology(&snapshot.monitors, &listed) {
                let layout = carry_capabilities(&listed, &snapshot.capabilities);
                let moved = layout != snapshot.monitors;
                if moved {
                    snapshot.monitors = layout.clone();
                }
                drop(snapshot);
                if moved {
                    debug!("Monitor layout changed");
                    if let Some(listener) = self.listener.upgrade() {
                        listener.layout_changed(&layout);
                    }
                }
                return false;
            }
            if initial {
                Vec::new()
            } else {
                snapshot.monitors.clone()
            }
        };

        let current = self.enrich(listed);
        if self.stopped(token) {
            debug!("Topology watcher stopped during refresh, dropping result");
            return false;
        }
        lock(&self.snapshot).monitors = current.clone();

        let change = TopologyChange { previous, current };
        for m in change.connected() {
            info!(
                "Monitor connected: {} ({}, DDC/CI {})",
                m.hardware_id(),
                m.identity.device_name,
                if m.supports_ddc_ci() { "yes" } else { "no" }
            );
        }
        for m in change.disconnected() {
            info!("Monitor disconnected: {}", m.hardware_id());
        }

        if let Some(listener) = self.listener.upgrade() {
            listener.topology_changed(&change);
        }
        true
    }

    fn stopped(&self, token: Option<&CancelToken>) -> bool {
        !self.running.load(Ordering::SeqCst) || token.is_some_and(CancelToken::is_cancelled)
    }

    /// Fill in DDC/CI support, probing only monitors not seen this session.
    fn enrich(&self, listed: Vec<MonitorInfo>) -> Vec<MonitorInfo> {
        let mut monitors = carry_capabilities(&listed, &lock(&self.snapshot).capabilities);
        for monitor in monitors.iter_mut().filter(|m| m.ddc_ci.is_none()) {
            let supported = self.directory.probe_ddc_ci_support(&monitor.identity);
            debug!("DDC/CI probe for {}: {}", monitor.hardware_id(), supported);
            monitor.ddc_ci = Some(supported);
            lock(&self.snapshot)
                .capabilities
                .insert(monitor.identity.hardware_id.clone(), supported);
        }
        monitors
    }
}

fn carry_capabilities(
    listed: &[MonitorInfo],
    capabilities: &HashMap<String, bool>,
) -> Vec<MonitorInfo> {
    listed
        .iter()
        .cloned()
        .map(|mut m| {
            if let Some(supported) = capabilities.get(m.hardware_id()) {
                m.ddc_ci = Some(*supported);
            }
            m
        })
        .collect()
}
