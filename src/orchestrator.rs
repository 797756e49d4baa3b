// Wires idle transitions to overlays and brightness, and keeps the engine's
// managed set in line with the connected monitors and the saved settings.

use crate::brightness::{BrightnessController, BrightnessLedger, DisplayControl};
use crate::error::Result;
use crate::geometry::Rect;
use crate::idle::{
    ActiveDisposition, ActivityReason, ActivitySource, IdleEngine, ManagedMonitor,
    MonitorTransition, TransitionHandler, IDLE_POLL_INTERVAL,
};
use crate::monitor::{find_by_hardware_id, MonitorDirectory, MonitorInfo};
use crate::overlay::{OverlayController, OverlayWindows};
use crate::topology::{TopologyChange, TopologyListener, TopologyWatcher, TOPOLOGY_POLL_INTERVAL};
use crate::worker::lock;
use log::{debug, info};
use oled_sleeper_shared::{Behavior, ManagedMonitorConfig, SettingsStore, Signal, Subscription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Side effects the orchestrator can apply to a monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ShowOverlay {
        hardware_id: String,
        bounds: Rect,
        dpi: u32,
    },
    HideOverlay {
        hardware_id: String,
    },
    Dim {
        hardware_id: String,
        level: u8,
    },
    Undim {
        hardware_id: String,
    },
}

impl Command {
    /// What to apply when `monitor` goes idle. `Dim` on a monitor without
    /// DDC/CI falls back to the overlay.
    pub fn for_idle(monitor: &ManagedMonitor) -> Command {
        match (monitor.config.behavior, monitor.ddc_ci) {
            (Behavior::Dim, true) => Command::Dim {
                hardware_id: monitor.hardware_id.clone(),
                level: monitor.config.dim_level,
            },
            (Behavior::Dim, false) => {
                debug!("{} has no DDC/CI, using blackout instead of dim", monitor.hardware_id);
                Command::show_overlay(monitor)
            }
            (Behavior::Blackout, _) => Command::show_overlay(monitor),
        }
    }

    fn show_overlay(monitor: &ManagedMonitor) -> Command {
        Command::ShowOverlay {
            hardware_id: monitor.hardware_id.clone(),
            bounds: monitor.bounds,
            dpi: monitor.dpi,
        }
    }

    /// Undo anything `for_idle` may have applied.
    pub fn for_release(hardware_id: &str) -> [Command; 2] {
        [
            Command::HideOverlay {
                hardware_id: hardware_id.to_string(),
            },
            Command::Undim {
                hardware_id: hardware_id.to_string(),
            },
        ]
    }
}

/// The overlay and brightness controllers behind one command dispatch.
pub struct Mitigations {
    overlays: OverlayController,
    brightness: BrightnessController,
}

impl Mitigations {
    pub fn new(overlays: OverlayController, brightness: BrightnessController) -> Self {
        Self { overlays, brightness }
    }

    pub fn overlays(&self) -> &OverlayController {
        &self.overlays
    }

    pub fn brightness(&self) -> &BrightnessController {
        &self.brightness
    }

    pub fn execute(&self, command: Command) {
        debug!("Executing {:?}", command);
        match command {
            Command::ShowOverlay {
                hardware_id,
                bounds,
                dpi,
            } => self.overlays.show(&hardware_id, bounds, dpi),
            Command::HideOverlay { hardware_id } => self.overlays.hide(&hardware_id),
            Command::Dim { hardware_id, level } => self.brightness.dim(&hardware_id, level),
            Command::Undim { hardware_id } => self.brightness.undim(&hardware_id),
        }
    }

    fn release(&self, hardware_id: &str) {
        for command in Command::for_release(hardware_id) {
            self.execute(command);
        }
    }

    /// Remove every overlay and put every dimmed monitor back.
    pub fn restore_all(&self) {
        self.overlays.hide_all();
        self.brightness.restore_all();
    }
}

impl TransitionHandler for Mitigations {
    fn monitor_became_idle(&self, transition: &MonitorTransition) {
        self.execute(Command::for_idle(&transition.monitor));
    }

    fn monitor_became_active(&self, transition: &MonitorTransition) -> ActiveDisposition {
        // our own overlay taking the foreground is not user activity
        if transition.reason == ActivityReason::ActiveWindow
            && transition
                .foreground
                .is_some_and(|window| self.overlays.is_overlay_window(window.handle))
        {
            return ActiveDisposition::Ignore;
        }
        self.release(&transition.monitor.hardware_id);
        ActiveDisposition::Accept
    }

    fn monitor_released(&self, monitor: &ManagedMonitor) {
        self.release(&monitor.hardware_id);
    }
}

/// OS-facing implementations the orchestrator runs on.
pub struct Platform {
    pub directory: Arc<dyn MonitorDirectory>,
    pub control: Arc<dyn DisplayControl>,
    pub overlays: Arc<dyn OverlayWindows>,
    pub activity: Arc<dyn ActivitySource>,
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub idle_poll: Duration,
    pub topology_poll: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            idle_poll: IDLE_POLL_INTERVAL,
            topology_poll: TOPOLOGY_POLL_INTERVAL,
        }
    }
}

/// Pairs each saved, managed config with its connected monitor.
pub fn managed_monitors(
    monitors: &[MonitorInfo],
    configs: &[ManagedMonitorConfig],
) -> Vec<ManagedMonitor> {
    configs
        .iter()
        .filter(|c| c.is_managed)
        .filter_map(|config| {
            find_by_hardware_id(monitors, &config.hardware_id)
                .map(|info| ManagedMonitor::new(info, config.clone()))
        })
        .collect()
}

pub struct Orchestrator {
    mitigations: Arc<Mitigations>,
    engine: IdleEngine,
    watcher: TopologyWatcher,
    settings: Arc<SettingsStore>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// Serialises rebuilding the managed set
    reconcile: Mutex<()>,
    started: AtomicBool,
    weak: Weak<Orchestrator>,
}

impl Orchestrator {
    /// Build the pipeline. `restore` is the restore-all signal owned by the
    /// application shell; the subscription lives as long as the orchestrator.
    pub fn new(
        platform: Platform,
        settings: Arc<SettingsStore>,
        ledger: BrightnessLedger,
        restore: &Signal<()>,
        timing: Timing,
    ) -> Arc<Self> {
        let Platform {
            directory,
            control,
            overlays,
            activity,
        } = platform;

        let orchestrator = Arc::new_cyclic(|weak: &Weak<Orchestrator>| {
            let mitigations = Arc::new(Mitigations::new(
                OverlayController::new(overlays),
                BrightnessController::new(directory.clone(), control, ledger),
            ));
            let engine =
                IdleEngine::new(activity, mitigations.clone()).with_interval(timing.idle_poll);
            let listener: Weak<dyn TopologyListener> = weak.clone();
            let watcher =
                TopologyWatcher::new(directory, listener).with_interval(timing.topology_poll);

            Self {
                mitigations,
                engine,
                watcher,
                settings,
                subscriptions: Mutex::new(Vec::new()),
                reconcile: Mutex::new(()),
                started: AtomicBool::new(false),
                weak: weak.clone(),
            }
        });

        let weak = Arc::downgrade(&orchestrator);
        let subscription = restore.subscribe(move |_| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.restore_all();
            }
        });
        lock(&orchestrator.subscriptions).push(subscription);
        orchestrator
    }

    /// Recover from an unclean shutdown, then start watching monitors,
    /// settings and activity. Does nothing the second time.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let recovered = self.mitigations.brightness().recover();
        if recovered > 0 {
            info!("Restored brightness of {} monitor(s) left dimmed by a previous run", recovered);
        }

        let weak = self.weak.clone();
        let subscription = self.settings.changed().subscribe(move |configs| {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.apply_settings(configs);
            }
        });
        lock(&self.subscriptions).push(subscription);

        self.watcher.start()?;
        self.engine.start()?;
        info!("OLED-Sleeper running");
        Ok(())
    }

    /// Rebuild the managed set from `configs` against the monitors connected now.
    pub fn apply_settings(&self, configs: &[ManagedMonitorConfig]) {
        info!("Settings changed, {} record(s)", configs.len());
        self.reconcile(&self.watcher.snapshot(), configs);
    }

    /// Re-enumerate monitors now, e.g. after a display-change broadcast.
    pub fn refresh_topology(&self) -> bool {
        self.watcher.refresh()
    }

    pub fn restore_all(&self) {
        info!("Restoring all monitors");
        self.mitigations.restore_all();
    }

    /// Stop the polling loops and put every monitor back. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        self.engine.stop();
        self.watcher.stop();
        lock(&self.subscriptions).clear();
        self.restore_all();
    }

    pub fn engine(&self) -> &IdleEngine {
        &self.engine
    }

    pub fn mitigations(&self) -> &Mitigations {
        &self.mitigations
    }

    pub fn monitors(&self) -> Vec<MonitorInfo> {
        self.watcher.snapshot()
    }

    fn reconcile(&self, monitors: &[MonitorInfo], configs: &[ManagedMonitorConfig]) {
        let _reconcile = lock(&self.reconcile);
        self.engine.update_settings(managed_monitors(monitors, configs));

        // ledger entries left by a monitor that was unplugged while dimmed
        let pending = self.mitigations.brightness().ledger().entries();
        if pending.keys().any(|id| find_by_hardware_id(monitors, id).is_some()) {
            self.mitigations.brightness().recover();
        }
    }
}

impl TopologyListener for Orchestrator {
    fn topology_changed(&self, change: &TopologyChange) {
        for monitor in change.disconnected() {
            self.mitigations.overlays().hide(monitor.hardware_id());
        }
        self.reconcile(&change.current, &self.settings.load());
    }

    fn layout_changed(&self, monitors: &[MonitorInfo]) {
        self.engine.update_layout(monitors);
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.engine.stop();
        self.watcher.stop();
    }
}
