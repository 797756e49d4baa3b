//! Per-monitor idle detection.
//!
//! Each managed monitor runs its own state machine:
//!
//! ```text
//!   Active --(no activity)--> Counting --(threshold elapsed)--> Idle
//!     ^                          |                                |
//!     +------(activity)----------+                                |
//!     +------(activity, unless the handler ignores it)------------+
//! ```
//!
//! One polling thread reads a single [`ActivitySnapshot`] per tick (system
//! idle time, cursor, foreground window) and evaluates every monitor against
//! it under one lock, so all monitors see the same instant.

use crate::error::Result;
use crate::geometry::{Point, Rect};
use crate::monitor::{find_by_hardware_id, MonitorInfo};
use crate::overlay::WindowHandle;
use crate::worker::{lock, CancelToken, Worker};
use log::{debug, error, info};
use oled_sleeper_shared::ManagedMonitorConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Active,
    Counting,
    Idle,
}

/// Why a monitor counts as in use this tick. Evaluated in declaration
/// order; the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityReason {
    None,
    SystemInput,
    MousePosition,
    ActiveWindow,
}

impl fmt::Display for ActivityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityReason::None => "none",
            ActivityReason::SystemInput => "system input",
            ActivityReason::MousePosition => "mouse position",
            ActivityReason::ActiveWindow => "active window",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForegroundWindow {
    pub handle: WindowHandle,
    pub bounds: Rect,
}

/// System state read once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySnapshot {
    /// Time since the last keyboard or mouse input anywhere in the session
    pub system_idle: Duration,
    /// `None` while the cursor cannot be read, e.g. on the secure desktop
    pub cursor: Option<Point>,
    pub foreground: Option<ForegroundWindow>,
}

pub trait ActivitySource: Send + Sync {
    fn snapshot(&self) -> Result<ActivitySnapshot>;
}

/// A connected monitor the user chose to manage, with its settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedMonitor {
    pub hardware_id: String,
    pub bounds: Rect,
    pub dpi: u32,
    pub ddc_ci: bool,
    pub config: ManagedMonitorConfig,
}

impl ManagedMonitor {
    pub fn new(info: &MonitorInfo, config: ManagedMonitorConfig) -> Self {
        Self {
            hardware_id: info.identity.hardware_id.clone(),
            bounds: info.bounds,
            dpi: info.identity.dpi,
            ddc_ci: info.supports_ddc_ci(),
            config,
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.config.idle_threshold_ms)
    }
}

/// Payload of a became-idle / became-active notification.
#[derive(Debug, Clone)]
pub struct MonitorTransition {
    pub monitor: ManagedMonitor,
    pub reason: ActivityReason,
    pub foreground: Option<ForegroundWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveDisposition {
    Accept,
    /// Leave the monitor idle; the activity does not count.
    Ignore,
}

/// Receives transitions. Called on the polling thread while the engine lock
/// is held, so implementations must not call back into the engine.
pub trait TransitionHandler: Send + Sync {
    fn monitor_became_idle(&self, transition: &MonitorTransition);

    /// Raised before the monitor leaves `Idle`. Returning `Ignore` keeps it idle.
    fn monitor_became_active(&self, transition: &MonitorTransition) -> ActiveDisposition;

    /// The engine discarded the state of a monitor that was `Idle`, because
    /// settings changed or the monitor went away. Whatever was applied on
    /// idle has to be undone.
    fn monitor_released(&self, monitor: &ManagedMonitor);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTimerState {
    pub state: MonitorState,
    pub activity_stopped_at: Option<Instant>,
}

impl MonitorTimerState {
    fn fresh() -> Self {
        Self {
            state: MonitorState::Active,
            activity_stopped_at: None,
        }
    }
}

/// First qualifying activity signal for `monitor`, in fixed precedence:
/// system input, then cursor position, then the foreground window.
pub fn classify(monitor: &ManagedMonitor, snapshot: &ActivitySnapshot) -> ActivityReason {
    let config = &monitor.config;
    if config.on_input && snapshot.system_idle < monitor.idle_threshold() {
        return ActivityReason::SystemInput;
    }
    if config.on_mouse_position
        && snapshot
            .cursor
            .is_some_and(|cursor| monitor.bounds.contains(cursor))
    {
        return ActivityReason::MousePosition;
    }
    if config.on_active_window
        && snapshot
            .foreground
            .is_some_and(|window| window.bounds.intersects(&monitor.bounds))
    {
        return ActivityReason::ActiveWindow;
    }
    ActivityReason::None
}

#[derive(Default)]
struct EngineState {
    monitors: Vec<ManagedMonitor>,
    timers: HashMap<String, MonitorTimerState>,
}

struct Shared {
    source: Arc<dyn ActivitySource>,
    handler: Arc<dyn TransitionHandler>,
    state: Mutex<EngineState>,
}

pub struct IdleEngine {
    shared: Arc<Shared>,
    interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl IdleEngine {
    pub fn new(source: Arc<dyn ActivitySource>, handler: Arc<dyn TransitionHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                handler,
                state: Mutex::new(EngineState::default()),
            }),
            interval: IDLE_POLL_INTERVAL,
            worker: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Replace the managed set. Unmanaged entries are dropped, every monitor
    /// restarts in `Active` with a fresh timer, and monitors that were idle
    /// are released first.
    pub fn update_settings(&self, monitors: Vec<ManagedMonitor>) {
        let mut state = lock(&self.shared.state);

        let released: Vec<ManagedMonitor> = state
            .monitors
            .iter()
            .filter(|m| {
                state
                    .timers
                    .get(&m.hardware_id)
                    .is_some_and(|t| t.state == MonitorState::Idle)
            })
            .cloned()
            .collect();
        for monitor in &released {
            debug!("Releasing idle monitor {}", monitor.hardware_id);
            self.shared.handler.monitor_released(monitor);
        }

        let mut managed: Vec<ManagedMonitor> = Vec::with_capacity(monitors.len());
        for monitor in monitors.into_iter().filter(|m| m.config.is_managed) {
            if managed.iter().any(|m| m.hardware_id == monitor.hardware_id) {
                continue;
            }
            managed.push(monitor);
        }

        state.timers = managed
            .iter()
            .map(|m| (m.hardware_id.clone(), MonitorTimerState::fresh()))
            .collect();
        state.monitors = managed;
        info!("Managing {} monitor(s)", state.monitors.len());
    }

    /// Take new bounds and DPI for monitors already managed, keeping their
    /// idle progress.
    pub fn update_layout(&self, monitors: &[MonitorInfo]) {
        let mut state = lock(&self.shared.state);
        for managed in state.monitors.iter_mut() {
            if let Some(info) = find_by_hardware_id(monitors, &managed.hardware_id) {
                managed.bounds = info.bounds;
                managed.dpi = info.identity.dpi;
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        *worker = Some(Worker::spawn("idle-engine", self.interval, move |token| {
            if let Err(e) = shared.tick(Instant::now(), Some(token)) {
                error!("Idle check failed: {}", e);
            }
        })?);
        info!("Idle engine started ({}ms tick)", self.interval.as_millis());
        Ok(())
    }

    /// Idempotent. An in-flight tick finishes the monitor it is on and stops.
    pub fn stop(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.stop();
            info!("Idle engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Run one tick now against a fresh snapshot.
    pub fn tick(&self) -> Result<()> {
        self.shared.tick(Instant::now(), None)
    }

    /// Run one tick against a given snapshot and clock reading.
    pub fn tick_at(&self, snapshot: &ActivitySnapshot, now: Instant) {
        self.shared.process(snapshot, now, None);
    }

    pub fn state_of(&self, hardware_id: &str) -> Option<MonitorState> {
        lock(&self.shared.state)
            .timers
            .get(hardware_id)
            .map(|t| t.state)
    }

    pub fn timer_of(&self, hardware_id: &str) -> Option<MonitorTimerState> {
        lock(&self.shared.state).timers.get(hardware_id).copied()
    }

    pub fn monitor(&self, hardware_id: &str) -> Option<ManagedMonitor> {
        lock(&self.shared.state)
            .monitors
            .iter()
            .find(|m| m.hardware_id == hardware_id)
            .cloned()
    }

    pub fn managed_ids(&self) -> Vec<String> {
        lock(&self.shared.state)
            .monitors
            .iter()
            .map(|m| m.hardware_id.clone())
            .collect()
    }
}

impl Drop for IdleEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn tick(&self, now: Instant, token: Option<&CancelToken>) -> Result<()> {
        let snapshot = self.source.snapshot()?;
        self.process(&snapshot, now, token);
        Ok(())
    }

    fn process(&self, snapshot: &ActivitySnapshot, now: Instant, token: Option<&CancelToken>) {
        let mut guard = lock(&self.state);
        let EngineState { monitors, timers } = &mut *guard;

        for monitor in monitors.iter() {
            if token.is_some_and(CancelToken::is_cancelled) {
                return;
            }
            let Some(timer) = timers.get_mut(&monitor.hardware_id) else {
                continue;
            };
            let reason = classify(monitor, snapshot);
            self.advance(monitor, timer, reason, snapshot, now);
        }
    }

    fn advance(
        &self,
        monitor: &ManagedMonitor,
        timer: &mut MonitorTimerState,
        reason: ActivityReason,
        snapshot: &ActivitySnapshot,
        now: Instant,
    ) {
        let id = &monitor.hardware_id;
        match (timer.state, reason) {
            (MonitorState::Active, ActivityReason::None) => {
                debug!("{}: activity stopped, counting", id);
                timer.state = MonitorState::Counting;
                timer.activity_stopped_at = Some(now);
            }
            (MonitorState::Active, _) | (MonitorState::Idle, ActivityReason::None) => {}
            (MonitorState::Counting, ActivityReason::None) => {
                let stopped_at = *timer.activity_stopped_at.get_or_insert(now);
                if now.saturating_duration_since(stopped_at) >= monitor.idle_threshold() {
                    info!(
                        "{} idle for {:.1}s, going idle",
                        id,
                        monitor.idle_threshold().as_secs_f64()
                    );
                    self.handler
                        .monitor_became_idle(&transition(monitor, reason, snapshot));
                    timer.state = MonitorState::Idle;
                }
            }
            (MonitorState::Counting, _) => {
                debug!("{}: activity resumed ({}) before threshold", id, reason);
                *timer = MonitorTimerState::fresh();
            }
            (MonitorState::Idle, _) => {
                let disposition = self
                    .handler
                    .monitor_became_active(&transition(monitor, reason, snapshot));
                match disposition {
                    ActiveDisposition::Accept => {
                        info!("{} active again ({})", id, reason);
                        *timer = MonitorTimerState::fresh();
                    }
                    ActiveDisposition::Ignore => {
                        debug!("{}: ignored activity ({})", id, reason);
                    }
                }
            }
        }
    }
}

fn transition(
    monitor: &ManagedMonitor,
    reason: ActivityReason,
    snapshot: &ActivitySnapshot,
) -> MonitorTransition {
    MonitorTransition {
        monitor: monitor.clone(),
        reason,
        foreground: snapshot.foreground,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        managed, quiet_snapshot, HandlerEvent, RecordingHandler, ScriptedSource,
    };
    use std::sync::atomic::Ordering;

    const LEFT: Rect = Rect::from_origin_size(0, 0, 1920, 1080);
    const RIGHT: Rect = Rect::from_origin_size(1920, 0, 1920, 1080);
    const T: Duration = Duration::from_secs(10);

    fn engine_with(monitors: Vec<ManagedMonitor>) -> (Arc<RecordingHandler>, IdleEngine) {
        let handler = Arc::new(RecordingHandler::default());
        let source = Arc::new(ScriptedSource::new(quiet_snapshot()));
        let engine = IdleEngine::new(source, handler.clone());
        engine.update_settings(monitors);
        (handler, engine)
    }

    fn at(base: Instant, offset: Duration) -> Instant {
        base + offset
    }

    #[test]
    fn unmanaged_monitors_have_no_state_and_no_events() {
        let mut off = managed("B", RIGHT, T);
        off.config.is_managed = false;
        let (handler, engine) = engine_with(vec![managed("A", LEFT, T), off]);

        assert_eq!(engine.managed_ids(), ["A"]);
        assert!(engine.state_of("B").is_none());

        let base = Instant::now();
        for step in 0..5 {
            engine.tick_at(&quiet_snapshot(), at(base, T * step));
        }
        assert!(handler.events().iter().all(|e| e.hardware_id() == "A"));
    }

    #[test]
    fn system_input_takes_precedence() {
        let monitor = managed("A", LEFT, T);
        let snapshot = ActivitySnapshot {
            system_idle: Duration::from_millis(50),
            cursor: Some(Point::new(100, 100)),
            foreground: Some(ForegroundWindow {
                handle: WindowHandle(7),
                bounds: LEFT,
            }),
        };
        assert_eq!(classify(&monitor, &snapshot), ActivityReason::SystemInput);
    }

    #[test]
    fn mouse_position_before_active_window() {
        let mut monitor = managed("A", LEFT, T);
        monitor.config.on_input = false;
        let snapshot = ActivitySnapshot {
            system_idle: Duration::ZERO,
            cursor: Some(Point::new(100, 100)),
            foreground: Some(ForegroundWindow {
                handle: WindowHandle(7),
                bounds: LEFT,
            }),
        };
        assert_eq!(classify(&monitor, &snapshot), ActivityReason::MousePosition);

        monitor.config.on_mouse_position = false;
        assert_eq!(classify(&monitor, &snapshot), ActivityReason::ActiveWindow);

        monitor.config.on_active_window = false;
        assert_eq!(classify(&monitor, &snapshot), ActivityReason::None);
    }

    #[test]
    fn cursor_and_window_elsewhere_do_not_count() {
        let mut monitor = managed("A", LEFT, T);
        monitor.config.on_input = false;
        let snapshot = ActivitySnapshot {
            system_idle: Duration::ZERO,
            cursor: Some(Point::new(2500, 100)),
            foreground: Some(ForegroundWindow {
                handle: WindowHandle(7),
                bounds: RIGHT,
            }),
        };
        assert_eq!(classify(&monitor, &snapshot), ActivityReason::None);
    }

    #[test]
    fn unreadable_cursor_does_not_count_as_activity() {
        let mut monitor = managed("A", LEFT, T);
        monitor.config.on_input = false;
        monitor.config.on_active_window = false;
        let snapshot = ActivitySnapshot {
            system_idle: Duration::ZERO,
            cursor: None,
            foreground: None,
        };
        assert_eq!(classify(&monitor, &snapshot), ActivityReason::None);

        // the other signals still work without it
        monitor.config.on_active_window = true;
        let focused = ActivitySnapshot {
            foreground: Some(ForegroundWindow {
                handle: WindowHandle(7),
                bounds: LEFT,
            }),
            ..snapshot
        };
        assert_eq!(classify(&monitor, &focused), ActivityReason::ActiveWindow);
    }

    #[test]
    fn engine_keeps_counting_while_cursor_is_unreadable() {
        let (handler, engine) = engine_with(vec![managed("A", LEFT, T)]);
        let locked = ActivitySnapshot {
            cursor: None,
            ..quiet_snapshot()
        };
        let base = Instant::now();
        engine.tick_at(&locked, base);
        engine.tick_at(&locked, at(base, T));
        assert_eq!(engine.state_of("A"), Some(MonitorState::Idle));
        assert_eq!(handler.idle_count("A"), 1);
    }

    #[test]
    fn system_input_compares_against_monitor_threshold() {
        let monitor = managed("A", LEFT, T);
        let mut snapshot = quiet_snapshot();
        snapshot.system_idle = T - Duration::from_millis(1);
        assert_eq!(classify(&monitor, &snapshot), ActivityReason::SystemInput);
        snapshot.system_idle = T;
        assert_eq!(classify(&monitor, &snapshot), ActivityReason::None);
    }

    #[test]
    fn exactly_one_idle_event_at_threshold() {
        let (handler, engine) = engine_with(vec![managed("A", LEFT, T)]);
        let base = Instant::now();

        engine.tick_at(&quiet_snapshot(), base);
        assert_eq!(engine.state_of("A"), Some(MonitorState::Counting));

        engine.tick_at(&quiet_snapshot(), at(base, T - Duration::from_millis(1)));
        assert!(handler.events().is_empty());

        engine.tick_at(&quiet_snapshot(), at(base, T));
        engine.tick_at(&quiet_snapshot(), at(base, T * 2));
        engine.tick_at(&quiet_snapshot(), at(base, T * 3));

        assert_eq!(engine.state_of("A"), Some(MonitorState::Idle));
        assert_eq!(handler.idle_count("A"), 1);
    }

    #[test]
    fn activity_before_threshold_cancels_countdown() {
        let (handler, engine) = engine_with(vec![managed("A", LEFT, T)]);
        let base = Instant::now();
        let mut busy = quiet_snapshot();
        busy.cursor = Some(Point::new(10, 10));

        engine.tick_at(&quiet_snapshot(), base);
        engine.tick_at(&busy, at(base, T - Duration::from_millis(200)));
        assert_eq!(engine.state_of("A"), Some(MonitorState::Active));

        // countdown restarts from the next quiet tick
        engine.tick_at(&quiet_snapshot(), at(base, T));
        engine.tick_at(&quiet_snapshot(), at(base, T + T / 2));
        assert_eq!(handler.idle_count("A"), 0);
        assert_eq!(engine.state_of("A"), Some(MonitorState::Counting));
    }

    #[test]
    fn idle_event_carries_monitor_and_reason() {
        let (handler, engine) = engine_with(vec![managed("A", LEFT, T)]);
        let base = Instant::now();
        engine.tick_at(&quiet_snapshot(), base);
        engine.tick_at(&quiet_snapshot(), at(base, T));

        let events = handler.events();
        let HandlerEvent::Idle(transition) = &events[0] else {
            panic!("expected idle event, got {:?}", events[0]);
        };
        assert_eq!(transition.monitor.hardware_id, "A");
        assert_eq!(transition.monitor.bounds, LEFT);
        assert_eq!(transition.reason, ActivityReason::None);
    }

    #[test]
    fn activity_after_idle_returns_to_active() {
        let (handler, engine) = engine_with(vec![managed("A", LEFT, T)]);
        let base = Instant::now();
        engine.tick_at(&quiet_snapshot(), base);
        engine.tick_at(&quiet_snapshot(), at(base, T));

        let mut typing = quiet_snapshot();
        typing.system_idle = Duration::from_millis(20);
        engine.tick_at(&typing, at(base, T * 2));

        assert_eq!(engine.state_of("A"), Some(MonitorState::Active));
        assert_eq!(handler.active_count("A"), 1);
        assert!(engine.timer_of("A").unwrap().activity_stopped_at.is_none());
    }

    #[test]
    fn ignored_activity_keeps_monitor_idle() {
        let (handler, engine) = engine_with(vec![managed("A", LEFT, T)]);
        let base = Instant::now();
        engine.tick_at(&quiet_snapshot(), base);
        engine.tick_at(&quiet_snapshot(), at(base, T));

        handler.ignore_active.store(true, Ordering::SeqCst);
        let mut focused = quiet_snapshot();
        focused.foreground = Some(ForegroundWindow {
            handle: WindowHandle(99),
            bounds: LEFT,
        });
        engine.tick_at(&focused, at(base, T * 2));
        engine.tick_at(&focused, at(base, T * 3));

        assert_eq!(engine.state_of("A"), Some(MonitorState::Idle));
        assert_eq!(handler.active_count("A"), 2);
        assert_eq!(handler.idle_count("A"), 1);
    }

    #[test]
    fn monitors_progress_independently() {
        let mut slow = managed("B", RIGHT, T * 3);
        slow.config.on_input = false;
        let mut fast = managed("A", LEFT, T);
        fast.config.on_input = false;
        let (handler, engine) = engine_with(vec![fast, slow]);

        let base = Instant::now();
        let mut on_right = quiet_snapshot();
        on_right.system_idle = Duration::ZERO;
        on_right.cursor = Some(Point::new(2000, 500));

        engine.tick_at(&on_right, base);
        engine.tick_at(&on_right, at(base, T));
        assert_eq!(engine.state_of("A"), Some(MonitorState::Idle));
        assert_eq!(engine.state_of("B"), Some(MonitorState::Active));
        assert_eq!(handler.idle_count("B"), 0);
    }

    #[test]
    fn update_settings_resets_progress_and_releases_idle_monitors() {
        let (handler, engine) = engine_with(vec![managed("A", LEFT, T), managed("B", RIGHT, T)]);
        let base = Instant::now();
        engine.tick_at(&quiet_snapshot(), base);
        engine.tick_at(&quiet_snapshot(), at(base, T));
        assert_eq!(engine.state_of("A"), Some(MonitorState::Idle));

        engine.update_settings(vec![managed("A", LEFT, T * 2), managed("B", RIGHT, T)]);

        assert_eq!(engine.state_of("A"), Some(MonitorState::Active));
        assert_eq!(engine.state_of("B"), Some(MonitorState::Active));
        let released: Vec<String> = handler
            .events()
            .iter()
            .filter_map(|e| match e {
                HandlerEvent::Released(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(released.len(), 2);
    }

    #[test]
    fn duplicate_configs_keep_first() {
        let (_handler, engine) =
            engine_with(vec![managed("A", LEFT, T), managed("A", RIGHT, T * 2)]);
        assert_eq!(engine.managed_ids(), ["A"]);
    }

    #[test]
    fn layout_update_keeps_idle_progress() {
        let mut a = managed("A", LEFT, T);
        a.config.on_input = false;
        let (_handler, engine) = engine_with(vec![a]);
        let base = Instant::now();
        engine.tick_at(&quiet_snapshot(), base);

        let grown = crate::testing::monitor("A", 1, Rect::from_origin_size(0, 0, 3840, 2160));
        engine.update_layout(&[grown]);
        assert_eq!(engine.state_of("A"), Some(MonitorState::Counting));

        // only inside the new bounds
        let mut cursor = quiet_snapshot();
        cursor.cursor = Some(Point::new(3000, 2000));
        engine.tick_at(&cursor, at(base, Duration::from_millis(200)));
        assert_eq!(engine.state_of("A"), Some(MonitorState::Active));
    }

    #[test]
    fn one_snapshot_per_tick_for_all_monitors() {
        let handler = Arc::new(RecordingHandler::default());
        let source = Arc::new(ScriptedSource::new(quiet_snapshot()));
        let engine = IdleEngine::new(source.clone(), handler);
        engine.update_settings(vec![
            managed("A", LEFT, T),
            managed("B", RIGHT, T),
            managed("C", Rect::from_origin_size(-1920, 0, 1920, 1080), T),
        ]);

        engine.tick().unwrap();
        engine.tick().unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn failing_ticks_do_not_stop_the_loop() {
        let handler = Arc::new(RecordingHandler::default());
        let source = Arc::new(ScriptedSource::new(quiet_snapshot()));
        source.fail_next(2);
        let engine =
            IdleEngine::new(source.clone(), handler).with_interval(Duration::from_millis(1));
        engine.update_settings(vec![managed("A", LEFT, T)]);

        engine.start().unwrap();
        while source.calls() < 4 {
            std::thread::sleep(Duration::from_millis(1));
        }
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.state_of("A"), Some(MonitorState::Counting));
    }

    #[test]
    fn stop_is_idempotent() {
        let (_handler, engine) = engine_with(vec![]);
        engine.start().unwrap();
        engine.start().unwrap();
        engine.stop();
        engine.stop();
    }

    /// Records like [`RecordingHandler`] and cancels the tick on the first
    /// idle transition.
    struct CancelOnIdle {
        inner: RecordingHandler,
        token: CancelToken,
    }

    impl TransitionHandler for CancelOnIdle {
        fn monitor_became_idle(&self, transition: &MonitorTransition) {
            self.inner.monitor_became_idle(transition);
            self.token.cancel();
        }

        fn monitor_became_active(&self, transition: &MonitorTransition) -> ActiveDisposition {
            self.inner.monitor_became_active(transition)
        }

        fn monitor_released(&self, monitor: &ManagedMonitor) {
            self.inner.monitor_released(monitor);
        }
    }

    #[test]
    fn cancelled_tick_finishes_current_monitor_and_stops() {
        let token = CancelToken::new();
        let handler = Arc::new(CancelOnIdle {
            inner: RecordingHandler::default(),
            token: token.clone(),
        });
        let source = Arc::new(ScriptedSource::new(quiet_snapshot()));
        let engine = IdleEngine::new(source, handler.clone());
        engine.update_settings(vec![managed("A", LEFT, T), managed("B", RIGHT, T)]);

        let base = Instant::now();
        engine.tick_at(&quiet_snapshot(), base);
        engine.shared.process(&quiet_snapshot(), at(base, T), Some(&token));

        // A saw its transition through; B was never looked at
        assert_eq!(engine.state_of("A"), Some(MonitorState::Idle));
        assert_eq!(handler.inner.idle_count("A"), 1);
        assert_eq!(engine.state_of("B"), Some(MonitorState::Counting));
        assert_eq!(engine.timer_of("B").unwrap().activity_stopped_at, Some(base));
        assert_eq!(handler.inner.idle_count("B"), 0);
    }
}
