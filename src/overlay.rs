// Blackout overlays: one opaque, topmost, non-activating window per idle
// monitor.
//
// The registry maps hardware id -> window handle and also keeps the set of
// live handles, so the idle engine can ask "is the foreground window one of
// ours?" without walking the map. Without that check, showing an overlay
// could itself register as window activity on the monitor it covers.

use crate::error::Result;
use crate::geometry::Rect;
use crate::worker::lock;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Native window handle, stored as an integer so it can cross threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub isize);

/// Creates and destroys the actual overlay windows. Implementations dispatch
/// onto the UI thread that owns the window message loop.
pub trait OverlayWindows: Send + Sync {
    fn create(&self, bounds: Rect, dpi: u32) -> Result<WindowHandle>;
    fn destroy(&self, handle: WindowHandle);
}

#[derive(Default)]
struct OverlayRegistry {
    by_monitor: HashMap<String, WindowHandle>,
    handles: HashSet<WindowHandle>,
}

pub struct OverlayController {
    windows: Arc<dyn OverlayWindows>,
    registry: Mutex<OverlayRegistry>,
    /// Serialises `show` so two callers cannot both create a window for the
    /// same monitor. The registry lock is not held while a window is created.
    showing: Mutex<()>,
}

impl OverlayController {
    pub fn new(windows: Arc<dyn OverlayWindows>) -> Self {
        Self {
            windows,
            registry: Mutex::new(OverlayRegistry::default()),
            showing: Mutex::new(()),
        }
    }

    /// Cover the monitor. No-op when it already has an overlay.
    pub fn show(&self, hardware_id: &str, bounds: Rect, dpi: u32) {
        let _showing = lock(&self.showing);
        if lock(&self.registry).by_monitor.contains_key(hardware_id) {
            debug!("Overlay already shown on {}", hardware_id);
            return;
        }

        let handle = match self.windows.create(bounds, dpi) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Could not show overlay on {}: {}", hardware_id, e);
                return;
            }
        };

        let mut registry = lock(&self.registry);
        registry.by_monitor.insert(hardware_id.to_string(), handle);
        registry.handles.insert(handle);
        info!("Blackout overlay shown on {} ({})", hardware_id, bounds);
    }

    pub fn hide(&self, hardware_id: &str) {
        let removed = {
            let mut registry = lock(&self.registry);
            let removed = registry.by_monitor.remove(hardware_id);
            if let Some(handle) = removed {
                registry.handles.remove(&handle);
            }
            removed
        };
        if let Some(handle) = removed {
            self.windows.destroy(handle);
            info!("Blackout overlay hidden on {}", hardware_id);
        }
    }

    pub fn hide_all(&self) {
        let drained: Vec<(String, WindowHandle)> = {
            let mut registry = lock(&self.registry);
            registry.handles.clear();
            registry.by_monitor.drain().collect()
        };
        for (hardware_id, handle) in drained {
            self.windows.destroy(handle);
            info!("Blackout overlay hidden on {}", hardware_id);
        }
    }

    pub fn is_overlay_window(&self, handle: WindowHandle) -> bool {
        lock(&self.registry).handles.contains(&handle)
    }

    pub fn has_overlay(&self, hardware_id: &str) -> bool {
        lock(&self.registry).by_monitor.contains_key(hardware_id)
    }

    pub fn overlay_for(&self, hardware_id: &str) -> Option<WindowHandle> {
        lock(&self.registry).by_monitor.get(hardware_id).copied()
    }

    pub fn count(&self) -> usize {
        lock(&self.registry).by_monitor.len()
    }
}
