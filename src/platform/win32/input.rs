use super::rect_from;
use crate::error::{Error, Result};
use crate::geometry::Point;
use crate::idle::{ActivitySnapshot, ActivitySource, ForegroundWindow};
use crate::overlay::WindowHandle;
use log::{info, warn};
use std::ffi::c_void;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use windows::Win32::Foundation::{HWND, POINT, RECT};
use windows::Win32::Graphics::Dwm::{DwmGetWindowAttribute, DWMWA_EXTENDED_FRAME_BOUNDS};
use windows::Win32::System::SystemInformation::GetTickCount;
use windows::Win32::UI::Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO};
use windows::Win32::UI::WindowsAndMessaging::{GetCursorPos, GetForegroundWindow, GetWindowRect};

/// Last-input time, cursor and foreground window of the interactive session.
#[derive(Debug, Default)]
pub struct Win32Activity {
    cursor_lost: AtomicBool,
}

impl Win32Activity {
    pub fn new() -> Self {
        Self::default()
    }

    /// `GetCursorPos` is denied while the secure desktop (lock screen, UAC
    /// prompt) is up. The other signals still work, so only the cursor drops
    /// out; the change is logged once each way.
    fn cursor(&self) -> Option<Point> {
        match cursor() {
            Ok(point) => {
                if self.cursor_lost.swap(false, Ordering::Relaxed) {
                    info!("Cursor position readable again");
                }
                Some(point)
            }
            Err(e) => {
                if !self.cursor_lost.swap(true, Ordering::Relaxed) {
                    warn!("Cursor position unavailable: {}", e);
                }
                None
            }
        }
    }
}

impl ActivitySource for Win32Activity {
    fn snapshot(&self) -> Result<ActivitySnapshot> {
        Ok(ActivitySnapshot {
            system_idle: system_idle()?,
            cursor: self.cursor(),
            foreground: foreground(),
        })
    }
}

fn system_idle() -> Result<Duration> {
    let mut info = LASTINPUTINFO {
        cbSize: mem::size_of::<LASTINPUTINFO>() as u32,
        dwTime: 0,
    };
    if !unsafe { GetLastInputInfo(&mut info) }.as_bool() {
        return Err(Error::ActivityState("GetLastInputInfo failed".to_string()));
    }
    // both are 32-bit tick counts; wrapping_sub survives the 49.7 day rollover
    let idle_ms = unsafe { GetTickCount() }.wrapping_sub(info.dwTime);
    Ok(Duration::from_millis(u64::from(idle_ms)))
}

fn cursor() -> Result<Point> {
    let mut point = POINT::default();
    unsafe { GetCursorPos(&mut point)? };
    Ok(Point::new(point.x, point.y))
}

/// Visible frame of the foreground window. DWM bounds exclude the invisible
/// resize border that `GetWindowRect` includes.
fn foreground() -> Option<ForegroundWindow> {
    let hwnd = unsafe { GetForegroundWindow() };
    if hwnd.is_invalid() {
        return None;
    }

    let mut rect = RECT::default();
    let dwm = unsafe {
        DwmGetWindowAttribute(
            hwnd,
            DWMWA_EXTENDED_FRAME_BOUNDS,
            &mut rect as *mut RECT as *mut c_void,
            mem::size_of::<RECT>() as u32,
        )
    };
    if dwm.is_err() && unsafe { GetWindowRect(hwnd, &mut rect) }.is_err() {
        return None;
    }

    Some(ForegroundWindow {
        handle: handle_of(hwnd),
        bounds: rect_from(rect),
    })
}

fn handle_of(hwnd: HWND) -> WindowHandle {
    WindowHandle(hwnd.0 as isize)
}
