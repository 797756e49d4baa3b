// Blackout windows: opaque black, topmost, non-activating popups.
//
// Z-order strategy:
//   • Windows are created with WS_EX_TOPMOST and shown with SW_SHOWNOACTIVATE,
//     so covering a monitor never steals focus from the user's window
//   • The shell window's 5 s timer calls `reassert_topmost`, which puts every
//     live overlay back at the top of the topmost band
//   • SWP_NOSENDCHANGING keeps other apps from being told about the re-topping
//
// Every function touching a window runs on the UI thread; `Win32Overlays`
// does the hand-over.

use super::shell::UiThread;
use super::wide;
use crate::error::{Error, Result};
use crate::geometry::Rect;
use crate::overlay::{OverlayWindows, WindowHandle};
use crate::worker::lock;
use log::{debug, warn};
use std::sync::mpsc;
use std::sync::Mutex;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{COLORREF, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::Graphics::Gdi::CreateSolidBrush;
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, IsWindow, LoadCursorW, RegisterClassW,
    SetWindowPos, ShowWindow, CS_HREDRAW, CS_VREDRAW, HWND_TOPMOST, IDC_ARROW, SWP_NOACTIVATE,
    SWP_NOMOVE, SWP_NOSENDCHANGING, SWP_NOSIZE, SW_HIDE, SW_SHOWNOACTIVATE, WM_MOUSEACTIVATE,
    WNDCLASSW, WS_EX_NOACTIVATE, WS_EX_TOOLWINDOW, WS_EX_TOPMOST, WS_POPUP,
};

const CLASS_NAME: &str = "OLEDSleeperOverlay";
const MA_NOACTIVATE: isize = 3;

static OVERLAY_WINDOWS: Mutex<Vec<WindowHandle>> = Mutex::new(Vec::new());
static CLASS_REGISTERED: Mutex<bool> = Mutex::new(false);

fn hwnd_of(handle: WindowHandle) -> HWND {
    HWND(handle.0 as *mut std::ffi::c_void)
}

/// Clicks on an overlay must not activate it.
unsafe extern "system" fn window_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if msg == WM_MOUSEACTIVATE {
        return LRESULT(MA_NOACTIVATE);
    }
    DefWindowProcW(hwnd, msg, wparam, lparam)
}

fn register_class() -> Result<()> {
    let mut registered = lock(&CLASS_REGISTERED);
    if *registered {
        return Ok(());
    }

    let class_name = wide(CLASS_NAME);
    unsafe {
        let hinstance = GetModuleHandleW(PCWSTR::null())?;
        let wc = WNDCLASSW {
            style: CS_HREDRAW | CS_VREDRAW,
            lpfnWndProc: Some(window_proc),
            hInstance: hinstance.into(),
            lpszClassName: PCWSTR(class_name.as_ptr()),
            hbrBackground: CreateSolidBrush(COLORREF(0)),
            hCursor: LoadCursorW(None, IDC_ARROW).unwrap_or_default(),
            ..Default::default()
        };
        if RegisterClassW(&wc) == 0 {
            return Err(Error::Overlay("could not register overlay window class".to_string()));
        }
    }
    *registered = true;
    Ok(())
}

fn place_topmost(hwnd: HWND, bounds: Rect) -> windows::core::Result<()> {
    unsafe {
        SetWindowPos(
            hwnd,
            Some(HWND_TOPMOST),
            bounds.left,
            bounds.top,
            bounds.width(),
            bounds.height(),
            SWP_NOACTIVATE | SWP_NOSENDCHANGING,
        )
    }
}

/// Create and show one overlay. UI thread only.
///
/// No scaling is applied here: with per-monitor v2 awareness `bounds` are
/// already physical pixels, and the second `SetWindowPos` undoes the resize
/// Windows applies when the window lands on a monitor of another scale. If
/// awareness could not be set, monitor bounds and window coordinates are
/// virtualised alike and still agree. `dpi` is only logged.
fn create_overlay(bounds: Rect, dpi: u32) -> Result<WindowHandle> {
    register_class()?;

    let class_name = wide(CLASS_NAME);
    let hwnd = unsafe {
        let hinstance = GetModuleHandleW(PCWSTR::null())?;
        CreateWindowExW(
            WS_EX_TOPMOST | WS_EX_TOOLWINDOW | WS_EX_NOACTIVATE,
            PCWSTR(class_name.as_ptr()),
            PCWSTR::null(),
            WS_POPUP,
            bounds.left,
            bounds.top,
            bounds.width(),
            bounds.height(),
            None,
            None,
            Some(hinstance.into()),
            None,
        )?
    };

    // A window created on one monitor and moved onto another of different
    // scale gets resized by the DPI change; position it again once it is there.
    if let Err(e) = place_topmost(hwnd, bounds).and_then(|()| place_topmost(hwnd, bounds)) {
        warn!("Could not position overlay at {}: {}", bounds, e);
    }
    unsafe {
        let _ = ShowWindow(hwnd, SW_SHOWNOACTIVATE);
    }

    let handle = WindowHandle(hwnd.0 as isize);
    lock(&OVERLAY_WINDOWS).push(handle);
    debug!("Overlay {:?} created at {} ({} dpi)", handle, bounds, dpi);
    Ok(handle)
}

/// UI thread only.
fn destroy_overlay(handle: WindowHandle) {
    lock(&OVERLAY_WINDOWS).retain(|h| *h != handle);
    let hwnd = hwnd_of(handle);
    unsafe {
        if IsWindow(Some(hwnd)).as_bool() {
            let _ = ShowWindow(hwnd, SW_HIDE);
            let _ = DestroyWindow(hwnd);
        }
    }
}

/// Put every live overlay back on top of the topmost band. UI thread only.
pub(super) fn reassert_topmost() {
    let windows = lock(&OVERLAY_WINDOWS);
    for handle in windows.iter() {
        let hwnd = hwnd_of(*handle);
        unsafe {
            if IsWindow(Some(hwnd)).as_bool() {
                let _ = SetWindowPos(
                    hwnd,
                    Some(HWND_TOPMOST),
                    0,
                    0,
                    0,
                    0,
                    SWP_NOMOVE | SWP_NOSIZE | SWP_NOACTIVATE | SWP_NOSENDCHANGING,
                );
            }
        }
    }
}

/// [`OverlayWindows`] backed by real windows owned by the UI thread.
pub struct Win32Overlays {
    ui: UiThread,
}

impl Win32Overlays {
    pub fn new(ui: UiThread) -> Self {
        Self { ui }
    }
}

impl OverlayWindows for Win32Overlays {
    fn create(&self, bounds: Rect, dpi: u32) -> Result<WindowHandle> {
        if self.ui.is_current() {
            return create_overlay(bounds, dpi);
        }

        let (tx, rx) = mpsc::channel();
        let posted = self.ui.post(Box::new(move || {
            let created = create_overlay(bounds, dpi);
            if let Err(mpsc::SendError(Ok(handle))) = tx.send(created) {
                // the caller gave up waiting; nobody would ever hide it
                destroy_overlay(handle);
            }
        }));
        if !posted {
            return Err(Error::Overlay("UI thread is not running".to_string()));
        }
        rx.recv_timeout(super::shell::DISPATCH_TIMEOUT)
            .map_err(|_| Error::Overlay("UI thread did not respond".to_string()))?
    }

    fn destroy(&self, handle: WindowHandle) {
        if self.ui.invoke(move || destroy_overlay(handle)).is_none() {
            warn!("Could not destroy overlay {:?}: UI thread did not respond", handle);
        }
    }
}
