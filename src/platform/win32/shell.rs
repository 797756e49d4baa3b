// The hidden shell window and the UI thread that owns it.
//
// Overlay windows are UI objects and must be created and destroyed on the
// thread running the message loop. Background threads hand work over with
// `UiThread::invoke`, which posts a boxed closure to the shell window and
// waits for the result with a timeout.
//
// The shell window is a hidden top-level popup rather than a message-only
// window so that it receives the WM_DISPLAYCHANGE and WM_ENDSESSION
// broadcasts.

use super::{overlay, wide};
use crate::error::{Error, Result};
use log::{debug, error, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use windows::core::{BOOL, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::Console::{
    SetConsoleCtrlHandler, CTRL_BREAK_EVENT, CTRL_CLOSE_EVENT, CTRL_C_EVENT, CTRL_LOGOFF_EVENT,
    CTRL_SHUTDOWN_EVENT,
};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::System::Threading::{
    CreateMutexW, GetCurrentThreadId, OpenMutexW, SYNCHRONIZATION_ACCESS_RIGHTS,
};
use windows::Win32::UI::HiDpi::{
    SetProcessDpiAwarenessContext, DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW, KillTimer,
    PostMessageW, PostQuitMessage, RegisterClassW, SetTimer, TranslateMessage, MSG, WM_APP,
    WM_CLOSE, WM_DESTROY, WM_DISPLAYCHANGE, WM_ENDSESSION, WM_QUERYENDSESSION, WM_TIMER,
    WNDCLASSW, WS_EX_TOOLWINDOW, WS_POPUP,
};

pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(2);
const TOPMOST_INTERVAL_MS: u32 = 5000;
const TOPMOST_TIMER: usize = 1;
const WM_INVOKE: u32 = WM_APP + 1;
const CLASS_NAME: &str = "OLEDSleeperShell";
const MUTEX_ALL_ACCESS: u32 = 0x001F_0001;

type Job = Box<dyn FnOnce() + Send>;

/// Callbacks the shell window raises. Set once per process.
pub struct ShellHooks {
    /// Logoff, shutdown or console close. Runs synchronously; the process
    /// may end as soon as it returns.
    pub session_ending: Box<dyn Fn() + Send + Sync>,
    /// Display configuration changed. Runs on a fresh thread.
    pub display_changed: Box<dyn Fn() + Send + Sync>,
}

static HOOKS: OnceLock<ShellHooks> = OnceLock::new();
static SHELL_WINDOW: AtomicIsize = AtomicIsize::new(0);

/// Handle to the thread running the shell window's message loop.
#[derive(Debug, Clone, Copy)]
pub struct UiThread {
    hwnd: isize,
    thread_id: u32,
}

impl UiThread {
    /// Create the shell window on the calling thread, which must then call
    /// [`UiThread::run`].
    pub fn create(hooks: ShellHooks) -> Result<Self> {
        if HOOKS.set(hooks).is_err() {
            warn!("Shell hooks already installed, keeping the first set");
        }

        let class_name = wide(CLASS_NAME);
        let hwnd = unsafe {
            let hinstance = GetModuleHandleW(PCWSTR::null())?;
            let class = WNDCLASSW {
                lpfnWndProc: Some(shell_proc),
                hInstance: hinstance.into(),
                lpszClassName: PCWSTR(class_name.as_ptr()),
                ..Default::default()
            };
            if RegisterClassW(&class) == 0 {
                return Err(windows::core::Error::from_win32().into());
            }
            CreateWindowExW(
                WS_EX_TOOLWINDOW,
                PCWSTR(class_name.as_ptr()),
                PCWSTR::null(),
                WS_POPUP,
                0,
                0,
                0,
                0,
                None,
                None,
                Some(hinstance.into()),
                None,
            )?
        };

        unsafe {
            SetTimer(Some(hwnd), TOPMOST_TIMER, TOPMOST_INTERVAL_MS, None);
            if let Err(e) = SetConsoleCtrlHandler(Some(console_handler), true) {
                debug!("No console control handler: {}", e);
            }
        }

        let ui = Self {
            hwnd: hwnd.0 as isize,
            thread_id: unsafe { GetCurrentThreadId() },
        };
        SHELL_WINDOW.store(ui.hwnd, Ordering::SeqCst);
        debug!("Shell window created on thread {}", ui.thread_id);
        Ok(ui)
    }

    /// Pump messages until the shell window is closed.
    pub fn run(&self) {
        unsafe {
            let mut msg = MSG::default();
            while GetMessageW(&mut msg, None, 0, 0).as_bool() {
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
        debug!("Message loop finished");
    }

    pub fn is_current(&self) -> bool {
        unsafe { GetCurrentThreadId() == self.thread_id }
    }

    /// Queue `job` on the UI thread. Returns `false` if the window is gone.
    pub fn post(&self, job: Job) -> bool {
        let raw = Box::into_raw(Box::new(job));
        let posted = unsafe {
            PostMessageW(
                Some(self.hwnd()),
                WM_INVOKE,
                WPARAM(0),
                LPARAM(raw as isize),
            )
        };
        if posted.is_err() {
            // never delivered, so still ours
            drop(unsafe { Box::from_raw(raw) });
            return false;
        }
        true
    }

    /// Run `f` on the UI thread and wait for its result. Runs inline when
    /// already on the UI thread; `None` if the loop did not answer in time.
    pub fn invoke<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Some(f());
        }
        let (tx, rx) = mpsc::channel();
        if !self.post(Box::new(move || {
            let _ = tx.send(f());
        })) {
            return None;
        }
        rx.recv_timeout(DISPATCH_TIMEOUT).ok()
    }

    /// Ask the loop to exit.
    pub fn close(&self) {
        unsafe {
            let _ = PostMessageW(Some(self.hwnd()), WM_CLOSE, WPARAM(0), LPARAM(0));
        }
    }

    fn hwnd(&self) -> HWND {
        HWND(self.hwnd as *mut _)
    }
}

unsafe extern "system" fn shell_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    match msg {
        WM_INVOKE => {
            let job = Box::from_raw(lparam.0 as *mut Job);
            if panic::catch_unwind(AssertUnwindSafe(move || job())).is_err() {
                error!("UI job panicked");
            }
            LRESULT(0)
        }
        WM_TIMER if wparam.0 == TOPMOST_TIMER => {
            overlay::reassert_topmost();
            LRESULT(0)
        }
        WM_QUERYENDSESSION => LRESULT(1),
        WM_ENDSESSION => {
            if wparam.0 != 0 {
                info!("Session ending");
                session_ending();
            }
            LRESULT(0)
        }
        WM_DISPLAYCHANGE => {
            debug!("WM_DISPLAYCHANGE");
            let spawned = thread::Builder::new()
                .name("display-change".to_string())
                .spawn(|| {
                    if let Some(hooks) = HOOKS.get() {
                        (hooks.display_changed)();
                    }
                });
            if let Err(e) = spawned {
                warn!("Could not handle display change: {}", e);
            }
            DefWindowProcW(hwnd, msg, wparam, lparam)
        }
        WM_CLOSE => {
            let _ = KillTimer(Some(hwnd), TOPMOST_TIMER);
            let _ = DestroyWindow(hwnd);
            LRESULT(0)
        }
        WM_DESTROY => {
            SHELL_WINDOW.store(0, Ordering::SeqCst);
            PostQuitMessage(0);
            LRESULT(0)
        }
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

fn session_ending() {
    if let Some(hooks) = HOOKS.get() {
        (hooks.session_ending)();
    }
}

unsafe extern "system" fn console_handler(event: u32) -> BOOL {
    match event {
        CTRL_C_EVENT | CTRL_BREAK_EVENT => {
            info!("Interrupted, shutting down");
        }
        // the process is terminated as soon as this handler returns
        CTRL_CLOSE_EVENT | CTRL_LOGOFF_EVENT | CTRL_SHUTDOWN_EVENT => {
            info!("Console closing, restoring monitors");
            session_ending();
        }
        _ => return BOOL::from(false),
    }
    let hwnd = SHELL_WINDOW.load(Ordering::SeqCst);
    if hwnd != 0 {
        let _ = PostMessageW(Some(HWND(hwnd as *mut _)), WM_CLOSE, WPARAM(0), LPARAM(0));
    }
    BOOL::from(true)
}

/// Per-monitor v2 awareness so bounds and overlay sizes are physical pixels.
pub fn enable_dpi_awareness() {
    let result =
        unsafe { SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2) };
    if let Err(e) = result {
        debug!("DPI awareness not changed: {}", e);
    }
}

/// Named mutex held for the life of the daemon.
pub struct InstanceGuard(HANDLE);

impl InstanceGuard {
    /// `None` when another instance already holds `name`.
    pub fn acquire(name: &str) -> Result<Option<Self>> {
        let name = wide(name);
        unsafe {
            let access = SYNCHRONIZATION_ACCESS_RIGHTS(MUTEX_ALL_ACCESS);
            if let Ok(existing) = OpenMutexW(access, false, PCWSTR(name.as_ptr())) {
                let _ = CloseHandle(existing);
                return Ok(None);
            }
            let handle = CreateMutexW(None, true, PCWSTR(name.as_ptr())).map_err(Error::from)?;
            Ok(Some(Self(handle)))
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}
