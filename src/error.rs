use oled_sleeper_shared::StoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("monitor {0} is not connected")]
    MonitorNotFound(String),

    #[error("no physical monitor handle for {0}")]
    NoPhysicalMonitor(String),

    #[error("VCP {operation} of code {code:#04x} failed on {device}")]
    Vcp {
        operation: &'static str,
        code: u8,
        device: String,
    },

    #[error("overlay window unavailable: {0}")]
    Overlay(String),

    #[error("system activity state unavailable: {0}")]
    ActivityState(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[cfg(windows)]
    #[error(transparent)]
    Win32(#[from] windows::core::Error),
}
