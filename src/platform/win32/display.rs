// Monitor enumeration via EnumDisplayMonitors, with hardware ids taken from
// the monitor's device interface path.

use super::{ddc, from_wide, rect_from, wide};
use crate::monitor::{
    parse_display_number, MonitorDirectory, MonitorIdentity, MonitorInfo, DEFAULT_DPI,
};
use log::{debug, warn};
use std::mem;
use windows::core::{BOOL, PCWSTR};
use windows::Win32::Foundation::{LPARAM, RECT};
use windows::Win32::Graphics::Gdi::{
    EnumDisplayDevicesW, EnumDisplayMonitors, GetMonitorInfoW, DISPLAY_DEVICEW, HDC, HMONITOR,
    MONITORINFO, MONITORINFOEXW,
};
use windows::Win32::UI::HiDpi::{GetDpiForMonitor, MDT_EFFECTIVE_DPI};

const MONITORINFOF_PRIMARY: u32 = 0x1;
const EDD_GET_DEVICE_INTERFACE_NAME: u32 = 0x1;
const DISPLAY_DEVICE_ACTIVE: u32 = 0x1;

/// One `HMONITOR` with its extended info, valid only for the current call.
pub(super) struct RawMonitor {
    pub handle: HMONITOR,
    pub device_name: String,
    pub bounds: RECT,
    pub is_primary: bool,
}

pub(super) fn enumerate() -> Vec<RawMonitor> {
    unsafe extern "system" fn collect(
        monitor: HMONITOR,
        _hdc: HDC,
        _rect: *mut RECT,
        lparam: LPARAM,
    ) -> BOOL {
        let handles = &mut *(lparam.0 as *mut Vec<HMONITOR>);
        handles.push(monitor);
        BOOL::from(true)
    }

    let mut handles: Vec<HMONITOR> = Vec::new();
    unsafe {
        let _ = EnumDisplayMonitors(
            None,
            None,
            Some(collect),
            LPARAM(&mut handles as *mut Vec<HMONITOR> as isize),
        );
    }

    handles
        .into_iter()
        .filter_map(|handle| {
            let mut info = MONITORINFOEXW::default();
            info.monitorInfo.cbSize = mem::size_of::<MONITORINFOEXW>() as u32;
            let ok = unsafe {
                GetMonitorInfoW(handle, &mut info as *mut MONITORINFOEXW as *mut MONITORINFO)
            };
            if !ok.as_bool() {
                debug!("GetMonitorInfoW failed for {:?}", handle);
                return None;
            }
            Some(RawMonitor {
                handle,
                device_name: from_wide(&info.szDevice),
                bounds: info.monitorInfo.rcMonitor,
                is_primary: info.monitorInfo.dwFlags & MONITORINFOF_PRIMARY != 0,
            })
        })
        .collect()
}

/// Exact match on the device name; enumeration order is never relied on.
pub(super) fn find_handle(device_name: &str) -> Option<HMONITOR> {
    enumerate()
        .into_iter()
        .find(|m| m.device_name == device_name)
        .map(|m| m.handle)
}

fn monitor_dpi(handle: HMONITOR) -> u32 {
    let (mut x, mut y) = (0u32, 0u32);
    match unsafe { GetDpiForMonitor(handle, MDT_EFFECTIVE_DPI, &mut x, &mut y) } {
        Ok(()) if x > 0 => x,
        _ => DEFAULT_DPI,
    }
}

#[derive(Debug, Default)]
pub struct Win32Directory;

impl Win32Directory {
    pub fn new() -> Self {
        Self
    }

    /// Device interface path of the active monitor attached to the display
    /// adapter output `device_name`, e.g.
    /// `\\?\DISPLAY#DEL41A8#5&2b5a2c1&0&UID4353#{e6f07b5f-...}`. Falls back
    /// to the device name when the adapter reports nothing.
    pub fn resolve_hardware_id(&self, device_name: &str) -> String {
        let adapter = wide(device_name);
        let mut index = 0;
        loop {
            let mut device = DISPLAY_DEVICEW {
                cb: mem::size_of::<DISPLAY_DEVICEW>() as u32,
                ..Default::default()
            };
            let found = unsafe {
                EnumDisplayDevicesW(
                    PCWSTR(adapter.as_ptr()),
                    index,
                    &mut device,
                    EDD_GET_DEVICE_INTERFACE_NAME,
                )
            };
            if !found.as_bool() {
                break;
            }
            index += 1;

            let id = from_wide(&device.DeviceID);
            if device.StateFlags.0 & DISPLAY_DEVICE_ACTIVE != 0 && !id.is_empty() {
                return id;
            }
        }
        warn!("No hardware id for {}, using the device name", device_name);
        device_name.to_string()
    }
}

impl MonitorDirectory for Win32Directory {
    fn list_monitors(&self) -> Vec<MonitorInfo> {
        enumerate()
            .into_iter()
            .map(|raw| MonitorInfo {
                identity: MonitorIdentity {
                    hardware_id: self.resolve_hardware_id(&raw.device_name),
                    display_number: parse_display_number(&raw.device_name),
                    is_primary: raw.is_primary,
                    dpi: monitor_dpi(raw.handle),
                    device_name: raw.device_name,
                },
                bounds: rect_from(raw.bounds),
                ddc_ci: None,
            })
            .collect()
    }

    fn probe_ddc_ci_support(&self, identity: &MonitorIdentity) -> bool {
        ddc::probe_capabilities(&identity.device_name)
    }
}
