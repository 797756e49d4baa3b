// DDC/CI through the Monitor Configuration API (dxva2).

use super::display::find_handle;
use crate::brightness::{DisplayControl, VcpChannel, VcpValue};
use crate::error::{Error, Result};
use log::{debug, warn};
use windows::Win32::Devices::Display::{
    DestroyPhysicalMonitors, GetCapabilitiesStringLength, GetNumberOfPhysicalMonitorsFromHMONITOR,
    GetPhysicalMonitorsFromHMONITOR, GetVCPFeatureAndVCPFeatureReply, SetVCPFeature,
    PHYSICAL_MONITOR,
};

/// Physical monitors behind one `HMONITOR`. Released on drop.
struct PhysicalMonitorSet {
    device_name: String,
    monitors: Vec<PHYSICAL_MONITOR>,
}

impl PhysicalMonitorSet {
    fn open(device_name: &str) -> Result<Self> {
        let handle = find_handle(device_name)
            .ok_or_else(|| Error::MonitorNotFound(device_name.to_string()))?;

        let mut count = 0u32;
        unsafe { GetNumberOfPhysicalMonitorsFromHMONITOR(handle, &mut count)? };
        if count == 0 {
            return Err(Error::NoPhysicalMonitor(device_name.to_string()));
        }

        let mut monitors = vec![PHYSICAL_MONITOR::default(); count as usize];
        unsafe { GetPhysicalMonitorsFromHMONITOR(handle, &mut monitors)? };
        Ok(Self {
            device_name: device_name.to_string(),
            monitors,
        })
    }

    fn primary(&self) -> &PHYSICAL_MONITOR {
        &self.monitors[0]
    }

    fn failure(&self, operation: &'static str, code: u8) -> Error {
        Error::Vcp {
            operation,
            code,
            device: self.device_name.clone(),
        }
    }
}

impl VcpChannel for PhysicalMonitorSet {
    fn read(&mut self, code: u8) -> Result<VcpValue> {
        let (mut current, mut maximum) = (0u32, 0u32);
        let ok = unsafe {
            GetVCPFeatureAndVCPFeatureReply(
                self.primary().hPhysicalMonitor,
                code,
                None,
                &mut current,
                Some(&mut maximum),
            )
        };
        if ok == 0 {
            return Err(self.failure("read", code));
        }
        Ok(VcpValue { current, maximum })
    }

    fn write(&mut self, code: u8, value: u32) -> Result<()> {
        let ok = unsafe { SetVCPFeature(self.primary().hPhysicalMonitor, code, value) };
        if ok == 0 {
            return Err(self.failure("write", code));
        }
        Ok(())
    }
}

impl Drop for PhysicalMonitorSet {
    fn drop(&mut self) {
        if let Err(e) = unsafe { DestroyPhysicalMonitors(&self.monitors) } {
            warn!("Could not release physical monitors of {}: {}", self.device_name, e);
        }
    }
}

/// Read-only capabilities query. Any failure means "unsupported".
pub(super) fn probe_capabilities(device_name: &str) -> bool {
    let set = match PhysicalMonitorSet::open(device_name) {
        Ok(set) => set,
        Err(e) => {
            debug!("DDC/CI probe of {} failed: {}", device_name, e);
            return false;
        }
    };
    let mut length = 0u32;
    let ok = unsafe { GetCapabilitiesStringLength(set.primary().hPhysicalMonitor, &mut length) };
    ok != 0 && length > 0
}

#[derive(Debug, Default)]
pub struct Win32DisplayControl;

impl Win32DisplayControl {
    pub fn new() -> Self {
        Self
    }
}

impl DisplayControl for Win32DisplayControl {
    fn open(&self, device_name: &str) -> Result<Box<dyn VcpChannel>> {
        Ok(Box::new(PhysicalMonitorSet::open(device_name)?))
    }
}
