//! hidapi-backed device handle

use hidapi::HidDevice;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::discovery::descriptor_from_info;
use crate::error::TransportError;
use crate::types::{DeviceDescriptor, Report};
use crate::{DeviceHandle, READ_BUFFER_SIZE};

/// Device handle over an open `hidapi::HidDevice`
///
/// The device sits behind a mutex so a reader thread and writers can share
/// the handle. `close()` takes the device out and drops it, which closes the
/// OS handle; a read in progress finishes its timeout first.
pub struct HidapiHandle {
    device: Mutex<Option<HidDevice>>,
    /// Path the handle was opened with, for logging
    path: String,
}

impl HidapiHandle {
    pub fn new(device: HidDevice, path: String) -> Self {
        Self {
            device: Mutex::new(Some(device)),
            path,
        }
    }

    /// Run `f` against the open device, failing if it has been closed
    fn with_device<T>(
        &self,
        f: impl FnOnce(&HidDevice) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let guard = self.device.lock();
        match guard.as_ref() {
            Some(device) => f(device),
            None => Err(TransportError::Closed),
        }
    }
}

impl DeviceHandle for HidapiHandle {
    fn read_timeout(&self, timeout_ms: i32) -> Result<Option<Report>, TransportError> {
        self.with_device(|device| {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            let len = device.read_timeout(&mut buf, timeout_ms)?;
            if len == 0 {
                return Ok(None);
            }
            buf.truncate(len);
            Ok(Some(buf))
        })
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.with_device(|device| {
            let written = device.write(data)?;
            debug!("{}: wrote {} bytes", self.path, written);
            Ok(written)
        })
    }

    fn get_feature_report(&self, report_id: u8, length: usize) -> Result<Report, TransportError> {
        if length == 0 {
            return Err(TransportError::Internal(
                "feature report length cannot be zero".into(),
            ));
        }
        self.with_device(|device| {
            let mut buf = vec![0u8; length];
            buf[0] = report_id;
            let len = device.get_feature_report(&mut buf)?;
            buf.truncate(len);
            Ok(buf)
        })
    }

    fn send_feature_report(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.with_device(|device| {
            device.send_feature_report(data)?;
            Ok(data.len())
        })
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), TransportError> {
        self.with_device(|device| Ok(device.set_blocking_mode(!nonblocking)?))
    }

    fn device_info(&self) -> Result<DeviceDescriptor, TransportError> {
        self.with_device(|device| {
            let info = device.get_device_info()?;
            Ok(descriptor_from_info(&info))
        })
    }

    fn close(&self) -> Result<(), TransportError> {
        // Dropping the HidDevice closes the OS handle
        match self.device.lock().take() {
            Some(_device) => {
                info!("Closed HID device {}", self.path);
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }

    fn is_closed(&self) -> bool {
        self.device.lock().is_none()
    }
}

impl Drop for HidapiHandle {
    fn drop(&mut self) {
        if self.device.get_mut().is_some() {
            debug!("HidapiHandle for {} dropped while open", self.path);
        }
    }
}
