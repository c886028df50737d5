//! Device discovery and opening through hidapi

use std::ffi::CString;
use std::sync::Arc;

use hidapi::HidApi;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::hid_device::HidapiHandle;
use crate::types::{DeviceDescriptor, DeviceSelector};
use crate::{BoxedHandle, HidBackend};

/// Convert an hidapi device info record into a descriptor
///
/// Usage page and usage are only reported when non-zero, like the
/// enumeration of the C library does on platforms without usage support.
pub(crate) fn descriptor_from_info(info: &hidapi::DeviceInfo) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        path: info.path().to_string_lossy().to_string(),
        serial_number: info.serial_number().map(|s| s.to_string()),
        manufacturer: info.manufacturer_string().map(|s| s.to_string()),
        product: info.product_string().map(|s| s.to_string()),
        release: info.release_number(),
        interface: info.interface_number(),
        usage_page: Some(info.usage_page()).filter(|&p| p != 0),
        usage: Some(info.usage()).filter(|&u| u != 0),
    }
}

/// HID backend using the system hidapi library
#[derive(Debug, Default, Clone, Copy)]
pub struct HidapiBackend;

impl HidapiBackend {
    pub fn new() -> Self {
        Self
    }

    fn api() -> Result<HidApi, TransportError> {
        HidApi::new().map_err(|e| TransportError::HidError(e.to_string()))
    }
}

impl HidBackend for HidapiBackend {
    fn list_devices(
        &self,
        vendor_id: Option<u16>,
        product_id: Option<u16>,
    ) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let api = Self::api()?;
        let devices: Vec<DeviceDescriptor> = api
            .device_list()
            .map(descriptor_from_info)
            .filter(|d| d.matches(vendor_id, product_id))
            .collect();

        debug!(
            "Enumerated {} devices (vid={:04X?} pid={:04X?})",
            devices.len(),
            vendor_id,
            product_id
        );
        Ok(devices)
    }

    fn open(&self, selector: &DeviceSelector) -> Result<BoxedHandle, TransportError> {
        let api = Self::api()?;

        let device = match selector {
            DeviceSelector::Path(path) => {
                let cpath = CString::new(path.as_str()).map_err(|_| {
                    TransportError::DeviceNotFound(format!("invalid device path {path:?}"))
                })?;
                api.open_path(&cpath)
            }
            DeviceSelector::Ids {
                vendor_id,
                product_id,
                serial_number: Some(serial),
            } => api.open_serial(*vendor_id, *product_id, serial),
            DeviceSelector::Ids {
                vendor_id,
                product_id,
                serial_number: None,
            } => api.open(*vendor_id, *product_id),
        }
        .map_err(|e| match TransportError::from(e) {
            TransportError::HidError(msg) => {
                TransportError::DeviceNotFound(format!("cannot open device {selector}: {msg}"))
            }
            other => other,
        })?;

        info!("Opened HID device {}", selector);
        Ok(Arc::new(HidapiHandle::new(device, selector.to_string())))
    }
}

/// List connected HID devices through hidapi
pub fn list_devices(
    vendor_id: Option<u16>,
    product_id: Option<u16>,
) -> Result<Vec<DeviceDescriptor>, TransportError> {
    HidapiBackend::new().list_devices(vendor_id, product_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices() {
        // Passes without devices connected; hidapi may be unavailable in CI
        if let Ok(devices) = list_devices(None, None) {
            for d in &devices {
                assert!(!d.path.is_empty());
            }
        }
    }
}
