//! Event-driven streams over blocking HID device handles
//!
//! A HID handle only offers "read the next report" as a blocking call. This
//! crate wraps such a handle in an adapter that reads in the background
//! exactly while someone listens for `Data` events:
//!
//! ```text
//! on_data / remove_listener
//!          |
//!   [ListenerRegistry] --0->1 / 1->0--> [read loop] --read_timeout--> [DeviceHandle]
//!          ^                                 |
//!          +---------- Data / Error ---------+
//!
//! write / send_feature_report --> [IntoReport validation] --> [DeviceHandle]
//! ```
//!
//! Two adapter variants share the contract:
//! - [`HidDevice`]: synchronous calls, self-re-arming read worker
//! - [`HidDeviceAsync`]: `async` calls on Tokio, start/stop read stream

pub mod config;
pub mod device;
pub mod device_async;
pub mod error;
pub mod listeners;
pub mod read_loop;
pub mod validate;

pub use config::AdapterConfig;
pub use device::HidDevice;
pub use device_async::HidDeviceAsync;
pub use error::{HidError, HidResult, ValidationError};
pub use listeners::{EventKind, HidEvent, Listener, ListenerId};
pub use read_loop::LoopStats;
pub use validate::IntoReport;

pub use hidstream_transport::{
    DeviceDescriptor, DeviceHandle, DeviceSelector, HidBackend, HidapiBackend, MockBackend,
    MockDevice, Report, TransportError,
};

use std::sync::Arc;

/// Lifecycle state of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Handle open, nothing is being read
    Idle,
    /// The read loop is running
    Active,
    /// `close()` is in progress
    Closing,
    /// The handle has been released
    Closed,
}

/// List HID devices, optionally filtered by vendor and product ID
pub fn list_devices(
    vendor_id: Option<u16>,
    product_id: Option<u16>,
) -> HidResult<Vec<DeviceDescriptor>> {
    Ok(hidstream_transport::list_devices(vendor_id, product_id)?)
}

/// Like [`list_devices`], with enumeration run on Tokio's blocking pool
pub async fn list_devices_async(
    vendor_id: Option<u16>,
    product_id: Option<u16>,
) -> HidResult<Vec<DeviceDescriptor>> {
    list_devices_with(Arc::new(HidapiBackend::new()), vendor_id, product_id).await
}

/// Enumerate through a specific backend on Tokio's blocking pool
pub async fn list_devices_with(
    backend: Arc<dyn HidBackend>,
    vendor_id: Option<u16>,
    product_id: Option<u16>,
) -> HidResult<Vec<DeviceDescriptor>> {
    tokio::task::spawn_blocking(move || backend.list_devices(vendor_id, product_id))
        .await
        .map_err(device_async::join_error)?
        .map_err(HidError::from)
}

/// Reject selectors no backend can open
pub(crate) fn check_selector(selector: &DeviceSelector) -> HidResult<()> {
    if let DeviceSelector::Path(path) = selector {
        if path.is_empty() {
            return Err(HidError::Construction("device path is empty".into()));
        }
        if path.contains('\0') {
            return Err(HidError::Construction(format!(
                "device path {path:?} contains a NUL byte"
            )));
        }
    }
    Ok(())
}
