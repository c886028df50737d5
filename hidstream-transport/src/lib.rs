//! Transport layer for hidstream
//!
//! This crate defines the contract a HID device handle has to fulfil and
//! provides two backends for it:
//!
//! - `HidapiBackend`: real devices through the `hidapi` crate
//! - `MockBackend`: scriptable in-memory devices for tests and demos
//!
//! ```text
//! [HidapiHandle / MockDevice]   ← implements DeviceHandle (raw I/O)
//!              |
//!   [hidstream::HidDevice / HidDeviceAsync]   ← read loop, listeners, validation
//! ```

pub mod error;
pub mod mock;
pub mod types;

mod discovery;
mod hid_device;

pub use discovery::{list_devices, HidapiBackend};
pub use error::TransportError;
pub use hid_device::HidapiHandle;
pub use mock::{MockBackend, MockDevice};
pub use types::{DeviceDescriptor, DeviceSelector, Report};

use std::sync::Arc;

/// Maximum size of a single input report read from a device
pub const READ_BUFFER_SIZE: usize = 2048;

/// The raw device handle trait - all backends implement this
///
/// A handle is one open connection to a HID device. Every operation is a
/// blocking call; callers that need asynchronous behaviour run them on a
/// worker thread. Implementations must be safe to share between a reader
/// thread and writers, and every operation after `close()` must fail with
/// `TransportError::Closed`.
pub trait DeviceHandle: Send + Sync {
    /// Read one input report
    ///
    /// # Arguments
    /// * `timeout_ms` - Timeout in milliseconds (`-1` blocks, `0` polls)
    ///
    /// # Returns
    /// `None` on timeout, `Some(report)` if data was received
    fn read_timeout(&self, timeout_ms: i32) -> Result<Option<Report>, TransportError>;

    /// Write an output report, returning the number of bytes accepted
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read a feature report
    ///
    /// # Arguments
    /// * `report_id` - Report ID, placed in the first byte of the request
    /// * `length` - Buffer length including the report ID byte
    fn get_feature_report(&self, report_id: u8, length: usize) -> Result<Report, TransportError>;

    /// Send a feature report (report ID in the first byte)
    fn send_feature_report(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Toggle non-blocking reads
    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), TransportError>;

    /// Get the descriptor of the open device
    fn device_info(&self) -> Result<DeviceDescriptor, TransportError>;

    /// Release the device. Fails if already closed.
    fn close(&self) -> Result<(), TransportError>;

    /// Check if `close()` has been called
    fn is_closed(&self) -> bool;
}

/// Type alias for a shared device handle
pub type BoxedHandle = Arc<dyn DeviceHandle>;

/// Device enumeration and opening
pub trait HidBackend: Send + Sync {
    /// List devices, optionally filtered by vendor and product ID
    fn list_devices(
        &self,
        vendor_id: Option<u16>,
        product_id: Option<u16>,
    ) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Open the device named by `selector`
    fn open(&self, selector: &DeviceSelector) -> Result<BoxedHandle, TransportError>;
}
