//! Transport error types

use thiserror::Error;

/// Errors raised by a device handle or backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device disconnected")]
    Disconnected,

    /// The handle has been closed; it cannot be used again
    #[error("Device handle is closed")]
    Closed,

    #[error("Communication timeout")]
    Timeout,

    // HID-specific errors
    #[error("HID error: {0}")]
    HidError(String),

    #[error("HID permission denied: {0}")]
    HidPermissionDenied(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<hidapi::HidError> for TransportError {
    fn from(e: hidapi::HidError) -> Self {
        let msg = e.to_string();
        if msg.contains("Permission denied") || msg.contains("EPERM") || msg.contains("EACCES") {
            TransportError::HidPermissionDenied(msg)
        } else {
            TransportError::HidError(msg)
        }
    }
}
