//! Adapter error types

use hidstream_transport::TransportError;
use thiserror::Error;

/// Caller supplied data that cannot be sent to a device as-is
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// An element does not fit in a single byte
    #[error("value {value} at index {index} is outside the byte range 0..=255")]
    OutOfRange { index: usize, value: i128 },

    /// The value is neither a byte buffer nor a numeric sequence
    #[error("expected a byte buffer or an array of integers, got {0}")]
    NotByteSequence(String),

    /// A textual byte list contained something that is not a number
    #[error("invalid byte value {0:?}")]
    InvalidToken(String),

    #[error("report length cannot be zero")]
    ZeroLength,
}

/// Errors from adapter operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HidError {
    /// The device could not be opened (not present, permission, claimed)
    #[error("cannot open device: {0}")]
    Open(#[source] TransportError),

    /// A read, write or feature report call failed in the transport
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid report data: {0}")]
    Validation(#[from] ValidationError),

    /// The adapter has been closed
    #[error("device has been closed")]
    Closed,

    /// The adapter was constructed with arguments it cannot use
    #[error("invalid construction: {0}")]
    Construction(String),

    /// A one-shot read was attempted while the read loop is running
    #[error("cannot read while the read loop is running")]
    ReadInProgress,

    /// A listener panicked while handling an event
    #[error("listener panicked: {0}")]
    ListenerPanicked(String),
}

/// Result alias for adapter operations
pub type HidResult<T> = Result<T, HidError>;
