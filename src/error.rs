//! Error types for the meshlink library.

use thiserror::Error;

/// The main error type for meshlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level failure that is not a plain I/O error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Bluetooth stack error.
    #[cfg(feature = "ble")]
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Payload did not parse as a known message.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// No acknowledgment or response within the bound.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection is not established (or not yet live).
    #[error("not connected")]
    NotConnected,

    /// The connection was lost while the operation was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// The operation was attempted after close started.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// The device rejected a packet that requested acknowledgment.
    #[error("negative acknowledgment: {reason}")]
    Nak { reason: String },

    /// No device could be found to connect to.
    #[error("no device: {message}")]
    NoDevice { message: String },
}

impl Error {
    /// Builds a timeout error from a duration.
    #[must_use]
    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Builds a transport error from anything displayable.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: message.to_string(),
        }
    }
}

/// Frame-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame payload exceeds maximum size.
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },
}

/// Payload decoding errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Protobuf wire decoding failed.
    #[error("protobuf: {0}")]
    Protobuf(#[from] prost::DecodeError),

    /// The message decoded but carried no recognised variant.
    #[error("empty message")]
    Empty,
}

/// Result type alias for meshlink operations.
pub type Result<T> = std::result::Result<T, Error>;
