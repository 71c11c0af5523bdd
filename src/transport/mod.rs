//! Transport layer for device communication.
//!
//! Every medium exposes the same blocking byte-stream contract so the reader
//! loop is identical for all of them. Stream transports (serial, TCP) frame
//! outbound payloads themselves; the BLE transport writes payloads to the
//! characteristic as-is and re-frames what it reads.

pub mod bridge;
#[cfg(feature = "ble")]
pub mod ble;
#[cfg(test)]
pub(crate) mod mock;
pub mod serial;
pub mod tcp;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use crate::error::{Error, Result};

/// Kind of physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// USB or UART serial port.
    Serial,
    /// TCP socket to a networked device.
    Tcp,
    /// Bluetooth Low Energy GATT characteristics.
    Ble,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Serial => "serial",
            Self::Tcp => "tcp",
            Self::Ble => "ble",
        })
    }
}

/// Trait for transport implementations.
///
/// All methods take `&self`: the reader thread blocks in [`read`](Self::read)
/// while other threads write or close.
pub trait Transport: Send + Sync {
    /// Opens the link. Opening an already open transport reopens it.
    fn open(&self) -> Result<()>;

    /// Reads available bytes, waiting at most `timeout`.
    ///
    /// Returns an empty buffer when nothing arrived in time. An error means the
    /// link is gone.
    fn read(&self, timeout: Duration) -> Result<Bytes>;

    /// Writes one message payload.
    fn write(&self, payload: &[u8]) -> Result<()>;

    /// Closes the link. Closing twice is a no-op.
    fn close(&self) -> Result<()>;

    /// Returns the medium.
    fn kind(&self) -> TransportKind;

    /// Takes device log lines that arrived outside the byte stream.
    ///
    /// Stream transports interleave console text with frames and return
    /// nothing here; BLE delivers its log characteristic this way.
    fn take_log_lines(&self) -> Vec<String> {
        Vec::new()
    }
}

/// How to reach a device.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// A specific serial port.
    Serial(serial::SerialConfig),
    /// A networked device.
    Tcp(tcp::TcpConfig),
    /// A Bluetooth device.
    #[cfg(feature = "ble")]
    Ble(ble::BleConfig),
    /// The only USB serial device attached.
    Auto,
}

impl TransportConfig {
    /// Builds the transport without opening it.
    pub fn build(self) -> Result<Arc<dyn Transport>> {
        Ok(match self {
            Self::Serial(config) => Arc::new(serial::SerialTransport::new(config)),
            Self::Tcp(config) => Arc::new(tcp::TcpTransport::new(config)),
            #[cfg(feature = "ble")]
            Self::Ble(config) => Arc::new(ble::BleTransport::new(config)),
            Self::Auto => {
                let port = detect_serial_port()?;
                info!(%port, "auto-detected serial device");
                Arc::new(serial::SerialTransport::new(serial::SerialConfig::new(port)))
            }
        })
    }
}

fn detect_serial_port() -> Result<String> {
    let mut ports = serial::list_usb_ports()?;
    match ports.len() {
        0 => Err(Error::NoDevice {
            message: "no USB serial devices found".into(),
        }),
        1 => Ok(ports.swap_remove(0)),
        _ => Err(Error::NoDevice {
            message: format!(
                "multiple serial ports detected ({}); pick one explicitly",
                ports.join(", ")
            ),
        }),
    }
}

pub use serial::{SerialConfig, SerialTransport};
pub use tcp::{TcpConfig, TcpTransport};
