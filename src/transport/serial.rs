//! Serial/USB transport implementation.
//!
//! This module provides serial port communication for devices connected via
//! USB. The port is driven through the blocking `serialport` API re-exported by
//! `tokio-serial`; reader and writer use separate cloned handles so a blocked
//! read never stalls a write.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_serial::{SerialPort, SerialPortType};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::encode_frame;
use crate::protocol::frame::START2;
use crate::transport::{Transport, TransportKind};

/// Default baud rate for radio devices.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default delay after opening before the first write.
pub const DEFAULT_CONNECTION_DELAY: Duration = Duration::from_millis(100);

/// Number of wake bytes written on open.
pub const WAKE_BYTES: usize = 32;

const READ_BUFFER: usize = 1024;

/// Configuration for serial transport.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Delay after the port opens and the wake bytes are written.
    pub connection_delay: Duration,
    /// Write wake bytes on open so a sleeping device resynchronizes.
    pub wake: bool,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            connection_delay: DEFAULT_CONNECTION_DELAY,
            wake: true,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the connection delay.
    #[must_use]
    pub const fn connection_delay(mut self, delay: Duration) -> Self {
        self.connection_delay = delay;
        self
    }

    /// Enables or disables the wake sequence.
    #[must_use]
    pub const fn wake(mut self, wake: bool) -> Self {
        self.wake = wake;
        self
    }
}

/// Serial transport.
pub struct SerialTransport {
    config: SerialConfig,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Creates a new serial transport for the given port with default settings.
    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self::new(SerialConfig::new(port))
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Transport for SerialTransport {
    fn open(&self) -> Result<()> {
        self.close()?;
        info!(port = %self.config.port, baud = self.config.baud_rate, "opening serial port");

        let mut port = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(Error::Serial)?;

        // Toggling these lines resets many USB-serial boards.
        if let Err(e) = port.write_request_to_send(false) {
            warn!("failed to clear RTS: {}", e);
        }
        if let Err(e) = port.write_data_terminal_ready(false) {
            warn!("failed to clear DTR: {}", e);
        }

        if self.config.wake {
            port.write_all(&[START2; WAKE_BYTES])?;
            port.flush()?;
        }
        thread::sleep(self.config.connection_delay);

        let reader = port.try_clone().map_err(Error::Serial)?;
        *self.reader.lock() = Some(reader);
        *self.writer.lock() = Some(port);

        debug!("serial port open");
        Ok(())
    }

    fn read(&self, timeout: Duration) -> Result<Bytes> {
        let mut guard = self.reader.lock();
        let port = guard.as_mut().ok_or(Error::NotConnected)?;
        port.set_timeout(timeout.max(Duration::from_millis(1)))
            .map_err(Error::Serial)?;

        let mut buf = [0u8; READ_BUFFER];
        match port.read(&mut buf) {
            Ok(0) => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial port closed",
            ))),
            Ok(n) => {
                trace!("received {} bytes", n);
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Bytes::new()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Bytes::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload)?;
        let mut guard = self.writer.lock();
        let port = guard.as_mut().ok_or(Error::NotConnected)?;

        trace!("sending frame: {} bytes", frame.len());
        port.write_all(&frame)?;
        port.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.writer.lock().take().is_some() {
            info!(port = %self.config.port, "closing serial port");
        }
        // The reader may be inside a bounded read; it releases the lock when that returns.
        self.reader.lock().take();
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Lists serial ports backed by a USB device, the usual way radios attach.
pub fn list_usb_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports
        .into_iter()
        .filter(|p| matches!(p.port_type, SerialPortType::UsbPort(_)))
        .map(|p| p.port_name)
        .collect())
}
