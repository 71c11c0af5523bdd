//! TCP transport for networked devices.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::protocol::encode_frame;
use crate::transport::{Transport, TransportKind};

/// Port the firmware's API server listens on.
pub const DEFAULT_TCP_PORT: u16 = 4403;

/// Default bound on establishing the socket.
pub const DEFAULT_TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER: usize = 4096;

/// Configuration for TCP transport.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Host name or address.
    pub host: String,
    /// Port number.
    pub port: u16,
    /// Bound on establishing the socket.
    pub connect_timeout: Duration,
}

impl TcpConfig {
    /// Creates a configuration for a host.
    ///
    /// A `host:port` string overrides the default port.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        let (host, port) = match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') => match port.parse() {
                Ok(port) => (name.to_owned(), port),
                Err(_) => (host, DEFAULT_TCP_PORT),
            },
            _ => (host, DEFAULT_TCP_PORT),
        };
        Self {
            host,
            port,
            connect_timeout: DEFAULT_TCP_CONNECT_TIMEOUT,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// TCP transport.
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpConfig,
    reader: Mutex<Option<TcpStream>>,
    writer: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    /// Creates a TCP transport.
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    fn connect_stream(&self) -> Result<TcpStream> {
        let addrs = (self.config.host.as_str(), self.config.port).to_socket_addrs()?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, "connect failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map_or_else(
            || Error::NoDevice {
                message: format!("{} did not resolve", self.config.host),
            },
            Error::Io,
        ))
    }
}

impl Transport for TcpTransport {
    fn open(&self) -> Result<()> {
        self.close()?;
        info!(host = %self.config.host, port = self.config.port, "connecting over TCP");

        let stream = self.connect_stream()?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;

        *self.reader.lock() = Some(reader);
        *self.writer.lock() = Some(stream);
        debug!("TCP connection open");
        Ok(())
    }

    fn read(&self, timeout: Duration) -> Result<Bytes> {
        let mut guard = self.reader.lock();
        let stream = guard.as_mut().ok_or(Error::NotConnected)?;
        // A zero read timeout is rejected by the socket API.
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut buf = [0u8; READ_BUFFER];
        match stream.read(&mut buf) {
            Ok(0) => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ))),
            Ok(n) => {
                trace!("received {} bytes", n);
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Bytes::new())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload)?;
        let mut guard = self.writer.lock();
        let stream = guard.as_mut().ok_or(Error::NotConnected)?;

        trace!("sending frame: {} bytes", frame.len());
        stream.write_all(&frame)?;
        stream.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(stream) = self.writer.lock().take() {
            info!(host = %self.config.host, "closing TCP connection");
            // Unblocks a reader waiting on the cloned handle.
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("shutdown: {}", e);
            }
        }
        self.reader.lock().take();
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}
