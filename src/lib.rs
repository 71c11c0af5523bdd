//! # meshlink
//!
//! A Rust client engine for Meshtastic mesh radio devices.
//!
//! This library keeps a session with a radio over serial, TCP or (with the
//! `ble` feature) Bluetooth Low Energy, and presents the device's node
//! database, configuration and message stream as a continuously updated local
//! model.
//!
//! ## Features
//!
//! - Blocking API usable from any thread; one background reader per link
//! - Topic-based event subscriptions (`receive.text`, `connection.lost`, ...)
//! - Acknowledged sends with timeouts and device flow control
//! - Request/response correlation by request id
//! - Automatic reconnection with capped exponential backoff
//!
//! ## Quick Start
//!
//! ```no_run
//! use meshlink::{Destination, Event, MeshLink};
//!
//! fn main() -> Result<(), meshlink::Error> {
//!     let link = MeshLink::serial("/dev/ttyUSB0");
//!
//!     link.subscribe("receive.text", |_, event| {
//!         if let Event::Text { packet, text } = event {
//!             println!("{}: {}", packet.sender(), text);
//!         }
//!     });
//!
//!     link.connect()?;
//!     println!("Connected as {:?}", link.my_node_num());
//!     println!("{} nodes known", link.nodes().len());
//!
//!     link.send_text("hello mesh", Destination::Broadcast, false)?;
//!
//!     link.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Stream framing and wire messages
//! - [`transport`] - Serial, TCP and BLE transports, plus the BLE async bridge
//! - [`session`] - Connection state machine, node table and acknowledgments
//! - [`event`] - Topic-based event dispatch
//! - [`client`] - High-level [`MeshLink`] client

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
mod reader;
pub mod session;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{MeshLink, connect};
pub use config::LinkConfig;
pub use error::{DecodeError, Error, FrameError, Result};
pub use event::{Event, EventDispatcher, SubscriptionId, topic_matches};
pub use protocol::{FrameDecoder, PortNum};
pub use reader::ConsoleLines;
pub use session::{ConnectionState, MAX_DATA_PAYLOAD, SessionInfo};
pub use transport::{
    SerialConfig, SerialTransport, TcpConfig, TcpTransport, Transport, TransportConfig,
    TransportKind, serial::list_ports,
};
pub use types::{
    Destination, DeviceMetrics, NodeRecord, NodeTable, PacketId, Position, ReceivedPacket,
    SendRequest, UserInfo,
};
