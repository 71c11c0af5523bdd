//! Data types for mesh entities.
//!
//! This module contains the core data structures used throughout the library:
//! - Node records and the node table
//! - Received packets, destinations and send requests

pub mod node;
pub mod packet;

pub use node::{DeviceMetrics, NodeRecord, NodeTable, Position, UserInfo, node_id, parse_node_id};
pub use packet::{BROADCAST_ID, Destination, PacketId, ReceivedPacket, SendRequest};
