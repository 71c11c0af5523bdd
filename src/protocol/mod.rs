//! Protocol definitions for radio communication.
//!
//! This module contains the low-level protocol types including:
//! - Frame encoding/decoding
//! - Protobuf wire messages
//! - Typed inbound/outbound message variants

pub mod frame;
pub mod message;
pub mod proto;

pub use frame::{
    DEFAULT_MARKER, Decoded, FrameDecoder, MAX_PAYLOAD_SIZE, encode as encode_frame,
    encode_with_marker,
};
pub use message::{Inbound, Outbound};
pub use proto::{BROADCAST_NUM, PortNum};
