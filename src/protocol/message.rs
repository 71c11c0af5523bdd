//! Typed inbound and outbound messages.
//!
//! Frame payloads are decoded into [`Inbound`], one variant per message kind
//! the session understands, so the state machine can match exhaustively.

use bytes::Bytes;
use prost::Message;

use crate::error::DecodeError;
use crate::protocol::proto::{self, from_radio, to_radio};

/// A message received from the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Identity of the locally attached node.
    MyInfo(proto::MyNodeInfo),
    /// Firmware and hardware capabilities.
    Metadata(proto::DeviceMetadata),
    /// One node database entry.
    NodeInfo(proto::NodeInfo),
    /// A device configuration section (opaque).
    Config(Bytes),
    /// A module configuration section (opaque).
    ModuleConfig(Bytes),
    /// One channel definition.
    Channel(proto::Channel),
    /// End of the configuration download for the given request id.
    ConfigComplete(u32),
    /// The device restarted.
    Rebooted,
    /// A mesh packet.
    Packet(proto::MeshPacket),
    /// Transmit queue report.
    QueueStatus(proto::QueueStatus),
    /// Structured device log line.
    LogRecord(proto::LogRecord),
    /// A message kind the session passes over.
    Other(&'static str),
}

impl Inbound {
    /// Decodes a frame payload.
    ///
    /// A zero-length payload is the reboot sentinel: firmware emits it when the
    /// serial API restarts.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Ok(Self::Rebooted);
        }

        let msg = proto::FromRadio::decode(payload)?;
        let variant = msg.payload_variant.ok_or(DecodeError::Empty)?;

        Ok(match variant {
            from_radio::PayloadVariant::Packet(p) => Self::Packet(p),
            from_radio::PayloadVariant::MyInfo(i) => Self::MyInfo(i),
            from_radio::PayloadVariant::NodeInfo(n) => Self::NodeInfo(n),
            from_radio::PayloadVariant::Config(c) => Self::Config(Bytes::from(c)),
            from_radio::PayloadVariant::LogRecord(r) => Self::LogRecord(r),
            from_radio::PayloadVariant::ConfigCompleteId(id) => Self::ConfigComplete(id),
            from_radio::PayloadVariant::Rebooted(true) => Self::Rebooted,
            from_radio::PayloadVariant::Rebooted(false) => Self::Other("rebooted=false"),
            from_radio::PayloadVariant::ModuleConfig(c) => Self::ModuleConfig(Bytes::from(c)),
            from_radio::PayloadVariant::Channel(c) => Self::Channel(c),
            from_radio::PayloadVariant::QueueStatus(q) => Self::QueueStatus(q),
            from_radio::PayloadVariant::XmodemPacket(_) => Self::Other("xmodem"),
            from_radio::PayloadVariant::Metadata(m) => Self::Metadata(m),
            from_radio::PayloadVariant::MqttClientProxyMessage(_) => Self::Other("mqtt proxy"),
        })
    }

    /// Short name of the message kind, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MyInfo(_) => "my_info",
            Self::Metadata(_) => "metadata",
            Self::NodeInfo(_) => "node_info",
            Self::Config(_) => "config",
            Self::ModuleConfig(_) => "module_config",
            Self::Channel(_) => "channel",
            Self::ConfigComplete(_) => "config_complete",
            Self::Rebooted => "rebooted",
            Self::Packet(_) => "packet",
            Self::QueueStatus(_) => "queue_status",
            Self::LogRecord(_) => "log_record",
            Self::Other(kind) => *kind,
        }
    }
}

/// A message sent to the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Start the configuration download, tagged with a request id.
    WantConfig(u32),
    /// A mesh packet.
    Packet(proto::MeshPacket),
    /// Keep-alive.
    Heartbeat,
    /// Tell the device we are done.
    Disconnect,
}

impl Outbound {
    /// Serializes into a `ToRadio` payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let variant = match self {
            Self::WantConfig(id) => to_radio::PayloadVariant::WantConfigId(*id),
            Self::Packet(p) => to_radio::PayloadVariant::Packet(p.clone()),
            Self::Heartbeat => to_radio::PayloadVariant::Heartbeat(proto::Heartbeat {}),
            Self::Disconnect => to_radio::PayloadVariant::Disconnect(true),
        };
        let msg = proto::ToRadio {
            payload_variant: Some(variant),
        };
        Bytes::from(msg.encode_to_vec())
    }

    /// Returns true for mesh packets, which are subject to TX queue limits.
    #[must_use]
    pub const fn is_packet(&self) -> bool {
        matches!(self, Self::Packet(_))
    }
}

/// Encodes a `FromRadio` payload. Used by tests and loopback transports.
#[must_use]
pub fn encode_from_radio(variant: from_radio::PayloadVariant) -> Bytes {
    let msg = proto::FromRadio {
        id: 0,
        payload_variant: Some(variant),
    };
    Bytes::from(msg.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_is_reboot_sentinel() {
        assert_eq!(Inbound::decode(&[]).unwrap(), Inbound::Rebooted);
    }

    #[test]
    fn test_decode_config_complete() {
        let bytes = encode_from_radio(from_radio::PayloadVariant::ConfigCompleteId(7));
        assert_eq!(Inbound::decode(&bytes).unwrap(), Inbound::ConfigComplete(7));
    }

    #[test]
    fn test_decode_garbage_is_error() {
        // Truncated length-delimited field.
        assert!(Inbound::decode(&[0x12, 0x10, 0x01]).is_err());
    }

    #[test]
    fn test_message_without_variant_is_empty() {
        // Only the FromRadio id field.
        assert!(matches!(
            Inbound::decode(&[0x08, 0x05]),
            Err(DecodeError::Empty)
        ));
    }

    #[test]
    fn test_outbound_disconnect_encoding() {
        // field 4, varint true
        assert_eq!(&Outbound::Disconnect.encode()[..], &[0x20, 0x01]);
        assert!(!Outbound::Heartbeat.is_packet());
    }

    #[test]
    fn test_outbound_packet_round_trips_through_proto() {
        let packet = proto::MeshPacket {
            to: proto::BROADCAST_NUM,
            id: 99,
            want_ack: true,
            ..Default::default()
        };
        let bytes = Outbound::Packet(packet.clone()).encode();
        let decoded = proto::ToRadio::decode(&bytes[..]).unwrap();
        assert_eq!(
            decoded.payload_variant,
            Some(to_radio::PayloadVariant::Packet(packet))
        );
    }
}
