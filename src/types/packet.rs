//! Packet types for received and sent mesh traffic.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::proto::{self, BROADCAST_NUM, PortNum};
use crate::types::node::{NodeTable, node_id, parse_node_id};

/// Identifier assigned to an outbound mesh packet.
pub type PacketId = u32;

/// Textual id used for broadcasts.
pub const BROADCAST_ID: &str = "^all";

/// Where an outbound packet is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Destination {
    /// Every node on the channel.
    #[default]
    Broadcast,
    /// The locally attached node.
    Local,
    /// A node number.
    Node(u32),
    /// A textual node id (`!1234abcd`) or an id advertised by a known node.
    Id(String),
}

impl Destination {
    /// Resolves to a node number.
    pub fn resolve(&self, my_node_num: Option<u32>, nodes: &NodeTable) -> Result<u32> {
        match self {
            Self::Broadcast => Ok(BROADCAST_NUM),
            Self::Node(num) => Ok(*num),
            Self::Local => my_node_num.ok_or(Error::NotConnected),
            Self::Id(id) if id == BROADCAST_ID => Ok(BROADCAST_NUM),
            Self::Id(id) => parse_node_id(id)
                .or_else(|| nodes.find_by_id(id).map(|n| n.num))
                .ok_or_else(|| Error::NoDevice {
                    message: format!("node id {id} not found in node table"),
                }),
        }
    }
}

impl From<u32> for Destination {
    fn from(num: u32) -> Self {
        Self::Node(num)
    }
}

impl From<&str> for Destination {
    fn from(id: &str) -> Self {
        Self::Id(id.to_owned())
    }
}

/// A mesh packet received from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPacket {
    /// Packet id assigned by the sender.
    pub id: u32,
    /// Sender node number.
    pub from: u32,
    /// Recipient node number.
    pub to: u32,
    /// Sender textual id, when the node table knows it.
    pub from_id: Option<String>,
    /// Recipient textual id, when the node table knows it.
    pub to_id: Option<String>,
    /// Channel index.
    pub channel: u32,
    /// Application port.
    pub port: PortNum,
    /// Application payload (empty for encrypted packets).
    pub payload: Bytes,
    /// Id of the request this packet answers, if any.
    pub request_id: Option<u32>,
    /// Receive time (Unix seconds).
    pub rx_time: u32,
    /// Receive SNR.
    pub rx_snr: f32,
    /// Receive RSSI.
    pub rx_rssi: i32,
    /// Remaining hop count.
    pub hop_limit: u32,
    /// Whether the sender asked for an acknowledgment.
    pub want_ack: bool,
    /// Whether the payload could not be decrypted by the device.
    pub encrypted: bool,
}

impl ReceivedPacket {
    /// Builds from a wire packet, resolving ids through the node table.
    #[must_use]
    pub fn from_proto(packet: &proto::MeshPacket, nodes: &NodeTable) -> Self {
        let lookup = |num: u32| -> Option<String> {
            if num == BROADCAST_NUM {
                Some(BROADCAST_ID.to_owned())
            } else {
                nodes.get(num).map(crate::types::NodeRecord::id)
            }
        };

        let (port, payload, request_id) = match packet.decoded() {
            Some(data) => (
                PortNum(data.portnum),
                Bytes::copy_from_slice(&data.payload),
                (data.request_id != 0).then_some(data.request_id),
            ),
            None => (PortNum::UNKNOWN, Bytes::new(), None),
        };

        Self {
            id: packet.id,
            from: packet.from,
            to: packet.to,
            from_id: lookup(packet.from),
            to_id: lookup(packet.to),
            channel: packet.channel,
            port,
            payload,
            request_id,
            rx_time: packet.rx_time,
            rx_snr: packet.rx_snr,
            rx_rssi: packet.rx_rssi,
            hop_limit: packet.hop_limit,
            want_ack: packet.want_ack,
            encrypted: matches!(
                packet.payload_variant,
                Some(proto::mesh_packet::PayloadVariant::Encrypted(_))
            ),
        }
    }

    /// Textual sender id, falling back to the formatted node number.
    #[must_use]
    pub fn sender(&self) -> String {
        self.from_id.clone().unwrap_or_else(|| node_id(self.from))
    }
}

/// An outbound application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Application payload.
    pub payload: Bytes,
    /// Application port.
    pub port: PortNum,
    /// Recipient.
    pub destination: Destination,
    /// Wait for a routing acknowledgment before returning.
    pub want_ack: bool,
    /// Ask the recipient to reply.
    pub want_response: bool,
    /// Channel index.
    pub channel: u32,
}

impl SendRequest {
    /// Creates a broadcast request without acknowledgment.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>, port: PortNum) -> Self {
        Self {
            payload: payload.into(),
            port,
            destination: Destination::Broadcast,
            want_ack: false,
            want_response: false,
            channel: 0,
        }
    }

    /// Creates a text message request.
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self::new(Bytes::copy_from_slice(text.as_bytes()), PortNum::TEXT_MESSAGE)
    }

    /// Sets the destination.
    #[must_use]
    pub fn to(mut self, destination: impl Into<Destination>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Requests an acknowledgment.
    #[must_use]
    pub const fn want_ack(mut self, want_ack: bool) -> Self {
        self.want_ack = want_ack;
        self
    }

    /// Requests a response from the recipient.
    #[must_use]
    pub const fn want_response(mut self, want_response: bool) -> Self {
        self.want_response = want_response;
        self
    }

    /// Sets the channel index.
    #[must_use]
    pub const fn channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeRecord, UserInfo};

    fn table() -> NodeTable {
        let mut nodes = NodeTable::new();
        let mut record = NodeRecord::new(0x42);
        record.user = Some(UserInfo {
            id: "!00000042".into(),
            long_name: "Relay".into(),
            ..UserInfo::default()
        });
        nodes.upsert(record);
        nodes
    }

    #[test]
    fn test_destination_resolution() {
        let nodes = table();
        assert_eq!(Destination::Broadcast.resolve(None, &nodes).unwrap(), BROADCAST_NUM);
        assert_eq!(Destination::from("^all").resolve(None, &nodes).unwrap(), BROADCAST_NUM);
        assert_eq!(Destination::from("!0000abcd").resolve(None, &nodes).unwrap(), 0xabcd);
        assert_eq!(Destination::Local.resolve(Some(7), &nodes).unwrap(), 7);
        assert!(matches!(
            Destination::Local.resolve(None, &nodes),
            Err(Error::NotConnected)
        ));
        assert!(Destination::from("nobody").resolve(None, &nodes).is_err());
    }

    #[test]
    fn test_received_packet_resolves_ids() {
        let nodes = table();
        let packet = proto::MeshPacket {
            from: 0x42,
            to: BROADCAST_NUM,
            id: 5,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: PortNum::TEXT_MESSAGE.0,
                payload: b"hi".to_vec(),
                request_id: 0,
                ..Default::default()
            })),
            ..Default::default()
        };

        let rx = ReceivedPacket::from_proto(&packet, &nodes);
        assert_eq!(rx.from_id.as_deref(), Some("!00000042"));
        assert_eq!(rx.to_id.as_deref(), Some(BROADCAST_ID));
        assert_eq!(rx.port, PortNum::TEXT_MESSAGE);
        assert_eq!(&rx.payload[..], b"hi");
        assert_eq!(rx.request_id, None);
        assert!(!rx.encrypted);
    }

    #[test]
    fn test_send_request_builder() {
        let req = SendRequest::text("hello").to(0x42_u32).want_ack(true).channel(2);
        assert_eq!(req.port, PortNum::TEXT_MESSAGE);
        assert_eq!(req.destination, Destination::Node(0x42));
        assert!(req.want_ack);
        assert_eq!(req.channel, 2);
    }
}
