//! Protobuf wire types for the radio API.
//!
//! Only the subset of the device schema that the session engine reads or
//! writes is declared here. Field tags follow the firmware's `mesh.proto`;
//! unknown fields are skipped by `prost`, and configuration payloads that the
//! engine does not interpret are carried as raw bytes.

use prost::Message;

/// Node number used for broadcast packets.
pub const BROADCAST_NUM: u32 = 0xffff_ffff;

/// Well-known application port numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortNum(pub i32);

impl PortNum {
    pub const UNKNOWN: Self = Self(0);
    pub const TEXT_MESSAGE: Self = Self(1);
    pub const REMOTE_HARDWARE: Self = Self(2);
    pub const POSITION: Self = Self(3);
    pub const NODEINFO: Self = Self(4);
    pub const ROUTING: Self = Self(5);
    pub const ADMIN: Self = Self(6);
    pub const WAYPOINT: Self = Self(8);
    pub const TELEMETRY: Self = Self(67);
    pub const TRACEROUTE: Self = Self(70);
    pub const NEIGHBORINFO: Self = Self(71);
    pub const PRIVATE: Self = Self(256);

    /// Returns the firmware's name for the port, used in event topics.
    #[must_use]
    pub fn name(self) -> String {
        match self {
            Self::UNKNOWN => "UNKNOWN_APP".into(),
            Self::TEXT_MESSAGE => "TEXT_MESSAGE_APP".into(),
            Self::REMOTE_HARDWARE => "REMOTE_HARDWARE_APP".into(),
            Self::POSITION => "POSITION_APP".into(),
            Self::NODEINFO => "NODEINFO_APP".into(),
            Self::ROUTING => "ROUTING_APP".into(),
            Self::ADMIN => "ADMIN_APP".into(),
            Self::WAYPOINT => "WAYPOINT_APP".into(),
            Self::TELEMETRY => "TELEMETRY_APP".into(),
            Self::TRACEROUTE => "TRACEROUTE_APP".into(),
            Self::NEIGHBORINFO => "NEIGHBORINFO_APP".into(),
            Self::PRIVATE => "PRIVATE_APP".into(),
            Self(other) => format!("PORT_{other}"),
        }
    }
}

/// Routing error reasons reported in acknowledgments.
#[must_use]
pub fn routing_error_name(code: i32) -> &'static str {
    match code {
        0 => "NONE",
        1 => "NO_ROUTE",
        2 => "GOT_NAK",
        3 => "TIMEOUT",
        4 => "NO_INTERFACE",
        5 => "MAX_RETRANSMIT",
        6 => "NO_CHANNEL",
        7 => "TOO_LARGE",
        8 => "NO_RESPONSE",
        9 => "DUTY_CYCLE_LIMIT",
        32 => "BAD_REQUEST",
        33 => "NOT_AUTHORIZED",
        34 => "PKI_FAILED",
        35 => "PKI_UNKNOWN_PUBKEY",
        _ => "UNKNOWN",
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Packet(super::MeshPacket),
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(
        oneof = "from_radio::PayloadVariant",
        tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14"
    )]
    pub payload_variant: Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "4")]
        NodeInfo(super::NodeInfo),
        #[prost(bytes, tag = "5")]
        Config(Vec<u8>),
        #[prost(message, tag = "6")]
        LogRecord(super::LogRecord),
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
        #[prost(bool, tag = "8")]
        Rebooted(bool),
        #[prost(bytes, tag = "9")]
        ModuleConfig(Vec<u8>),
        #[prost(message, tag = "10")]
        Channel(super::Channel),
        #[prost(message, tag = "11")]
        QueueStatus(super::QueueStatus),
        #[prost(bytes, tag = "12")]
        XmodemPacket(Vec<u8>),
        #[prost(message, tag = "13")]
        Metadata(super::DeviceMetadata),
        #[prost(bytes, tag = "14")]
        MqttClientProxyMessage(Vec<u8>),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "11")]
    pub priority: i32,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes, tag = "5")]
        Encrypted(Vec<u8>),
    }
}

impl MeshPacket {
    /// Returns the decoded payload, if the device delivered one.
    #[must_use]
    pub fn decoded(&self) -> Option<&Data> {
        match &self.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(data)) => Some(data),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Data {
    #[prost(int32, tag = "1")]
    pub portnum: i32,
    #[prost(bytes, tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
    #[prost(uint32, tag = "8")]
    pub reboot_count: u32,
    #[prost(uint32, tag = "11")]
    pub min_app_version: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
    #[prost(message, optional, tag = "3")]
    pub position: Option<Position>,
    #[prost(float, tag = "4")]
    pub snr: f32,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
    #[prost(message, optional, tag = "6")]
    pub device_metrics: Option<DeviceMetrics>,
    #[prost(uint32, tag = "7")]
    pub channel: u32,
    #[prost(bool, tag = "8")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "9")]
    pub hops_away: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(bytes, tag = "4")]
    pub macaddr: Vec<u8>,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Position {
    #[prost(sfixed32, tag = "1")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "2")]
    pub longitude_i: i32,
    #[prost(int32, tag = "3")]
    pub altitude: i32,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceMetrics {
    #[prost(uint32, tag = "1")]
    pub battery_level: u32,
    #[prost(float, tag = "2")]
    pub voltage: f32,
    #[prost(float, tag = "3")]
    pub channel_utilization: f32,
    #[prost(float, tag = "4")]
    pub air_util_tx: f32,
    #[prost(uint32, tag = "5")]
    pub uptime_seconds: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(message, optional, tag = "2")]
    pub device_metrics: Option<DeviceMetrics>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Routing {
    #[prost(oneof = "routing::Variant", tags = "3")]
    pub variant: Option<routing::Variant>,
}

pub mod routing {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Variant {
        #[prost(int32, tag = "3")]
        ErrorReason(i32),
    }
}

impl Routing {
    /// Error reason carried by this routing message (0 is success).
    #[must_use]
    pub fn error_reason(&self) -> i32 {
        match self.variant {
            Some(routing::Variant::ErrorReason(code)) => code,
            None => 0,
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct QueueStatus {
    #[prost(int32, tag = "1")]
    pub res: i32,
    #[prost(uint32, tag = "2")]
    pub free: u32,
    #[prost(uint32, tag = "3")]
    pub maxlen: u32,
    #[prost(uint32, tag = "4")]
    pub mesh_packet_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct LogRecord {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(fixed32, tag = "2")]
    pub time: u32,
    #[prost(string, tag = "3")]
    pub source: String,
    #[prost(int32, tag = "4")]
    pub level: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Channel {
    #[prost(int32, tag = "1")]
    pub index: i32,
    #[prost(bytes, tag = "2")]
    pub settings: Vec<u8>,
    #[prost(int32, tag = "3")]
    pub role: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceMetadata {
    #[prost(string, tag = "1")]
    pub firmware_version: String,
    #[prost(uint32, tag = "2")]
    pub device_state_version: u32,
    #[prost(int32, tag = "9")]
    pub hw_model: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Heartbeat {}

/// Device administration request; only node removal is modelled.
#[derive(Clone, PartialEq, Message)]
pub struct AdminMessage {
    #[prost(oneof = "admin_message::PayloadVariant", tags = "38")]
    pub payload_variant: Option<admin_message::PayloadVariant>,
}

pub mod admin_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(uint32, tag = "38")]
        RemoveByNodenum(u32),
    }
}
