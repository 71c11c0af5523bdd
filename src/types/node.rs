//! Node database structures.

use std::collections::HashMap;

use crate::protocol::proto;

/// Scale of the integer coordinates on the wire.
const COORD_SCALE: f64 = 1e-7;

/// Formats a node number as the firmware's textual node id (`!1234abcd`).
#[must_use]
pub fn node_id(num: u32) -> String {
    format!("!{num:08x}")
}

/// Parses a textual node id (`!1234abcd`) into a node number.
#[must_use]
pub fn parse_node_id(id: &str) -> Option<u32> {
    let hex = id.strip_prefix('!')?;
    u32::from_str_radix(hex, 16).ok()
}

/// User identity advertised by a node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInfo {
    /// Textual node id, e.g. `!1234abcd`.
    pub id: String,
    /// Long display name.
    pub long_name: String,
    /// Short (up to four characters) display name.
    pub short_name: String,
    /// Hardware model code.
    pub hw_model: i32,
    /// Whether the operator is a licensed amateur.
    pub is_licensed: bool,
}

impl From<proto::User> for UserInfo {
    fn from(user: proto::User) -> Self {
        Self {
            id: user.id,
            long_name: user.long_name,
            short_name: user.short_name,
            hw_model: user.hw_model,
            is_licensed: user.is_licensed,
        }
    }
}

/// A reported position.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Altitude in meters.
    pub altitude: i32,
    /// Fix time (Unix seconds, 0 if unknown).
    pub time: u32,
}

impl From<proto::Position> for Position {
    fn from(p: proto::Position) -> Self {
        Self {
            latitude: f64::from(p.latitude_i) * COORD_SCALE,
            longitude: f64::from(p.longitude_i) * COORD_SCALE,
            altitude: p.altitude,
            time: p.time,
        }
    }
}

/// Device health telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceMetrics {
    /// Battery level in percent; 0 or above 100 means externally powered.
    pub battery_level: u32,
    /// Battery voltage.
    pub voltage: f32,
    /// Channel utilization in percent.
    pub channel_utilization: f32,
    /// Transmit airtime in percent.
    pub air_util_tx: f32,
    /// Seconds since boot.
    pub uptime_seconds: u32,
}

impl From<proto::DeviceMetrics> for DeviceMetrics {
    fn from(m: proto::DeviceMetrics) -> Self {
        Self {
            battery_level: m.battery_level,
            voltage: m.voltage,
            channel_utilization: m.channel_utilization,
            air_util_tx: m.air_util_tx,
            uptime_seconds: m.uptime_seconds,
        }
    }
}

/// One mesh participant as reported by the device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeRecord {
    /// Node number.
    pub num: u32,
    /// Advertised user identity.
    pub user: Option<UserInfo>,
    /// Last known position.
    pub position: Option<Position>,
    /// SNR of the last received packet.
    pub snr: f32,
    /// Last time the node was heard (Unix seconds).
    pub last_heard: u32,
    /// Last reported device telemetry.
    pub metrics: Option<DeviceMetrics>,
    /// Channel index the node was heard on.
    pub channel: u32,
    /// Hops between us and the node.
    pub hops_away: u32,
}

impl NodeRecord {
    /// Creates an empty record for a node number.
    #[must_use]
    pub fn new(num: u32) -> Self {
        Self {
            num,
            ..Self::default()
        }
    }

    /// Returns the textual id, preferring the advertised one.
    #[must_use]
    pub fn id(&self) -> String {
        match &self.user {
            Some(user) if !user.id.is_empty() => user.id.clone(),
            _ => node_id(self.num),
        }
    }

    /// Returns the long name if the node advertised one.
    #[must_use]
    pub fn long_name(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.long_name.as_str())
    }
}

impl From<proto::NodeInfo> for NodeRecord {
    fn from(info: proto::NodeInfo) -> Self {
        Self {
            num: info.num,
            user: info.user.map(UserInfo::from),
            position: info.position.map(Position::from),
            snr: info.snr,
            last_heard: info.last_heard,
            metrics: info.device_metrics.map(DeviceMetrics::from),
            channel: info.channel,
            hops_away: info.hops_away,
        }
    }
}

/// Local mapping of known mesh participants, keyed by node number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTable {
    nodes: HashMap<u32, NodeRecord>,
}

impl NodeTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record, returning the previous one.
    pub fn upsert(&mut self, record: NodeRecord) -> Option<NodeRecord> {
        self.nodes.insert(record.num, record)
    }

    /// Returns a mutable record, creating a minimal one if needed.
    pub fn entry(&mut self, num: u32) -> &mut NodeRecord {
        self.nodes.entry(num).or_insert_with(|| NodeRecord::new(num))
    }

    /// Returns a mutable record if the node is known.
    pub fn get_mut(&mut self, num: u32) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(&num)
    }

    /// Removes a record.
    pub fn remove(&mut self, num: u32) -> Option<NodeRecord> {
        self.nodes.remove(&num)
    }

    /// Looks up a node by number.
    #[must_use]
    pub fn get(&self, num: u32) -> Option<&NodeRecord> {
        self.nodes.get(&num)
    }

    /// Looks up a node by its textual id.
    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes
            .values()
            .find(|n| n.user.as_ref().is_some_and(|u| u.id == id))
    }

    /// Returns true if the node is known.
    #[must_use]
    pub fn contains(&self, num: u32) -> bool {
        self.nodes.contains_key(&num)
    }

    /// Number of known nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no nodes are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over all records in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_format() {
        assert_eq!(node_id(0x1234_abcd), "!1234abcd");
        assert_eq!(node_id(1), "!00000001");
        assert_eq!(parse_node_id("!1234abcd"), Some(0x1234_abcd));
        assert_eq!(parse_node_id("1234abcd"), None);
        assert_eq!(parse_node_id("!zz"), None);
    }

    #[test]
    fn test_position_scaling() {
        let pos = Position::from(proto::Position {
            latitude_i: 525_200_000,
            longitude_i: -1_340_000,
            altitude: 34,
            time: 0,
        });
        assert!((pos.latitude - 52.52).abs() < 1e-9);
        assert!((pos.longitude + 0.134).abs() < 1e-9);
    }

    #[test]
    fn test_record_id_falls_back_to_number() {
        let mut record = NodeRecord::new(0xdead_beef);
        assert_eq!(record.id(), "!deadbeef");

        record.user = Some(UserInfo {
            id: "!cafebabe".into(),
            ..UserInfo::default()
        });
        assert_eq!(record.id(), "!cafebabe");
    }

    #[test]
    fn test_table_upsert_and_lookup() {
        let mut table = NodeTable::new();
        assert!(table.upsert(NodeRecord::new(1)).is_none());
        assert!(table.upsert(NodeRecord::new(1)).is_some());

        table.entry(2).user = Some(UserInfo {
            id: "!00000002".into(),
            long_name: "Base".into(),
            ..UserInfo::default()
        });

        assert_eq!(table.len(), 2);
        assert_eq!(table.find_by_id("!00000002").map(|n| n.num), Some(2));
        assert_eq!(table.get(2).and_then(NodeRecord::long_name), Some("Base"));
        assert!(table.remove(1).is_some());
        assert!(!table.contains(1));
    }
}
