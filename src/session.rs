//! Connection state machine.
//!
//! [`Session`] owns everything the engine knows about the device: lifecycle
//! state, negotiated capabilities, the node table, acknowledgment tracking and
//! the outbound queue. It performs no I/O. Each inbound message yields a
//! [`Step`] listing the events to publish and the payloads to write, which the
//! caller carries out.
//!
//! ```text
//! Disconnected -> Connecting -> ConfigDownload -> Live
//!                     ^                 ^          |
//!                     |                 +-reboot---+
//!                     +---- Lost <------ link failure
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use prost::Message;
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, FrameError, Result};
use crate::event::Event;
use crate::protocol::proto::{self, PortNum, routing_error_name};
use crate::protocol::{Inbound, Outbound};
use crate::sync::Completion;
use crate::types::{
    DeviceMetrics, NodeRecord, NodeTable, PacketId, Position, ReceivedPacket, SendRequest,
    UserInfo,
};

/// Largest application payload the firmware accepts in one packet.
pub const MAX_DATA_PAYLOAD: usize = 233;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Transport open, configuration not yet requested.
    Connecting,
    /// Waiting for the device to finish sending its configuration.
    ConfigDownload,
    /// Fully synchronized; traffic flows both ways.
    Live,
    /// The link failed; waiting to reconnect or settle.
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ConfigDownload => "config download",
            Self::Live => "live",
            Self::Lost => "lost",
        })
    }
}

/// What the device told us about itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionInfo {
    /// Node number of the attached radio.
    pub my_node_num: Option<u32>,
    /// Firmware version string.
    pub firmware_version: Option<String>,
    /// Version of the device's persisted state format.
    pub device_state_version: u32,
    /// Times the device has rebooted.
    pub reboot_count: u32,
    /// Oldest client API version the firmware supports.
    pub min_app_version: u32,
    /// Hardware model code.
    pub hw_model: i32,
    /// Free TX queue slots at the last report.
    pub tx_queue_free: Option<u32>,
    /// TX queue capacity.
    pub tx_queue_max: Option<u32>,
    /// Channel definitions, ordered by index.
    pub channels: Vec<proto::Channel>,
    /// Opaque device configuration sections.
    pub config: Vec<Bytes>,
    /// Opaque module configuration sections.
    pub module_config: Vec<Bytes>,
}

/// Completion handle resolved by a routing acknowledgment.
pub type AckHandle = Completion<Result<()>>;

/// Resolved with the packet answering a request, or the reason none will come.
pub type ResponseHandle = Completion<Result<ReceivedPacket>>;

/// Side effect applied when an acknowledgment arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// The device confirmed it dropped this node.
    RemoveNode(u32),
}

/// A packet waiting for TX queue space.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// Packet id.
    pub id: PacketId,
    /// Encoded `ToRadio` payload.
    pub payload: Bytes,
    /// Whether a caller waits for an acknowledgment.
    pub wants_ack: bool,
    /// When the packet was queued.
    pub enqueued: Instant,
}

struct PendingAck {
    done: AckHandle,
    action: Option<AckAction>,
}

/// Outcome of feeding one message to the session.
#[derive(Debug, Default)]
pub struct Step {
    /// Events to publish, in order.
    pub events: Vec<Event>,
    /// Payloads to write, in order.
    pub writes: Vec<Bytes>,
}

/// Result of [`Session::submit`].
#[derive(Debug)]
pub struct Submitted {
    /// Assigned packet id.
    pub id: PacketId,
    /// Resolved when the device acknowledges, if requested.
    pub ack: Option<AckHandle>,
    /// Payload to write now; `None` if queued behind flow control.
    pub write: Option<Bytes>,
}

/// The connection state machine.
pub struct Session {
    state: ConnectionState,
    info: SessionInfo,
    nodes: NodeTable,
    config_id: u32,
    last_packet_id: u32,
    pending: HashMap<PacketId, PendingAck>,
    responses: HashMap<PacketId, ResponseHandle>,
    queue: VecDeque<PendingWrite>,
    tx_free: Option<u32>,
    last_rx: Instant,
    last_tx: Instant,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("nodes", &self.nodes.len())
            .field("pending_acks", &self.pending.len())
            .field("awaiting_responses", &self.responses.len())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Creates a disconnected session with a random packet id base.
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: ConnectionState::Disconnected,
            info: SessionInfo::default(),
            nodes: NodeTable::new(),
            config_id: 0,
            last_packet_id: rand::thread_rng().gen_range(1..=u32::MAX),
            pending: HashMap::new(),
            responses: HashMap::new(),
            queue: VecDeque::new(),
            tx_free: None,
            last_rx: now,
            last_tx: now,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub const fn info(&self) -> &SessionInfo {
        &self.info
    }

    #[must_use]
    pub const fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    #[must_use]
    pub const fn my_node_num(&self) -> Option<u32> {
        self.info.my_node_num
    }

    /// Id of the configuration request in progress.
    #[must_use]
    pub const fn config_id(&self) -> u32 {
        self.config_id
    }

    /// Number of acknowledgments still outstanding.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    /// Requests still waiting for their reply.
    #[must_use]
    pub fn awaiting_responses(&self) -> usize {
        self.responses.len()
    }

    /// Number of packets held back by flow control.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The transport opened; a configuration request comes next.
    pub fn begin_connect(&mut self) {
        debug!(from = %self.state, "connecting");
        self.state = ConnectionState::Connecting;
        self.tx_free = None;
    }

    /// Picks a fresh configuration id and returns the request to write.
    pub fn config_request(&mut self) -> Bytes {
        let previous = self.config_id;
        let mut rng = rand::thread_rng();
        while self.config_id == previous {
            self.config_id = rng.gen_range(1..=u32::MAX);
        }
        self.info.channels.clear();
        self.info.config.clear();
        self.info.module_config.clear();
        Outbound::WantConfig(self.config_id).encode()
    }

    /// The configuration request was written.
    pub fn config_requested(&mut self, now: Instant) {
        debug!(config_id = self.config_id, "downloading configuration");
        self.state = ConnectionState::ConfigDownload;
        self.last_rx = now;
        self.last_tx = now;
    }

    /// Records inbound traffic for liveness tracking.
    pub fn note_rx(&mut self, now: Instant) {
        self.last_rx = now;
    }

    /// Records outbound traffic for heartbeat scheduling.
    pub fn note_tx(&mut self, now: Instant) {
        self.last_tx = now;
    }

    /// Returns true if a live link has been silent for longer than `timeout`.
    #[must_use]
    pub fn liveness_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.state == ConnectionState::Live && now.saturating_duration_since(self.last_rx) > timeout
    }

    /// Returns a heartbeat to write if the link has been quiet for `interval`.
    pub fn heartbeat(&mut self, now: Instant, interval: Duration) -> Option<Bytes> {
        if self.state != ConnectionState::Live
            || now.saturating_duration_since(self.last_tx) < interval
        {
            return None;
        }
        trace!("heartbeat due");
        self.last_tx = now;
        Some(Outbound::Heartbeat.encode())
    }

    /// Applies one inbound message.
    pub fn handle_inbound(&mut self, msg: Inbound) -> Step {
        let mut step = Step::default();
        let live = self.state == ConnectionState::Live;
        trace!(kind = msg.kind(), state = %self.state, "inbound");

        match msg {
            Inbound::MyInfo(my) => {
                self.info.my_node_num = Some(my.my_node_num);
                self.info.reboot_count = my.reboot_count;
                self.info.min_app_version = my.min_app_version;
            }
            Inbound::Metadata(meta) => {
                self.info.firmware_version = Some(meta.firmware_version);
                self.info.device_state_version = meta.device_state_version;
                self.info.hw_model = meta.hw_model;
            }
            Inbound::NodeInfo(info) => {
                let record = NodeRecord::from(info);
                if live {
                    step.events.push(Event::NodeUpdated(Box::new(record.clone())));
                }
                self.nodes.upsert(record);
            }
            Inbound::Config(section) => self.info.config.push(section),
            Inbound::ModuleConfig(section) => self.info.module_config.push(section),
            Inbound::Channel(channel) => {
                let channels = &mut self.info.channels;
                match channels.iter_mut().find(|c| c.index == channel.index) {
                    Some(existing) => *existing = channel,
                    None => {
                        channels.push(channel);
                        channels.sort_by_key(|c| c.index);
                    }
                }
            }
            Inbound::ConfigComplete(id) => self.handle_config_complete(id, &mut step),
            Inbound::Rebooted => self.handle_reboot(&mut step),
            Inbound::Packet(packet) => self.handle_packet(&packet, live, &mut step),
            Inbound::QueueStatus(status) => self.handle_queue_status(&status, live, &mut step),
            Inbound::LogRecord(record) => {
                if live {
                    step.events.push(Event::LogRecord(record));
                }
            }
            Inbound::Other(kind) => trace!(kind, "ignoring message"),
        }
        step
    }

    fn handle_config_complete(&mut self, id: u32, step: &mut Step) {
        if self.state != ConnectionState::ConfigDownload || id != self.config_id {
            debug!(id, expected = self.config_id, state = %self.state, "ignoring config complete");
            return;
        }
        info!(
            node = ?self.info.my_node_num,
            nodes = self.nodes.len(),
            firmware = ?self.info.firmware_version,
            "session live"
        );
        self.state = ConnectionState::Live;
        step.events
            .push(Event::Established(Box::new(self.info.clone())));
    }

    fn handle_reboot(&mut self, step: &mut Step) {
        match self.state {
            ConnectionState::Live => {
                info!("device rebooted; downloading configuration again");
                step.writes.push(self.config_request());
                self.state = ConnectionState::ConfigDownload;
                step.events.push(Event::Rebooted);
            }
            ConnectionState::ConfigDownload => {
                debug!("device rebooted during download; restarting");
                step.writes.push(self.config_request());
            }
            _ => debug!(state = %self.state, "ignoring reboot notice"),
        }
    }

    fn handle_packet(&mut self, packet: &proto::MeshPacket, live: bool, step: &mut Step) {
        if packet.from == 0 {
            warn!(id = packet.id, "dropping packet with sender 0");
            return;
        }
        if let Some(node) = self.nodes.get_mut(packet.from) {
            if packet.rx_time != 0 {
                node.last_heard = packet.rx_time;
            }
            node.snr = packet.rx_snr;
        }

        let rx = ReceivedPacket::from_proto(packet, &self.nodes);
        if let Some(request_id) = rx.request_id {
            if rx.port != PortNum::ROUTING {
                self.resolve_response(request_id, &rx);
            }
        }
        let event = self.decode_packet(rx, live, step);
        if live {
            step.events.push(event);
        }
    }

    /// Decodes a packet into its typed event, updating the node table.
    fn decode_packet(&mut self, rx: ReceivedPacket, live: bool, step: &mut Step) -> Event {
        let from = rx.from;
        match rx.port {
            PortNum::TEXT_MESSAGE => Event::Text {
                text: String::from_utf8_lossy(&rx.payload).into_owned(),
                packet: Box::new(rx),
            },
            PortNum::POSITION => match proto::Position::decode(&rx.payload[..]) {
                Ok(p) => {
                    let position = Position::from(p);
                    let node = self.nodes.entry(from);
                    node.position = Some(position);
                    if live {
                        step.events.push(Event::NodeUpdated(Box::new(node.clone())));
                    }
                    Event::Position {
                        packet: Box::new(rx),
                        position,
                    }
                }
                Err(e) => undecodable(rx, &e),
            },
            PortNum::NODEINFO => match proto::User::decode(&rx.payload[..]) {
                Ok(u) => {
                    let user = UserInfo::from(u);
                    let node = self.nodes.entry(from);
                    node.user = Some(user.clone());
                    if live {
                        step.events.push(Event::NodeUpdated(Box::new(node.clone())));
                    }
                    Event::User {
                        packet: Box::new(rx),
                        user,
                    }
                }
                Err(e) => undecodable(rx, &e),
            },
            PortNum::ROUTING => match proto::Routing::decode(&rx.payload[..]) {
                Ok(routing) => {
                    let error_reason = routing.error_reason();
                    if let Some(request_id) = rx.request_id {
                        self.resolve_ack(request_id, error_reason, live, step);
                    }
                    Event::Routing {
                        packet: Box::new(rx),
                        error_reason,
                    }
                }
                Err(e) => undecodable(rx, &e),
            },
            PortNum::TELEMETRY => match proto::Telemetry::decode(&rx.payload[..]) {
                Ok(telemetry) => {
                    let metrics = telemetry.device_metrics.map(DeviceMetrics::from);
                    if let (Some(m), Some(node)) = (metrics, self.nodes.get_mut(from)) {
                        node.metrics = Some(m);
                    }
                    Event::Telemetry {
                        packet: Box::new(rx),
                        metrics,
                    }
                }
                Err(e) => undecodable(rx, &e),
            },
            _ => Event::Data(Box::new(rx)),
        }
    }

    fn resolve_response(&mut self, request_id: PacketId, rx: &ReceivedPacket) {
        if let Some(waiter) = self.responses.remove(&request_id) {
            trace!(request_id, from = rx.from, port = %rx.port.name(), "response received");
            waiter.complete(Ok(rx.clone()));
        }
    }

    fn resolve_ack(&mut self, request_id: PacketId, error_reason: i32, live: bool, step: &mut Step) {
        // A rejected request will not be answered either. A plain ack leaves
        // the reply outstanding.
        if error_reason != 0 {
            if let Some(waiter) = self.responses.remove(&request_id) {
                waiter.complete(Err(Error::Nak {
                    reason: routing_error_name(error_reason).to_owned(),
                }));
            }
        }

        let Some(pending) = self.pending.remove(&request_id) else {
            debug!(request_id, "acknowledgment for unknown or expired packet ignored");
            return;
        };

        if error_reason != 0 {
            let reason = routing_error_name(error_reason);
            debug!(request_id, reason, "packet rejected");
            pending.done.complete(Err(Error::Nak {
                reason: reason.to_owned(),
            }));
            return;
        }

        trace!(request_id, "packet acknowledged");
        if !pending.done.complete(Ok(())) {
            return;
        }
        if let Some(AckAction::RemoveNode(num)) = pending.action {
            if self.nodes.remove(num).is_some() && live {
                step.events.push(Event::NodeRemoved(num));
            }
        }
    }

    fn handle_queue_status(&mut self, status: &proto::QueueStatus, live: bool, step: &mut Step) {
        trace!(
            free = status.free,
            maxlen = status.maxlen,
            packet = status.mesh_packet_id,
            "queue status"
        );
        if status.res != 0 {
            warn!(packet = status.mesh_packet_id, res = status.res, "device refused packet");
        }
        self.info.tx_queue_free = Some(status.free);
        self.info.tx_queue_max = Some(status.maxlen);

        let mut free = status.free;
        while free > 0 {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            trace!(id = queued.id, waited = ?queued.enqueued.elapsed(), "flushing queued packet");
            step.writes.push(queued.payload);
            free -= 1;
        }
        self.tx_free = Some(free);

        if live {
            step.events.push(Event::QueueStatus {
                free: status.free,
                maxlen: status.maxlen,
            });
        }
    }

    fn allocate_packet_id(&mut self) -> PacketId {
        self.last_packet_id = self.last_packet_id.wrapping_add(1);
        if self.last_packet_id == 0 {
            self.last_packet_id = 1;
        }
        self.last_packet_id
    }

    /// Builds and registers an outbound packet.
    ///
    /// The returned payload must be written before the session lock is
    /// released so writes reach the device in submission order.
    pub fn submit(&mut self, request: &SendRequest, action: Option<AckAction>) -> Result<Submitted> {
        if self.state != ConnectionState::Live {
            return Err(Error::NotConnected);
        }
        if request.payload.len() > MAX_DATA_PAYLOAD {
            return Err(Error::Frame(FrameError::TooLarge {
                size: request.payload.len(),
                max: MAX_DATA_PAYLOAD,
            }));
        }

        let to = request.destination.resolve(self.info.my_node_num, &self.nodes)?;
        let id = self.allocate_packet_id();
        let packet = proto::MeshPacket {
            to,
            channel: request.channel,
            id,
            want_ack: request.want_ack,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: request.port.0,
                payload: request.payload.to_vec(),
                want_response: request.want_response,
                ..Default::default()
            })),
            ..Default::default()
        };
        let payload = Outbound::Packet(packet).encode();
        trace!(id, to, port = %request.port.name(), "submitting packet");

        let ack = request.want_ack.then(|| {
            let done = Completion::new();
            self.pending.insert(
                id,
                PendingAck {
                    done: done.clone(),
                    action,
                },
            );
            done
        });

        let write = if self.queue.is_empty() && self.tx_free != Some(0) {
            if let Some(free) = self.tx_free.as_mut() {
                *free -= 1;
            }
            Some(payload)
        } else {
            debug!(id, queued = self.queue.len() + 1, "TX queue full; holding packet");
            self.queue.push_back(PendingWrite {
                id,
                payload,
                wants_ack: request.want_ack,
                enqueued: Instant::now(),
            });
            None
        };

        Ok(Submitted { id, ack, write })
    }

    /// Stops tracking an acknowledgment. Returns false if it already resolved.
    pub fn forget_ack(&mut self, id: PacketId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Registers interest in the reply to packet `id`.
    ///
    /// Must be called under the same lock as [`submit`](Self::submit) so the
    /// reply cannot arrive unobserved.
    pub fn expect_response(&mut self, id: PacketId) -> ResponseHandle {
        let waiter = Completion::new();
        self.responses.insert(id, waiter.clone());
        waiter
    }

    /// Stops waiting for a reply. Returns false if it already resolved.
    pub fn forget_response(&mut self, id: PacketId) -> bool {
        self.responses.remove(&id).is_some()
    }

    /// Drops a packet that could not be written.
    pub fn abandon(&mut self, id: PacketId) {
        self.forget_ack(id);
        self.forget_response(id);
        self.queue.retain(|w| w.id != id);
    }

    /// The link failed. Returns the events to publish; empty if already lost.
    pub fn mark_lost(&mut self, reason: &str) -> Vec<Event> {
        if matches!(
            self.state,
            ConnectionState::Lost | ConnectionState::Disconnected
        ) {
            return Vec::new();
        }
        warn!(state = %self.state, reason, "connection lost");
        self.state = ConnectionState::Lost;
        self.fail_all(|| Error::ConnectionLost);
        vec![Event::Lost {
            reason: reason.to_owned(),
        }]
    }

    /// No reconnection will follow a loss.
    pub fn settle(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Tears the session down for close.
    pub fn shutdown(&mut self) {
        self.fail_all(|| Error::ShutdownInProgress);
        self.state = ConnectionState::Disconnected;
    }

    fn fail_all(&mut self, error: impl Fn() -> Error) {
        let dropped_acks = self.queue.iter().filter(|w| w.wants_ack).count();
        if !self.queue.is_empty() {
            debug!(
                queued = self.queue.len(),
                with_ack = dropped_acks,
                "dropping queued packets"
            );
        }
        self.queue.clear();
        self.tx_free = None;
        for (_, pending) in self.pending.drain() {
            pending.done.complete(Err(error()));
        }
        for (_, waiter) in self.responses.drain() {
            waiter.complete(Err(error()));
        }
    }
}

fn undecodable(rx: ReceivedPacket, error: &prost::DecodeError) -> Event {
    warn!(port = %rx.port.name(), from = rx.from, "undecodable payload: {}", error);
    Event::Data(Box::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::proto::{from_radio, mesh_packet, to_radio};
    use crate::sync::WaitOutcome;
    use crate::types::Destination;

    const LOCAL: u32 = 0x0a0b_0c0d;
    const PEER: u32 = 0x1122_3344;

    fn decode_to_radio(bytes: &Bytes) -> to_radio::PayloadVariant {
        proto::ToRadio::decode(&bytes[..])
            .unwrap()
            .payload_variant
            .unwrap()
    }

    fn packet(from: u32, port: PortNum, payload: Vec<u8>, request_id: u32) -> Inbound {
        Inbound::Packet(proto::MeshPacket {
            from,
            to: LOCAL,
            id: 77,
            rx_time: 1_700_000_000,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: port.0,
                payload,
                request_id,
                ..Default::default()
            })),
            ..Default::default()
        })
    }

    fn routing(request_id: u32, reason: i32) -> Inbound {
        let body = proto::Routing {
            variant: Some(proto::routing::Variant::ErrorReason(reason)),
        };
        packet(LOCAL, PortNum::ROUTING, body.encode_to_vec(), request_id)
    }

    fn downloading() -> Session {
        let mut session = Session::new();
        session.begin_connect();
        session.config_request();
        session.config_requested(Instant::now());
        session
    }

    fn live() -> Session {
        let mut session = downloading();
        session.handle_inbound(Inbound::MyInfo(proto::MyNodeInfo {
            my_node_num: LOCAL,
            ..Default::default()
        }));
        session.handle_inbound(Inbound::NodeInfo(proto::NodeInfo {
            num: PEER,
            ..Default::default()
        }));
        let id = session.config_id();
        let step = session.handle_inbound(Inbound::ConfigComplete(id));
        assert_eq!(step.events.len(), 1);
        assert_eq!(session.state(), ConnectionState::Live);
        session
    }

    #[test]
    fn test_config_request_encodes_fresh_id() {
        let mut session = Session::new();
        let first = session.config_request();
        let first_id = session.config_id();
        assert_ne!(first_id, 0);
        assert_eq!(
            decode_to_radio(&first),
            to_radio::PayloadVariant::WantConfigId(first_id)
        );
        session.config_request();
        assert_ne!(session.config_id(), first_id);
    }

    #[test]
    fn test_download_publishes_nothing_until_complete() {
        let mut session = downloading();
        let steps = [
            Inbound::MyInfo(proto::MyNodeInfo {
                my_node_num: LOCAL,
                reboot_count: 2,
                min_app_version: 1,
            }),
            Inbound::NodeInfo(proto::NodeInfo {
                num: PEER,
                ..Default::default()
            }),
            Inbound::Channel(proto::Channel {
                index: 1,
                ..Default::default()
            }),
            Inbound::Channel(proto::Channel {
                index: 0,
                ..Default::default()
            }),
            Inbound::Config(Bytes::from_static(&[1, 2])),
            packet(PEER, PortNum::TEXT_MESSAGE, b"early".to_vec(), 0),
            Inbound::ConfigComplete(session.config_id().wrapping_add(1)),
        ];
        for msg in steps {
            assert!(session.handle_inbound(msg).events.is_empty());
        }
        assert_eq!(session.state(), ConnectionState::ConfigDownload);
        assert_eq!(session.nodes().len(), 1);
        assert_eq!(session.info().channels[0].index, 0);

        let id = session.config_id();
        let step = session.handle_inbound(Inbound::ConfigComplete(id));
        match &step.events[..] {
            [Event::Established(info)] => {
                assert_eq!(info.my_node_num, Some(LOCAL));
                assert_eq!(info.reboot_count, 2);
                assert_eq!(info.config.len(), 1);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_send_requires_live_session() {
        let mut session = downloading();
        let result = session.submit(&SendRequest::text("hi"), None);
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut session = live();
        let big = SendRequest::new(vec![0u8; MAX_DATA_PAYLOAD + 1], PortNum::PRIVATE);
        assert!(matches!(
            session.submit(&big, None),
            Err(Error::Frame(FrameError::TooLarge { .. }))
        ));
    }

    #[test]
    fn test_packet_ids_increment_and_skip_zero() {
        let mut session = live();
        session.last_packet_id = u32::MAX;
        let a = session.submit(&SendRequest::text("a"), None).unwrap().id;
        let b = session.submit(&SendRequest::text("b"), None).unwrap().id;
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn test_submit_encodes_packet() {
        let mut session = live();
        let request = SendRequest::text("hello").to(PEER).channel(1).want_ack(true);
        let submitted = session.submit(&request, None).unwrap();
        assert!(submitted.ack.is_some());

        match decode_to_radio(&submitted.write.unwrap()) {
            to_radio::PayloadVariant::Packet(p) => {
                assert_eq!(p.to, PEER);
                assert_eq!(p.channel, 1);
                assert_eq!(p.id, submitted.id);
                assert!(p.want_ack);
                assert_eq!(p.decoded().unwrap().payload, b"hello");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_ack_completes_pending_write() {
        let mut session = live();
        let submitted = session
            .submit(&SendRequest::text("hi").want_ack(true), None)
            .unwrap();
        let step = session.handle_inbound(routing(submitted.id, 0));

        assert!(matches!(&step.events[..], [Event::Routing { error_reason: 0, .. }]));
        let ack = submitted.ack.unwrap();
        assert!(matches!(ack.wait(Duration::ZERO), WaitOutcome::Ready(Ok(()))));
        assert_eq!(session.pending_acks(), 0);
    }

    #[test]
    fn test_nak_reports_reason() {
        let mut session = live();
        let submitted = session
            .submit(&SendRequest::text("hi").want_ack(true), None)
            .unwrap();
        session.handle_inbound(routing(submitted.id, 5));

        match submitted.ack.unwrap().wait(Duration::ZERO) {
            WaitOutcome::Ready(Err(Error::Nak { reason })) => assert_eq!(reason, "MAX_RETRANSMIT"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_late_ack_after_timeout_is_ignored() {
        let mut session = live();
        let submitted = session
            .submit(&SendRequest::text("hi").want_ack(true), None)
            .unwrap();
        assert!(session.forget_ack(submitted.id));

        session.handle_inbound(routing(submitted.id, 0));
        let ack = submitted.ack.unwrap();
        assert!(!ack.is_done());
    }

    #[test]
    fn test_queue_status_flow_control() {
        let mut session = live();
        session.handle_inbound(Inbound::QueueStatus(proto::QueueStatus {
            free: 0,
            maxlen: 16,
            ..Default::default()
        }));

        let ids: Vec<_> = (0..3)
            .map(|i| {
                let s = session
                    .submit(&SendRequest::text(&format!("m{i}")), None)
                    .unwrap();
                assert!(s.write.is_none());
                s.id
            })
            .collect();
        assert_eq!(session.queued(), 3);

        let step = session.handle_inbound(Inbound::QueueStatus(proto::QueueStatus {
            free: 2,
            maxlen: 16,
            ..Default::default()
        }));
        let flushed: Vec<_> = step
            .writes
            .iter()
            .map(|w| match decode_to_radio(w) {
                to_radio::PayloadVariant::Packet(p) => p.id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(flushed, ids[..2]);
        assert_eq!(session.queued(), 1);
        assert!(matches!(
            step.events.last(),
            Some(Event::QueueStatus { free: 2, maxlen: 16 })
        ));

        // New packets stay behind the queued one.
        let late = session.submit(&SendRequest::text("late"), None).unwrap();
        assert!(late.write.is_none());
        assert_eq!(session.queued(), 2);
    }

    #[test]
    fn test_heartbeat_bypasses_queue() {
        let mut session = live();
        session.handle_inbound(Inbound::QueueStatus(proto::QueueStatus::default()));
        let later = Instant::now() + Duration::from_secs(10);
        let beat = session.heartbeat(later, Duration::from_secs(5)).unwrap();
        assert_eq!(
            decode_to_radio(&beat),
            to_radio::PayloadVariant::Heartbeat(proto::Heartbeat {})
        );
        assert!(session.heartbeat(later, Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_reboot_while_live_redownloads() {
        let mut session = live();
        let old_id = session.config_id();
        let step = session.handle_inbound(Inbound::Rebooted);

        assert_eq!(session.state(), ConnectionState::ConfigDownload);
        assert!(matches!(&step.events[..], [Event::Rebooted]));
        assert_eq!(
            decode_to_radio(&step.writes[0]),
            to_radio::PayloadVariant::WantConfigId(session.config_id())
        );
        assert_ne!(session.config_id(), old_id);
        assert!(session.nodes().contains(PEER));
    }

    #[test]
    fn test_reboot_during_download_restarts_silently() {
        let mut session = downloading();
        let old_id = session.config_id();
        let step = session.handle_inbound(Inbound::Rebooted);
        assert!(step.events.is_empty());
        assert_eq!(step.writes.len(), 1);
        assert_ne!(session.config_id(), old_id);

        // Completion for the abandoned request is ignored.
        assert!(session.handle_inbound(Inbound::ConfigComplete(old_id)).events.is_empty());
        assert_eq!(session.state(), ConnectionState::ConfigDownload);
    }

    #[test]
    fn test_loss_fails_pending_once() {
        let mut session = live();
        let submitted = session
            .submit(&SendRequest::text("hi").want_ack(true), None)
            .unwrap();

        assert_eq!(session.mark_lost("read error").len(), 1);
        assert!(session.mark_lost("again").is_empty());
        assert_eq!(session.state(), ConnectionState::Lost);
        assert!(matches!(
            submitted.ack.unwrap().wait(Duration::ZERO),
            WaitOutcome::Ready(Err(Error::ConnectionLost))
        ));
    }

    #[test]
    fn test_reply_resolves_waiting_request() {
        let mut session = live();
        let submitted = session
            .submit(&SendRequest::text("ping").want_response(true), None)
            .unwrap();
        let reply = session.expect_response(submitted.id);

        session.handle_inbound(packet(PEER, PortNum::TEXT_MESSAGE, b"other".to_vec(), 0));
        assert!(!reply.is_done());

        let step = session.handle_inbound(packet(
            PEER,
            PortNum::TEXT_MESSAGE,
            b"pong".to_vec(),
            submitted.id,
        ));
        assert!(matches!(&step.events[..], [Event::Text { text, .. }] if text == "pong"));
        match reply.wait(Duration::ZERO) {
            WaitOutcome::Ready(Ok(rx)) => {
                assert_eq!(rx.from, PEER);
                assert_eq!(rx.request_id, Some(submitted.id));
                assert_eq!(&rx.payload[..], b"pong");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(session.awaiting_responses(), 0);
    }

    #[test]
    fn test_routing_ack_keeps_reply_outstanding() {
        let mut session = live();
        let submitted = session
            .submit(
                &SendRequest::text("ping").want_ack(true).want_response(true),
                None,
            )
            .unwrap();
        let reply = session.expect_response(submitted.id);

        session.handle_inbound(routing(submitted.id, 0));
        assert!(!reply.is_done());
        assert_eq!(session.awaiting_responses(), 1);
    }

    #[test]
    fn test_routing_error_fails_waiting_request() {
        let mut session = live();
        let submitted = session
            .submit(&SendRequest::text("ping").want_response(true), None)
            .unwrap();
        let reply = session.expect_response(submitted.id);

        session.handle_inbound(routing(submitted.id, 5));
        match reply.wait(Duration::ZERO) {
            WaitOutcome::Ready(Err(Error::Nak { reason })) => assert_eq!(reason, "MAX_RETRANSMIT"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_loss_fails_waiting_requests() {
        let mut session = live();
        let submitted = session
            .submit(&SendRequest::text("ping").want_response(true), None)
            .unwrap();
        let reply = session.expect_response(submitted.id);

        session.mark_lost("read error");
        assert!(matches!(
            reply.wait(Duration::ZERO),
            WaitOutcome::Ready(Err(Error::ConnectionLost))
        ));
        assert_eq!(session.awaiting_responses(), 0);
    }

    #[test]
    fn test_forgotten_reply_is_ignored() {
        let mut session = live();
        let submitted = session
            .submit(&SendRequest::text("ping").want_response(true), None)
            .unwrap();
        let reply = session.expect_response(submitted.id);
        assert!(session.forget_response(submitted.id));
        assert!(!session.forget_response(submitted.id));

        session.handle_inbound(packet(PEER, PortNum::TEXT_MESSAGE, b"late".to_vec(), submitted.id));
        assert!(!reply.is_done());
    }

    #[test]
    fn test_shutdown_fails_pending() {
        let mut session = live();
        let submitted = session
            .submit(&SendRequest::text("hi").want_ack(true), None)
            .unwrap();
        session.shutdown();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(matches!(
            submitted.ack.unwrap().wait(Duration::ZERO),
            WaitOutcome::Ready(Err(Error::ShutdownInProgress))
        ));
    }

    #[test]
    fn test_packets_update_node_table() {
        let mut session = live();
        let position = proto::Position {
            latitude_i: 515_000_000,
            longitude_i: -1_000_000,
            altitude: 12,
            time: 0,
        };
        let step = session.handle_inbound(packet(PEER, PortNum::POSITION, position.encode_to_vec(), 0));
        assert!(matches!(
            &step.events[..],
            [Event::NodeUpdated(_), Event::Position { .. }]
        ));

        let user = proto::User {
            id: "!11223344".into(),
            long_name: "Peer".into(),
            ..Default::default()
        };
        session.handle_inbound(packet(PEER, PortNum::NODEINFO, user.encode_to_vec(), 0));

        let node = session.nodes().get(PEER).unwrap();
        assert!((node.position.unwrap().latitude - 51.5).abs() < 1e-9);
        assert_eq!(node.long_name(), Some("Peer"));
        assert_eq!(node.last_heard, 1_700_000_000);
    }

    #[test]
    fn test_text_and_unknown_ports() {
        let mut session = live();
        let step = session.handle_inbound(packet(PEER, PortNum::TEXT_MESSAGE, b"hi".to_vec(), 0));
        match &step.events[..] {
            [Event::Text { text, packet }] => {
                assert_eq!(text, "hi");
                assert_eq!(packet.sender(), "!11223344");
            }
            other => panic!("unexpected events {other:?}"),
        }

        let step = session.handle_inbound(packet(PEER, PortNum(300), vec![1], 0));
        assert_eq!(step.events[0].topic(), "receive.data.PORT_300");
    }

    #[test]
    fn test_packet_from_zero_is_dropped() {
        let mut session = live();
        let step = session.handle_inbound(packet(0, PortNum::TEXT_MESSAGE, b"echo".to_vec(), 0));
        assert!(step.events.is_empty());
    }

    #[test]
    fn test_undecodable_payload_falls_back_to_data() {
        let mut session = live();
        let step = session.handle_inbound(packet(PEER, PortNum::POSITION, vec![0x0a, 0x10], 0));
        assert!(matches!(&step.events[..], [Event::Data(_)]));
    }

    #[test]
    fn test_remove_node_on_ack() {
        let mut session = live();
        let request = SendRequest::new(Bytes::new(), PortNum::ADMIN)
            .to(Destination::Local)
            .want_ack(true);
        let submitted = session
            .submit(&request, Some(AckAction::RemoveNode(PEER)))
            .unwrap();

        let step = session.handle_inbound(routing(submitted.id, 0));
        assert!(matches!(step.events[0], Event::NodeRemoved(PEER)));
        assert!(!session.nodes().contains(PEER));
    }

    #[test]
    fn test_liveness() {
        let mut session = live();
        let start = Instant::now();
        session.note_rx(start);
        assert!(!session.liveness_expired(start + Duration::from_secs(1), Duration::from_secs(2)));
        assert!(session.liveness_expired(start + Duration::from_secs(3), Duration::from_secs(2)));

        session.mark_lost("silence");
        assert!(!session.liveness_expired(start + Duration::from_secs(3), Duration::from_secs(2)));
    }

    #[test]
    fn test_reconnect_after_loss() {
        let mut session = live();
        session.mark_lost("gone");
        session.begin_connect();
        assert_eq!(session.state(), ConnectionState::Connecting);
        session.config_request();
        session.config_requested(Instant::now());
        let id = session.config_id();
        let step = session.handle_inbound(Inbound::ConfigComplete(id));
        assert_eq!(step.events.len(), 1);
        assert!(session.nodes().contains(PEER));
    }

    #[test]
    fn test_from_radio_variants_round_trip_into_inbound() {
        let payload = crate::protocol::message::encode_from_radio(
            from_radio::PayloadVariant::QueueStatus(proto::QueueStatus {
                free: 4,
                ..Default::default()
            }),
        );
        let mut session = live();
        let step = session.handle_inbound(Inbound::decode(&payload).unwrap());
        assert_eq!(session.info().tx_queue_free, Some(4));
        assert_eq!(step.events.len(), 1);
    }
}
