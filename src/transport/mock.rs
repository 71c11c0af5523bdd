//! In-memory transport and simulated device for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use prost::Message;

use crate::error::{Error, Result};
use crate::protocol::encode_frame;
use crate::protocol::message::encode_from_radio;
use crate::protocol::proto::{self, from_radio, to_radio};
use crate::transport::{Transport, TransportKind};

/// Node number of the simulated local radio.
pub const LOCAL_NODE: u32 = 0x0a0b_0c0d;
/// Node number of a simulated remote peer.
pub const PEER_NODE: u32 = 0x1122_3344;

type Responder = Box<dyn Fn(&proto::ToRadio) -> Vec<Bytes> + Send + Sync>;

/// Loopback transport: tests push inbound bytes and inspect what was written.
pub struct MockTransport {
    inbound: Mutex<VecDeque<Bytes>>,
    arrived: Condvar,
    written: Mutex<Vec<Bytes>>,
    responder: Mutex<Option<Responder>>,
    log_lines: Mutex<Vec<String>>,
    open_delay: Mutex<Duration>,
    open: AtomicBool,
    broken: AtomicBool,
    fail_writes: AtomicBool,
    fail_opens: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
            written: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            log_lines: Mutex::new(Vec::new()),
            open_delay: Mutex::new(Duration::ZERO),
            open: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_opens: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    /// A transport answering like a radio: config download and routing acks.
    pub fn device() -> Self {
        let mock = Self::new();
        mock.respond_with(simulated_device);
        mock
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&proto::ToRadio) -> Vec<Bytes> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Queues raw stream bytes.
    pub fn push_raw(&self, bytes: impl Into<Bytes>) {
        self.inbound.lock().push_back(bytes.into());
        self.arrived.notify_all();
    }

    /// Queues one framed `FromRadio` payload.
    pub fn push(&self, variant: from_radio::PayloadVariant) {
        self.push_payload(&encode_from_radio(variant));
    }

    pub fn push_payload(&self, payload: &[u8]) {
        self.push_raw(encode_frame(payload).unwrap());
    }

    /// Queues a device log line delivered outside the byte stream.
    pub fn push_log_line(&self, line: &str) {
        self.log_lines.lock().push(line.to_owned());
        self.arrived.notify_all();
    }

    /// Makes every subsequent read fail until reopened.
    pub fn break_link(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.arrived.notify_all();
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }

    /// Makes every subsequent `open` take `delay` before it succeeds.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Decoded `ToRadio` messages written so far.
    pub fn sent(&self) -> Vec<proto::ToRadio> {
        self.written
            .lock()
            .iter()
            .map(|p| proto::ToRadio::decode(&p[..]).unwrap())
            .collect()
    }

    pub fn sent_packets(&self) -> Vec<proto::MeshPacket> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m.payload_variant {
                Some(to_radio::PayloadVariant::Packet(p)) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn open(&self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::transport("simulated open failure"));
        }
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.broken.store(false, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, timeout: Duration) -> Result<Bytes> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let mut inbound = self.inbound.lock();
        self.arrived.wait_while_for(
            &mut inbound,
            |q| {
                q.is_empty()
                    && !self.broken.load(Ordering::SeqCst)
                    && self.open.load(Ordering::SeqCst)
            },
            timeout,
        );

        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLost);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let mut out = BytesMut::new();
        while let Some(chunk) = inbound.pop_front() {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    fn write(&self, payload: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::transport("simulated write failure"));
        }
        self.written.lock().push(Bytes::copy_from_slice(payload));

        let replies = match (
            self.responder.lock().as_ref(),
            proto::ToRadio::decode(payload),
        ) {
            (Some(responder), Ok(msg)) => responder(&msg),
            _ => Vec::new(),
        };
        for reply in replies {
            self.push_payload(&reply);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        self.arrived.notify_all();
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn take_log_lines(&self) -> Vec<String> {
        std::mem::take(&mut *self.log_lines.lock())
    }
}

/// Routing packet acknowledging `request_id` with the given error reason.
pub fn routing_reply(request_id: u32, error_reason: i32) -> Bytes {
    let routing = proto::Routing {
        variant: Some(proto::routing::Variant::ErrorReason(error_reason)),
    };
    encode_from_radio(from_radio::PayloadVariant::Packet(proto::MeshPacket {
        from: LOCAL_NODE,
        to: LOCAL_NODE,
        id: request_id.wrapping_add(1000),
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: proto::PortNum::ROUTING.0,
            payload: routing.encode_to_vec(),
            request_id,
            ..Default::default()
        })),
        ..Default::default()
    }))
}

/// The configuration download a radio sends for `want_config_id`.
pub fn config_download(config_id: u32) -> Vec<Bytes> {
    let node = |num: u32, name: &str| proto::NodeInfo {
        num,
        user: Some(proto::User {
            id: format!("!{num:08x}"),
            long_name: name.into(),
            short_name: name.chars().take(4).collect(),
            ..Default::default()
        }),
        ..Default::default()
    };
    vec![
        encode_from_radio(from_radio::PayloadVariant::MyInfo(proto::MyNodeInfo {
            my_node_num: LOCAL_NODE,
            reboot_count: 3,
            min_app_version: 30200,
        })),
        encode_from_radio(from_radio::PayloadVariant::Metadata(proto::DeviceMetadata {
            firmware_version: "2.5.6".into(),
            device_state_version: 23,
            hw_model: 9,
        })),
        encode_from_radio(from_radio::PayloadVariant::NodeInfo(node(LOCAL_NODE, "Local"))),
        encode_from_radio(from_radio::PayloadVariant::NodeInfo(node(PEER_NODE, "Peer"))),
        encode_from_radio(from_radio::PayloadVariant::Channel(proto::Channel {
            index: 0,
            settings: vec![0x0a, 0x00],
            role: 1,
        })),
        encode_from_radio(from_radio::PayloadVariant::Config(vec![0x0a, 0x02, 0x08, 0x01])),
        encode_from_radio(from_radio::PayloadVariant::ConfigCompleteId(config_id)),
    ]
}

/// A text reply from the peer answering the request `request_id`.
pub fn response_reply(request_id: u32, text: &str) -> Bytes {
    encode_from_radio(from_radio::PayloadVariant::Packet(proto::MeshPacket {
        from: PEER_NODE,
        to: LOCAL_NODE,
        id: request_id.wrapping_add(2000),
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: proto::PortNum::TEXT_MESSAGE.0,
            payload: text.as_bytes().to_vec(),
            request_id,
            ..Default::default()
        })),
        ..Default::default()
    }))
}

fn simulated_device(msg: &proto::ToRadio) -> Vec<Bytes> {
    match &msg.payload_variant {
        Some(to_radio::PayloadVariant::WantConfigId(id)) => config_download(*id),
        Some(to_radio::PayloadVariant::Packet(p)) if p.want_ack => vec![routing_reply(p.id, 0)],
        _ => Vec::new(),
    }
}
