//! Main [`MeshLink`] client implementation.
//!
//! A [`MeshLink`] owns one connection: the transport, the session state
//! machine, the event dispatcher and the reader thread. Every public method is
//! blocking and may be called from any thread, including from inside an event
//! callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::event::{
    Event, EventDispatcher, SubscriptionId, TOPIC_CLOSED, TOPIC_ESTABLISHED, TOPIC_LOST,
};
use crate::protocol::proto::{self, PortNum, admin_message};
use crate::protocol::{Inbound, Outbound};
use crate::reader::ReaderHandle;
use crate::session::{
    AckAction, ConnectionState, ResponseHandle, Session, SessionInfo, Submitted,
};
use crate::sync::{Completion, WaitOutcome};
use crate::transport::{
    SerialConfig, SerialTransport, TcpConfig, TcpTransport, Transport, TransportConfig,
    TransportKind,
};
use crate::types::{
    Destination, NodeRecord, NodeTable, PacketId, ReceivedPacket, SendRequest,
};

/// State shared between the caller-facing handle and the reader thread.
pub(crate) struct Link {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) session: Mutex<Session>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) config: LinkConfig,
    /// Set when a write fails; the reader turns it into a loss.
    pub(crate) link_failed: AtomicBool,
}

impl Link {
    fn new(transport: Arc<dyn Transport>, config: LinkConfig) -> Self {
        Self {
            transport,
            session: Mutex::new(Session::new()),
            dispatcher: EventDispatcher::new(),
            config,
            link_failed: AtomicBool::new(false),
        }
    }

    /// Writes with the session lock held so payloads leave in session order.
    fn write_locked(&self, session: &mut Session, payload: &[u8]) -> Result<()> {
        match self.transport.write(payload) {
            Ok(()) => {
                session.note_tx(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.link_failed.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Opens the transport and requests the configuration download.
    pub(crate) fn establish(&self) -> Result<()> {
        self.link_failed.store(false, Ordering::SeqCst);
        self.transport.open()?;

        let result = {
            let mut session = self.session.lock();
            session.begin_connect();
            let request = session.config_request();
            self.write_locked(&mut session, &request)
                .map(|()| session.config_requested(Instant::now()))
        };
        if result.is_err() {
            self.link_failed.store(false, Ordering::SeqCst);
            self.close_transport();
        }
        result
    }

    /// Decodes one frame, applies it and publishes what it produced.
    pub(crate) fn process_frame(&self, payload: &[u8]) {
        trace!(len = payload.len(), payload = %hex::encode(payload), "frame");
        let msg = match Inbound::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(len = payload.len(), "undecodable frame: {}", e);
                return;
            }
        };

        let events = {
            let mut session = self.session.lock();
            let step = session.handle_inbound(msg);
            for write in &step.writes {
                if let Err(e) = self.write_locked(&mut session, write) {
                    warn!("write failed: {}", e);
                    break;
                }
            }
            step.events
        };
        for event in &events {
            self.dispatcher.emit(event);
        }
    }

    /// Periodic checks between reads. Returns a loss reason if the link is dead.
    pub(crate) fn housekeeping(&self, now: Instant) -> Option<String> {
        let mut session = self.session.lock();
        if self
            .config
            .liveness_timeout
            .is_some_and(|timeout| session.liveness_expired(now, timeout))
        {
            return Some("no traffic from device".into());
        }
        if let Some(beat) = self
            .config
            .heartbeat_interval
            .and_then(|interval| session.heartbeat(now, interval))
        {
            if let Err(e) = self.write_locked(&mut session, &beat) {
                warn!("heartbeat failed: {}", e);
            }
        }
        None
    }

    /// Reports a failed link to the session and closes the transport.
    pub(crate) fn lose(&self, reason: &str) {
        let events = self.session.lock().mark_lost(reason);
        self.close_transport();
        for event in &events {
            self.dispatcher.emit(event);
        }
    }

    pub(crate) fn close_transport(&self) {
        if let Err(e) = self.transport.close() {
            warn!("closing transport failed: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Start {
    AlreadyLive,
    Started,
    Pending,
}

/// Client for one mesh radio.
///
/// Dropping the handle closes the connection.
pub struct MeshLink {
    link: Arc<Link>,
    reader: Mutex<Option<ReaderHandle>>,
    closing: AtomicBool,
}

impl std::fmt::Debug for MeshLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshLink")
            .field("transport", &self.link.transport.kind())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MeshLink {
    /// Creates a client for a serial port (not yet connected).
    #[must_use]
    pub fn serial(port: impl Into<String>) -> Self {
        Self::with_transport(
            Arc::new(SerialTransport::new(SerialConfig::new(port))),
            LinkConfig::default(),
        )
    }

    /// Creates a client for a networked device (`host` or `host:port`).
    #[must_use]
    pub fn tcp(host: impl Into<String>) -> Self {
        Self::with_transport(
            Arc::new(TcpTransport::new(TcpConfig::new(host))),
            LinkConfig::default(),
        )
    }

    /// Creates a client for a Bluetooth device matched by name or address.
    #[cfg(feature = "ble")]
    #[must_use]
    pub fn ble(device: impl Into<String>) -> Self {
        use crate::transport::ble::{BleConfig, BleTransport};
        Self::with_transport(
            Arc::new(BleTransport::new(BleConfig::new(device))),
            LinkConfig::default(),
        )
    }

    /// Creates a client over any transport.
    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>, config: LinkConfig) -> Self {
        Self {
            link: Arc::new(Link::new(transport, config)),
            reader: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    /// Connects and blocks until the configuration download completes.
    ///
    /// Returns immediately if the session is already live. If another
    /// connection attempt is in flight, waits for it instead of starting a
    /// second one.
    pub fn connect(&self) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::ShutdownInProgress);
        }
        let timeout = self.link.config.connect_timeout;
        let done: Completion<Result<()>> = Completion::new();

        // Subscribe first so an establishment racing the request is not missed.
        let on_established = done.clone();
        let on_lost = done.clone();
        let on_closed = done.clone();
        let dispatcher = &self.link.dispatcher;
        let subscriptions = [
            dispatcher.subscribe(TOPIC_ESTABLISHED, move |_, _| {
                on_established.complete(Ok(()));
            }),
            dispatcher.subscribe(TOPIC_LOST, move |_, _| {
                on_lost.complete(Err(Error::ConnectionLost));
            }),
            dispatcher.subscribe(TOPIC_CLOSED, move |_, _| {
                on_closed.cancel();
            }),
        ];

        let result = match self.start_if_idle() {
            Ok(Start::AlreadyLive) => Ok(()),
            Ok(start) => {
                let result = match done.wait(timeout) {
                    WaitOutcome::Ready(result) => result,
                    WaitOutcome::Cancelled => Err(Error::ShutdownInProgress),
                    WaitOutcome::TimedOut => Err(Error::timeout(timeout)),
                };
                if result.is_err() && start == Start::Started {
                    self.abandon_connect();
                }
                result
            }
            Err(e) => Err(e),
        };
        self.unsubscribe_all(&subscriptions);

        match &result {
            Ok(()) => info!(node = ?self.my_node_num(), "connected"),
            Err(e) => warn!("connect failed: {}", e),
        }
        result
    }

    fn start_if_idle(&self) -> Result<Start> {
        let mut reader = self.reader.lock();
        let state = self.link.session.lock().state();
        match state {
            ConnectionState::Live => return Ok(Start::AlreadyLive),
            ConnectionState::Disconnected => {}
            _ => {
                debug!(%state, "connection attempt already in progress");
                return Ok(Start::Pending);
            }
        }

        // A reader that gave up reconnecting has left its loop already.
        if let Some(previous) = reader.take() {
            if !previous.is_finished() {
                previous.stop();
            }
            previous.join(self.link.config.join_timeout);
        }

        info!(transport = %self.link.transport.kind(), "connecting");
        if let Err(e) = self.link.establish() {
            self.link.session.lock().settle();
            return Err(e);
        }
        match ReaderHandle::spawn(Arc::clone(&self.link)) {
            Ok(handle) => {
                *reader = Some(handle);
                Ok(Start::Started)
            }
            Err(e) => {
                self.link.close_transport();
                self.link.session.lock().settle();
                Err(e)
            }
        }
    }

    fn abandon_connect(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = &reader {
            reader.stop();
        }
        self.link.close_transport();
        if let Some(reader) = reader {
            reader.join(self.link.config.join_timeout);
            // A reconnect that was opening the transport has finished by now.
            self.link.close_transport();
        }
        self.link.session.lock().settle();
    }

    fn unsubscribe_all(&self, ids: &[SubscriptionId]) {
        for &id in ids {
            self.link.dispatcher.unsubscribe(id);
        }
    }

    /// Sends a packet. With `want_ack` set, blocks until the device
    /// acknowledges it, rejects it, or the acknowledgment timeout elapses.
    pub fn send(&self, request: &SendRequest) -> Result<PacketId> {
        self.submit(request, None)
    }

    /// Sends a text message.
    pub fn send_text(
        &self,
        text: &str,
        destination: impl Into<Destination>,
        want_ack: bool,
    ) -> Result<PacketId> {
        self.send(&SendRequest::text(text).to(destination).want_ack(want_ack))
    }

    /// Sends an application payload on `port`.
    pub fn send_data(
        &self,
        payload: impl Into<Bytes>,
        port: PortNum,
        destination: impl Into<Destination>,
        want_ack: bool,
    ) -> Result<PacketId> {
        self.send(
            &SendRequest::new(payload, port)
                .to(destination)
                .want_ack(want_ack),
        )
    }

    /// Asks the attached radio to forget a node. The local node table drops
    /// the record once the radio acknowledges.
    pub fn remove_node(&self, num: u32) -> Result<()> {
        let admin = proto::AdminMessage {
            payload_variant: Some(admin_message::PayloadVariant::RemoveByNodenum(num)),
        };
        let request = SendRequest::new(admin.encode_to_vec(), PortNum::ADMIN)
            .to(Destination::Local)
            .want_ack(true);
        self.submit(&request, Some(AckAction::RemoveNode(num)))
            .map(|_| ())
    }

    /// Sends a request and blocks until the packet answering it arrives.
    ///
    /// The packet goes out with `want_response` set. The reply is matched by
    /// its request id and returned whatever its port. A routing error for the
    /// request ends the wait early with [`Error::Nak`]; otherwise the wait is
    /// bounded by [`LinkConfig::response_timeout`].
    pub fn send_with_response(&self, request: &SendRequest) -> Result<ReceivedPacket> {
        let request = request.clone().want_response(true);
        let (submitted, reply) = self.dispatch(&request, None, true)?;
        let Some(reply) = reply else {
            return Err(Error::NotConnected);
        };
        self.wait_tracked(
            &reply,
            self.link.config.response_timeout,
            submitted.id,
            Session::forget_response,
        )
    }

    fn submit(&self, request: &SendRequest, action: Option<AckAction>) -> Result<PacketId> {
        let (submitted, _) = self.dispatch(request, action, false)?;
        let id = submitted.id;
        let Some(ack) = submitted.ack else {
            return Ok(id);
        };
        self.wait_tracked(&ack, self.link.config.ack_timeout, id, Session::forget_ack)
            .map(|()| id)
    }

    /// Registers a packet with the session and writes it, both under the
    /// session lock.
    fn dispatch(
        &self,
        request: &SendRequest,
        action: Option<AckAction>,
        expect_response: bool,
    ) -> Result<(Submitted, Option<ResponseHandle>)> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::ShutdownInProgress);
        }

        let mut session = self.link.session.lock();
        let mut submitted = session.submit(request, action)?;
        let reply = expect_response.then(|| {
            // The reply settles the request; an ack alone is not waited for.
            if submitted.ack.take().is_some() {
                session.forget_ack(submitted.id);
            }
            session.expect_response(submitted.id)
        });
        if let Some(payload) = &submitted.write {
            if let Err(e) = self.link.write_locked(&mut session, payload) {
                session.abandon(submitted.id);
                return Err(e);
            }
        }
        Ok((submitted, reply))
    }

    /// Waits on a handle the session tracks under `id`. On timeout the entry
    /// is dropped under the session lock unless it resolved first, so each
    /// outcome is reported exactly once.
    fn wait_tracked<T>(
        &self,
        handle: &Completion<Result<T>>,
        timeout: Duration,
        id: PacketId,
        forget: fn(&mut Session, PacketId) -> bool,
    ) -> Result<T> {
        match handle.wait(timeout) {
            WaitOutcome::Ready(result) => result,
            WaitOutcome::Cancelled => Err(Error::ShutdownInProgress),
            WaitOutcome::TimedOut => {
                if forget(&mut self.link.session.lock(), id) {
                    handle.cancel();
                    debug!(id, ?timeout, "wait for device timed out");
                    return Err(Error::timeout(timeout));
                }
                // Resolved between the timeout and taking the lock.
                match handle.wait(Duration::ZERO) {
                    WaitOutcome::Ready(result) => result,
                    WaitOutcome::Cancelled | WaitOutcome::TimedOut => {
                        Err(Error::timeout(timeout))
                    }
                }
            }
        }
    }

    /// Registers a callback for topics matching `pattern`.
    pub fn subscribe<F>(&self, pattern: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        self.link.dispatcher.subscribe(pattern, callback)
    }

    /// Removes a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.link.dispatcher.unsubscribe(id)
    }

    /// Blocks until an event matching `pattern` arrives.
    #[must_use]
    pub fn wait_for(&self, pattern: &str, timeout: Duration) -> Option<Event> {
        self.link.dispatcher.wait_for(pattern, timeout)
    }

    /// Closes the connection. Calling it again is a no-op.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing");

        let state = self.link.session.lock().state();
        if matches!(
            state,
            ConnectionState::Live | ConnectionState::ConfigDownload
        ) {
            if let Err(e) = self.link.transport.write(&Outbound::Disconnect.encode()) {
                debug!("disconnect notice not sent: {}", e);
            }
        }

        let reader = self.reader.lock().take();
        if let Some(reader) = &reader {
            reader.stop();
        }
        self.link.close_transport();
        if let Some(reader) = reader {
            reader.join(self.link.config.join_timeout);
            // A reconnect that was opening the transport has finished by now.
            self.link.close_transport();
        }

        self.link.session.lock().shutdown();
        self.link.dispatcher.emit(&Event::Closed);
        self.link.dispatcher.clear();
        info!("closed");
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.link.session.lock().state()
    }

    /// Snapshot of the node table.
    #[must_use]
    pub fn nodes(&self) -> NodeTable {
        self.link.session.lock().nodes().clone()
    }

    /// Snapshot of one node.
    #[must_use]
    pub fn node(&self, num: u32) -> Option<NodeRecord> {
        self.link.session.lock().nodes().get(num).cloned()
    }

    /// Snapshot of what the device reported about itself.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        self.link.session.lock().info().clone()
    }

    /// Node number of the attached radio, once known.
    #[must_use]
    pub fn my_node_num(&self) -> Option<u32> {
        self.link.session.lock().my_node_num()
    }

    /// The transport medium.
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.link.transport.kind()
    }
}

impl Drop for MeshLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builds a transport, connects, and returns the live client.
pub fn connect(transport: TransportConfig, config: LinkConfig) -> Result<MeshLink> {
    let link = MeshLink::with_transport(transport.build()?, config);
    link.connect()?;
    Ok(link)
}
