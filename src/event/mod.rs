//! Topic-based event dispatch.
//!
//! Events published by the session are delivered synchronously, on the
//! publishing thread, to every subscriber whose pattern matches the event's
//! topic. Topics are dot-separated (`receive.text`, `connection.lost`).
//!
//! Patterns:
//!
//! - an exact topic matches only itself;
//! - a bare prefix matches itself and everything below it on a dot boundary
//!   (`receive` matches `receive.text` but not `receiver`);
//! - `prefix.*` matches strictly deeper topics only;
//! - `*` matches every topic.

use std::borrow::Cow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::protocol::proto;
use crate::session::SessionInfo;
use crate::sync::{Completion, WaitOutcome};
use crate::types::{DeviceMetrics, NodeRecord, Position, ReceivedPacket, UserInfo};

/// Topic of [`Event::Established`].
pub const TOPIC_ESTABLISHED: &str = "connection.established";
/// Topic of [`Event::Lost`].
pub const TOPIC_LOST: &str = "connection.lost";
/// Topic of [`Event::Rebooted`].
pub const TOPIC_REBOOTED: &str = "connection.rebooted";
/// Topic of [`Event::Closed`].
pub const TOPIC_CLOSED: &str = "connection.closed";

/// Events surfaced to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Configuration download finished; the session is live.
    Established(Box<SessionInfo>),
    /// The link to the device was lost.
    Lost { reason: String },
    /// The device restarted; the configuration is being downloaded again.
    Rebooted,
    /// The session was closed by the caller.
    Closed,
    /// A node record was created or changed.
    NodeUpdated(Box<NodeRecord>),
    /// A node was removed from the table.
    NodeRemoved(u32),
    /// A text message.
    Text {
        packet: Box<ReceivedPacket>,
        text: String,
    },
    /// A position report.
    Position {
        packet: Box<ReceivedPacket>,
        position: Position,
    },
    /// A user identity broadcast.
    User {
        packet: Box<ReceivedPacket>,
        user: UserInfo,
    },
    /// A routing message (acknowledgments and failures).
    Routing {
        packet: Box<ReceivedPacket>,
        error_reason: i32,
    },
    /// Device telemetry.
    Telemetry {
        packet: Box<ReceivedPacket>,
        metrics: Option<DeviceMetrics>,
    },
    /// A packet on a port without a typed decoding.
    Data(Box<ReceivedPacket>),
    /// One line of device console output.
    LogLine(String),
    /// A structured device log record.
    LogRecord(proto::LogRecord),
    /// Device transmit queue report.
    QueueStatus { free: u32, maxlen: u32 },
}

impl Event {
    /// Returns the topic this event is published under.
    #[must_use]
    pub fn topic(&self) -> Cow<'static, str> {
        match self {
            Self::Established(_) => Cow::Borrowed(TOPIC_ESTABLISHED),
            Self::Lost { .. } => Cow::Borrowed(TOPIC_LOST),
            Self::Rebooted => Cow::Borrowed(TOPIC_REBOOTED),
            Self::Closed => Cow::Borrowed(TOPIC_CLOSED),
            Self::NodeUpdated(_) => Cow::Borrowed("node.updated"),
            Self::NodeRemoved(_) => Cow::Borrowed("node.removed"),
            Self::Text { .. } => Cow::Borrowed("receive.text"),
            Self::Position { .. } => Cow::Borrowed("receive.position"),
            Self::User { .. } => Cow::Borrowed("receive.user"),
            Self::Routing { .. } => Cow::Borrowed("receive.routing"),
            Self::Telemetry { .. } => Cow::Borrowed("receive.telemetry"),
            Self::Data(packet) => Cow::Owned(format!("receive.data.{}", packet.port.name())),
            Self::LogLine(_) => Cow::Borrowed("log.line"),
            Self::LogRecord(_) => Cow::Borrowed("log.record"),
            Self::QueueStatus { .. } => Cow::Borrowed("queue.status"),
        }
    }

    /// Returns the packet carried by receive events.
    #[must_use]
    pub fn packet(&self) -> Option<&ReceivedPacket> {
        match self {
            Self::Text { packet, .. }
            | Self::Position { packet, .. }
            | Self::User { packet, .. }
            | Self::Routing { packet, .. }
            | Self::Telemetry { packet, .. }
            | Self::Data(packet) => Some(&**packet),
            _ => None,
        }
    }
}

/// Returns true if `pattern` selects `topic`.
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" || pattern == topic {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.len() > 1 && rest.starts_with('.'));
    }
    topic
        .strip_prefix(pattern)
        .is_some_and(|rest| rest.starts_with('.'))
}

/// Handle returned by [`EventDispatcher::subscribe`].
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&str, &Event) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    pattern: String,
    callback: Callback,
    /// Cleared on unsubscribe; checked before every delivery.
    active: Arc<AtomicBool>,
}

impl Subscriber {
    fn retire(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Delivers events to subscribers.
pub struct EventDispatcher {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.len())
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Creates a dispatcher with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a callback for every topic matching `pattern`.
    pub fn subscribe<F>(&self, pattern: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pattern = pattern.into();
        trace!(id, %pattern, "subscribed");
        self.subscribers.lock().push(Subscriber {
            id,
            pattern,
            callback: Arc::new(callback),
            active: Arc::new(AtomicBool::new(true)),
        });
        id
    }

    /// Removes a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(index) = subscribers.iter().position(|s| s.id == id) else {
            return false;
        };
        subscribers.remove(index).retire();
        true
    }

    /// Delivers an event under an explicit topic.
    ///
    /// Callbacks run in registration order without the registry lock held, so
    /// they may subscribe, unsubscribe, or publish. A subscription removed
    /// while an event is being delivered gets no further callbacks, including
    /// for that event; one added meanwhile first sees the next event. A
    /// panicking callback is logged and does not stop delivery to the rest.
    pub fn publish(&self, topic: &str, event: &Event) {
        let targets: Vec<(SubscriptionId, Callback, Arc<AtomicBool>)> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| topic_matches(&s.pattern, topic))
            .map(|s| (s.id, Arc::clone(&s.callback), Arc::clone(&s.active)))
            .collect();

        trace!(topic, subscribers = targets.len(), "publishing");
        for (id, callback, active) in targets {
            if !active.load(Ordering::Acquire) {
                trace!(subscription = id, topic, "skipping removed subscriber");
                continue;
            }
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(topic, event))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                error!(subscription = id, topic, %message, "event subscriber panicked");
            }
        }
    }

    /// Delivers an event under its own topic.
    pub fn emit(&self, event: &Event) {
        self.publish(&event.topic(), event);
    }

    /// Blocks until an event matching `pattern` is published, or the timeout elapses.
    #[must_use]
    pub fn wait_for(&self, pattern: &str, timeout: Duration) -> Option<Event> {
        let done = Completion::new();
        let remote = done.clone();
        let id = self.subscribe(pattern, move |_, event| {
            remote.complete(event.clone());
        });

        let outcome = done.wait(timeout);
        self.unsubscribe(id);
        match outcome {
            WaitOutcome::Ready(event) => Some(event),
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => None,
        }
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Returns true if nobody is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every subscription.
    pub fn clear(&self) {
        for subscriber in self.subscribers.lock().drain(..) {
            subscriber.retire();
        }
    }
}
