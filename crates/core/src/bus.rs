//! In-process message bus.
//!
//! Channels publish [`InboundMessage`]s, the agent loop consumes them and
//! answers with [`OutboundMessage`]s, and token deltas flow out as
//! [`StreamDelta`]s while a turn is still running.
//!
//! Inbound and outbound queues apply backpressure. Stream deltas never do:
//! when the primary stream queue or a subscriber queue is full the delta is
//! dropped and counted, so the token path cannot stall behind a slow reader.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// A user event received by a channel, already normalized to text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Originating channel (e.g. "telegram", "cli")
    pub channel: String,

    pub sender_id: String,

    pub chat_id: String,

    /// Explicit session key; empty means `"{channel}:{chat_id}"`.
    #[serde(default)]
    pub session_key: String,

    pub content: String,

    /// Local files referenced by the message, in arrival order
    #[serde(default)]
    pub media_paths: Vec<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            session_key: String::new(),
            content: content.into(),
            media_paths: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = key.into();
        self
    }

    pub fn with_media(mut self, paths: Vec<String>) -> Self {
        self.media_paths = paths;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The session this message belongs to.
    pub fn session_key(&self) -> String {
        if self.session_key.is_empty() {
            format!("{}:{}", self.channel, self.chat_id)
        } else {
            self.session_key.clone()
        }
    }
}

/// A final response addressed to one chat on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
        }
    }
}

/// An incremental piece of generated text. Exactly one delta per turn has
/// `done == true`, and it is the last one for that chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    pub channel: String,
    pub chat_id: String,
    pub delta: String,
    pub done: bool,
}

impl StreamDelta {
    pub fn text(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        delta: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            delta: delta.into(),
            done: false,
        }
    }

    pub fn done(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            delta: String::new(),
            done: true,
        }
    }
}

/// Predicate over `(channel, chat_id)` deciding which deltas a subscriber sees.
/// `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFilter {
    pub channel: Option<String>,
    pub chat_id: Option<String>,
}

impl StreamFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            chat_id: None,
        }
    }

    pub fn chat(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            chat_id: Some(chat_id.into()),
        }
    }

    pub fn matches(&self, delta: &StreamDelta) -> bool {
        self.channel.as_deref().is_none_or(|c| c == delta.channel)
            && self.chat_id.as_deref().is_none_or(|c| c == delta.chat_id)
    }
}

/// Queue sizes for the three primary channels.
#[derive(Debug, Clone, Copy)]
pub struct BusCapacity {
    pub inbound: usize,
    pub outbound: usize,
    pub stream: usize,
}

impl Default for BusCapacity {
    fn default() -> Self {
        Self {
            inbound: 100,
            outbound: 100,
            stream: 500,
        }
    }
}

/// Identifies a registered stream subscriber.
pub type SubscriberId = u64;

/// The receiving end of a stream subscription.
///
/// The channel is closed once, when the subscriber is removed from the bus;
/// `recv` then drains what is buffered and returns `None`.
#[derive(Debug)]
pub struct StreamSubscription {
    id: SubscriberId,
    rx: mpsc::Receiver<StreamDelta>,
    dropped: Arc<AtomicU64>,
}

impl StreamSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<StreamDelta> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamDelta> {
        self.rx.try_recv().ok()
    }

    /// Deltas that matched this subscriber but were dropped because its buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Point-in-time counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub stream_dropped: u64,
    pub subscriber_dropped: u64,
    pub subscribers: usize,
    pub closed: bool,
}

struct Subscriber {
    id: SubscriberId,
    filter: StreamFilter,
    tx: mpsc::Sender<StreamDelta>,
    dropped: Arc<AtomicU64>,
}

struct Senders {
    inbound: mpsc::Sender<InboundMessage>,
    outbound: mpsc::Sender<OutboundMessage>,
    stream: mpsc::Sender<StreamDelta>,
}

struct State {
    /// `None` once the bus is closed; dropping the senders closes the queues.
    senders: Option<Senders>,
    subscribers: Vec<Subscriber>,
}

/// The shared pub/sub hub. Cheap to share behind an `Arc`.
pub struct MessageBus {
    state: RwLock<State>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
    stream_rx: Mutex<mpsc::Receiver<StreamDelta>>,
    next_id: AtomicU64,
    stream_dropped: AtomicU64,
    subscriber_dropped: AtomicU64,
}

impl MessageBus {
    pub fn new(capacity: BusCapacity) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.inbound.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.outbound.max(1));
        let (stream_tx, stream_rx) = mpsc::channel(capacity.stream.max(1));

        Self {
            state: RwLock::new(State {
                senders: Some(Senders {
                    inbound: inbound_tx,
                    outbound: outbound_tx,
                    stream: stream_tx,
                }),
                subscribers: Vec::new(),
            }),
            inbound_rx: Mutex::new(inbound_rx),
            outbound_rx: Mutex::new(outbound_rx),
            stream_rx: Mutex::new(stream_rx),
            next_id: AtomicU64::new(1),
            stream_dropped: AtomicU64::new(0),
            subscriber_dropped: AtomicU64::new(0),
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- Inbound ---

    /// Queue a message for the agent loop. Waits while the queue is full.
    /// Returns `false` without waiting if the bus is closed.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> bool {
        let tx = match self.read_state().senders.as_ref() {
            Some(s) => s.inbound.clone(),
            None => {
                debug!(channel = %msg.channel, "Bus closed, inbound message discarded");
                return false;
            }
        };
        tx.send(msg).await.is_ok()
    }

    /// Wait for the next inbound message. `None` once the bus is closed and drained.
    ///
    /// Dropping the returned future cancels the wait.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    pub async fn consume_inbound_timeout(&self, timeout: Duration) -> Option<InboundMessage> {
        tokio::time::timeout(timeout, self.consume_inbound())
            .await
            .ok()
            .flatten()
    }

    // --- Outbound ---

    pub async fn publish_outbound(&self, msg: OutboundMessage) -> bool {
        let tx = match self.read_state().senders.as_ref() {
            Some(s) => s.outbound.clone(),
            None => {
                debug!(channel = %msg.channel, "Bus closed, outbound message discarded");
                return false;
            }
        };
        tx.send(msg).await.is_ok()
    }

    pub async fn subscribe_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }

    pub async fn subscribe_outbound_timeout(&self, timeout: Duration) -> Option<OutboundMessage> {
        tokio::time::timeout(timeout, self.subscribe_outbound())
            .await
            .ok()
            .flatten()
    }

    // --- Stream ---

    /// Publish a delta to the primary stream and every matching subscriber.
    /// Never waits: full queues drop the delta and bump a counter.
    pub fn publish_stream_delta(&self, delta: StreamDelta) {
        let state = self.read_state();
        let Some(senders) = state.senders.as_ref() else {
            return;
        };

        for sub in state.subscribers.iter().filter(|s| s.filter.matches(&delta)) {
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(delta.clone()) {
                let n = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.subscriber_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(subscriber = sub.id, dropped = n, "Subscriber buffer full, delta dropped");
            }
        }

        if let Err(mpsc::error::TrySendError::Full(_)) = senders.stream.try_send(delta) {
            let n = self.stream_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(dropped = n, "Stream buffer full, delta dropped");
        }
    }

    /// Wait for the next delta on the primary stream.
    pub async fn subscribe_stream(&self) -> Option<StreamDelta> {
        self.stream_rx.lock().await.recv().await
    }

    pub async fn subscribe_stream_timeout(&self, timeout: Duration) -> Option<StreamDelta> {
        tokio::time::timeout(timeout, self.subscribe_stream())
            .await
            .ok()
            .flatten()
    }

    /// Register an extra stream consumer with its own bounded buffer.
    ///
    /// The caller must hand the id back to [`remove_stream_subscriber`](Self::remove_stream_subscriber).
    pub fn add_stream_subscriber(&self, filter: StreamFilter, capacity: usize) -> StreamSubscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));

        self.write_state().subscribers.push(Subscriber {
            id,
            filter,
            tx,
            dropped: dropped.clone(),
        });
        debug!(subscriber = id, "Stream subscriber added");

        StreamSubscription { id, rx, dropped }
    }

    /// Unregister a subscriber and close its channel. Returns `false` if the
    /// id was unknown (already removed), in which case nothing is closed.
    pub fn remove_stream_subscriber(&self, id: SubscriberId) -> bool {
        let mut state = self.write_state();
        match state.subscribers.iter().position(|s| s.id == id) {
            Some(idx) => {
                // Dropping the only sender closes the subscriber's channel.
                state.subscribers.remove(idx);
                debug!(subscriber = id, "Stream subscriber removed");
                true
            }
            None => false,
        }
    }

    // --- Lifecycle ---

    /// Close the three primary queues. Safe to call more than once.
    ///
    /// Consumers still drain whatever was buffered before close. Subscribers
    /// stay registered (and receive nothing further) until removed.
    pub fn close(&self) {
        let mut state = self.write_state();
        if state.senders.take().is_some() {
            debug!("Message bus closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.read_state().senders.is_none()
    }

    pub fn stats(&self) -> BusStats {
        let state = self.read_state();
        BusStats {
            stream_dropped: self.stream_dropped.load(Ordering::Relaxed),
            subscriber_dropped: self.subscriber_dropped.load(Ordering::Relaxed),
            subscribers: state.subscribers.len(),
            closed: state.senders.is_none(),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusCapacity::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn inbound_roundtrip() {
        let bus = MessageBus::default();
        assert!(bus.publish_inbound(InboundMessage::new("cli", "u1", "c1", "hello")).await);

        let msg = bus.consume_inbound().await.unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.session_key(), "cli:c1");
    }

    #[test]
    fn explicit_session_key_wins() {
        let msg = InboundMessage::new("gateway", "u", "chat", "x").with_session_key("desk:main");
        assert_eq!(msg.session_key(), "desk:main");
    }

    #[tokio::test]
    async fn outbound_roundtrip() {
        let bus = MessageBus::default();
        bus.publish_outbound(OutboundMessage::new("telegram", "42", "hi")).await;
        let out = bus.subscribe_outbound().await.unwrap();
        assert_eq!(out.chat_id, "42");
    }

    #[tokio::test]
    async fn close_twice_is_harmless() {
        let bus = MessageBus::default();
        bus.close();
        bus.close();
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn publish_after_close_neither_blocks_nor_delivers() {
        let bus = MessageBus::new(BusCapacity {
            inbound: 1,
            outbound: 1,
            stream: 1,
        });
        bus.close();

        // Capacity is 1, so a blocking send would hang on the second call.
        let first = tokio::time::timeout(
            WAIT,
            bus.publish_inbound(InboundMessage::new("cli", "u", "c", "a")),
        )
        .await;
        let second = tokio::time::timeout(
            WAIT,
            bus.publish_inbound(InboundMessage::new("cli", "u", "c", "b")),
        )
        .await;
        assert_eq!(first, Ok(false));
        assert_eq!(second, Ok(false));
        assert!(!bus.publish_outbound(OutboundMessage::new("cli", "c", "x")).await);

        assert!(bus.consume_inbound_timeout(WAIT).await.is_none());
    }

    #[tokio::test]
    async fn buffered_inbound_survives_close() {
        let bus = MessageBus::default();
        bus.publish_inbound(InboundMessage::new("cli", "u", "c", "queued")).await;
        bus.close();

        assert_eq!(bus.consume_inbound().await.unwrap().content, "queued");
        assert!(bus.consume_inbound().await.is_none());
    }

    #[tokio::test]
    async fn consume_inbound_times_out_when_idle() {
        let bus = MessageBus::default();
        assert!(bus.consume_inbound_timeout(WAIT).await.is_none());
    }

    #[tokio::test]
    async fn full_stream_drops_instead_of_blocking() {
        let bus = MessageBus::new(BusCapacity {
            inbound: 4,
            outbound: 4,
            stream: 2,
        });
        for i in 0..5 {
            bus.publish_stream_delta(StreamDelta::text("cli", "c", format!("d{i}")));
        }
        assert_eq!(bus.stats().stream_dropped, 3);

        assert_eq!(bus.subscribe_stream().await.unwrap().delta, "d0");
        assert_eq!(bus.subscribe_stream().await.unwrap().delta, "d1");
    }

    #[tokio::test]
    async fn subscribers_with_disjoint_filters_are_isolated() {
        let bus = MessageBus::default();
        let mut a = bus.add_stream_subscriber(StreamFilter::chat("gateway", "a"), 8);
        let mut b = bus.add_stream_subscriber(StreamFilter::chat("gateway", "b"), 8);

        bus.publish_stream_delta(StreamDelta::text("gateway", "a", "for-a"));
        bus.publish_stream_delta(StreamDelta::text("gateway", "b", "for-b"));

        assert_eq!(a.recv().await.unwrap().delta, "for-a");
        assert_eq!(b.recv().await.unwrap().delta, "for-b");
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());

        // Removing one leaves the other untouched
        assert!(bus.remove_stream_subscriber(a.id()));
        bus.publish_stream_delta(StreamDelta::text("gateway", "b", "again"));
        assert_eq!(b.recv().await.unwrap().delta, "again");
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn remove_closes_exactly_once() {
        let bus = MessageBus::default();
        let mut sub = bus.add_stream_subscriber(StreamFilter::all(), 4);
        bus.publish_stream_delta(StreamDelta::text("cli", "c", "tail"));

        assert!(bus.remove_stream_subscriber(sub.id()));
        assert!(!bus.remove_stream_subscriber(sub.id()));
        assert_eq!(bus.stats().subscribers, 0);

        // Buffered delta is still drained before the closed channel reports None
        assert_eq!(sub.recv().await.unwrap().delta, "tail");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_are_counted() {
        let bus = MessageBus::default();
        let sub = bus.add_stream_subscriber(StreamFilter::channel("cli"), 1);
        bus.publish_stream_delta(StreamDelta::text("cli", "c", "1"));
        bus.publish_stream_delta(StreamDelta::text("cli", "c", "2"));
        bus.publish_stream_delta(StreamDelta::text("telegram", "c", "ignored"));

        assert_eq!(sub.dropped(), 1);
        assert_eq!(bus.stats().subscriber_dropped, 1);
    }

    #[tokio::test]
    async fn deltas_keep_fifo_order_per_chat() {
        let bus = MessageBus::default();
        let mut sub = bus.add_stream_subscriber(StreamFilter::chat("cli", "c"), 16);
        for i in 0..5 {
            bus.publish_stream_delta(StreamDelta::text("cli", "c", i.to_string()));
        }
        bus.publish_stream_delta(StreamDelta::done("cli", "c"));

        let mut seen = Vec::new();
        while let Some(d) = sub.recv().await {
            if d.done {
                break;
            }
            seen.push(d.delta);
        }
        assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn stream_publish_after_close_is_noop() {
        let bus = MessageBus::default();
        let mut sub = bus.add_stream_subscriber(StreamFilter::all(), 4);
        bus.close();
        bus.publish_stream_delta(StreamDelta::text("cli", "c", "late"));
        assert!(sub.try_recv().is_none());
        assert!(bus.remove_stream_subscriber(sub.id()));
    }

    #[test]
    fn filter_matching() {
        let d = StreamDelta::text("telegram", "7", "x");
        assert!(StreamFilter::all().matches(&d));
        assert!(StreamFilter::channel("telegram").matches(&d));
        assert!(StreamFilter::chat("telegram", "7").matches(&d));
        assert!(!StreamFilter::chat("telegram", "8").matches(&d));
        assert!(!StreamFilter::channel("cli").matches(&d));
    }
}
