//! Topic Bus
//!
//! In-process publish/subscribe keyed by topic string, built on tokio
//! broadcast channels. Constructed once at startup and shared by `Arc`.
//!
//! # Topic Families
//!
//! - Feed topics `"<feed-kind>/<code>"` carry [`FeedEvent`]s republished
//!   by ingestors, so listeners can watch one code without going through
//!   a broadcaster.
//! - Control topics carry [`ControlEvent`]s used for subsystem signaling.
//!
//! A topic exists while someone subscribes to it. When a handler listener
//! stops, its topic is dropped if no receiver is left.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::feed::{Code, FeedEvent, FeedKind};

// =============================================================================
// Topics
// =============================================================================

/// Request to keep a tick stream open for a code.
pub const TOPIC_SUBSCRIBE_TICK: &str = "stream/subscribe/tick";

/// Request to keep a bid/ask stream open for a code.
pub const TOPIC_SUBSCRIBE_BID_ASK: &str = "stream/subscribe/bidask";

/// Request to keep a stock quote stream open for a code.
pub const TOPIC_SUBSCRIBE_STOCK_QUOTE: &str = "stream/subscribe/stock/quote";

/// Reference data has been loaded.
pub const TOPIC_REFERENCE_DATA_READY: &str = "basic/data/updated";

/// Topic a feed event for `code` is published under.
#[must_use]
pub fn feed_topic(kind: FeedKind, code: &str) -> String {
    format!("{kind}/{code}")
}

/// Control topic requesting a subscription for `kind`, if it has one.
#[must_use]
pub const fn subscribe_topic(kind: FeedKind) -> Option<&'static str> {
    match kind {
        FeedKind::Tick => Some(TOPIC_SUBSCRIBE_TICK),
        FeedKind::BidAsk => Some(TOPIC_SUBSCRIBE_BID_ASK),
        FeedKind::Quote => Some(TOPIC_SUBSCRIBE_STOCK_QUOTE),
        FeedKind::Trade => None,
    }
}

// =============================================================================
// Events
// =============================================================================

/// Subsystem signaling payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Keep `kind` streaming for `code`.
    Subscribe {
        /// Feed kind.
        kind: FeedKind,
        /// Instrument code.
        code: Code,
    },
    /// Reference data is loaded; dependent streams may start.
    ReferenceDataReady,
}

/// Everything the bus carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Republished upstream event.
    Feed(FeedEvent),
    /// Control signal.
    Control(ControlEvent),
}

impl From<FeedEvent> for BusEvent {
    fn from(event: FeedEvent) -> Self {
        Self::Feed(event)
    }
}

impl From<ControlEvent> for BusEvent {
    fn from(event: ControlEvent) -> Self {
        Self::Control(event)
    }
}

// =============================================================================
// Topic Bus
// =============================================================================

/// Default per-topic buffer.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

type Topics = Arc<RwLock<HashMap<String, broadcast::Sender<BusEvent>>>>;

/// Topic-keyed broadcast hub.
#[derive(Debug)]
pub struct TopicBus {
    topics: Topics,
    capacity: usize,
}

/// Shared handle.
pub type SharedTopicBus = Arc<TopicBus>;

impl Default for TopicBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl TopicBus {
    /// Create a bus with the given per-topic buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Publish on a topic.
    ///
    /// Returns the number of receivers reached; 0 when nobody is
    /// subscribed. Never creates a topic.
    pub fn publish(&self, topic: &str, event: impl Into<BusEvent>) -> usize {
        self.topics
            .read()
            .get(topic)
            .and_then(|sender| sender.send(event.into()).ok())
            .unwrap_or(0)
    }

    /// Raw receiver for a topic.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.subscribe();
        }
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Run `handler` for each event on `topic`, in order, until cancelled.
    pub fn subscribe_with<F>(
        &self,
        topic: &str,
        cancel: CancellationToken,
        mut handler: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(BusEvent) + Send + 'static,
    {
        let rx = self.subscribe(topic);
        let topic = topic.to_string();
        let topics = Arc::clone(&self.topics);
        tokio::spawn(async move {
            run_listener(rx, &topic, cancel, |event| {
                handler(event);
                std::future::ready(())
            })
            .await;
            release_topic(&topics, &topic);
        })
    }

    /// Run an async `handler` for each event on `topic` until cancelled.
    ///
    /// With `allow_concurrent`, each event gets its own task and handlers
    /// may overlap; otherwise each handler completes before the next event
    /// is taken.
    pub fn subscribe_async<F, Fut>(
        &self,
        topic: &str,
        allow_concurrent: bool,
        cancel: CancellationToken,
        handler: F,
    ) -> JoinHandle<()>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = self.subscribe(topic);
        let topic = topic.to_string();
        let topics = Arc::clone(&self.topics);
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            run_listener(rx, &topic, cancel, |event| {
                let handler = Arc::clone(&handler);
                async move {
                    if allow_concurrent {
                        tokio::spawn(async move { (*handler)(event).await });
                    } else {
                        (*handler)(event).await;
                    }
                }
            })
            .await;
            release_topic(&topics, &topic);
        })
    }

    /// Receivers currently attached to a topic.
    #[must_use]
    pub fn receiver_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of known topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}

/// Drop `topic` if nobody listens to it any more.
fn release_topic(topics: &Topics, topic: &str) {
    let mut topics = topics.write();
    if topics
        .get(topic)
        .is_some_and(|sender| sender.receiver_count() == 0)
    {
        topics.remove(topic);
        tracing::debug!(topic, "Bus topic released");
    }
}

async fn run_listener<H, Fut>(
    mut rx: broadcast::Receiver<BusEvent>,
    topic: &str,
    cancel: CancellationToken,
    mut handle: H,
) where
    H: FnMut(BusEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = rx.recv() => received,
        };
        match received {
            Ok(event) => handle(event).await,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(topic, skipped, "Bus listener lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!(topic, "Bus listener stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn feed_topic_format() {
        assert_eq!(feed_topic(FeedKind::Tick, "TXF"), "tick/TXF");
        assert_eq!(feed_topic(FeedKind::BidAsk, "2330"), "bidask/2330");
        assert_eq!(subscribe_topic(FeedKind::Trade), None);
        assert_eq!(
            subscribe_topic(FeedKind::Quote),
            Some("stream/subscribe/stock/quote")
        );
    }

    #[test]
    fn publish_without_subscribers_reaches_nobody() {
        let bus = TopicBus::default();
        assert_eq!(bus.publish("nobody", ControlEvent::ReferenceDataReady), 0);
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = TopicBus::default();
        let mut a = bus.subscribe("t");
        let mut b = bus.subscribe("t");
        assert_eq!(bus.receiver_count("t"), 2);

        for code in ["A", "B"] {
            let event = ControlEvent::Subscribe {
                kind: FeedKind::Tick,
                code: code.to_string(),
            };
            assert_eq!(bus.publish("t", event), 2);
        }

        for rx in [&mut a, &mut b] {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            assert!(matches!(first, BusEvent::Control(ControlEvent::Subscribe { ref code, .. }) if code == "A"));
            assert!(matches!(second, BusEvent::Control(ControlEvent::Subscribe { ref code, .. }) if code == "B"));
        }
    }

    #[tokio::test]
    async fn subscribe_with_runs_handler() {
        let bus = TopicBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let c = Arc::clone(&count);
        let handle = bus.subscribe_with("t", cancel.clone(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish("t", ControlEvent::ReferenceDataReady);
        bus.publish("t", ControlEvent::ReferenceDataReady);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn subscribe_async_concurrent_handlers_overlap() {
        let bus = TopicBus::default();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let release = Arc::new(tokio::sync::Notify::new());
        let r = Arc::clone(&release);

        bus.subscribe_async("t", true, cancel.clone(), move |_| {
            let tx = tx.clone();
            let r = Arc::clone(&r);
            async move {
                let _ = tx.send(());
                r.notified().await;
            }
        });

        bus.publish("t", ControlEvent::ReferenceDataReady);
        bus.publish("t", ControlEvent::ReferenceDataReady);

        // Both handlers start even though neither has finished.
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        release.notify_waiters();
        cancel.cancel();
    }

    #[tokio::test]
    async fn stopped_listener_releases_its_topic() {
        let bus = TopicBus::default();
        let cancel = CancellationToken::new();
        let handle = bus.subscribe_with("a", cancel.clone(), |_| {});
        let _other = bus.subscribe_with("b", CancellationToken::new(), |_| {});
        assert_eq!(bus.topic_count(), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bus.receiver_count("a"), 0);
        assert_eq!(bus.topic_count(), 1);
    }

    #[tokio::test]
    async fn stopped_listener_keeps_topic_with_other_receivers() {
        let bus = TopicBus::default();
        let cancel = CancellationToken::new();
        let handle = bus.subscribe_async("t", false, cancel.clone(), |_| async {});
        let _raw = bus.subscribe("t");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bus.receiver_count("t"), 1);
        assert_eq!(bus.topic_count(), 1);
    }
}
