//! Instrument Stream Ingestor
//!
//! Owns one upstream subscription for a `(feed kind, code)` pair. Every
//! received event is republished on the topic bus under
//! `"<feed-kind>/<code>"` and then pushed into the feed kind's shared
//! ingestion channel.
//!
//! Each ingestor runs under a retry supervisor: a failed open or a stream
//! that ends or errors is re-issued after an exponential backoff, and a
//! successful open resets the backoff. Cancelling the lease token ends the
//! ingestor promptly, including while it sleeps or waits for room in the
//! shared channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::application::ports::{FeedStream, MarketDataSource, SubscribeFeed, UpstreamError};
use crate::domain::feed::{Code, FeedKind};
use crate::domain::subscription::{Lease, SubscriptionTable};
use crate::infrastructure::bus::{SharedTopicBus, feed_topic};
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::{ReconnectConfig, ReconnectPolicy};

// =============================================================================
// Feed Stats
// =============================================================================

/// Upstream counters for one feed kind.
#[derive(Debug)]
pub struct FeedStats {
    kind: FeedKind,
    active_streams: AtomicUsize,
    messages_received: AtomicU64,
    reconnect_attempts: AtomicU64,
    last_error: RwLock<Option<String>>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`FeedStats`] for health reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FeedStatus {
    /// Feed kind name.
    pub feed: &'static str,
    /// Upstream streams currently open.
    pub active_streams: usize,
    /// Events received since start.
    pub messages_received: u64,
    /// Resubscription attempts since start.
    pub reconnect_attempts: u64,
    /// Most recent upstream error.
    pub last_error: Option<String>,
    /// When a stream last opened.
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl FeedStats {
    /// Zeroed counters for `kind`.
    #[must_use]
    pub const fn new(kind: FeedKind) -> Self {
        Self {
            kind,
            active_streams: AtomicUsize::new(0),
            messages_received: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            last_error: RwLock::new(None),
            last_connected_at: RwLock::new(None),
        }
    }

    fn stream_opened(&self) {
        let active = self.active_streams.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_connected_at.write() = Some(Utc::now());
        metrics::set_upstream_streams(self.kind, active);
    }

    fn stream_closed(&self) {
        let active = self
            .active_streams
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        metrics::set_upstream_streams(self.kind, active);
    }

    fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_event_received(self.kind);
    }

    fn record_reconnect(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        metrics::record_reconnect(self.kind);
    }

    fn record_error(&self, stage: &'static str, error: &UpstreamError) {
        *self.last_error.write() = Some(error.to_string());
        metrics::record_upstream_error(self.kind, stage);
    }

    /// Upstream streams currently open.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Relaxed)
    }

    /// Events received since start.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Resubscription attempts since start.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Copy the counters.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            feed: self.kind.as_str(),
            active_streams: self.active_streams(),
            messages_received: self.messages_received(),
            reconnect_attempts: self.reconnect_attempts(),
            last_error: self.last_error.read().clone(),
            last_connected_at: *self.last_connected_at.read(),
        }
    }
}

// =============================================================================
// Stream Observer
// =============================================================================

/// Lifecycle hooks called by an ingestor.
#[async_trait]
pub trait StreamObserver: Send + Sync {
    /// An upstream stream (re)opened.
    async fn opened(&self, kind: FeedKind, code: &str, generation: u64);

    /// The ingestor stopped for good, cancelled or out of retries.
    async fn finished(&self, kind: FeedKind, code: &str, generation: u64);
}

#[async_trait]
impl StreamObserver for SubscriptionTable {
    async fn opened(&self, _kind: FeedKind, _code: &str, _generation: u64) {}

    async fn finished(&self, kind: FeedKind, code: &str, generation: u64) {
        SubscriptionTable::finished(self, kind, code, generation);
    }
}

enum StreamEnd {
    Cancelled,
    ChannelClosed,
    Ended,
    Failed(UpstreamError),
}

// =============================================================================
// Ingestor
// =============================================================================

/// Spawns supervised upstream subscriptions for one feed kind.
pub struct Ingestor<E: SubscribeFeed> {
    source: Arc<dyn MarketDataSource>,
    bus: SharedTopicBus,
    tx: mpsc::Sender<E>,
    reconnect: ReconnectConfig,
    stats: Arc<FeedStats>,
    observer: Arc<dyn StreamObserver>,
}

impl<E: SubscribeFeed> Clone for Ingestor<E> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            bus: Arc::clone(&self.bus),
            tx: self.tx.clone(),
            reconnect: self.reconnect,
            stats: Arc::clone(&self.stats),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<E: SubscribeFeed> Ingestor<E> {
    /// Create an ingestor feeding `tx`.
    #[must_use]
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        bus: SharedTopicBus,
        tx: mpsc::Sender<E>,
        reconnect: ReconnectConfig,
        observer: Arc<dyn StreamObserver>,
    ) -> Self {
        Self {
            source,
            bus,
            tx,
            reconnect,
            stats: Arc::new(FeedStats::new(E::KIND)),
            observer,
        }
    }

    /// Counters shared by every subscription of this feed kind.
    #[must_use]
    pub fn stats(&self) -> Arc<FeedStats> {
        Arc::clone(&self.stats)
    }

    /// Start the subscription for `code` described by `lease`.
    pub fn spawn(&self, code: &str, lease: Lease) -> JoinHandle<()> {
        let span = tracing::info_span!("ingestor", feed = %E::KIND, code = %code);
        let this = self.clone();
        let code = code.to_string();
        tokio::spawn(this.run(code, lease).instrument(span))
    }

    async fn run(self, code: Code, lease: Lease) {
        let Lease {
            token: cancel,
            generation,
        } = lease;
        let mut policy = ReconnectPolicy::new(self.reconnect);

        loop {
            let opened = tokio::select! {
                () = cancel.cancelled() => break,
                opened = E::open(self.source.as_ref(), &code) => opened,
            };

            match opened {
                Ok(stream) => {
                    policy.reset();
                    self.stats.stream_opened();
                    self.observer.opened(E::KIND, &code, generation).await;
                    tracing::info!("Upstream stream opened");

                    let end = self.pump(stream, &cancel).await;
                    self.stats.stream_closed();
                    match end {
                        StreamEnd::Cancelled => break,
                        StreamEnd::ChannelClosed => {
                            tracing::debug!("Ingestion channel closed");
                            break;
                        }
                        StreamEnd::Ended => {
                            self.stats.record_error("stream", &UpstreamError::StreamClosed);
                            tracing::warn!("Upstream stream ended");
                        }
                        StreamEnd::Failed(e) => {
                            self.stats.record_error("stream", &e);
                            tracing::warn!(error = %e, "Upstream stream failed");
                        }
                    }
                }
                Err(e) => {
                    self.stats.record_error("open", &e);
                    tracing::warn!(error = %e, "Upstream subscribe failed");
                }
            }

            if !policy.wait(&cancel).await {
                if !cancel.is_cancelled() {
                    tracing::error!(
                        attempts = policy.attempt_count(),
                        "Giving up on upstream subscription"
                    );
                }
                break;
            }
            self.stats.record_reconnect();
            tracing::info!(attempt = policy.attempt_count(), "Resubscribing upstream");
        }

        self.observer.finished(E::KIND, &code, generation).await;
        tracing::debug!("Ingestor stopped");
    }

    async fn pump(&self, mut stream: FeedStream<E>, cancel: &CancellationToken) -> StreamEnd {
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return StreamEnd::Failed(e),
                None => return StreamEnd::Ended,
            };

            self.stats.record_message();
            self.bus.publish(
                &feed_topic(E::KIND, event.code()),
                event.clone().into_feed_event(),
            );

            tokio::select! {
                () = cancel.cancelled() => return StreamEnd::Cancelled,
                sent = self.tx.send(event) => {
                    if sent.is_err() {
                        return StreamEnd::ChannelClosed;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::feed::{FeedEvent, Tick};
    use crate::infrastructure::bus::{BusEvent, TopicBus};
    use crate::infrastructure::upstream::InMemorySource;

    #[derive(Default)]
    struct Recorder {
        events: parking_lot::Mutex<Vec<(&'static str, u64)>>,
    }

    #[async_trait]
    impl StreamObserver for Recorder {
        async fn opened(&self, _kind: FeedKind, _code: &str, generation: u64) {
            self.events.lock().push(("opened", generation));
        }

        async fn finished(&self, _kind: FeedKind, _code: &str, generation: u64) {
            self.events.lock().push(("finished", generation));
        }
    }

    fn tick(code: &str, price: i64) -> Tick {
        Tick {
            code: code.to_string(),
            price: Decimal::new(price, 0),
            price_change: Decimal::ZERO,
            volume: 1,
            timestamp: Utc::now(),
        }
    }

    struct Fixture {
        source: Arc<InMemorySource>,
        bus: SharedTopicBus,
        recorder: Arc<Recorder>,
        ingestor: Ingestor<Tick>,
        rx: mpsc::Receiver<Tick>,
        table: SubscriptionTable,
    }

    fn fixture(reconnect: ReconnectConfig) -> Fixture {
        let source = Arc::new(InMemorySource::new());
        let bus = Arc::new(TopicBus::default());
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::channel(16);
        let ingestor = Ingestor::new(
            Arc::clone(&source) as Arc<dyn MarketDataSource>,
            Arc::clone(&bus),
            tx,
            reconnect,
            Arc::clone(&recorder) as Arc<dyn StreamObserver>,
        );
        Fixture {
            source,
            bus,
            recorder,
            ingestor,
            rx,
            table: SubscriptionTable::new(CancellationToken::new()),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Tick>) -> Tick {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn publishes_on_bus_then_channel() {
        let mut f = fixture(ReconnectConfig::default());
        let mut topic = f.bus.subscribe("tick/TXF");
        let lease = f.table.acquire(FeedKind::Tick, "TXF").unwrap();
        f.ingestor.spawn("TXF", lease);

        assert!(
            f.source
                .wait_for_streams(FeedKind::Tick, "TXF", 1, Duration::from_secs(1))
                .await
        );
        f.source.push_tick(tick("TXF", 100));

        assert_eq!(recv(&mut f.rx).await.price, Decimal::new(100, 0));
        let published = topic.recv().await.unwrap();
        assert!(matches!(published, BusEvent::Feed(FeedEvent::Tick(ref t)) if t.code == "TXF"));
        assert_eq!(f.ingestor.stats().messages_received(), 1);
        assert_eq!(f.ingestor.stats().active_streams(), 1);
    }

    #[tokio::test]
    async fn resubscribes_after_stream_failure() {
        let mut f = fixture(ReconnectConfig::fixed(Duration::from_millis(5), 0));
        let lease = f.table.acquire(FeedKind::Tick, "TXF").unwrap();
        f.ingestor.spawn("TXF", lease);
        assert!(
            f.source
                .wait_for_streams(FeedKind::Tick, "TXF", 1, Duration::from_secs(1))
                .await
        );

        f.source.fail_streams(FeedKind::Tick, "TXF");
        assert!(
            f.source
                .wait_for_streams(FeedKind::Tick, "TXF", 1, Duration::from_secs(1))
                .await
        );
        assert_eq!(f.source.open_count(FeedKind::Tick, "TXF"), 2);

        f.source.push_tick(tick("TXF", 7));
        assert_eq!(recv(&mut f.rx).await.price, Decimal::new(7, 0));
        assert_eq!(f.ingestor.stats().reconnect_attempts(), 1);
        assert!(f.ingestor.stats().status().last_error.is_some());
    }

    #[tokio::test]
    async fn retries_failed_opens() {
        let mut f = fixture(ReconnectConfig::fixed(Duration::from_millis(5), 0));
        f.source.fail_next_opens(FeedKind::Tick, "TXF", 2);
        let lease = f.table.acquire(FeedKind::Tick, "TXF").unwrap();
        f.ingestor.spawn("TXF", lease);

        assert!(
            f.source
                .wait_for_streams(FeedKind::Tick, "TXF", 1, Duration::from_secs(1))
                .await
        );
        f.source.push_tick(tick("TXF", 1));
        recv(&mut f.rx).await;
        assert_eq!(f.ingestor.stats().reconnect_attempts(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let f = fixture(ReconnectConfig::fixed(Duration::from_millis(1), 2));
        f.source.fail_next_opens(FeedKind::Tick, "TXF", 10);
        let lease = f.table.acquire(FeedKind::Tick, "TXF").unwrap();
        let generation = lease.generation;
        let handle = f.ingestor.spawn("TXF", lease);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*f.recorder.events.lock(), vec![("finished", generation)]);
        assert_eq!(f.ingestor.stats().active_streams(), 0);
    }

    #[tokio::test]
    async fn release_cancels_and_closes_upstream() {
        let f = fixture(ReconnectConfig::default());
        let lease = f.table.acquire(FeedKind::Tick, "TXF").unwrap();
        let generation = lease.generation;
        let handle = f.ingestor.spawn("TXF", lease);
        assert!(
            f.source
                .wait_for_streams(FeedKind::Tick, "TXF", 1, Duration::from_secs(1))
                .await
        );

        assert!(f.table.release(FeedKind::Tick, "TXF"));
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(
            f.source
                .wait_for_streams(FeedKind::Tick, "TXF", 0, Duration::from_secs(1))
                .await
        );
        assert_eq!(
            *f.recorder.events.lock(),
            vec![("opened", generation), ("finished", generation)]
        );
    }

    #[tokio::test]
    async fn cancellation_unblocks_full_channel() {
        let source = Arc::new(InMemorySource::new());
        let (tx, _rx) = mpsc::channel(1);
        let ingestor: Ingestor<Tick> = Ingestor::new(
            Arc::clone(&source) as Arc<dyn MarketDataSource>,
            Arc::new(TopicBus::default()),
            tx,
            ReconnectConfig::default(),
            Arc::new(Recorder::default()),
        );
        let table = SubscriptionTable::new(CancellationToken::new());
        let handle = ingestor.spawn("TXF", table.acquire(FeedKind::Tick, "TXF").unwrap());
        assert!(
            source
                .wait_for_streams(FeedKind::Tick, "TXF", 1, Duration::from_secs(1))
                .await
        );

        for price in 0..3 {
            source.push_tick(tick("TXF", price));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        table.release(FeedKind::Tick, "TXF");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
