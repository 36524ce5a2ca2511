//! Market Data Stream
//!
//! Wires tick and bid/ask ingestion to their broadcasters and owns the
//! futures market client registry. Clients are seeded from the futures
//! snapshot universe.
//!
//! # Subscriptions
//!
//! - Codes announced on `stream/subscribe/tick` and `stream/subscribe/bidask`
//!   are pinned and streamed for the life of the process.
//! - A single-code client holds one reference on both the tick and bid/ask
//!   subscription of its code; the last detach tears them down.
//! - The "currently subscribed codes" set holds every code whose tick stream
//!   has opened and whose ingestor is still running. Firehose clients are
//!   seeded with that set under its lock.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::broadcaster::spawn_broadcaster;
use super::ingestor::{FeedStatus, Ingestor, StreamObserver};
use super::snapshot::SnapshotSeeder;
use super::tracking::{TrackedSubscriptions, sorted};
use crate::application::ports::MarketDataSource;
use crate::domain::feed::{BidAsk, ClientId, Code, FeedKind, Tick};
use crate::domain::registry::{
    ClientRegistry, DeliveryPolicy, MarketClient, MarketReceivers, RegistryStats, Subscriber,
};
use crate::domain::subscription::{Lease, SubscriptionStats};
use crate::infrastructure::bus::{
    BusEvent, ControlEvent, SharedTopicBus, TOPIC_SUBSCRIBE_BID_ASK, TOPIC_SUBSCRIBE_TICK,
};
use crate::infrastructure::config::GatewayConfig;
use crate::infrastructure::metrics::{self, ClientMode};
use crate::infrastructure::upstream::ReconnectConfig;

const STREAM_LABEL: &str = "market";

// =============================================================================
// Configuration
// =============================================================================

/// Market and stock stream tuning.
#[derive(Debug, Clone, Copy)]
pub struct MarketStreamConfig {
    /// Channel policy for market clients.
    pub client_policy: DeliveryPolicy,
    /// Shared ingestion channel capacity per feed kind.
    pub ingest_capacity: usize,
    /// Resubscription backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for MarketStreamConfig {
    fn default() -> Self {
        Self {
            client_policy: DeliveryPolicy::DropNewest { capacity: 256 },
            ingest_capacity: 1024,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MarketStreamConfig {
    /// Derive from the gateway configuration.
    #[must_use]
    pub const fn from_config(config: &GatewayConfig) -> Self {
        Self {
            client_policy: DeliveryPolicy::DropNewest {
                capacity: config.fan_out.client_capacity,
            },
            ingest_capacity: config.fan_out.ingest_capacity,
            reconnect: ReconnectConfig::from_settings(&config.upstream),
        }
    }
}

// =============================================================================
// Market Stream
// =============================================================================

/// Tick and bid/ask fan-out.
pub struct MarketStream {
    registry: Arc<ClientRegistry<MarketClient>>,
    subscriptions: Arc<TrackedSubscriptions>,
    ticks: Ingestor<Tick>,
    bid_asks: Ingestor<BidAsk>,
    seeder: SnapshotSeeder<Tick>,
    policy: DeliveryPolicy,
}

impl MarketStream {
    /// Build the stream and spawn its broadcasters and control listeners.
    ///
    /// Every task stops when `cancel` fires.
    pub fn start(
        source: Arc<dyn MarketDataSource>,
        bus: SharedTopicBus,
        config: MarketStreamConfig,
        cancel: &CancellationToken,
    ) -> Arc<Self> {
        let subscriptions = Arc::new(TrackedSubscriptions::new(
            cancel.child_token(),
            FeedKind::Tick,
        ));
        let observer = Arc::clone(&subscriptions) as Arc<dyn StreamObserver>;
        let registry = Arc::new(ClientRegistry::new());
        let capacity = config.ingest_capacity.max(1);

        let (tick_tx, tick_rx) = mpsc::channel(capacity);
        let (bid_ask_tx, bid_ask_rx) = mpsc::channel(capacity);
        spawn_broadcaster::<_, Tick>(Arc::clone(&registry), tick_rx, cancel.child_token());
        spawn_broadcaster::<_, BidAsk>(Arc::clone(&registry), bid_ask_rx, cancel.child_token());

        let stream = Arc::new(Self {
            registry,
            ticks: Ingestor::new(
                Arc::clone(&source),
                Arc::clone(&bus),
                tick_tx,
                config.reconnect,
                Arc::clone(&observer),
            ),
            bid_asks: Ingestor::new(
                Arc::clone(&source),
                Arc::clone(&bus),
                bid_ask_tx,
                config.reconnect,
                observer,
            ),
            subscriptions,
            seeder: SnapshotSeeder::new(source),
            policy: config.client_policy,
        });

        for topic in [TOPIC_SUBSCRIBE_TICK, TOPIC_SUBSCRIBE_BID_ASK] {
            let this = Arc::clone(&stream);
            bus.subscribe_with(topic, cancel.child_token(), move |event| {
                if let BusEvent::Control(ControlEvent::Subscribe { kind, code }) = event {
                    this.pin(kind, &code);
                }
            });
        }

        stream
    }

    /// Stream `(kind, code)` for the life of the process. Returns `true`
    /// if an ingestor was started.
    pub fn pin(&self, kind: FeedKind, code: &str) -> bool {
        if !matches!(kind, FeedKind::Tick | FeedKind::BidAsk) {
            tracing::warn!(feed = %kind, code = %code, "Not a futures market subscription");
            return false;
        }
        let Some(lease) = self.subscriptions.table().pin(kind, code) else {
            return false;
        };
        tracing::info!(feed = %kind, code = %code, "Pinned market subscription");
        self.spawn_ingestor(kind, code, lease);
        true
    }

    fn spawn_ingestor(&self, kind: FeedKind, code: &str, lease: Lease) {
        match kind {
            FeedKind::Tick => {
                self.ticks.spawn(code, lease);
            }
            FeedKind::BidAsk => {
                self.bid_asks.spawn(code, lease);
            }
            FeedKind::Trade | FeedKind::Quote => {}
        }
    }

    /// New client using the configured channel policy.
    #[must_use]
    pub fn new_client(&self) -> (MarketClient, MarketReceivers) {
        MarketClient::new(self.policy)
    }

    /// New client with a given id, for re-attaching the same session.
    #[must_use]
    pub fn client_with_id(&self, id: ClientId) -> (MarketClient, MarketReceivers) {
        MarketClient::with_id(id, self.policy)
    }

    /// Seed `client` with every subscribed code, then register it for all
    /// codes.
    pub async fn attach_firehose(&self, client: MarketClient) {
        let known = self.subscriptions.known().await;
        let codes = sorted(&known);

        let id = client.id();
        let seeded = self.seeder.seed(&codes, &client).await;
        self.registry.attach_firehose(client);
        drop(known);

        tracing::debug!(client_id = %id, seeded, "Firehose market client attached");
        self.publish_client_counts();
    }

    /// Unregister a firehose client. Unknown ids are ignored.
    pub fn detach_firehose(&self, id: ClientId) -> bool {
        let removed = self.registry.detach_firehose(id);
        if removed {
            tracing::debug!(client_id = %id, "Firehose market client detached");
            self.publish_client_counts();
        }
        removed
    }

    /// Subscribe upstream for `code` if needed, seed `client` with that
    /// code, then register it.
    pub async fn attach_single_code(&self, code: &str, client: MarketClient) {
        for kind in [FeedKind::Tick, FeedKind::BidAsk] {
            if let Some(lease) = self.subscriptions.table().acquire(kind, code) {
                self.spawn_ingestor(kind, code, lease);
            }
        }

        let id = client.id();
        let seeded = self.seeder.seed(&[code.to_string()], &client).await;
        if self.registry.attach_single_code(code, client) {
            // Same client re-attached: keep a single reference.
            for kind in [FeedKind::Tick, FeedKind::BidAsk] {
                self.subscriptions.table().release(kind, code);
            }
        }

        tracing::debug!(client_id = %id, code = %code, seeded, "Single-code market client attached");
        self.publish_client_counts();
    }

    /// Unregister a single-code client and drop its upstream references.
    /// Unknown pairs are ignored.
    pub fn detach_single_code(&self, code: &str, id: ClientId) -> bool {
        if !self.registry.detach_single_code(code, id) {
            return false;
        }
        for kind in [FeedKind::Tick, FeedKind::BidAsk] {
            if self.subscriptions.table().release(kind, code) {
                tracing::info!(feed = %kind, code = %code, "Upstream subscription released");
            }
        }
        tracing::debug!(client_id = %id, code = %code, "Single-code market client detached");
        self.publish_client_counts();
        true
    }

    /// Codes with an open tick stream, naturally sorted.
    pub async fn subscribed_codes(&self) -> Vec<Code> {
        self.subscriptions.codes().await
    }

    /// Registry sizes.
    #[must_use]
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Upstream subscription counts for one feed kind.
    #[must_use]
    pub fn subscription_stats(&self, kind: FeedKind) -> SubscriptionStats {
        self.subscriptions.table().stats(kind)
    }

    /// Client references on `(kind, code)`.
    #[must_use]
    pub fn references(&self, kind: FeedKind, code: &str) -> usize {
        self.subscriptions.table().references(kind, code)
    }

    /// Upstream counters for the tick and bid/ask feeds.
    #[must_use]
    pub fn feed_status(&self) -> Vec<FeedStatus> {
        vec![self.ticks.stats().status(), self.bid_asks.stats().status()]
    }

    fn publish_client_counts(&self) {
        let stats = self.registry.stats();
        metrics::set_clients(STREAM_LABEL, ClientMode::Firehose, stats.firehose_clients);
        metrics::set_clients(STREAM_LABEL, ClientMode::SingleCode, stats.single_code_clients);
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
    use crate::domain::feed::Snapshot;
    use crate::infrastructure::bus::TopicBus;
    use crate::infrastructure::upstream::InMemorySource;

    const WAIT: Duration = Duration::from_secs(1);

    fn tick(code: &str, price: i64) -> Tick {
        Tick {
            code: code.to_string(),
            price: Decimal::new(price, 0),
            price_change: Decimal::ZERO,
            volume: 1,
            timestamp: Utc::now(),
        }
    }

    fn start(source: &Arc<InMemorySource>) -> (Arc<MarketStream>, SharedTopicBus, CancellationToken) {
        let bus = Arc::new(TopicBus::default());
        let cancel = CancellationToken::new();
        let config = MarketStreamConfig {
            client_policy: DeliveryPolicy::DropNewest { capacity: 64 },
            reconnect: ReconnectConfig::fixed(Duration::from_millis(5), 0),
            ..MarketStreamConfig::default()
        };
        let stream = MarketStream::start(
            Arc::clone(source) as Arc<dyn MarketDataSource>,
            Arc::clone(&bus),
            config,
            &cancel,
        );
        (stream, bus, cancel)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn control_topic_pins_code() {
        let source = Arc::new(InMemorySource::new());
        let (stream, bus, _cancel) = start(&source);

        bus.publish(
            TOPIC_SUBSCRIBE_TICK,
            ControlEvent::Subscribe {
                kind: FeedKind::Tick,
                code: "TXF".to_string(),
            },
        );
        assert!(source.wait_for_streams(FeedKind::Tick, "TXF", 1, WAIT).await);
        wait_until(|| stream.subscription_stats(FeedKind::Tick).pinned == 1).await;

        tokio::time::timeout(WAIT, async {
            while stream.subscribed_codes().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stream.subscribed_codes().await, vec!["TXF".to_string()]);
    }

    #[tokio::test]
    async fn single_code_refcount_tears_down_upstream() {
        let source = Arc::new(InMemorySource::new());
        let (stream, _bus, _cancel) = start(&source);

        let (a, _a_rx) = stream.new_client();
        let (b, _b_rx) = stream.new_client();
        let (a_id, b_id) = (a.id(), b.id());
        stream.attach_single_code("2330", a).await;
        stream.attach_single_code("2330", b).await;
        assert_eq!(stream.references(FeedKind::Tick, "2330"), 2);
        assert!(source.wait_for_streams(FeedKind::Tick, "2330", 1, WAIT).await);
        assert!(source.wait_for_streams(FeedKind::BidAsk, "2330", 1, WAIT).await);

        assert!(stream.detach_single_code("2330", a_id));
        assert_eq!(stream.references(FeedKind::Tick, "2330"), 1);
        assert!(stream.detach_single_code("2330", b_id));
        assert!(!stream.detach_single_code("2330", b_id));

        assert!(source.wait_for_streams(FeedKind::Tick, "2330", 0, WAIT).await);
        assert!(source.wait_for_streams(FeedKind::BidAsk, "2330", 0, WAIT).await);
        assert_eq!(stream.subscription_stats(FeedKind::Tick).active, 0);
    }

    #[tokio::test]
    async fn reattaching_same_client_keeps_one_reference() {
        let source = Arc::new(InMemorySource::new());
        let (stream, _bus, _cancel) = start(&source);
        let id = ClientId::new();

        let (first, _rx1) = MarketClient::with_id(id, DeliveryPolicy::Lossless);
        let (second, _rx2) = MarketClient::with_id(id, DeliveryPolicy::Lossless);
        stream.attach_single_code("TXF", first).await;
        stream.attach_single_code("TXF", second).await;

        assert_eq!(stream.references(FeedKind::Tick, "TXF"), 1);
        assert_eq!(stream.registry_stats().single_code_clients, 1);
    }

    #[tokio::test]
    async fn single_code_client_is_seeded_before_live_events() {
        let source = Arc::new(InMemorySource::new());
        source.set_snapshot(
            "TXF",
            Snapshot {
                close: Decimal::new(17_000, 0),
                change_price: Decimal::new(12, 0),
            },
        );
        let (stream, _bus, _cancel) = start(&source);

        let (client, mut rx) = stream.new_client();
        stream.attach_single_code("TXF", client).await;
        assert!(source.wait_for_streams(FeedKind::Tick, "TXF", 1, WAIT).await);
        source.push_tick(tick("TXF", 17_001));

        let seeded = tokio::time::timeout(WAIT, rx.ticks.recv()).await.unwrap().unwrap();
        assert_eq!(seeded.price, Decimal::new(17_000, 0));
        assert_eq!(seeded.volume, 0);
        let live = tokio::time::timeout(WAIT, rx.ticks.recv()).await.unwrap().unwrap();
        assert_eq!(live.price, Decimal::new(17_001, 0));
    }

    #[tokio::test]
    async fn stock_and_trade_kinds_are_not_pinned_here() {
        let source = Arc::new(InMemorySource::new());
        let (stream, _bus, _cancel) = start(&source);
        assert!(!stream.pin(FeedKind::Quote, "2330"));
        assert!(!stream.pin(FeedKind::Trade, "TXF"));
        assert_eq!(source.open_count(FeedKind::Quote, "2330"), 0);
    }

    #[tokio::test]
    async fn cancel_stops_ingestors() {
        let source = Arc::new(InMemorySource::new());
        let (stream, _bus, cancel) = start(&source);
        assert!(stream.pin(FeedKind::BidAsk, "MXF"));
        assert!(!stream.pin(FeedKind::BidAsk, "MXF"));
        assert!(source.wait_for_streams(FeedKind::BidAsk, "MXF", 1, WAIT).await);

        cancel.cancel();
        assert!(source.wait_for_streams(FeedKind::BidAsk, "MXF", 0, WAIT).await);
    }
}
