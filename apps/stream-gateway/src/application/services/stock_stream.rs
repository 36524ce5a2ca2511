//! Stock Quote Stream
//!
//! Wires stock quote ingestion to its broadcaster and owns the stock
//! client registry. Clients are seeded from the stock snapshot universe.
//!
//! # Subscriptions
//!
//! - Codes announced on `stream/subscribe/stock/quote` are pinned and
//!   streamed for the life of the process.
//! - A single-code client holds one reference on the quote subscription of
//!   its code; the last detach tears it down.
//! - The subscribed stock codes are those whose quote stream has opened and
//!   whose ingestor is still running.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::broadcaster::spawn_broadcaster;
use super::ingestor::{FeedStatus, Ingestor, StreamObserver};
use super::market_stream::MarketStreamConfig;
use super::snapshot::SnapshotSeeder;
use super::tracking::{TrackedSubscriptions, sorted};
use crate::application::ports::MarketDataSource;
use crate::domain::feed::{ClientId, Code, FeedKind, Quote};
use crate::domain::registry::{
    ClientReceiver, ClientRegistry, DeliveryPolicy, QuoteClient, RegistryStats, Subscriber,
};
use crate::domain::subscription::SubscriptionStats;
use crate::infrastructure::bus::{
    BusEvent, ControlEvent, SharedTopicBus, TOPIC_SUBSCRIBE_STOCK_QUOTE,
};
use crate::infrastructure::metrics::{self, ClientMode};

const STREAM_LABEL: &str = "stock";

/// Stock quote fan-out.
pub struct StockStream {
    registry: Arc<ClientRegistry<QuoteClient>>,
    subscriptions: Arc<TrackedSubscriptions>,
    quotes: Ingestor<Quote>,
    seeder: SnapshotSeeder<Quote>,
    policy: DeliveryPolicy,
}

impl StockStream {
    /// Build the stream and spawn its broadcaster and control listener.
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
            FeedKind::Quote,
        ));
        let observer = Arc::clone(&subscriptions) as Arc<dyn StreamObserver>;
        let registry = Arc::new(ClientRegistry::new());

        let (quote_tx, quote_rx) = mpsc::channel(config.ingest_capacity.max(1));
        spawn_broadcaster::<_, Quote>(Arc::clone(&registry), quote_rx, cancel.child_token());

        let stream = Arc::new(Self {
            registry,
            quotes: Ingestor::new(
                Arc::clone(&source),
                Arc::clone(&bus),
                quote_tx,
                config.reconnect,
                observer,
            ),
            subscriptions,
            seeder: SnapshotSeeder::new(source),
            policy: config.client_policy,
        });

        let this = Arc::clone(&stream);
        bus.subscribe_with(TOPIC_SUBSCRIBE_STOCK_QUOTE, cancel.child_token(), move |event| {
            if let BusEvent::Control(ControlEvent::Subscribe { kind, code }) = event {
                if kind == FeedKind::Quote {
                    this.pin(&code);
                } else {
                    tracing::warn!(feed = %kind, code = %code, "Ignoring non-quote stock subscription");
                }
            }
        });

        stream
    }

    /// Stream quotes for `code` for the life of the process. Returns `true`
    /// if an ingestor was started.
    pub fn pin(&self, code: &str) -> bool {
        let Some(lease) = self.subscriptions.table().pin(FeedKind::Quote, code) else {
            return false;
        };
        tracing::info!(code = %code, "Pinned stock quote subscription");
        self.quotes.spawn(code, lease);
        true
    }

    /// New client using the configured channel policy.
    #[must_use]
    pub fn new_client(&self) -> (QuoteClient, ClientReceiver<Quote>) {
        QuoteClient::new(self.policy)
    }

    /// New client with a given id, for re-attaching the same session.
    #[must_use]
    pub fn client_with_id(&self, id: ClientId) -> (QuoteClient, ClientReceiver<Quote>) {
        QuoteClient::with_id(id, self.policy)
    }

    /// Seed `client` with every subscribed stock code, then register it for
    /// all codes.
    pub async fn attach_firehose(&self, client: QuoteClient) {
        let known = self.subscriptions.known().await;
        let codes = sorted(&known);

        let id = client.id();
        let seeded = self.seeder.seed(&codes, &client).await;
        self.registry.attach_firehose(client);
        drop(known);

        tracing::debug!(client_id = %id, seeded, "Firehose stock client attached");
        self.publish_client_counts();
    }

    /// Unregister a firehose client. Unknown ids are ignored.
    pub fn detach_firehose(&self, id: ClientId) -> bool {
        let removed = self.registry.detach_firehose(id);
        if removed {
            tracing::debug!(client_id = %id, "Firehose stock client detached");
            self.publish_client_counts();
        }
        removed
    }

    /// Subscribe upstream for `code` if needed, seed `client` with that
    /// code, then register it.
    pub async fn attach_single_code(&self, code: &str, client: QuoteClient) {
        if let Some(lease) = self.subscriptions.table().acquire(FeedKind::Quote, code) {
            self.quotes.spawn(code, lease);
        }

        let id = client.id();
        let seeded = self.seeder.seed(&[code.to_string()], &client).await;
        if self.registry.attach_single_code(code, client) {
            self.subscriptions.table().release(FeedKind::Quote, code);
        }

        tracing::debug!(client_id = %id, code = %code, seeded, "Single-code stock client attached");
        self.publish_client_counts();
    }

    /// Unregister a single-code client and drop its upstream reference.
    /// Unknown pairs are ignored.
    pub fn detach_single_code(&self, code: &str, id: ClientId) -> bool {
        if !self.registry.detach_single_code(code, id) {
            return false;
        }
        if self.subscriptions.table().release(FeedKind::Quote, code) {
            tracing::info!(code = %code, "Stock quote subscription released");
        }
        tracing::debug!(client_id = %id, code = %code, "Single-code stock client detached");
        self.publish_client_counts();
        true
    }

    /// Codes with an open quote stream, naturally sorted.
    pub async fn subscribed_codes(&self) -> Vec<Code> {
        self.subscriptions.codes().await
    }

    /// Registry sizes.
    #[must_use]
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Upstream quote subscription counts.
    #[must_use]
    pub fn subscription_stats(&self) -> SubscriptionStats {
        self.subscriptions.table().stats(FeedKind::Quote)
    }

    /// Client references on the quote subscription of `code`.
    #[must_use]
    pub fn references(&self, code: &str) -> usize {
        self.subscriptions.table().references(FeedKind::Quote, code)
    }

    /// Upstream counters for the quote feed.
    #[must_use]
    pub fn feed_status(&self) -> FeedStatus {
        self.quotes.stats().status()
    }

    fn publish_client_counts(&self) {
        let stats = self.registry.stats();
        metrics::set_clients(STREAM_LABEL, ClientMode::Firehose, stats.firehose_clients);
        metrics::set_clients(STREAM_LABEL, ClientMode::SingleCode, stats.single_code_clients);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::feed::{Snapshot, SnapshotKind};
    use crate::infrastructure::bus::TopicBus;
    use crate::infrastructure::upstream::{InMemorySource, ReconnectConfig};

    const WAIT: Duration = Duration::from_secs(1);

    fn quote(code: &str, price: i64) -> Quote {
        Quote {
            code: code.to_string(),
            price: Decimal::new(price, 0),
            price_change: Decimal::ZERO,
            volume: 5,
            timestamp: Utc::now(),
        }
    }

    fn start(source: &Arc<InMemorySource>) -> (Arc<StockStream>, SharedTopicBus, CancellationToken) {
        let bus = Arc::new(TopicBus::default());
        let cancel = CancellationToken::new();
        let config = MarketStreamConfig {
            client_policy: DeliveryPolicy::DropNewest { capacity: 64 },
            reconnect: ReconnectConfig::fixed(Duration::from_millis(5), 0),
            ..MarketStreamConfig::default()
        };
        let stream = StockStream::start(
            Arc::clone(source) as Arc<dyn MarketDataSource>,
            Arc::clone(&bus),
            config,
            &cancel,
        );
        (stream, bus, cancel)
    }

    async fn wait_for_codes(stream: &StockStream, n: usize) {
        tokio::time::timeout(WAIT, async {
            while stream.subscribed_codes().await.len() != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stock_topic_pins_quote_stream() {
        let source = Arc::new(InMemorySource::new());
        let (stream, bus, _cancel) = start(&source);

        bus.publish(
            TOPIC_SUBSCRIBE_STOCK_QUOTE,
            ControlEvent::Subscribe {
                kind: FeedKind::Quote,
                code: "2330".to_string(),
            },
        );
        assert!(source.wait_for_streams(FeedKind::Quote, "2330", 1, WAIT).await);
        wait_for_codes(&stream, 1).await;
        assert_eq!(stream.subscription_stats().pinned, 1);
        assert_eq!(stream.subscribed_codes().await, vec!["2330".to_string()]);
    }

    #[tokio::test]
    async fn firehose_client_is_seeded_from_stock_snapshots() {
        let source = Arc::new(InMemorySource::new());
        source.set_snapshot_of(
            SnapshotKind::Stock,
            "2330",
            Snapshot {
                close: Decimal::new(580, 0),
                change_price: Decimal::new(3, 0),
            },
        );
        let (stream, _bus, _cancel) = start(&source);
        assert!(stream.pin("2330"));
        wait_for_codes(&stream, 1).await;

        let (client, mut rx) = stream.new_client();
        stream.attach_firehose(client).await;
        source.push_quote(quote("2330", 581));

        let seeded = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(seeded.price, Decimal::new(580, 0));
        assert_eq!(seeded.volume, 0);
        let live = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(live.price, Decimal::new(581, 0));
    }

    #[tokio::test]
    async fn single_code_clients_share_one_quote_stream() {
        let source = Arc::new(InMemorySource::new());
        let (stream, _bus, _cancel) = start(&source);

        let (a, mut a_rx) = stream.new_client();
        let (b, _b_rx) = stream.new_client();
        let (a_id, b_id) = (a.id(), b.id());
        stream.attach_single_code("1101", a).await;
        stream.attach_single_code("1101", b).await;
        assert_eq!(stream.references("1101"), 2);
        assert!(source.wait_for_streams(FeedKind::Quote, "1101", 1, WAIT).await);

        source.push_quote(quote("1101", 40));
        let live = tokio::time::timeout(WAIT, a_rx.recv()).await.unwrap().unwrap();
        assert_eq!(live.code, "1101");

        assert!(stream.detach_single_code("1101", a_id));
        assert!(stream.detach_single_code("1101", b_id));
        assert!(source.wait_for_streams(FeedKind::Quote, "1101", 0, WAIT).await);
        assert_eq!(source.open_count(FeedKind::Quote, "1101"), 1);
    }
}
