//! Trade Execution Stream
//!
//! One upstream trade subscription fanned out to firehose and per-code
//! trade clients. Streaming starts once reference data is ready
//! (`basic/data/updated`). Every execution is queued for a background
//! writer before its fan-out; the writer upserts into the
//! [`TradeRepository`] in arrival order. A failed write is logged and
//! counted, and the event is delivered regardless.
//!
//! Trade clients use lossless channels. A trade update trigger asks the
//! upstream to republish changed executions, which then arrive on the
//! running trade stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::broadcaster::spawn_broadcaster_with;
use super::ingestor::{FeedStatus, Ingestor, StreamObserver};
use crate::application::ports::{MarketDataSource, TradeRepository, UpstreamError};
use crate::domain::feed::{ClientId, FeedKind, TradeExecution};
use crate::domain::registry::{ClientReceiver, ClientRegistry, RegistryStats, Subscriber, TradeClient};
use crate::domain::subscription::SubscriptionTable;
use crate::infrastructure::bus::{BusEvent, ControlEvent, SharedTopicBus, TOPIC_REFERENCE_DATA_READY};
use crate::infrastructure::config::GatewayConfig;
use crate::infrastructure::metrics::{self, ClientMode};
use crate::infrastructure::upstream::ReconnectConfig;

const STREAM_LABEL: &str = "trade";

/// Table key of the single trade subscription.
const ALL_CODES: &str = "*";

/// Trade stream tuning.
#[derive(Debug, Clone, Copy)]
pub struct TradeStreamConfig {
    /// Shared ingestion channel capacity.
    pub ingest_capacity: usize,
    /// Resubscription backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for TradeStreamConfig {
    fn default() -> Self {
        Self {
            ingest_capacity: 1024,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TradeStreamConfig {
    /// Derive from the gateway configuration.
    #[must_use]
    pub const fn from_config(config: &GatewayConfig) -> Self {
        Self {
            ingest_capacity: config.fan_out.ingest_capacity,
            reconnect: ReconnectConfig::from_settings(&config.upstream),
        }
    }
}

/// Trade execution fan-out with background persistence.
pub struct TradeStream {
    registry: Arc<ClientRegistry<TradeClient>>,
    table: Arc<SubscriptionTable>,
    ingestor: Ingestor<TradeExecution>,
    source: Arc<dyn MarketDataSource>,
}

impl TradeStream {
    /// Build the stream, spawn its broadcaster and wait for the
    /// reference-data signal on `bus`.
    pub fn start(
        source: Arc<dyn MarketDataSource>,
        bus: SharedTopicBus,
        repository: Arc<dyn TradeRepository>,
        config: TradeStreamConfig,
        cancel: &CancellationToken,
    ) -> Arc<Self> {
        let table = Arc::new(SubscriptionTable::new(cancel.child_token()));
        let registry = Arc::new(ClientRegistry::new());
        let (tx, rx) = mpsc::channel(config.ingest_capacity.max(1));

        let persist_tx = spawn_persister(repository);
        spawn_broadcaster_with(
            Arc::clone(&registry),
            rx,
            cancel.child_token(),
            move |trade: &TradeExecution| {
                if persist_tx.send(trade.clone()).is_err() {
                    metrics::record_persistence_failure();
                    tracing::warn!(order_id = %trade.order_id, "Trade writer stopped");
                }
            },
        );

        let observer = Arc::clone(&table) as Arc<dyn StreamObserver>;
        let stream = Arc::new(Self {
            registry,
            table,
            ingestor: Ingestor::new(
                Arc::clone(&source),
                Arc::clone(&bus),
                tx,
                config.reconnect,
                observer,
            ),
            source,
        });

        let this = Arc::clone(&stream);
        bus.subscribe_with(TOPIC_REFERENCE_DATA_READY, cancel.child_token(), move |event| {
            if matches!(event, BusEvent::Control(ControlEvent::ReferenceDataReady)) {
                this.start_streaming();
            }
        });

        stream
    }

    /// Open the upstream trade subscription unless it is already running.
    /// Returns `true` if it was started.
    pub fn start_streaming(&self) -> bool {
        let Some(lease) = self.table.pin(FeedKind::Trade, ALL_CODES) else {
            return false;
        };
        tracing::info!("Starting trade stream");
        self.ingestor.spawn(ALL_CODES, lease);
        true
    }

    /// Whether the upstream trade subscription is running.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.table.is_active(FeedKind::Trade, ALL_CODES)
    }

    /// Ask the upstream to refresh order records and republish changes.
    ///
    /// # Errors
    ///
    /// Returns the upstream error if the request is rejected.
    pub async fn trigger_update(&self) -> Result<(), UpstreamError> {
        self.source.trigger_trade_update().await.inspect_err(|e| {
            tracing::warn!(error = %e, "Trade update trigger failed");
        })?;
        tracing::info!("Trade update triggered");
        Ok(())
    }

    /// New lossless trade client.
    #[must_use]
    pub fn new_client(&self) -> (TradeClient, ClientReceiver<TradeExecution>) {
        TradeClient::new()
    }

    /// Register a client for every trade.
    pub fn attach_firehose(&self, client: TradeClient) {
        let id = client.id();
        self.registry.attach_firehose(client);
        tracing::debug!(client_id = %id, "Firehose trade client attached");
        self.publish_client_counts();
    }

    /// Unregister a firehose client. Unknown ids are ignored.
    pub fn detach_firehose(&self, id: ClientId) -> bool {
        let removed = self.registry.detach_firehose(id);
        if removed {
            self.publish_client_counts();
        }
        removed
    }

    /// Register a client for the trades of one code.
    pub fn attach_single_code(&self, code: &str, client: TradeClient) {
        let id = client.id();
        self.registry.attach_single_code(code, client);
        tracing::debug!(client_id = %id, code = %code, "Single-code trade client attached");
        self.publish_client_counts();
    }

    /// Unregister a single-code client. Unknown pairs are ignored.
    pub fn detach_single_code(&self, code: &str, id: ClientId) -> bool {
        let removed = self.registry.detach_single_code(code, id);
        if removed {
            self.publish_client_counts();
        }
        removed
    }

    /// Registry sizes.
    #[must_use]
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Upstream counters for the trade feed.
    #[must_use]
    pub fn feed_status(&self) -> FeedStatus {
        self.ingestor.stats().status()
    }

    fn publish_client_counts(&self) {
        let stats = self.registry.stats();
        metrics::set_clients(STREAM_LABEL, ClientMode::Firehose, stats.firehose_clients);
        metrics::set_clients(STREAM_LABEL, ClientMode::SingleCode, stats.single_code_clients);
    }
}

/// Writer task draining queued executions into `repository`. Ends once the
/// broadcaster holding the sender is gone.
fn spawn_persister(repository: Arc<dyn TradeRepository>) -> mpsc::UnboundedSender<TradeExecution> {
    let (tx, mut rx) = mpsc::unbounded_channel::<TradeExecution>();
    tokio::spawn(async move {
        while let Some(trade) = rx.recv().await {
            match repository.upsert_trade(&trade).await {
                Ok(record) => {
                    tracing::debug!(order_id = %trade.order_id, uid = %record.uid, "Trade persisted");
                }
                Err(e) => {
                    metrics::record_persistence_failure();
                    tracing::warn!(order_id = %trade.order_id, error = %e, "Trade persistence failed");
                }
            }
        }
    });
    tx
}

// =============================================================================
// Tests
// =============================================================================
