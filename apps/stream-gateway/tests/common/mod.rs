//! Shared setup for the gateway integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use stream_gateway::{
    AppState, DeliveryPolicy, GatewayServer, InMemorySource, InMemoryTradeRepository,
    MarketDataSource, MarketStream, MarketStreamConfig, ReconnectConfig, StockStream, TopicBus,
    TradeRepository, TradeStream, TradeStreamConfig,
};

/// Default wait for asynchronous effects.
pub const WAIT: Duration = Duration::from_secs(2);

/// A running gateway on a loopback port, backed by in-memory adapters.
pub struct Gateway {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub market: Arc<MarketStream>,
    pub stock: Arc<StockStream>,
    pub trade: Arc<TradeStream>,
    pub source: Arc<InMemorySource>,
    pub repository: Arc<InMemoryTradeRepository>,
    pub bus: Arc<TopicBus>,
    pub cancel: CancellationToken,
}

impl Gateway {
    /// `ws://` URL for `path` on this gateway.
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Build the services without binding a socket.
pub fn build() -> (Arc<AppState>, Gateway) {
    let source = Arc::new(InMemorySource::new());
    let repository = Arc::new(InMemoryTradeRepository::new());
    let bus = Arc::new(TopicBus::default());
    let cancel = CancellationToken::new();
    let reconnect = ReconnectConfig::fixed(Duration::from_millis(10), 0);

    let stream_config = MarketStreamConfig {
        client_policy: DeliveryPolicy::DropNewest { capacity: 64 },
        ingest_capacity: 64,
        reconnect,
    };

    let market = MarketStream::start(
        Arc::clone(&source) as Arc<dyn MarketDataSource>,
        Arc::clone(&bus),
        stream_config,
        &cancel,
    );
    let stock = StockStream::start(
        Arc::clone(&source) as Arc<dyn MarketDataSource>,
        Arc::clone(&bus),
        stream_config,
        &cancel,
    );
    let trade = TradeStream::start(
        Arc::clone(&source) as Arc<dyn MarketDataSource>,
        Arc::clone(&bus),
        Arc::clone(&repository) as Arc<dyn TradeRepository>,
        TradeStreamConfig {
            ingest_capacity: 64,
            reconnect,
        },
        &cancel,
    );
    let state = Arc::new(AppState::new(
        Arc::clone(&market),
        Arc::clone(&stock),
        Arc::clone(&trade),
        Arc::clone(&repository) as Arc<dyn TradeRepository>,
        32,
        cancel.child_token(),
    ));

    let gateway = Gateway {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        state: Arc::clone(&state),
        market,
        stock,
        trade,
        source,
        repository,
        bus,
        cancel,
    };
    (state, gateway)
}

/// Build the services and serve them on a random loopback port.
pub async fn spawn_gateway() -> Gateway {
    let (state, mut gateway) = build();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    gateway.addr = listener.local_addr().unwrap();

    let server = GatewayServer::new(gateway.addr.port(), state, gateway.cancel.clone());
    tokio::spawn(server.serve(listener));
    gateway
}

/// Poll `condition` until it holds, failing after [`WAIT`].
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
