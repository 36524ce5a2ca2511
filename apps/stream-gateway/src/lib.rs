#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::default_trait_access
    )
)]

//! Stream Gateway - Market Data and Trade Fan-Out
//!
//! Keeps per-instrument streaming subscriptions open against the upstream
//! market data / execution service and fans every tick, bid/ask update and
//! trade execution out to many WebSocket clients without letting a slow
//! client stall the others.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core fan-out types with no I/O
//!   - `feed`: Tick, bid/ask, stock quote, trade and snapshot types
//!   - `registry`: Per-client channels and firehose / single-code maps
//!   - `subscription`: Refcounted upstream subscription table
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Upstream source and trade repository interfaces
//!   - `services`: Ingestors, broadcasters, snapshot seeding, streams
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: gRPC and in-memory market data sources
//!   - `bus`: Typed in-process topic bus
//!   - `websocket`: Session read / write pumps
//!   - `http`: REST, WebSocket routes and health endpoints
//!   - `config`, `metrics`, `telemetry`, `persistence`
//!
//! # Data Flow
//!
//! ```text
//!                  ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! upstream gRPC ──►│ Ingestor   │──►│ Broadcaster  │──►│ WS session  │──► Client 1
//!  (code, kind)    │ per code   │   │ per kind     │   │ write pump  │──► Client N
//!                  └─────┬──────┘   └──────────────┘   └─────────────┘
//!                        ▼
//!                   Topic bus (tick/<code>, bidask/<code>)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core fan-out types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::feed::{
    BidAsk, ClientId, Code, FeedEvent, FeedKind, FeedPayload, OrderAction, OrderStatus,
    OrderType, PriceLevel, Quote, Seeded, Snapshot, SnapshotKind, Tick, TradeExecution,
};
pub use domain::registry::{
    ClientReceiver, ClientRegistry, DeliveryPolicy, MarketClient, MarketReceivers, QuoteClient,
    RegistryStats, Subscriber, TradeClient,
};
pub use domain::subscription::{SubscriptionStats, SubscriptionTable};

// Ports
pub use application::ports::{
    MarketDataSource, PersistenceError, TradeRecord, TradeRepository, UpstreamError,
};

// Services
pub use application::services::{
    FeedStatus, MarketStream, MarketStreamConfig, SnapshotSeeder, StockStream, TickLatencyMonitor,
    TradeStream, TradeStreamConfig,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FanOutSettings, GatewayConfig, ServerSettings, StreamSettings, UpstreamSettings,
};

// Bus
pub use infrastructure::bus::{BusEvent, ControlEvent, SharedTopicBus, TopicBus};

// Server (for integration tests)
pub use infrastructure::http::{AppState, GatewayServer, GatewayServerError, router};

// Upstream adapters (for integration tests)
pub use infrastructure::upstream::{
    GrpcMarketDataSource, InMemorySource, ReconnectConfig, proto,
};

// Persistence
pub use infrastructure::persistence::InMemoryTradeRepository;

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
