//! Application Services
//!
//! Services that run the fan-out core on top of the ports.
//!
//! - `Ingestor`: supervised upstream subscription per `(feed kind, code)`
//! - `broadcaster`: per-feed delivery of ingested events to the registry
//! - `MarketStream`: tick and bid/ask fan-out with futures snapshot seeding
//! - `StockStream`: stock quote fan-out with stock snapshot seeding
//! - `TradeStream`: trade fan-out with background persistence
//! - `TickLatencyMonitor`: per-code bus listener for tick latency

mod broadcaster;
mod ingestor;
mod latency;
mod market_stream;
mod snapshot;
mod stock_stream;
mod tracking;
mod trade_stream;

pub use broadcaster::{spawn_broadcaster, spawn_broadcaster_with};
pub use ingestor::{FeedStats, FeedStatus, Ingestor, StreamObserver};
pub use latency::TickLatencyMonitor;
pub use market_stream::{MarketStream, MarketStreamConfig};
pub use snapshot::SnapshotSeeder;
pub use stock_stream::StockStream;
pub use trade_stream::{TradeStream, TradeStreamConfig};
