//! Application Ports (Driven)
//!
//! Interfaces the fan-out core uses to reach excluded collaborators:
//! - `MarketDataSource`: upstream streaming RPC service
//! - `TradeRepository`: trade execution storage

mod market_data_port;
mod trade_repository_port;

pub use market_data_port::{FeedStream, MarketDataSource, SubscribeFeed, UpstreamError};
pub use trade_repository_port::{PersistenceError, TradeRecord, TradeRepository};

#[cfg(test)]
pub use trade_repository_port::MockTradeRepository;
