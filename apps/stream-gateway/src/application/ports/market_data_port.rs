//! Market Data Port (Driven Port)
//!
//! Interface to the upstream market data / execution service. Streams end
//! with an error on disconnect; reconnecting is the caller's business.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::feed::{
    BidAsk, Code, FeedPayload, Quote, Snapshot, SnapshotKind, Tick, TradeExecution,
};

/// Long-lived upstream event stream.
pub type FeedStream<E> = BoxStream<'static, Result<E, UpstreamError>>;

/// Upstream failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Could not reach the service.
    #[error("upstream transport error: {message}")]
    Transport {
        /// Error details.
        message: String,
    },

    /// The service answered with an error status.
    #[error("upstream rpc failed ({code}): {message}")]
    Rpc {
        /// Status code name.
        code: String,
        /// Status message.
        message: String,
    },

    /// A message could not be converted.
    #[error("invalid upstream message: {message}")]
    Decode {
        /// Error details.
        message: String,
    },

    /// The stream was closed by the server.
    #[error("upstream stream closed")]
    StreamClosed,
}

/// Port for the upstream streaming service.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Open a tick stream for one code.
    async fn subscribe_tick(&self, code: &str) -> Result<FeedStream<Tick>, UpstreamError>;

    /// Open a bid/ask stream for one code.
    async fn subscribe_bid_ask(&self, code: &str) -> Result<FeedStream<BidAsk>, UpstreamError>;

    /// Open a stock quote stream for one code.
    async fn subscribe_quote(&self, code: &str) -> Result<FeedStream<Quote>, UpstreamError>;

    /// Open the trade execution stream.
    async fn subscribe_trade(&self) -> Result<FeedStream<TradeExecution>, UpstreamError>;

    /// Ask the upstream to refresh its order records and republish every
    /// changed execution on the trade stream.
    async fn trigger_trade_update(&self) -> Result<(), UpstreamError>;

    /// Fetch last-known values. Codes without a snapshot are absent from
    /// the result.
    async fn get_snapshot(
        &self,
        kind: SnapshotKind,
        codes: &[Code],
    ) -> Result<HashMap<Code, Snapshot>, UpstreamError>;
}

/// Feed payloads that can be subscribed to on a [`MarketDataSource`].
#[async_trait]
pub trait SubscribeFeed: FeedPayload + Sized {
    /// Open the upstream stream for `code`.
    async fn open(
        source: &dyn MarketDataSource,
        code: &str,
    ) -> Result<FeedStream<Self>, UpstreamError>;
}

#[async_trait]
impl SubscribeFeed for Tick {
    async fn open(
        source: &dyn MarketDataSource,
        code: &str,
    ) -> Result<FeedStream<Self>, UpstreamError> {
        source.subscribe_tick(code).await
    }
}

#[async_trait]
impl SubscribeFeed for BidAsk {
    async fn open(
        source: &dyn MarketDataSource,
        code: &str,
    ) -> Result<FeedStream<Self>, UpstreamError> {
        source.subscribe_bid_ask(code).await
    }
}

#[async_trait]
impl SubscribeFeed for Quote {
    async fn open(
        source: &dyn MarketDataSource,
        code: &str,
    ) -> Result<FeedStream<Self>, UpstreamError> {
        source.subscribe_quote(code).await
    }
}

#[async_trait]
impl SubscribeFeed for TradeExecution {
    /// The trade stream is not per code; `code` only labels the ingestor.
    async fn open(
        source: &dyn MarketDataSource,
        _code: &str,
    ) -> Result<FeedStream<Self>, UpstreamError> {
        source.subscribe_trade().await
    }
}
