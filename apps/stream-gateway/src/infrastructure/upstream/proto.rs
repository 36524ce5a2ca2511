//! Wire Messages
//!
//! Protobuf messages of the `gateway.v1.MarketDataService` upstream
//! service. The same messages are used for outbound WebSocket frames:
//! market sessions receive [`MarketFrame`]s, stock sessions receive
//! [`StockQuote`]s, trade sessions receive [`Trade`]s.
//!
//! ```text
//! service MarketDataService {
//!   rpc SubscribeTick(SubscribeRequest) returns (stream Tick);
//!   rpc SubscribeBidAsk(SubscribeRequest) returns (stream BidAsk);
//!   rpc SubscribeStockQuote(SubscribeRequest) returns (stream StockQuote);
//!   rpc SubscribeTrade(TradeStreamRequest) returns (stream Trade);
//!   rpc UpdateAndPublishTrade(TradeUpdateRequest) returns (TradeUpdateResponse);
//!   rpc GetSnapshot(SnapshotRequest) returns (SnapshotResponse);
//! }
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use prost_types::Timestamp;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};

use crate::application::ports::UpstreamError;
use crate::domain::feed;

// =============================================================================
// Messages
// =============================================================================

/// Per-code subscription request.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct SubscribeRequest {
    /// Instrument code.
    #[prost(string, tag = "1")]
    pub code: String,
}

/// Trade stream request.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct TradeStreamRequest {}

/// Request to refresh and republish order records.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct TradeUpdateRequest {}

/// Acknowledgement of a [`TradeUpdateRequest`].
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct TradeUpdateResponse {}

/// Tick update.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tick {
    /// Instrument code.
    #[prost(string, tag = "1")]
    pub code: String,
    /// Last price.
    #[prost(double, tag = "2")]
    pub close: f64,
    /// Change against previous close.
    #[prost(double, tag = "3")]
    pub price_chg: f64,
    /// Tick volume.
    #[prost(int64, tag = "4")]
    pub volume: i64,
    /// Exchange time.
    #[prost(message, optional, tag = "5")]
    pub tick_time: Option<Timestamp>,
}

/// Stock quote update.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StockQuote {
    /// Stock code.
    #[prost(string, tag = "1")]
    pub code: String,
    /// Last price.
    #[prost(double, tag = "2")]
    pub close: f64,
    /// Change against previous close.
    #[prost(double, tag = "3")]
    pub price_chg: f64,
    /// Quote volume.
    #[prost(int64, tag = "4")]
    pub volume: i64,
    /// Exchange time.
    #[prost(message, optional, tag = "5")]
    pub quote_time: Option<Timestamp>,
}

/// One order book level.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PriceLevel {
    /// Level price.
    #[prost(double, tag = "1")]
    pub price: f64,
    /// Level volume.
    #[prost(int64, tag = "2")]
    pub volume: i64,
}

/// Bid/ask update.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidAsk {
    /// Instrument code.
    #[prost(string, tag = "1")]
    pub code: String,
    /// Bid levels, best first.
    #[prost(message, repeated, tag = "2")]
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first.
    #[prost(message, repeated, tag = "3")]
    pub asks: Vec<PriceLevel>,
    /// Exchange time.
    #[prost(message, optional, tag = "4")]
    pub bid_ask_time: Option<Timestamp>,
}

/// Instrument type of an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OrderType {
    /// Unspecified.
    Unspecified = 0,
    /// Stock in shares.
    StockShare = 1,
    /// Stock in lots.
    StockLot = 2,
    /// Future.
    Future = 3,
    /// Option.
    Option = 4,
}

/// Order side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OrderAction {
    /// Unspecified.
    Unspecified = 0,
    /// Buy.
    Buy = 1,
    /// Sell.
    Sell = 2,
}

/// Order status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OrderStatus {
    /// Unspecified.
    Unspecified = 0,
    /// Pending.
    Pending = 1,
    /// Partially filled.
    PartFilled = 2,
    /// Filled.
    Filled = 3,
    /// Cancelled.
    Cancelled = 4,
    /// Failed.
    Failed = 5,
}

/// Trade execution report.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Trade {
    /// Order id.
    #[prost(string, tag = "1")]
    pub order_id: String,
    /// Instrument code.
    #[prost(string, tag = "2")]
    pub code: String,
    /// Instrument type.
    #[prost(enumeration = "OrderType", tag = "3")]
    pub r#type: i32,
    /// Side.
    #[prost(enumeration = "OrderAction", tag = "4")]
    pub action: i32,
    /// Price.
    #[prost(double, tag = "5")]
    pub price: f64,
    /// Ordered quantity.
    #[prost(int64, tag = "6")]
    pub quantity: i64,
    /// Filled quantity.
    #[prost(int64, tag = "7")]
    pub filled_quantity: i64,
    /// Status.
    #[prost(enumeration = "OrderStatus", tag = "8")]
    pub status: i32,
    /// Order time.
    #[prost(message, optional, tag = "9")]
    pub order_time: Option<Timestamp>,
}

/// Snapshot universe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SnapshotType {
    /// Futures.
    Future = 0,
    /// Stocks.
    Stock = 1,
}

/// Snapshot request.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct SnapshotRequest {
    /// Universe.
    #[prost(enumeration = "SnapshotType", tag = "1")]
    pub r#type: i32,
    /// Codes to fetch.
    #[prost(string, repeated, tag = "2")]
    pub codes: Vec<String>,
}

/// Last-known value for one code.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SnapshotEntry {
    /// Close price.
    #[prost(double, tag = "1")]
    pub close: f64,
    /// Change against previous close.
    #[prost(double, tag = "2")]
    pub change_price: f64,
}

/// Snapshot response keyed by code.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotResponse {
    /// Entries by code.
    #[prost(map = "string, message", tag = "1")]
    pub snapshots: HashMap<String, SnapshotEntry>,
}

/// Outbound market data frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarketFrame {
    /// Tick or bid/ask payload.
    #[prost(oneof = "market_frame::Payload", tags = "1, 2")]
    pub payload: Option<market_frame::Payload>,
}

/// Nested types of [`MarketFrame`].
pub mod market_frame {
    /// Frame payload.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        /// Tick update.
        #[prost(message, tag = "1")]
        Tick(super::Tick),
        /// Bid/ask update.
        #[prost(message, tag = "2")]
        BidAsk(super::BidAsk),
    }
}

// =============================================================================
// Converters
// =============================================================================

/// Convert chrono `DateTime` to prost `Timestamp`.
#[must_use]
pub fn datetime_to_timestamp(dt: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: dt.timestamp(),
        nanos: i32::try_from(dt.timestamp_subsec_nanos()).unwrap_or(i32::MAX),
    }
}

/// Convert prost `Timestamp` to chrono `DateTime`. A missing or invalid
/// timestamp maps to now.
#[must_use]
pub fn timestamp_to_datetime(ts: Option<&Timestamp>) -> DateTime<Utc> {
    ts.and_then(|ts| {
        let nanos = u32::try_from(ts.nanos).ok()?;
        DateTime::from_timestamp(ts.seconds, nanos)
    })
    .unwrap_or_else(Utc::now)
}

fn decimal_from_f64(field: &str, value: f64) -> Result<Decimal, UpstreamError> {
    Decimal::from_f64(value).ok_or_else(|| UpstreamError::Decode {
        message: format!("{field} is not a finite number: {value}"),
    })
}

fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

impl TryFrom<Tick> for feed::Tick {
    type Error = UpstreamError;

    fn try_from(msg: Tick) -> Result<Self, Self::Error> {
        Ok(Self {
            price: decimal_from_f64("close", msg.close)?,
            price_change: decimal_from_f64("price_chg", msg.price_chg)?,
            volume: msg.volume,
            timestamp: timestamp_to_datetime(msg.tick_time.as_ref()),
            code: msg.code,
        })
    }
}

impl From<&feed::Tick> for Tick {
    fn from(tick: &feed::Tick) -> Self {
        Self {
            code: tick.code.clone(),
            close: decimal_to_f64(tick.price),
            price_chg: decimal_to_f64(tick.price_change),
            volume: tick.volume,
            tick_time: Some(datetime_to_timestamp(tick.timestamp)),
        }
    }
}

impl TryFrom<StockQuote> for feed::Quote {
    type Error = UpstreamError;

    fn try_from(msg: StockQuote) -> Result<Self, Self::Error> {
        Ok(Self {
            price: decimal_from_f64("close", msg.close)?,
            price_change: decimal_from_f64("price_chg", msg.price_chg)?,
            volume: msg.volume,
            timestamp: timestamp_to_datetime(msg.quote_time.as_ref()),
            code: msg.code,
        })
    }
}

impl From<&feed::Quote> for StockQuote {
    fn from(quote: &feed::Quote) -> Self {
        Self {
            code: quote.code.clone(),
            close: decimal_to_f64(quote.price),
            price_chg: decimal_to_f64(quote.price_change),
            volume: quote.volume,
            quote_time: Some(datetime_to_timestamp(quote.timestamp)),
        }
    }
}

fn levels_from_proto(field: &str, levels: Vec<PriceLevel>) -> Result<Vec<feed::PriceLevel>, UpstreamError> {
    levels
        .into_iter()
        .map(|l| {
            Ok(feed::PriceLevel {
                price: decimal_from_f64(field, l.price)?,
                volume: l.volume,
            })
        })
        .collect()
}

fn levels_to_proto(levels: &[feed::PriceLevel]) -> Vec<PriceLevel> {
    levels
        .iter()
        .map(|l| PriceLevel {
            price: decimal_to_f64(l.price),
            volume: l.volume,
        })
        .collect()
}

impl TryFrom<BidAsk> for feed::BidAsk {
    type Error = UpstreamError;

    fn try_from(msg: BidAsk) -> Result<Self, Self::Error> {
        Ok(Self {
            bids: levels_from_proto("bids", msg.bids)?,
            asks: levels_from_proto("asks", msg.asks)?,
            timestamp: timestamp_to_datetime(msg.bid_ask_time.as_ref()),
            code: msg.code,
        })
    }
}

impl From<&feed::BidAsk> for BidAsk {
    fn from(bid_ask: &feed::BidAsk) -> Self {
        Self {
            code: bid_ask.code.clone(),
            bids: levels_to_proto(&bid_ask.bids),
            asks: levels_to_proto(&bid_ask.asks),
            bid_ask_time: Some(datetime_to_timestamp(bid_ask.timestamp)),
        }
    }
}

impl From<OrderType> for feed::OrderType {
    fn from(value: OrderType) -> Self {
        match value {
            OrderType::Unspecified => Self::Unspecified,
            OrderType::StockShare => Self::StockShare,
            OrderType::StockLot => Self::StockLot,
            OrderType::Future => Self::Future,
            OrderType::Option => Self::Option,
        }
    }
}

impl From<feed::OrderType> for OrderType {
    fn from(value: feed::OrderType) -> Self {
        match value {
            feed::OrderType::Unspecified => Self::Unspecified,
            feed::OrderType::StockShare => Self::StockShare,
            feed::OrderType::StockLot => Self::StockLot,
            feed::OrderType::Future => Self::Future,
            feed::OrderType::Option => Self::Option,
        }
    }
}

impl From<OrderAction> for feed::OrderAction {
    fn from(value: OrderAction) -> Self {
        match value {
            OrderAction::Unspecified => Self::Unspecified,
            OrderAction::Buy => Self::Buy,
            OrderAction::Sell => Self::Sell,
        }
    }
}

impl From<feed::OrderAction> for OrderAction {
    fn from(value: feed::OrderAction) -> Self {
        match value {
            feed::OrderAction::Unspecified => Self::Unspecified,
            feed::OrderAction::Buy => Self::Buy,
            feed::OrderAction::Sell => Self::Sell,
        }
    }
}

impl From<OrderStatus> for feed::OrderStatus {
    fn from(value: OrderStatus) -> Self {
        match value {
            OrderStatus::Unspecified => Self::Unspecified,
            OrderStatus::Pending => Self::Pending,
            OrderStatus::PartFilled => Self::PartFilled,
            OrderStatus::Filled => Self::Filled,
            OrderStatus::Cancelled => Self::Cancelled,
            OrderStatus::Failed => Self::Failed,
        }
    }
}

impl From<feed::OrderStatus> for OrderStatus {
    fn from(value: feed::OrderStatus) -> Self {
        match value {
            feed::OrderStatus::Unspecified => Self::Unspecified,
            feed::OrderStatus::Pending => Self::Pending,
            feed::OrderStatus::PartFilled => Self::PartFilled,
            feed::OrderStatus::Filled => Self::Filled,
            feed::OrderStatus::Cancelled => Self::Cancelled,
            feed::OrderStatus::Failed => Self::Failed,
        }
    }
}

impl TryFrom<Trade> for feed::TradeExecution {
    type Error = UpstreamError;

    fn try_from(msg: Trade) -> Result<Self, Self::Error> {
        Ok(Self {
            order_type: msg.r#type().into(),
            action: msg.action().into(),
            status: msg.status().into(),
            price: decimal_from_f64("price", msg.price)?,
            quantity: msg.quantity,
            filled_quantity: msg.filled_quantity,
            order_time: timestamp_to_datetime(msg.order_time.as_ref()),
            order_id: msg.order_id,
            code: msg.code,
        })
    }
}

impl From<&feed::TradeExecution> for Trade {
    fn from(trade: &feed::TradeExecution) -> Self {
        Self {
            order_id: trade.order_id.clone(),
            code: trade.code.clone(),
            r#type: OrderType::from(trade.order_type).into(),
            action: OrderAction::from(trade.action).into(),
            price: decimal_to_f64(trade.price),
            quantity: trade.quantity,
            filled_quantity: trade.filled_quantity,
            status: OrderStatus::from(trade.status).into(),
            order_time: Some(datetime_to_timestamp(trade.order_time)),
        }
    }
}

impl From<feed::SnapshotKind> for SnapshotType {
    fn from(kind: feed::SnapshotKind) -> Self {
        match kind {
            feed::SnapshotKind::Future => Self::Future,
            feed::SnapshotKind::Stock => Self::Stock,
        }
    }
}

impl TryFrom<SnapshotEntry> for feed::Snapshot {
    type Error = UpstreamError;

    fn try_from(msg: SnapshotEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            close: decimal_from_f64("close", msg.close)?,
            change_price: decimal_from_f64("change_price", msg.change_price)?,
        })
    }
}

impl From<&feed::Tick> for MarketFrame {
    fn from(tick: &feed::Tick) -> Self {
        Self {
            payload: Some(market_frame::Payload::Tick(tick.into())),
        }
    }
}

impl From<&feed::BidAsk> for MarketFrame {
    fn from(bid_ask: &feed::BidAsk) -> Self {
        Self {
            payload: Some(market_frame::Payload::BidAsk(bid_ask.into())),
        }
    }
}
