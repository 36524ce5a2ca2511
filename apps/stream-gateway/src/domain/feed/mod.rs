//! Feed Event Types
//!
//! Immutable values produced by the upstream market data / execution
//! service. Market data events are identified by instrument code, trade
//! executions by order id (they also carry a code for per-code views).

mod natural;

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use natural::{natural_cmp, natural_sort};

/// Instrument code (e.g. `"TXF"`, `"2330"`).
pub type Code = String;

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque client identifier, unique per connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Feed Kind
// =============================================================================

/// Category of real-time event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    /// Last-trade price updates.
    Tick,
    /// Order book top levels.
    BidAsk,
    /// Order execution reports.
    Trade,
    /// Stock quote updates.
    Quote,
}

impl FeedKind {
    /// All feed kinds.
    pub const ALL: [Self; 4] = [Self::Tick, Self::BidAsk, Self::Trade, Self::Quote];

    /// Stable name used in topics and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::BidAsk => "bidask",
            Self::Trade => "trade",
            Self::Quote => "quote",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Market Data
// =============================================================================

/// Last-trade price update for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument code.
    pub code: Code,
    /// Last traded price.
    pub price: Decimal,
    /// Change against the previous close.
    pub price_change: Decimal,
    /// Traded volume for this tick.
    pub volume: i64,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Last quote of one listed stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Stock code.
    pub code: Code,
    /// Last traded price.
    pub price: Decimal,
    /// Change against the previous close.
    pub price_change: Decimal,
    /// Traded volume for this quote.
    pub volume: i64,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

/// One price level of the order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting volume at this price.
    pub volume: i64,
}

/// Top-of-book update for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidAsk {
    /// Instrument code.
    pub code: Code,
    /// Bid levels, best first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first.
    pub asks: Vec<PriceLevel>,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Trade Execution
// =============================================================================

/// Instrument type of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Unknown or unspecified.
    #[default]
    Unspecified,
    /// Stock traded in shares.
    StockShare,
    /// Stock traded in board lots.
    StockLot,
    /// Futures contract.
    Future,
    /// Options contract.
    Option,
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    /// Unknown or unspecified.
    #[default]
    Unspecified,
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Unknown or unspecified.
    #[default]
    Unspecified,
    /// Accepted, waiting for a match.
    Pending,
    /// Some quantity filled.
    PartFilled,
    /// Fully filled.
    Filled,
    /// Cancelled before full fill.
    Cancelled,
    /// Rejected upstream.
    Failed,
}

impl OrderStatus {
    /// Whether the order can still fill.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::PartFilled)
    }
}

/// Execution report for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeExecution {
    /// Upstream order identifier.
    pub order_id: String,
    /// Instrument code.
    pub code: Code,
    /// Instrument type.
    pub order_type: OrderType,
    /// Order side.
    pub action: OrderAction,
    /// Order price.
    pub price: Decimal,
    /// Ordered quantity.
    pub quantity: i64,
    /// Filled quantity so far.
    pub filled_quantity: i64,
    /// Current status.
    pub status: OrderStatus,
    /// Time the order was placed.
    pub order_time: DateTime<Utc>,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Instrument universe a snapshot request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Futures contracts.
    #[default]
    Future,
    /// Listed stocks.
    Stock,
}

impl SnapshotKind {
    /// Kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Future => "future",
            Self::Stock => "stock",
        }
    }
}

/// Last known summary value for a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last close price.
    pub close: Decimal,
    /// Change against the previous close.
    pub change_price: Decimal,
}

// =============================================================================
// Feed Event
// =============================================================================

/// Any event carried on the topic bus feed family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Tick update.
    Tick(Tick),
    /// Bid/ask update.
    BidAsk(BidAsk),
    /// Trade execution.
    Trade(TradeExecution),
    /// Stock quote.
    Quote(Quote),
}

impl FeedEvent {
    /// Feed kind of this event.
    #[must_use]
    pub const fn kind(&self) -> FeedKind {
        match self {
            Self::Tick(_) => FeedKind::Tick,
            Self::BidAsk(_) => FeedKind::BidAsk,
            Self::Trade(_) => FeedKind::Trade,
            Self::Quote(_) => FeedKind::Quote,
        }
    }

    /// Instrument code of this event.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Tick(t) => &t.code,
            Self::BidAsk(b) => &b.code,
            Self::Trade(t) => &t.code,
            Self::Quote(q) => &q.code,
        }
    }
}

/// A concrete event type flowing through one ingestor and broadcaster.
pub trait FeedPayload: Clone + Send + Sync + fmt::Debug + 'static {
    /// Feed kind this payload belongs to.
    const KIND: FeedKind;

    /// Instrument code the event is routed by.
    fn code(&self) -> &str;

    /// Wrap into the bus feed family.
    fn into_feed_event(self) -> FeedEvent;
}

impl FeedPayload for Tick {
    const KIND: FeedKind = FeedKind::Tick;

    fn code(&self) -> &str {
        &self.code
    }

    fn into_feed_event(self) -> FeedEvent {
        FeedEvent::Tick(self)
    }
}

impl FeedPayload for BidAsk {
    const KIND: FeedKind = FeedKind::BidAsk;

    fn code(&self) -> &str {
        &self.code
    }

    fn into_feed_event(self) -> FeedEvent {
        FeedEvent::BidAsk(self)
    }
}

impl FeedPayload for TradeExecution {
    const KIND: FeedKind = FeedKind::Trade;

    fn code(&self) -> &str {
        &self.code
    }

    fn into_feed_event(self) -> FeedEvent {
        FeedEvent::Trade(self)
    }
}

impl FeedPayload for Quote {
    const KIND: FeedKind = FeedKind::Quote;

    fn code(&self) -> &str {
        &self.code
    }

    fn into_feed_event(self) -> FeedEvent {
        FeedEvent::Quote(self)
    }
}

/// A payload a freshly attached client is seeded with.
///
/// Each seeded feed names the snapshot universe its seed values come
/// from; the seed carries the snapshot close and change with zero volume.
pub trait Seeded: FeedPayload {
    /// Universe queried for this feed's snapshots.
    const SNAPSHOT: SnapshotKind;

    /// Synthesize the seed event for `code`.
    fn from_snapshot(code: Code, snapshot: Snapshot) -> Self;
}

impl Seeded for Tick {
    const SNAPSHOT: SnapshotKind = SnapshotKind::Future;

    fn from_snapshot(code: Code, snapshot: Snapshot) -> Self {
        Self {
            code,
            price: snapshot.close,
            price_change: snapshot.change_price,
            volume: 0,
            timestamp: Utc::now(),
        }
    }
}

impl Seeded for Quote {
    const SNAPSHOT: SnapshotKind = SnapshotKind::Stock;

    fn from_snapshot(code: Code, snapshot: Snapshot) -> Self {
        Self {
            code,
            price: snapshot.close,
            price_change: snapshot.change_price,
            volume: 0,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_kind_names() {
        assert_eq!(FeedKind::Tick.as_str(), "tick");
        assert_eq!(FeedKind::BidAsk.as_str(), "bidask");
        assert_eq!(FeedKind::Trade.to_string(), "trade");
        assert_eq!(FeedKind::Quote.as_str(), "quote");
    }

    #[test]
    fn only_pending_and_part_filled_orders_are_open() {
        let open: Vec<_> = [
            OrderStatus::Unspecified,
            OrderStatus::Pending,
            OrderStatus::PartFilled,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ]
        .into_iter()
        .filter(|s| s.is_open())
        .collect();
        assert_eq!(open, [OrderStatus::Pending, OrderStatus::PartFilled]);
    }

    #[test]
    fn client_ids_are_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn client_id_serializes_as_uuid_string() {
        let id = ClientId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn seeded_feeds_use_their_own_snapshot_universe() {
        assert_eq!(<Tick as Seeded>::SNAPSHOT, SnapshotKind::Future);
        assert_eq!(<Quote as Seeded>::SNAPSHOT, SnapshotKind::Stock);
    }

    #[test]
    fn seeded_quote_copies_snapshot_values() {
        let snapshot = Snapshot {
            close: Decimal::new(5_805, 1),
            change_price: Decimal::new(3, 0),
        };
        let quote = Quote::from_snapshot("2330".to_string(), snapshot);
        assert_eq!(quote.code, "2330");
        assert_eq!(quote.price, Decimal::new(5_805, 1));
        assert_eq!(quote.price_change, Decimal::new(3, 0));
        assert_eq!(quote.volume, 0);
        assert_eq!(quote.into_feed_event().kind(), FeedKind::Quote);
    }

    #[test]
    fn seeded_tick_copies_snapshot_values() {
        let snapshot = Snapshot {
            close: Decimal::new(172_505, 1),
            change_price: Decimal::new(-12, 0),
        };
        let tick = Tick::from_snapshot("TXF".to_string(), snapshot);
        assert_eq!(tick.code, "TXF");
        assert_eq!(tick.price, Decimal::new(172_505, 1));
        assert_eq!(tick.price_change, Decimal::new(-12, 0));
        assert_eq!(tick.volume, 0);
    }

    #[test]
    fn feed_event_routing_fields() {
        let event = Tick::from_snapshot(
            "MXF".to_string(),
            Snapshot {
                close: Decimal::ONE,
                change_price: Decimal::ZERO,
            },
        )
        .into_feed_event();
        assert_eq!(event.kind(), FeedKind::Tick);
        assert_eq!(event.code(), "MXF");
    }
}
