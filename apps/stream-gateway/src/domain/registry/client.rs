//! Client types stored in the registries.

use super::channel::{ClientReceiver, ClientSender, Delivery, DeliveryPolicy, client_channel};
use crate::domain::feed::{BidAsk, ClientId, Quote, Tick, TradeExecution};

/// A registry member identified by its client id.
pub trait Subscriber: Send + Sync + 'static {
    /// Client identifier.
    fn id(&self) -> ClientId;
}

/// A registry member able to receive events of type `E`.
pub trait Deliver<E>: Subscriber {
    /// Hand one event to the client's channel for `E`.
    fn deliver(&self, event: E) -> Delivery;
}

// =============================================================================
// Market Data Client
// =============================================================================

/// Downstream consumer of tick and bid/ask events.
#[derive(Debug)]
pub struct MarketClient {
    id: ClientId,
    ticks: ClientSender<Tick>,
    bid_asks: ClientSender<BidAsk>,
}

/// Receiving side of a [`MarketClient`].
#[derive(Debug)]
pub struct MarketReceivers {
    /// Tick events.
    pub ticks: ClientReceiver<Tick>,
    /// Bid/ask events.
    pub bid_asks: ClientReceiver<BidAsk>,
}

impl MarketClient {
    /// Create a client with a fresh id and one channel per market feed.
    #[must_use]
    pub fn new(policy: DeliveryPolicy) -> (Self, MarketReceivers) {
        Self::with_id(ClientId::new(), policy)
    }

    /// Create a client with a given id.
    #[must_use]
    pub fn with_id(id: ClientId, policy: DeliveryPolicy) -> (Self, MarketReceivers) {
        let (tick_tx, tick_rx) = client_channel(policy);
        let (bid_ask_tx, bid_ask_rx) = client_channel(policy);
        (
            Self {
                id,
                ticks: tick_tx,
                bid_asks: bid_ask_tx,
            },
            MarketReceivers {
                ticks: tick_rx,
                bid_asks: bid_ask_rx,
            },
        )
    }
}

impl Subscriber for MarketClient {
    fn id(&self) -> ClientId {
        self.id
    }
}

impl Deliver<Tick> for MarketClient {
    fn deliver(&self, event: Tick) -> Delivery {
        self.ticks.deliver(event)
    }
}

impl Deliver<BidAsk> for MarketClient {
    fn deliver(&self, event: BidAsk) -> Delivery {
        self.bid_asks.deliver(event)
    }
}

// =============================================================================
// Stock Quote Client
// =============================================================================

/// Downstream consumer of stock quotes.
#[derive(Debug)]
pub struct QuoteClient {
    id: ClientId,
    quotes: ClientSender<Quote>,
}

impl QuoteClient {
    /// Create a client with a fresh id.
    #[must_use]
    pub fn new(policy: DeliveryPolicy) -> (Self, ClientReceiver<Quote>) {
        Self::with_id(ClientId::new(), policy)
    }

    /// Create a client with a given id.
    #[must_use]
    pub fn with_id(id: ClientId, policy: DeliveryPolicy) -> (Self, ClientReceiver<Quote>) {
        let (tx, rx) = client_channel(policy);
        (Self { id, quotes: tx }, rx)
    }
}

impl Subscriber for QuoteClient {
    fn id(&self) -> ClientId {
        self.id
    }
}

impl Deliver<Quote> for QuoteClient {
    fn deliver(&self, event: Quote) -> Delivery {
        self.quotes.deliver(event)
    }
}

// =============================================================================
// Trade Client
// =============================================================================

/// Downstream consumer of trade executions.
#[derive(Debug)]
pub struct TradeClient {
    id: ClientId,
    trades: ClientSender<TradeExecution>,
}

impl TradeClient {
    /// Create a client with a fresh id and a lossless trade channel.
    #[must_use]
    pub fn new() -> (Self, ClientReceiver<TradeExecution>) {
        Self::with_id(ClientId::new())
    }

    /// Create a client with a given id.
    #[must_use]
    pub fn with_id(id: ClientId) -> (Self, ClientReceiver<TradeExecution>) {
        let (tx, rx) = client_channel(DeliveryPolicy::Lossless);
        (Self { id, trades: tx }, rx)
    }
}

impl Subscriber for TradeClient {
    fn id(&self) -> ClientId {
        self.id
    }
}

impl Deliver<TradeExecution> for TradeClient {
    fn deliver(&self, event: TradeExecution) -> Delivery {
        self.trades.deliver(event)
    }
}
