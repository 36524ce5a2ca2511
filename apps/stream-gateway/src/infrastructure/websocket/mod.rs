//! WebSocket Transport
//!
//! Session pumps for upgraded sockets and the protobuf frames sent to
//! clients.

pub mod session;

use axum::body::Bytes;
use prost::Message as _;

use crate::domain::feed::{BidAsk, Quote, Tick, TradeExecution};
use crate::infrastructure::upstream::proto;

pub use session::{PING, PONG, SessionError, SessionHandle, SessionState};

/// Events that can be written to a session as a binary frame.
pub trait OutboundFrame {
    /// Protobuf encoding of the event.
    fn encode_frame(&self) -> Bytes;
}

impl OutboundFrame for Tick {
    fn encode_frame(&self) -> Bytes {
        proto::MarketFrame::from(self).encode_to_vec().into()
    }
}

impl OutboundFrame for BidAsk {
    fn encode_frame(&self) -> Bytes {
        proto::MarketFrame::from(self).encode_to_vec().into()
    }
}

impl OutboundFrame for Quote {
    fn encode_frame(&self) -> Bytes {
        proto::StockQuote::from(self).encode_to_vec().into()
    }
}

impl OutboundFrame for TradeExecution {
    fn encode_frame(&self) -> Bytes {
        proto::Trade::from(self).encode_to_vec().into()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use prost::Message;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::feed::PriceLevel;

    #[test]
    fn bid_ask_frame_is_tagged() {
        let bid_ask = BidAsk {
            code: "MXF".to_string(),
            bids: vec![PriceLevel {
                price: Decimal::new(100, 0),
                volume: 2,
            }],
            asks: Vec::new(),
            timestamp: Utc::now(),
        };
        let frame = proto::MarketFrame::decode(bid_ask.encode_frame()).unwrap();
        assert!(matches!(
            frame.payload,
            Some(proto::market_frame::Payload::BidAsk(ref b)) if b.code == "MXF" && b.bids.len() == 1
        ));
    }

    #[test]
    fn quote_frame_is_a_bare_stock_quote() {
        let quote = Quote {
            code: "2330".to_string(),
            price: Decimal::new(580, 0),
            price_change: Decimal::ONE,
            volume: 7,
            timestamp: Utc::now(),
        };
        let frame = proto::StockQuote::decode(quote.encode_frame()).unwrap();
        assert_eq!(frame.code, "2330");
        assert_eq!(frame.volume, 7);
    }
}
