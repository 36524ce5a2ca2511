//! In-memory upstream for tests and local development.
//!
//! Streams are fed explicitly with `push_*`; failures can be injected per
//! `(feed kind, code)` to exercise the resubscription path.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::application::ports::{FeedStream, MarketDataSource, UpstreamError};
use crate::domain::feed::{
    BidAsk, Code, FeedKind, Quote, Snapshot, SnapshotKind, Tick, TradeExecution,
};

type Key = (FeedKind, Code);
type Sender<E> = mpsc::UnboundedSender<Result<E, UpstreamError>>;

#[derive(Debug, Default)]
struct State {
    ticks: HashMap<Code, Vec<Sender<Tick>>>,
    bid_asks: HashMap<Code, Vec<Sender<BidAsk>>>,
    quotes: HashMap<Code, Vec<Sender<Quote>>>,
    trades: Vec<Sender<TradeExecution>>,
    opens: HashMap<Key, usize>,
    failing_opens: HashMap<Key, usize>,
    snapshots: HashMap<(SnapshotKind, Code), Snapshot>,
    snapshot_calls: usize,
    fail_snapshots: bool,
    trade_updates: usize,
    fail_trade_updates: bool,
}

/// Scriptable [`MarketDataSource`].
#[derive(Debug, Default)]
pub struct InMemorySource {
    state: Mutex<State>,
}

fn push<E: Clone>(senders: &mut Vec<Sender<E>>, event: &E) -> usize {
    senders.retain(|tx| tx.send(Ok(event.clone())).is_ok());
    senders.len()
}

fn open_stream<E: Send + 'static>(senders: &mut Vec<Sender<E>>) -> FeedStream<E> {
    let (tx, rx) = mpsc::unbounded_channel();
    senders.push(tx);
    UnboundedReceiverStream::new(rx).boxed()
}

fn live<E>(senders: Option<&Vec<Sender<E>>>) -> usize {
    senders.map_or(0, |s| s.iter().filter(|tx| !tx.is_closed()).count())
}

fn fail<E>(senders: Option<&mut Vec<Sender<E>>>) -> usize {
    senders.map_or(0, |senders| {
        let n = senders.len();
        for tx in senders.drain(..) {
            let _ = tx.send(Err(UpstreamError::StreamClosed));
        }
        n
    })
}

impl InMemorySource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a tick on every open stream for its code. Returns streams reached.
    pub fn push_tick(&self, tick: Tick) -> usize {
        let mut state = self.state.lock();
        state
            .ticks
            .get_mut(&tick.code)
            .map_or(0, |senders| push(senders, &tick))
    }

    /// Emit a bid/ask update. Returns streams reached.
    pub fn push_bid_ask(&self, bid_ask: BidAsk) -> usize {
        let mut state = self.state.lock();
        state
            .bid_asks
            .get_mut(&bid_ask.code)
            .map_or(0, |senders| push(senders, &bid_ask))
    }

    /// Emit a stock quote. Returns streams reached.
    pub fn push_quote(&self, quote: Quote) -> usize {
        let mut state = self.state.lock();
        state
            .quotes
            .get_mut(&quote.code)
            .map_or(0, |senders| push(senders, &quote))
    }

    /// Emit a trade on every open trade stream. Returns streams reached.
    pub fn push_trade(&self, trade: TradeExecution) -> usize {
        push(&mut self.state.lock().trades, &trade)
    }

    /// End every open stream for `(kind, code)` with an error. Returns the
    /// number of streams ended.
    pub fn fail_streams(&self, kind: FeedKind, code: &str) -> usize {
        let mut state = self.state.lock();
        match kind {
            FeedKind::Tick => fail(state.ticks.get_mut(code)),
            FeedKind::BidAsk => fail(state.bid_asks.get_mut(code)),
            FeedKind::Quote => fail(state.quotes.get_mut(code)),
            FeedKind::Trade => fail(Some(&mut state.trades)),
        }
    }

    /// Make the next `n` opens of `(kind, code)` fail.
    pub fn fail_next_opens(&self, kind: FeedKind, code: &str, n: usize) {
        self.state
            .lock()
            .failing_opens
            .insert((kind, code.to_string()), n);
    }

    /// Set the futures snapshot returned for `code`.
    pub fn set_snapshot(&self, code: &str, snapshot: Snapshot) {
        self.set_snapshot_of(SnapshotKind::Future, code, snapshot);
    }

    /// Set the snapshot returned for `code` in the `kind` universe.
    pub fn set_snapshot_of(&self, kind: SnapshotKind, code: &str, snapshot: Snapshot) {
        self.state
            .lock()
            .snapshots
            .insert((kind, code.to_string()), snapshot);
    }

    /// Make snapshot calls fail.
    pub fn fail_snapshots(&self, fail: bool) {
        self.state.lock().fail_snapshots = fail;
    }

    /// Snapshot calls served so far.
    #[must_use]
    pub fn snapshot_calls(&self) -> usize {
        self.state.lock().snapshot_calls
    }

    /// Make trade update triggers fail.
    pub fn fail_trade_updates(&self, fail: bool) {
        self.state.lock().fail_trade_updates = fail;
    }

    /// Trade update triggers accepted so far.
    #[must_use]
    pub fn trade_updates(&self) -> usize {
        self.state.lock().trade_updates
    }

    /// Successful opens of `(kind, code)` so far. Trade streams use `""`.
    #[must_use]
    pub fn open_count(&self, kind: FeedKind, code: &str) -> usize {
        self.state
            .lock()
            .opens
            .get(&(kind, code.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Streams for `(kind, code)` whose consumer is still alive.
    #[must_use]
    pub fn live_streams(&self, kind: FeedKind, code: &str) -> usize {
        let state = self.state.lock();
        match kind {
            FeedKind::Tick => live(state.ticks.get(code)),
            FeedKind::BidAsk => live(state.bid_asks.get(code)),
            FeedKind::Quote => live(state.quotes.get(code)),
            FeedKind::Trade => live(Some(&state.trades)),
        }
    }

    /// Poll until `(kind, code)` has `n` live streams or `timeout` elapses.
    /// Returns whether the count was reached.
    pub async fn wait_for_streams(
        &self,
        kind: FeedKind,
        code: &str,
        n: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.live_streams(kind, code) == n {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn begin_open(&self, kind: FeedKind, code: &str) -> Result<(), UpstreamError> {
        let mut state = self.state.lock();
        let key = (kind, code.to_string());
        if let Some(remaining) = state.failing_opens.get_mut(&key)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(UpstreamError::Rpc {
                code: "unavailable".to_string(),
                message: format!("injected failure for {kind}/{code}"),
            });
        }
        *state.opens.entry(key).or_default() += 1;
        Ok(())
    }
}

#[async_trait]
impl MarketDataSource for InMemorySource {
    async fn subscribe_tick(&self, code: &str) -> Result<FeedStream<Tick>, UpstreamError> {
        self.begin_open(FeedKind::Tick, code)?;
        let mut state = self.state.lock();
        Ok(open_stream(state.ticks.entry(code.to_string()).or_default()))
    }

    async fn subscribe_bid_ask(&self, code: &str) -> Result<FeedStream<BidAsk>, UpstreamError> {
        self.begin_open(FeedKind::BidAsk, code)?;
        let mut state = self.state.lock();
        Ok(open_stream(
            state.bid_asks.entry(code.to_string()).or_default(),
        ))
    }

    async fn subscribe_quote(&self, code: &str) -> Result<FeedStream<Quote>, UpstreamError> {
        self.begin_open(FeedKind::Quote, code)?;
        let mut state = self.state.lock();
        Ok(open_stream(state.quotes.entry(code.to_string()).or_default()))
    }

    async fn subscribe_trade(&self) -> Result<FeedStream<TradeExecution>, UpstreamError> {
        self.begin_open(FeedKind::Trade, "")?;
        Ok(open_stream(&mut self.state.lock().trades))
    }

    async fn trigger_trade_update(&self) -> Result<(), UpstreamError> {
        let mut state = self.state.lock();
        if state.fail_trade_updates {
            return Err(UpstreamError::Rpc {
                code: "unavailable".to_string(),
                message: "trade update rejected".to_string(),
            });
        }
        state.trade_updates += 1;
        Ok(())
    }

    async fn get_snapshot(
        &self,
        kind: SnapshotKind,
        codes: &[Code],
    ) -> Result<HashMap<Code, Snapshot>, UpstreamError> {
        let mut state = self.state.lock();
        state.snapshot_calls += 1;
        if state.fail_snapshots {
            return Err(UpstreamError::Transport {
                message: "snapshot service unavailable".to_string(),
            });
        }
        Ok(codes
            .iter()
            .filter_map(|code| {
                state
                    .snapshots
                    .get(&(kind, code.clone()))
                    .map(|s| (code.clone(), *s))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;

    fn tick(code: &str) -> Tick {
        Tick {
            code: code.to_string(),
            price: Decimal::ONE,
            price_change: Decimal::ZERO,
            volume: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn pushed_ticks_reach_open_streams() {
        let source = InMemorySource::new();
        let mut stream = source.subscribe_tick("TXF").await.unwrap();
        assert_eq!(source.push_tick(tick("TXF")), 1);
        assert_eq!(source.push_tick(tick("MXF")), 0);
        assert_eq!(stream.next().await.unwrap().unwrap().code, "TXF");
    }

    #[tokio::test]
    async fn injected_open_failures_are_consumed() {
        let source = InMemorySource::new();
        source.fail_next_opens(FeedKind::BidAsk, "TXF", 1);
        assert!(source.subscribe_bid_ask("TXF").await.is_err());
        assert!(source.subscribe_bid_ask("TXF").await.is_ok());
        assert_eq!(source.open_count(FeedKind::BidAsk, "TXF"), 1);
    }

    #[tokio::test]
    async fn failed_streams_end_with_error() {
        let source = InMemorySource::new();
        let mut stream = source.subscribe_trade().await.unwrap();
        assert_eq!(source.fail_streams(FeedKind::Trade, ""), 1);
        assert!(matches!(
            stream.next().await,
            Some(Err(UpstreamError::StreamClosed))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_streams_are_not_live() {
        let source = InMemorySource::new();
        let stream = source.subscribe_tick("TXF").await.unwrap();
        assert_eq!(source.live_streams(FeedKind::Tick, "TXF"), 1);
        drop(stream);
        assert_eq!(source.live_streams(FeedKind::Tick, "TXF"), 0);
    }

    #[tokio::test]
    async fn snapshots_omit_unknown_codes() {
        let source = InMemorySource::new();
        source.set_snapshot(
            "A",
            Snapshot {
                close: Decimal::TEN,
                change_price: Decimal::ONE,
            },
        );
        let result = source
            .get_snapshot(SnapshotKind::Future, &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("A"));

        source.fail_snapshots(true);
        assert!(source.get_snapshot(SnapshotKind::Future, &[]).await.is_err());
        assert_eq!(source.snapshot_calls(), 2);
    }

    #[tokio::test]
    async fn snapshots_are_scoped_by_universe() {
        let source = InMemorySource::new();
        let snapshot = Snapshot {
            close: Decimal::TEN,
            change_price: Decimal::ONE,
        };
        source.set_snapshot_of(SnapshotKind::Stock, "2330", snapshot);
        let codes = ["2330".to_string()];

        assert!(source.get_snapshot(SnapshotKind::Future, &codes).await.unwrap().is_empty());
        let stock = source.get_snapshot(SnapshotKind::Stock, &codes).await.unwrap();
        assert_eq!(stock.get("2330"), Some(&snapshot));
    }

    #[tokio::test]
    async fn trade_update_triggers_are_counted() {
        let source = InMemorySource::new();
        source.trigger_trade_update().await.unwrap();
        source.fail_trade_updates(true);
        assert!(source.trigger_trade_update().await.is_err());
        assert_eq!(source.trade_updates(), 1);
    }
}
