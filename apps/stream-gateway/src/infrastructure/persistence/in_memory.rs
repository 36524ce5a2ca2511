//! In-memory trade repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::application::ports::{PersistenceError, TradeRecord, TradeRepository};
use crate::domain::feed::{Code, TradeExecution};

/// In-memory implementation of `TradeRepository`, keyed by order id.
///
/// State does not survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryTradeRepository {
    trades: RwLock<HashMap<String, TradeRecord>>,
}

impl InMemoryTradeRepository {
    /// Create a new empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trades.read().len()
    }

    /// Whether the repository is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trades.read().is_empty()
    }

    fn select<P: Fn(&TradeRecord) -> bool>(&self, predicate: P) -> Vec<TradeRecord> {
        let mut records: Vec<TradeRecord> = self
            .trades
            .read()
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.trade
                .order_time
                .cmp(&b.trade.order_time)
                .then_with(|| a.trade.order_id.cmp(&b.trade.order_id))
        });
        records
    }
}

#[async_trait]
impl TradeRepository for InMemoryTradeRepository {
    async fn upsert_trade(&self, trade: &TradeExecution) -> Result<TradeRecord, PersistenceError> {
        if trade.order_id.is_empty() {
            return Err(PersistenceError::Rejected {
                order_id: String::new(),
                reason: "empty order id".to_string(),
            });
        }

        let mut trades = self.trades.write();
        let now = Utc::now();
        let record = trades
            .entry(trade.order_id.clone())
            .and_modify(|existing| {
                existing.trade = trade.clone();
                existing.updated_at = now;
            })
            .or_insert_with(|| TradeRecord {
                uid: Uuid::new_v4(),
                trade: trade.clone(),
                updated_at: now,
            });
        Ok(record.clone())
    }

    async fn find_all(&self) -> Result<Vec<TradeRecord>, PersistenceError> {
        Ok(self.select(|_| true))
    }

    async fn find_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<TradeRecord>, PersistenceError> {
        Ok(self.trades.read().get(order_id).cloned())
    }

    async fn find_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>, PersistenceError> {
        Ok(self.select(|r| (start..=end).contains(&r.trade.order_time)))
    }

    async fn find_undone_by_code(&self, code: &Code) -> Result<Vec<TradeRecord>, PersistenceError> {
        Ok(self.select(|r| r.trade.code == *code && r.trade.status.is_open()))
    }
}
