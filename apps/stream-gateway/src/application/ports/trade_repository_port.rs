//! Trade Repository Port (Driven Port)
//!
//! Storage for trade executions, keyed by order id with last-write-wins
//! semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::feed::{Code, TradeExecution};

/// A persisted trade execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Trade identifier, generated on first insert.
    pub uid: Uuid,
    /// Latest execution values for the order.
    #[serde(flatten)]
    pub trade: TradeExecution,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
}

/// Storage failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistenceError {
    /// The backend is unreachable.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },

    /// The write was rejected.
    #[error("invalid trade {order_id}: {reason}")]
    Rejected {
        /// Order that failed.
        order_id: String,
        /// Rejection reason.
        reason: String,
    },
}

/// Port for trade storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeRepository: Send + Sync {
    /// Insert a new order or overwrite the existing one with the same id.
    async fn upsert_trade(&self, trade: &TradeExecution) -> Result<TradeRecord, PersistenceError>;

    /// All records, oldest order first.
    async fn find_all(&self) -> Result<Vec<TradeRecord>, PersistenceError>;

    /// Record for one order id.
    async fn find_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<TradeRecord>, PersistenceError>;

    /// Records placed within `[start, end]`, oldest order first.
    async fn find_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeRecord>, PersistenceError>;

    /// Records of `code` that can still fill, oldest order first.
    async fn find_undone_by_code(&self, code: &Code) -> Result<Vec<TradeRecord>, PersistenceError>;
}
