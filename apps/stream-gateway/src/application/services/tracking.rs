//! Subscribed Code Tracking
//!
//! Pairs a [`SubscriptionTable`] with the set of codes whose lead feed
//! stream is open. A code joins the set when its lead ingestor opens and
//! leaves it when that ingestor finishes; a later generation re-adds it.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

use super::ingestor::StreamObserver;
use crate::domain::feed::{Code, FeedKind, natural_sort};
use crate::domain::subscription::SubscriptionTable;

/// Code to the generation of the lead ingestor that announced it.
pub(super) type KnownCodes = HashMap<Code, u64>;

pub(super) struct TrackedSubscriptions {
    table: SubscriptionTable,
    lead: FeedKind,
    known: RwLock<KnownCodes>,
}

impl TrackedSubscriptions {
    pub(super) fn new(parent: CancellationToken, lead: FeedKind) -> Self {
        Self {
            table: SubscriptionTable::new(parent),
            lead,
            known: RwLock::new(HashMap::new()),
        }
    }

    pub(super) const fn table(&self) -> &SubscriptionTable {
        &self.table
    }

    /// Hold the known set; attaches seed under this guard.
    pub(super) async fn known(&self) -> RwLockReadGuard<'_, KnownCodes> {
        self.known.read().await
    }

    /// Known codes, naturally sorted.
    pub(super) async fn codes(&self) -> Vec<Code> {
        sorted(&*self.known.read().await)
    }
}

pub(super) fn sorted(known: &KnownCodes) -> Vec<Code> {
    let mut codes: Vec<Code> = known.keys().cloned().collect();
    natural_sort(&mut codes);
    codes
}

#[async_trait]
impl StreamObserver for TrackedSubscriptions {
    async fn opened(&self, kind: FeedKind, code: &str, generation: u64) {
        if kind == self.lead {
            self.known.write().await.insert(code.to_string(), generation);
        }
    }

    async fn finished(&self, kind: FeedKind, code: &str, generation: u64) {
        StreamObserver::finished(&self.table, kind, code, generation).await;
        if kind == self.lead {
            let mut known = self.known.write().await;
            if known.get(code) == Some(&generation) {
                known.remove(code);
            }
        }
    }
}
