//! Snapshot Seeding
//!
//! Delivers a synthetic event built from the last-known snapshot of each
//! code straight to a client's channel, before the client joins a registry.
//! Ticks are seeded from the futures universe, stock quotes from the stock
//! universe.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::application::ports::MarketDataSource;
use crate::domain::feed::{Code, Seeded};
use crate::domain::registry::{Deliver, Delivery};
use crate::infrastructure::metrics;

/// Seeds newly attached clients of one feed from upstream snapshots.
pub struct SnapshotSeeder<E> {
    source: Arc<dyn MarketDataSource>,
    _feed: PhantomData<fn() -> E>,
}

impl<E: Seeded> SnapshotSeeder<E> {
    /// Create a seeder querying the snapshot universe of `E`.
    #[must_use]
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self {
            source,
            _feed: PhantomData,
        }
    }

    /// Deliver one seeded event per code that has a snapshot, in `codes`
    /// order. Codes without a snapshot are skipped; a failed call seeds
    /// nothing. Returns the number of events delivered.
    pub async fn seed<C: Deliver<E>>(&self, codes: &[Code], client: &C) -> usize {
        if codes.is_empty() {
            return 0;
        }

        let snapshots = match self.source.get_snapshot(E::SNAPSHOT, codes).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::warn!(
                    client_id = %client.id(),
                    feed = %E::KIND,
                    codes = codes.len(),
                    error = %e,
                    "Snapshot fetch failed, attaching without seed"
                );
                return 0;
            }
        };

        let mut seeded = 0;
        for code in codes {
            let Some(snapshot) = snapshots.get(code) else {
                tracing::debug!(code = %code, "No snapshot for code");
                continue;
            };
            match client.deliver(E::from_snapshot(code.clone(), *snapshot)) {
                Delivery::Delivered => seeded += 1,
                Delivery::Dropped => {
                    tracing::debug!(code = %code, client_id = %client.id(), "Seed event dropped");
                }
                Delivery::Closed => break,
            }
        }
        metrics::record_snapshot_events(seeded);
        seeded
    }
}
