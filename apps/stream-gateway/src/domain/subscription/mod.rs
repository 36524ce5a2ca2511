//! Upstream Subscription Table
//!
//! Reference counting for upstream `(feed kind, code)` subscriptions.
//!
//! # Design
//!
//! Each entry tracks:
//! - A reference count of single-code clients that need the code
//! - A `pinned` flag for codes the gateway streams regardless of demand
//! - A cancellation token owned by the ingestor feeding the entry
//!
//! The first reference (or pin) starts an ingestor; the last release of
//! an unpinned entry cancels it. A later acquire starts a fresh one.
//!
//! An ingestor that gives up leaves its entry in place while clients still
//! hold references or the code is pinned. The entry is then stopped, and the
//! next acquire or pin starts a new generation without touching the count.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::domain::feed::{Code, FeedKind};

// =============================================================================
// Types
// =============================================================================

/// Handle returned when an entry needs a new ingestor.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Cancelled when the entry is torn down.
    pub token: CancellationToken,
    /// Identifies this ingestor incarnation.
    pub generation: u64,
}

#[derive(Debug)]
struct Entry {
    refs: usize,
    pinned: bool,
    running: bool,
    token: CancellationToken,
    generation: u64,
}

/// Subscription counts for one feed kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Entries with a running ingestor.
    pub active: usize,
    /// Pinned entries.
    pub pinned: usize,
    /// Sum of client references.
    pub references: usize,
}

#[derive(Debug, Default)]
struct TableState {
    entries: HashMap<(FeedKind, Code), Entry>,
    next_generation: u64,
}

impl TableState {
    fn lease(&mut self, parent: &CancellationToken) -> Lease {
        self.next_generation += 1;
        Lease {
            token: parent.child_token(),
            generation: self.next_generation,
        }
    }

    fn start(&mut self, key: (FeedKind, Code), parent: &CancellationToken, pinned: bool) -> Lease {
        let lease = self.lease(parent);
        self.entries.insert(
            key,
            Entry {
                refs: usize::from(!pinned),
                pinned,
                running: true,
                token: lease.token.clone(),
                generation: lease.generation,
            },
        );
        lease
    }

    /// New generation for a stopped entry, `None` if it is still running.
    fn restart(&mut self, key: &(FeedKind, Code), parent: &CancellationToken) -> Option<Lease> {
        if self.entries.get(key).is_none_or(|e| e.running) {
            return None;
        }
        let lease = self.lease(parent);
        let entry = self.entries.get_mut(key)?;
        entry.running = true;
        entry.token = lease.token.clone();
        entry.generation = lease.generation;
        Some(lease)
    }
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Reference-counted table of upstream subscriptions.
#[derive(Debug)]
pub struct SubscriptionTable {
    state: RwLock<TableState>,
    parent: CancellationToken,
}

impl SubscriptionTable {
    /// Create a table whose ingestor tokens are children of `parent`.
    #[must_use]
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            parent,
        }
    }

    /// Keep `(kind, code)` subscribed for the life of the process.
    ///
    /// Returns a lease if an ingestor must be started, either for a new
    /// entry or for one whose ingestor gave up. Otherwise idempotent.
    pub fn pin(&self, kind: FeedKind, code: &str) -> Option<Lease> {
        let mut state = self.state.write();
        let key = (kind, code.to_string());
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.pinned = true;
            return state.restart(&key, &self.parent);
        }
        Some(state.start(key, &self.parent, true))
    }

    /// Add one client reference.
    ///
    /// Returns a lease when the count went 0→1, or when the entry's
    /// ingestor gave up, and an ingestor must be started.
    pub fn acquire(&self, kind: FeedKind, code: &str) -> Option<Lease> {
        let mut state = self.state.write();
        let key = (kind, code.to_string());
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.refs += 1;
            return state.restart(&key, &self.parent);
        }
        Some(state.start(key, &self.parent, false))
    }

    /// Drop one client reference.
    ///
    /// Returns `true` when the entry was torn down (its ingestor cancelled).
    /// Releasing an unknown entry is a no-op.
    pub fn release(&self, kind: FeedKind, code: &str) -> bool {
        let mut state = self.state.write();
        let key = (kind, code.to_string());
        let Some(entry) = state.entries.get_mut(&key) else {
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 || entry.pinned {
            return false;
        }
        if let Some(entry) = state.entries.remove(&key) {
            entry.token.cancel();
        }
        true
    }

    /// Record that the ingestor of `generation` stopped.
    ///
    /// An entry still referenced or pinned is kept and marked stopped;
    /// otherwise it is removed. Returns `true` if it was removed. A stale
    /// generation leaves its replacement alone.
    pub fn finished(&self, kind: FeedKind, code: &str, generation: u64) -> bool {
        let mut state = self.state.write();
        let key = (kind, code.to_string());
        let Some(entry) = state.entries.get_mut(&key) else {
            return false;
        };
        if entry.generation != generation {
            return false;
        }
        if entry.refs > 0 || entry.pinned {
            entry.running = false;
            return false;
        }
        state.entries.remove(&key);
        true
    }

    /// Whether an ingestor is running for `(kind, code)`.
    #[must_use]
    pub fn is_active(&self, kind: FeedKind, code: &str) -> bool {
        self.state
            .read()
            .entries
            .get(&(kind, code.to_string()))
            .is_some_and(|e| e.running)
    }

    /// Client references for `(kind, code)`.
    #[must_use]
    pub fn references(&self, kind: FeedKind, code: &str) -> usize {
        self.state
            .read()
            .entries
            .get(&(kind, code.to_string()))
            .map_or(0, |e| e.refs)
    }

    /// Counts for one feed kind.
    #[must_use]
    pub fn stats(&self, kind: FeedKind) -> SubscriptionStats {
        let state = self.state.read();
        state
            .entries
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .fold(SubscriptionStats::default(), |mut acc, (_, entry)| {
                acc.active += usize::from(entry.running);
                acc.pinned += usize::from(entry.pinned);
                acc.references += entry.refs;
                acc
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
