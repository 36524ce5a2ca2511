//! Client Registry
//!
//! Holds the downstream consumers of one fan-out: a firehose map keyed by
//! client id (receives every code) and a single-code map keyed by code
//! (value: the clients subscribed to that code). Both maps sit behind
//! read-write locks; broadcasts take read locks, attach/detach take write
//! locks.
//!
//! # Ownership
//!
//! A client value owns its channel senders. The registry entry is the sole
//! owner of that value, so removing the entry drops the senders and closes
//! the client's channels exactly once. Sending happens under the read lock,
//! which means a detach cannot interleave with an in-flight send to the same
//! client.

mod channel;
mod client;

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::domain::feed::{ClientId, Code};

pub use channel::{ClientReceiver, ClientSender, Delivery, DeliveryPolicy, client_channel};
pub use client::{Deliver, MarketClient, MarketReceivers, QuoteClient, Subscriber, TradeClient};

// =============================================================================
// Broadcast Outcome
// =============================================================================

/// Per-event delivery tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Events queued on client channels.
    pub delivered: usize,
    /// Events discarded by a full channel.
    pub dropped: usize,
    /// Clients whose receiver was already gone.
    pub closed: usize,
}

impl BroadcastOutcome {
    const fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Dropped => self.dropped += 1,
            Delivery::Closed => self.closed += 1,
        }
    }
}

/// Registry size snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Firehose clients.
    pub firehose_clients: usize,
    /// Single-code registrations across all codes.
    pub single_code_clients: usize,
    /// Codes with at least one single-code client.
    pub codes: usize,
}

// =============================================================================
// Client Registry
// =============================================================================

/// Firehose and single-code client maps for one fan-out.
pub struct ClientRegistry<C> {
    firehose: RwLock<HashMap<ClientId, C>>,
    single_code: RwLock<HashMap<Code, Vec<C>>>,
}

impl<C> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self {
            firehose: RwLock::new(HashMap::new()),
            single_code: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: Subscriber> ClientRegistry<C> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a firehose client.
    ///
    /// Returns `true` if a client with the same id was replaced; the
    /// replaced client's channels are closed.
    pub fn attach_firehose(&self, client: C) -> bool {
        self.firehose.write().insert(client.id(), client).is_some()
    }

    /// Remove a firehose client and close its channels.
    ///
    /// Returns `false` (and does nothing) if the id is not registered.
    pub fn detach_firehose(&self, id: ClientId) -> bool {
        let removed = self.firehose.write().remove(&id);
        removed.is_some()
    }

    /// Register a client for one code.
    ///
    /// An existing entry for the same `(code, id)` pair is replaced; returns
    /// `true` in that case.
    pub fn attach_single_code(&self, code: &str, client: C) -> bool {
        let mut map = self.single_code.write();
        let list = map.entry(code.to_string()).or_default();
        if let Some(slot) = list.iter_mut().find(|c| c.id() == client.id()) {
            *slot = client;
            return true;
        }
        list.push(client);
        false
    }

    /// Remove a client from one code's list and close its channels.
    ///
    /// The code's list is deleted once empty. Returns `false` (and does
    /// nothing) if the pair is not registered.
    pub fn detach_single_code(&self, code: &str, id: ClientId) -> bool {
        let removed = {
            let mut map = self.single_code.write();
            let Some(list) = map.get_mut(code) else {
                return false;
            };
            let Some(pos) = list.iter().position(|c| c.id() == id) else {
                return false;
            };
            let removed = list.swap_remove(pos);
            if list.is_empty() {
                map.remove(code);
            }
            removed
        };
        drop(removed);
        true
    }

    /// Deliver one event: single-code clients of `code` first, then every
    /// firehose client.
    pub fn broadcast<E>(&self, code: &str, event: &E) -> BroadcastOutcome
    where
        C: Deliver<E>,
        E: Clone,
    {
        let mut outcome = BroadcastOutcome::default();

        if let Some(list) = self.single_code.read().get(code) {
            for client in list {
                outcome.record(client.deliver(event.clone()));
            }
        }

        for client in self.firehose.read().values() {
            outcome.record(client.deliver(event.clone()));
        }

        outcome
    }

    /// Whether a firehose client is registered.
    #[must_use]
    pub fn has_firehose(&self, id: ClientId) -> bool {
        self.firehose.read().contains_key(&id)
    }

    /// Whether `(code, id)` is registered.
    #[must_use]
    pub fn has_single_code(&self, code: &str, id: ClientId) -> bool {
        self.single_code
            .read()
            .get(code)
            .is_some_and(|list| list.iter().any(|c| c.id() == id))
    }

    /// Number of single-code clients for one code.
    #[must_use]
    pub fn single_code_count(&self, code: &str) -> usize {
        self.single_code.read().get(code).map_or(0, Vec::len)
    }

    /// Current sizes.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let firehose_clients = self.firehose.read().len();
        let single_code = self.single_code.read();
        RegistryStats {
            firehose_clients,
            single_code_clients: single_code.values().map(Vec::len).sum(),
            codes: single_code.len(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
