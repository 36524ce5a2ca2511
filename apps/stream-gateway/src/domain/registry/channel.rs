//! Per-client delivery channels.
//!
//! Each client owns one channel per feed kind. The sending half lives in
//! exactly one registry entry and is not `Clone`, so removing the entry is
//! the only way the channel gets closed.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Overflow behavior of a client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Bounded buffer; a full buffer drops the incoming event.
    DropNewest {
        /// Buffered events before drops start.
        capacity: usize,
    },
    /// Unbounded buffer; nothing is dropped while the receiver is alive.
    Lossless,
}

/// Result of handing one event to a client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Event queued for the client.
    Delivered,
    /// Buffer was full and the event was discarded.
    Dropped,
    /// Receiver is gone.
    Closed,
}

#[derive(Debug)]
enum SenderInner<E> {
    Bounded(mpsc::Sender<E>),
    Unbounded(mpsc::UnboundedSender<E>),
}

#[derive(Debug)]
enum ReceiverInner<E> {
    Bounded(mpsc::Receiver<E>),
    Unbounded(mpsc::UnboundedReceiver<E>),
}

/// Sending half held by the registry.
#[derive(Debug)]
pub struct ClientSender<E> {
    inner: SenderInner<E>,
}

/// Receiving half held by the session.
#[derive(Debug)]
pub struct ClientReceiver<E> {
    inner: ReceiverInner<E>,
}

/// Create a client channel with the given overflow policy.
///
/// A zero `DropNewest` capacity is raised to one.
#[must_use]
pub fn client_channel<E>(policy: DeliveryPolicy) -> (ClientSender<E>, ClientReceiver<E>) {
    match policy {
        DeliveryPolicy::DropNewest { capacity } => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                ClientSender {
                    inner: SenderInner::Bounded(tx),
                },
                ClientReceiver {
                    inner: ReceiverInner::Bounded(rx),
                },
            )
        }
        DeliveryPolicy::Lossless => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                ClientSender {
                    inner: SenderInner::Unbounded(tx),
                },
                ClientReceiver {
                    inner: ReceiverInner::Unbounded(rx),
                },
            )
        }
    }
}

impl<E> ClientSender<E> {
    /// Hand an event to the client without waiting.
    pub fn deliver(&self, event: E) -> Delivery {
        match &self.inner {
            SenderInner::Bounded(tx) => match tx.try_send(event) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => Delivery::Dropped,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
            SenderInner::Unbounded(tx) => match tx.send(event) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Closed,
            },
        }
    }

    /// Whether the receiving half has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.is_closed(),
            SenderInner::Unbounded(tx) => tx.is_closed(),
        }
    }
}

impl<E> ClientReceiver<E> {
    /// Wait for the next event. `None` once the sender is gone and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<E> {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.recv().await,
            ReceiverInner::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Take a buffered event, if any.
    pub fn try_recv(&mut self) -> Option<E> {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.try_recv().ok(),
            ReceiverInner::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    /// Whether the sending half is gone. Buffered events may remain.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match &self.inner {
            ReceiverInner::Bounded(rx) => rx.is_closed(),
            ReceiverInner::Unbounded(rx) => rx.is_closed(),
        }
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.inner {
            ReceiverInner::Bounded(rx) => rx.len(),
            ReceiverInner::Unbounded(rx) => rx.len(),
        }
    }

    /// Whether no events are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
