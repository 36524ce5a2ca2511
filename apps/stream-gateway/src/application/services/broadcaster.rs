//! Fan-Out Broadcaster
//!
//! One task per feed kind drains the shared ingestion channel and hands
//! each event to the registry: single-code clients of the event's code
//! first, then every firehose client. Client sends never block, so a slow
//! consumer only affects its own channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::feed::FeedPayload;
use crate::domain::registry::{ClientRegistry, Deliver};
use crate::infrastructure::metrics;

/// Spawn the broadcaster for one feed kind.
///
/// Runs until `cancel` fires or every ingestion sender is gone. Events are
/// delivered in the order they are received.
pub fn spawn_broadcaster<C, E>(
    registry: Arc<ClientRegistry<C>>,
    rx: mpsc::Receiver<E>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    C: Deliver<E>,
    E: FeedPayload,
{
    spawn_broadcaster_with(registry, rx, cancel, |_| {})
}

/// Like [`spawn_broadcaster`], calling `before` on each event ahead of its
/// fan-out.
pub fn spawn_broadcaster_with<C, E, F>(
    registry: Arc<ClientRegistry<C>>,
    mut rx: mpsc::Receiver<E>,
    cancel: CancellationToken,
    mut before: F,
) -> JoinHandle<()>
where
    C: Deliver<E>,
    E: FeedPayload,
    F: FnMut(&E) + Send + 'static,
{
    tokio::spawn(async move {
        tracing::debug!(feed = %E::KIND, "Broadcaster started");
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            before(&event);
            let outcome = registry.broadcast(event.code(), &event);
            metrics::record_fan_out(E::KIND, outcome.delivered, outcome.dropped);
            if outcome.dropped > 0 {
                tracing::trace!(
                    feed = %E::KIND,
                    code = %event.code(),
                    dropped = outcome.dropped,
                    "Slow clients skipped an event"
                );
            }
        }
        tracing::debug!(feed = %E::KIND, "Broadcaster stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::feed::Tick;
    use crate::domain::registry::{DeliveryPolicy, MarketClient, Subscriber};

    fn tick(code: &str, price: i64) -> Tick {
        Tick {
            code: code.to_string(),
            price: Decimal::new(price, 0),
            price_change: Decimal::ZERO,
            volume: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn slow_client_does_not_stall_others() {
        let registry = Arc::new(ClientRegistry::new());
        let (slow, mut slow_rx) = MarketClient::new(DeliveryPolicy::DropNewest { capacity: 1 });
        let (fast, mut fast_rx) = MarketClient::new(DeliveryPolicy::DropNewest { capacity: 16 });
        registry.attach_firehose(slow);
        registry.attach_firehose(fast);

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = spawn_broadcaster(Arc::clone(&registry), rx, cancel.clone());

        for price in 0..5 {
            tx.send(tick("X", price)).await.unwrap();
        }
        for price in 0..5 {
            let tick = tokio::time::timeout(Duration::from_secs(1), fast_rx.ticks.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(tick.price, Decimal::new(price, 0));
        }

        assert_eq!(slow_rx.ticks.try_recv().unwrap().price, Decimal::ZERO);
        assert!(slow_rx.ticks.try_recv().is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_senders_are_gone() {
        let registry: Arc<ClientRegistry<MarketClient>> = Arc::new(ClientRegistry::new());
        let (tx, rx) = mpsc::channel::<Tick>(1);
        let handle = spawn_broadcaster(registry, rx, CancellationToken::new());
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn delivery_after_detach_is_harmless() {
        let registry = Arc::new(ClientRegistry::new());
        let (client, mut client_rx) = MarketClient::new(DeliveryPolicy::Lossless);
        let id = client.id();
        registry.attach_firehose(client);

        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_broadcaster(Arc::clone(&registry), rx, CancellationToken::new());
        assert!(registry.detach_firehose(id));
        tx.send(tick("X", 1)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(client_rx.ticks.recv().await.is_none());
    }
}
