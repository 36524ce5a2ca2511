//! Tick Latency Monitor
//!
//! Listens on `tick/<code>` bus topics for every pinned code and records
//! exchange-to-gateway latency, without going through the broadcaster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::feed::{Code, FeedEvent, FeedKind};
use crate::infrastructure::bus::{
    BusEvent, ControlEvent, SharedTopicBus, TOPIC_SUBSCRIBE_TICK, feed_topic,
};
use crate::infrastructure::metrics;

/// Per-code tick latency tracking.
pub struct TickLatencyMonitor {
    bus: SharedTopicBus,
    cancel: CancellationToken,
    /// Watched codes and their most recent latency.
    latest: Arc<Mutex<HashMap<Code, Option<Duration>>>>,
}

impl TickLatencyMonitor {
    /// Create a monitor that watches codes announced on
    /// `stream/subscribe/tick`.
    pub fn start(bus: SharedTopicBus, cancel: &CancellationToken) -> Arc<Self> {
        let monitor = Arc::new(Self {
            bus: Arc::clone(&bus),
            cancel: cancel.child_token(),
            latest: Arc::new(Mutex::new(HashMap::new())),
        });

        let this = Arc::clone(&monitor);
        bus.subscribe_with(TOPIC_SUBSCRIBE_TICK, cancel.child_token(), move |event| {
            if let BusEvent::Control(ControlEvent::Subscribe {
                kind: FeedKind::Tick,
                code,
            }) = event
            {
                this.watch(&code);
            }
        });

        monitor
    }

    /// Start watching `code`. Returns `false` if already watched.
    pub fn watch(&self, code: &str) -> bool {
        let mut watched = self.latest.lock();
        if watched.contains_key(code) {
            return false;
        }

        let latest = Arc::clone(&self.latest);
        self.bus.subscribe_with(
            &feed_topic(FeedKind::Tick, code),
            self.cancel.clone(),
            move |event| {
                let BusEvent::Feed(FeedEvent::Tick(tick)) = event else {
                    return;
                };
                let Ok(latency) = (Utc::now() - tick.timestamp).to_std() else {
                    return;
                };
                metrics::record_tick_latency(latency);
                latest.lock().insert(tick.code, Some(latency));
            },
        );
        watched.insert(code.to_string(), None);
        drop(watched);

        tracing::debug!(code = %code, "Watching tick latency");
        true
    }

    /// Most recent latency seen for `code`.
    #[must_use]
    pub fn latest(&self, code: &str) -> Option<Duration> {
        self.latest.lock().get(code).copied().flatten()
    }

    /// Codes being watched.
    #[must_use]
    pub fn watched(&self) -> usize {
        self.latest.lock().len()
    }
}
