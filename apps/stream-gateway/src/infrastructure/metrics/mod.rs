//! Prometheus Metrics Module
//!
//! Exposes gateway metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Events**: Counts received from upstream, delivered and dropped per feed
//! - **Upstream**: Resubscription attempts, stream errors, active streams
//! - **Clients**: Registered clients per stream and mode, WebSocket sessions
//! - **Latency**: Exchange-to-gateway tick latency
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::feed::FeedKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the same handle.
///
/// # Errors
///
/// Returns `BuildError` if a different global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "gateway_events_received_total",
        "Events received from upstream streams"
    );
    describe_counter!(
        "gateway_events_delivered_total",
        "Events queued on client channels"
    );
    describe_counter!(
        "gateway_events_dropped_total",
        "Events dropped because a client channel was full"
    );
    describe_counter!(
        "gateway_snapshot_events_total",
        "Synthetic events seeded from snapshots"
    );

    describe_counter!(
        "gateway_upstream_reconnects_total",
        "Upstream resubscription attempts"
    );
    describe_counter!(
        "gateway_upstream_errors_total",
        "Upstream stream open failures and terminations"
    );
    describe_gauge!(
        "gateway_upstream_streams",
        "Active upstream streams per feed"
    );

    describe_gauge!(
        "gateway_clients",
        "Registered clients per stream and mode"
    );
    describe_gauge!(
        "gateway_websocket_sessions",
        "Open WebSocket sessions"
    );

    describe_counter!(
        "gateway_persistence_failures_total",
        "Trade executions that failed to persist"
    );

    describe_histogram!(
        "gateway_tick_latency_seconds",
        "Delay between exchange time and gateway receipt for ticks"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Registry membership mode label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    /// Receives every code.
    Firehose,
    /// Receives one code.
    SingleCode,
}

impl ClientMode {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Firehose => "firehose",
            Self::SingleCode => "single_code",
        }
    }
}

/// Record an event received from upstream.
pub fn record_event_received(feed: FeedKind) {
    counter!("gateway_events_received_total", "feed" => feed.as_str()).increment(1);
}

/// Record fan-out results for one event.
pub fn record_fan_out(feed: FeedKind, delivered: usize, dropped: usize) {
    if delivered > 0 {
        counter!("gateway_events_delivered_total", "feed" => feed.as_str())
            .increment(delivered as u64);
    }
    if dropped > 0 {
        counter!("gateway_events_dropped_total", "feed" => feed.as_str())
            .increment(dropped as u64);
    }
}

/// Record snapshot events seeded into a client.
pub fn record_snapshot_events(count: usize) {
    counter!("gateway_snapshot_events_total").increment(count as u64);
}

/// Record an upstream resubscription attempt.
pub fn record_reconnect(feed: FeedKind) {
    counter!("gateway_upstream_reconnects_total", "feed" => feed.as_str()).increment(1);
}

/// Record an upstream failure.
pub fn record_upstream_error(feed: FeedKind, stage: &'static str) {
    counter!(
        "gateway_upstream_errors_total",
        "feed" => feed.as_str(),
        "stage" => stage
    )
    .increment(1);
}

/// Update the active upstream stream count for a feed.
#[allow(clippy::cast_precision_loss)]
pub fn set_upstream_streams(feed: FeedKind, count: usize) {
    gauge!("gateway_upstream_streams", "feed" => feed.as_str()).set(count as f64);
}

/// Update the registered client count for a stream.
#[allow(clippy::cast_precision_loss)]
pub fn set_clients(stream: &'static str, mode: ClientMode, count: usize) {
    gauge!(
        "gateway_clients",
        "stream" => stream,
        "mode" => mode.as_str()
    )
    .set(count as f64);
}

/// A WebSocket session opened.
pub fn websocket_session_opened() {
    gauge!("gateway_websocket_sessions").increment(1.0);
}

/// A WebSocket session closed.
pub fn websocket_session_closed() {
    gauge!("gateway_websocket_sessions").decrement(1.0);
}

/// Record a trade that failed to persist.
pub fn record_persistence_failure() {
    counter!("gateway_persistence_failures_total").increment(1);
}

/// Record exchange-to-gateway latency for a tick.
pub fn record_tick_latency(latency: Duration) {
    histogram!("gateway_tick_latency_seconds").record(latency.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
