//! Health Check and Metrics Handlers
//!
//! - `GET /health` - JSON status of the upstream feeds and client registries
//! - `GET /healthz` - Liveness check (simple OK)
//! - `GET /readyz` - Readiness check (at least one upstream stream open)
//! - `GET /metrics` - Prometheus metrics in text format

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::AppState;
use crate::application::services::FeedStatus;
use crate::domain::feed::FeedKind;
use crate::domain::registry::RegistryStats;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Gateway version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream feed counters.
    pub feeds: Vec<FeedStatus>,
    /// Market data clients.
    pub market_clients: ClientCounts,
    /// Stock quote clients.
    pub stock_clients: ClientCounts,
    /// Trade clients.
    pub trade_clients: ClientCounts,
    /// Codes with a tick subscription.
    pub subscribed_codes: usize,
    /// Codes with a stock quote subscription.
    pub subscribed_stock_codes: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every feed has an open stream.
    Healthy,
    /// Some feeds have no open stream.
    Degraded,
    /// No upstream stream is open.
    Unhealthy,
}

/// Registered clients of one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientCounts {
    /// Clients receiving every code.
    pub firehose: usize,
    /// Clients registered for one code.
    pub single_code: usize,
}

impl From<RegistryStats> for ClientCounts {
    fn from(stats: RegistryStats) -> Self {
        Self {
            firehose: stats.firehose_clients,
            single_code: stats.single_code_clients,
        }
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

pub(super) async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

pub(super) async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub(super) async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = build_health_response(&state);

    if response.status == HealthStatus::Unhealthy {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}

pub(super) async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let mut feeds = state.market.feed_status();
    feeds.push(state.stock.feed_status());
    feeds.push(state.trade.feed_status());

    HealthResponse {
        status: determine_health_status(&feeds),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        feeds,
        market_clients: state.market.registry_stats().into(),
        stock_clients: state.stock.registry_stats().into(),
        trade_clients: state.trade.registry_stats().into(),
        subscribed_codes: state.market.subscription_stats(FeedKind::Tick).active,
        subscribed_stock_codes: state.stock.subscription_stats().active,
    }
}

fn determine_health_status(feeds: &[FeedStatus]) -> HealthStatus {
    let connected = feeds.iter().filter(|f| f.active_streams > 0).count();

    match connected {
        0 => HealthStatus::Unhealthy,
        n if n == feeds.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(name: &'static str, active_streams: usize) -> FeedStatus {
        FeedStatus {
            feed: name,
            active_streams,
            messages_received: 0,
            reconnect_attempts: 0,
            last_error: None,
            last_connected_at: None,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn determine_status_all_connected() {
        let feeds = [feed("tick", 3), feed("bidask", 3), feed("trade", 1)];
        assert_eq!(determine_health_status(&feeds), HealthStatus::Healthy);
    }

    #[test]
    fn determine_status_partial() {
        let feeds = [feed("tick", 0), feed("bidask", 0), feed("trade", 1)];
        assert_eq!(determine_health_status(&feeds), HealthStatus::Degraded);
    }

    #[test]
    fn determine_status_none_connected() {
        let feeds = [feed("tick", 0), feed("bidask", 0), feed("trade", 0)];
        assert_eq!(determine_health_status(&feeds), HealthStatus::Unhealthy);
    }

    #[test]
    fn client_counts_from_registry_stats() {
        let stats = RegistryStats {
            firehose_clients: 2,
            single_code_clients: 5,
            codes: 3,
        };
        assert_eq!(
            ClientCounts::from(stats),
            ClientCounts {
                firehose: 2,
                single_code: 5
            }
        );
    }
}
