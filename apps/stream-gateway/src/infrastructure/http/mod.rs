//! HTTP Server
//!
//! One axum listener serves the REST endpoints, the WebSocket streams and
//! the health and metrics endpoints.
//!
//! # Endpoints
//!
//! - `GET /api/v1/stream/codes` - Codes with a live tick stream
//! - `GET /api/v1/stream/stock/codes` - Codes with a live stock quote stream
//! - `GET /api/v1/trade/records` - Persisted trade executions
//! - `POST /api/v1/trade/records` - Trades by order id or time range
//! - `PUT /api/v1/trade/records` - Ask upstream to republish trade updates
//! - `GET /api/v1/trade/records/undone/{code}` - Open orders of a code
//! - `GET /ws/v1/stream/market[/{code}]` - Futures tick and bid/ask stream
//! - `GET /ws/v1/stream/stock[/{code}]` - Stock quote stream
//! - `GET /ws/v1/trade/stream[/{code}]` - Trade execution stream
//! - `GET /ws/v1/health` - Keep-alive only session
//! - `GET /health`, `/healthz`, `/readyz`, `/metrics` - Health and metrics

mod health;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::TradeRepository;
use crate::application::services::{MarketStream, StockStream, TradeStream};

pub use health::{ClientCounts, HealthResponse, HealthStatus};
pub use routes::{CodesResponse, TradeQuery};

// =============================================================================
// Server State
// =============================================================================

/// Shared state for every handler.
pub struct AppState {
    market: Arc<MarketStream>,
    stock: Arc<StockStream>,
    trade: Arc<TradeStream>,
    trades: Arc<dyn TradeRepository>,
    ws_buffer: usize,
    version: String,
    started_at: Instant,
    shutdown: CancellationToken,
}

impl AppState {
    /// Create handler state. WebSocket sessions stop when `shutdown` fires.
    #[must_use]
    pub fn new(
        market: Arc<MarketStream>,
        stock: Arc<StockStream>,
        trade: Arc<TradeStream>,
        trades: Arc<dyn TradeRepository>,
        ws_buffer: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            market,
            stock,
            trade,
            trades,
            ws_buffer,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
            shutdown,
        }
    }
}

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/stream/codes", get(routes::subscribed_codes))
        .route("/api/v1/stream/stock/codes", get(routes::subscribed_stock_codes))
        .route(
            "/api/v1/trade/records",
            get(routes::trade_records)
                .post(routes::query_trade_records)
                .put(routes::trigger_trade_update),
        )
        .route(
            "/api/v1/trade/records/undone/{code}",
            get(routes::undone_trade_records),
        )
        .route("/ws/v1/stream/market", get(routes::market_firehose))
        .route("/ws/v1/stream/market/{code}", get(routes::market_single_code))
        .route("/ws/v1/stream/stock", get(routes::stock_firehose))
        .route("/ws/v1/stream/stock/{code}", get(routes::stock_single_code))
        .route("/ws/v1/trade/stream", get(routes::trade_firehose))
        .route("/ws/v1/trade/stream/{code}", get(routes::trade_single_code))
        .route("/ws/v1/health", get(routes::keep_alive))
        .route("/health", get(health::health_handler))
        .route("/healthz", get(health::liveness_handler))
        .route("/readyz", get(health::readiness_handler))
        .route("/metrics", get(health::metrics_handler))
        .with_state(state)
}

// =============================================================================
// Gateway Server
// =============================================================================

/// HTTP and WebSocket server.
pub struct GatewayServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl GatewayServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `GatewayServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), GatewayServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Gateway server listening");
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns `GatewayServerError::ServerFailed` on a fatal server error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayServerError> {
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| GatewayServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Gateway server stopped");
        Ok(())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Gateway server errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
