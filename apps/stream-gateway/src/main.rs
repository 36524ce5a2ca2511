//! Stream Gateway Binary
//!
//! Starts the futures market, stock quote and trade fan-out gateway.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin stream-gateway
//! ```
//!
//! # Environment Variables
//!
//! - `UPSTREAM_GRPC_HOST` / `UPSTREAM_GRPC_PORT`: Upstream service (default: 127.0.0.1:56666)
//! - `GATEWAY_HTTP_PORT`: HTTP / WebSocket port (default: 23456)
//! - `GATEWAY_CODES`: Comma separated futures codes streamed from startup
//! - `GATEWAY_STOCK_CODES`: Comma separated stock codes streamed from startup
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: capitan-stream-gateway)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use stream_gateway::application::ports::{MarketDataSource, TradeRepository};
use stream_gateway::infrastructure::bus::{
    SharedTopicBus, TOPIC_REFERENCE_DATA_READY, subscribe_topic,
};
use stream_gateway::infrastructure::telemetry;
use stream_gateway::{
    AppState, ControlEvent, FeedKind, GatewayConfig, GatewayServer, GrpcMarketDataSource,
    InMemoryTradeRepository, MarketStream, MarketStreamConfig, StockStream, TickLatencyMonitor,
    TopicBus, TradeStream, TradeStreamConfig, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Stream Gateway");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let bus = Arc::new(TopicBus::new(config.fan_out.bus_capacity));

    let source: Arc<dyn MarketDataSource> = Arc::new(
        GrpcMarketDataSource::connect_lazy(&config.upstream.uri(), config.upstream.connect_timeout)
            .context("invalid upstream endpoint")?,
    );
    let trades: Arc<dyn TradeRepository> = Arc::new(InMemoryTradeRepository::new());

    let market = MarketStream::start(
        Arc::clone(&source),
        Arc::clone(&bus),
        MarketStreamConfig::from_config(&config),
        &shutdown_token,
    );
    let stock = StockStream::start(
        Arc::clone(&source),
        Arc::clone(&bus),
        MarketStreamConfig::from_config(&config),
        &shutdown_token,
    );
    let trade = TradeStream::start(
        Arc::clone(&source),
        Arc::clone(&bus),
        Arc::clone(&trades),
        TradeStreamConfig::from_config(&config),
        &shutdown_token,
    );
    let _latency = TickLatencyMonitor::start(Arc::clone(&bus), &shutdown_token);

    // Announce startup codes, then unblock the trade stream.
    announce(&bus, &config.streams.codes, &[FeedKind::Tick, FeedKind::BidAsk]);
    announce(&bus, &config.streams.stock_codes, &[FeedKind::Quote]);
    bus.publish(TOPIC_REFERENCE_DATA_READY, ControlEvent::ReferenceDataReady);

    let state = Arc::new(AppState::new(
        market,
        stock,
        trade,
        trades,
        config.server.ws_write_buffer,
        shutdown_token.child_token(),
    ));
    let server = GatewayServer::new(config.server.http_port, state, shutdown_token.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "Gateway server error");
        }
    });

    tracing::info!("Stream gateway ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, server_handle)
        .await
        .is_err()
    {
        tracing::warn!("Gateway server did not stop in time");
    }

    tracing::info!("Stream gateway stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        upstream = %config.upstream.uri(),
        http_port = config.server.http_port,
        codes = config.streams.codes.len(),
        stock_codes = config.streams.stock_codes.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        ingest_capacity = config.fan_out.ingest_capacity,
        client_capacity = config.fan_out.client_capacity,
        bus_capacity = config.fan_out.bus_capacity,
        "Fan-out capacities"
    );
}

/// Publish a subscribe request for every `(kind, code)` pair.
fn announce(bus: &SharedTopicBus, codes: &[String], kinds: &[FeedKind]) {
    for code in codes {
        for &kind in kinds {
            if let Some(topic) = subscribe_topic(kind) {
                bus.publish(
                    topic,
                    ControlEvent::Subscribe {
                        kind,
                        code: code.clone(),
                    },
                );
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
