//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the transport and server edges.

/// In-process typed topic bus.
pub mod bus;

/// Configuration loading.
pub mod config;

/// HTTP routes, WebSocket stream handlers and health endpoints.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Trade storage adapters.
pub mod persistence;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Upstream market data service adapters.
pub mod upstream;

/// WebSocket session transport and outbound frames.
pub mod websocket;
