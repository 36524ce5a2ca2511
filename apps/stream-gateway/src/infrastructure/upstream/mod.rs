//! Upstream Service Adapters
//!
//! - `grpc`: tonic client for the upstream market data / execution service
//! - `memory`: scriptable in-process source for tests and local runs
//! - `proto`: wire messages shared with outbound WebSocket frames
//! - `reconnect`: backoff used by ingestors between subscription attempts

pub mod grpc;
pub mod memory;
#[allow(missing_docs, clippy::derive_partial_eq_without_eq)]
pub mod proto;
pub mod reconnect;

pub use grpc::GrpcMarketDataSource;
pub use memory::InMemorySource;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
