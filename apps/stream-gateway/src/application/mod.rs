//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the fan-out services and the port interfaces that
//! define how they reach the upstream service and trade storage.

/// Port interfaces for external systems (upstream service, persistence).
pub mod ports;

/// Ingestion, broadcast, seeding and trade streaming services.
pub mod services;
