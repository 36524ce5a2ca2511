//! Domain Layer
//!
//! Core fan-out types with no I/O: feed events, client channels and
//! registries, and upstream subscription bookkeeping.

pub mod feed;
pub mod registry;
pub mod subscription;
