//! Configuration Module
//!
//! Configuration loading for the gateway service.

mod settings;

pub use settings::{
    ConfigError, FanOutSettings, GatewayConfig, ServerSettings, StreamSettings, UpstreamSettings,
};
