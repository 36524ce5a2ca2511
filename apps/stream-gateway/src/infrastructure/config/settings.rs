//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.
//! Every value has a default; malformed numbers fall back to the default and
//! [`GatewayConfig::validate`] rejects values the gateway cannot run with.

use std::time::Duration;

use crate::domain::feed::Code;

/// Upstream service connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSettings {
    /// Upstream gRPC host.
    pub host: String,
    /// Upstream gRPC port.
    pub port: u16,
    /// Timeout for establishing the channel.
    pub connect_timeout: Duration,
    /// Initial resubscription delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum resubscription delay.
    pub reconnect_delay_max: Duration,
    /// Resubscription delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum resubscription attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 56666,
            connect_timeout: Duration::from_secs(5),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

impl UpstreamSettings {
    /// Endpoint URI for the gRPC channel.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// HTTP / WebSocket server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// HTTP listen port (REST, WebSocket, health, metrics).
    pub http_port: u16,
    /// Outbound frame buffer per WebSocket session.
    pub ws_write_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 23456,
            ws_write_buffer: 64,
        }
    }
}

/// Fan-out channel capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutSettings {
    /// Shared ingestion channel per feed kind.
    pub ingest_capacity: usize,
    /// Per-client market data channel (drop-newest beyond this).
    pub client_capacity: usize,
    /// Per-topic bus buffer.
    pub bus_capacity: usize,
}

impl Default for FanOutSettings {
    fn default() -> Self {
        Self {
            ingest_capacity: 1024,
            client_capacity: 256,
            bus_capacity: 1024,
        }
    }
}

/// Streamed instrument settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSettings {
    /// Futures codes whose tick and bid/ask streams open at startup.
    pub codes: Vec<Code>,
    /// Stock codes whose quote streams open at startup.
    pub stock_codes: Vec<Code>,
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfig {
    /// Upstream connection settings.
    pub upstream: UpstreamSettings,
    /// Server settings.
    pub server: ServerSettings,
    /// Fan-out capacities.
    pub fan_out: FanOutSettings,
    /// Streamed instruments.
    pub streams: StreamSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is empty or out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is empty or out of range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let upstream_defaults = UpstreamSettings::default();
        let server_defaults = ServerSettings::default();
        let fan_out_defaults = FanOutSettings::default();

        let host = match env.get("UPSTREAM_GRPC_HOST") {
            Some(host) if host.trim().is_empty() => {
                return Err(ConfigError::EmptyValue("UPSTREAM_GRPC_HOST".to_string()));
            }
            Some(host) => host.trim().to_string(),
            None => upstream_defaults.host.clone(),
        };

        let upstream = UpstreamSettings {
            host,
            port: env.parse("UPSTREAM_GRPC_PORT", upstream_defaults.port),
            connect_timeout: env.duration_secs(
                "UPSTREAM_CONNECT_TIMEOUT_SECS",
                upstream_defaults.connect_timeout,
            ),
            reconnect_delay_initial: env.duration_millis(
                "UPSTREAM_RECONNECT_DELAY_INITIAL_MS",
                upstream_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.duration_secs(
                "UPSTREAM_RECONNECT_DELAY_MAX_SECS",
                upstream_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "UPSTREAM_RECONNECT_DELAY_MULTIPLIER",
                upstream_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.parse(
                "UPSTREAM_MAX_RECONNECT_ATTEMPTS",
                upstream_defaults.max_reconnect_attempts,
            ),
        };

        let server = ServerSettings {
            http_port: env.parse("GATEWAY_HTTP_PORT", server_defaults.http_port),
            ws_write_buffer: env.parse("GATEWAY_WS_BUFFER", server_defaults.ws_write_buffer),
        };

        let fan_out = FanOutSettings {
            ingest_capacity: env.parse("GATEWAY_INGEST_CAPACITY", fan_out_defaults.ingest_capacity),
            client_capacity: env.parse("GATEWAY_CLIENT_CAPACITY", fan_out_defaults.client_capacity),
            bus_capacity: env.parse("GATEWAY_BUS_CAPACITY", fan_out_defaults.bus_capacity),
        };

        let streams = StreamSettings {
            codes: env.get("GATEWAY_CODES").map(|v| parse_codes(&v)).unwrap_or_default(),
            stock_codes: env
                .get("GATEWAY_STOCK_CODES")
                .map(|v| parse_codes(&v))
                .unwrap_or_default(),
        };

        let config = Self {
            upstream,
            server,
            fan_out,
            streams,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values the gateway cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an empty host, a zero capacity or a
    /// non-positive backoff multiplier.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.host.is_empty() {
            return Err(ConfigError::EmptyValue("UPSTREAM_GRPC_HOST".to_string()));
        }
        let capacities = [
            ("GATEWAY_INGEST_CAPACITY", self.fan_out.ingest_capacity),
            ("GATEWAY_CLIENT_CAPACITY", self.fan_out.client_capacity),
            ("GATEWAY_BUS_CAPACITY", self.fan_out.bus_capacity),
            ("GATEWAY_WS_BUFFER", self.server.ws_write_buffer),
        ];
        if let Some((key, _)) = capacities.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::ZeroCapacity((*key).to_string()));
        }
        if !(self.upstream.reconnect_delay_multiplier.is_finite()
            && self.upstream.reconnect_delay_multiplier >= 1.0)
        {
            return Err(ConfigError::InvalidValue {
                key: "UPSTREAM_RECONNECT_DELAY_MULTIPLIER".to_string(),
                value: self.upstream.reconnect_delay_multiplier.to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// A channel capacity is zero.
    #[error("{0} must be greater than zero")]
    ZeroCapacity(String),
    /// Value is out of range.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// Split a comma separated code list, dropping blanks and duplicates.
fn parse_codes(raw: &str) -> Vec<Code> {
    let mut codes: Vec<Code> = Vec::new();
    for code in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        if !codes.iter().any(|c| c == code) {
            codes.push(code.to_string());
        }
    }
    codes
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
