//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - Built-in defaults
//! - TOML configuration file (`ROOMCAST_CONFIG`, or the first default path found)
//! - Environment variables (`ROOMCAST__PORT`, `ROOMCAST__PRESENCE__TTL_SECS`, ...)

use anyhow::{Context, Result};
use roomcast_core::{OverflowPolicy, PresenceConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "ROOMCAST_CONFIG";

/// Prefix for per-key environment overrides.
const ENV_PREFIX: &str = "ROOMCAST";

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "roomcast.toml",
    "/etc/roomcast/roomcast.toml",
    "~/.config/roomcast/roomcast.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Presence configuration.
    #[serde(default)]
    pub presence: PresenceSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// How long a closed socket's writer may keep flushing, in milliseconds.
    #[serde(default = "default_writer_drain")]
    pub writer_drain_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound frames queued per connection before overflow.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// What to do when a connection's outbound queue is full.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Read-inactivity timeout in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSettings {
    /// Seconds without a heartbeat before a user counts as gone.
    #[serde(default = "default_presence_ttl")]
    pub ttl_secs: u64,

    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Publish `offline` for users the sweep expires.
    #[serde(default = "default_true")]
    pub announce_expired: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_writer_drain() -> u64 {
    5_000
}

fn default_max_message_size() -> usize {
    1 << 20 // 1 MiB
}

fn default_outbound_buffer() -> usize {
    roomcast_core::connection::DEFAULT_OUTBOUND_BUFFER
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_read_timeout() -> u64 {
    60_000
}

fn default_presence_ttl() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    20
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            writer_drain_timeout_ms: default_writer_drain(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            outbound_buffer: default_outbound_buffer(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            announce_expired: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the environment and the first config file found.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::load_from(Some(Path::new(&path)));
        }

        let found = DEFAULT_CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        Self::load_from(found.as_deref().map(Path::new))
    }

    /// Load configuration from an optional file plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or any value is invalid.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let layered = builder
            .build()
            .with_context(|| match path {
                Some(p) => format!("Failed to read config file: {}", p.display()),
                None => "Failed to read configuration".to_string(),
            })?;

        layered
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Parse configuration from a TOML string, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid configuration.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse config")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Session timing for the core.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::from_millis(self.heartbeat.ping_interval_ms.max(1)),
            read_timeout: Duration::from_millis(self.heartbeat.read_timeout_ms.max(1)),
        }
    }

    /// Grace period for a closed socket's writer before it is aborted.
    #[must_use]
    pub fn writer_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.writer_drain_timeout_ms)
    }

    /// Presence tracking for the core.
    #[must_use]
    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            ttl: Duration::from_secs(self.presence.ttl_secs),
            sweep_interval: Duration::from_secs(self.presence.sweep_interval_secs.max(1)),
            announce_expired: self.presence.announce_expired,
        }
    }
}
