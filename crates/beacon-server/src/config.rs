//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`beacon.toml`)
//! - Environment variables (`BEACON_*`, nested keys separated by `__`,
//!   e.g. `BEACON_CACHE__URL`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tenvis_beacon_core::RegistryConfig;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Fixed instance identifier. Generated at startup when unset.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Connection registry configuration.
    #[serde(default)]
    pub registry: RegistrySection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Shared cache and relay backend.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Messages buffered per connection before deliveries fail.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections held by this instance.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// `[registry]` section, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,
    #[serde(default = "default_entry_ttl")]
    pub entry_ttl_ms: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_cache_timeout")]
    pub cache_timeout_ms: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_lock_poll_interval")]
    pub lock_poll_interval_ms: u64,
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

/// Which store backs the registry and the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Process-local; a single-instance deployment.
    Memory,
    /// Redis; required for fleets.
    Redis,
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Backend kind.
    #[serde(default = "default_backend")]
    pub backend: CacheBackend,

    /// Backend URL (Redis only).
    #[serde(default = "default_cache_url")]
    pub url: String,

    /// Prefix of relay channels.
    #[serde(default = "default_relay_prefix")]
    pub relay_prefix: String,

    /// Envelopes buffered in this instance's relay inbox.
    #[serde(default = "default_relay_capacity")]
    pub relay_capacity: usize,
}

// Default value functions
fn default_host() -> String {
    std::env::var("BEACON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("BEACON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_outbound_queue() -> usize {
    1024
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_key_prefix() -> String {
    RegistryConfig::default().key_prefix
}

fn default_lock_prefix() -> String {
    RegistryConfig::default().lock_prefix
}

fn default_entry_ttl() -> u64 {
    60_000
}

fn default_reconcile_interval() -> u64 {
    20_000
}

fn default_cache_timeout() -> u64 {
    2_000
}

fn default_lock_timeout() -> u64 {
    1_000
}

fn default_lock_ttl() -> u64 {
    5_000
}

fn default_lock_poll_interval() -> u64 {
    100
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_backend() -> CacheBackend {
    CacheBackend::Memory
}

fn default_cache_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_relay_prefix() -> String {
    "beacon".to_string()
}

fn default_relay_capacity() -> usize {
    4096
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            instance_id: None,
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            registry: RegistrySection::default(),
            metrics: MetricsConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            lock_prefix: default_lock_prefix(),
            entry_ttl_ms: default_entry_ttl(),
            reconcile_interval_ms: default_reconcile_interval(),
            cache_timeout_ms: default_cache_timeout(),
            lock_timeout_ms: default_lock_timeout(),
            lock_ttl_ms: default_lock_ttl(),
            lock_poll_interval_ms: default_lock_poll_interval(),
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

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_cache_url(),
            relay_prefix: default_relay_prefix(),
            relay_capacity: default_relay_capacity(),
        }
    }
}

impl RegistrySection {
    /// Convert to the core registry configuration.
    #[must_use]
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            key_prefix: self.key_prefix.clone(),
            lock_prefix: self.lock_prefix.clone(),
            entry_ttl: Duration::from_millis(self.entry_ttl_ms),
            reconcile_interval: Duration::from_millis(self.reconcile_interval_ms),
            cache_timeout: Duration::from_millis(self.cache_timeout_ms),
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
            lock_poll_interval: Duration::from_millis(self.lock_poll_interval_ms),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// `BEACON_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "beacon.toml",
            "/etc/beacon/beacon.toml",
            "~/.config/beacon/beacon.toml",
        ];

        let mut builder = config::Config::builder();
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                builder = builder.add_source(config::File::with_name(expanded.as_ref()));
                break;
            }
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("BEACON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert!(config.instance_id.is_none());
        assert!(config.registry.to_registry_config().validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Default::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            instance_id = "edge-1"

            [limits]
            max_connections = 50000

            [registry]
            entry_ttl_ms = 1000
            reconcile_interval_ms = 250

            [cache]
            backend = "redis"
            url = "redis://cache:6379/"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.instance_id.as_deref(), Some("edge-1"));
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.cache.backend, CacheBackend::Redis);
        assert_eq!(config.cache.url, "redis://cache:6379/");

        let registry = config.registry.to_registry_config();
        assert_eq!(registry.entry_ttl, Duration::from_millis(1000));
        assert_eq!(registry.reconcile_interval, Duration::from_millis(250));
        assert_eq!(registry.key_prefix, "beacon:session");
    }
}
