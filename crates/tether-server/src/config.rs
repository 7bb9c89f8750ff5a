//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TETHER_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tether_core::{GatewayConfig, HeartbeatConfig};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatSection,

    /// Gateway configuration.
    #[serde(default)]
    pub gateway: GatewaySection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Use the in-process store instead of Redis. Single-process only;
    /// meant for local development.
    #[serde(default)]
    pub in_memory: bool,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for verifying connection tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSection {
    /// Probe interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub interval_secs: u64,

    /// How long to wait for a probe acknowledgment, in seconds.
    #[serde(default = "default_ping_timeout")]
    pub timeout_secs: u64,

    /// Consecutive unacknowledged probes that force a disconnect.
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,

    /// Staleness sweep interval in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Inbound-activity gap past which a session counts as stale, in seconds.
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Delay between sends while draining a pending queue, in milliseconds.
    #[serde(default = "default_drain_pacing")]
    pub drain_pacing_ms: u64,

    /// Broadcast channels fanned out to every local session.
    #[serde(default = "default_broadcast_channels")]
    pub broadcast_channels: Vec<String>,
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
    std::env::var("TETHER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TETHER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_redis_url() -> String {
    std::env::var("TETHER_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_jwt_secret() -> String {
    std::env::var("TETHER_JWT_SECRET").unwrap_or_else(|_| "development-secret".to_string())
}

fn default_true() -> bool {
    true
}

fn default_ping_interval() -> u64 {
    30
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_max_missed() -> u32 {
    3
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_idle() -> u64 {
    120
}

fn default_drain_pacing() -> u64 {
    25
}

fn default_broadcast_channels() -> Vec<String> {
    vec!["product_updates".to_string()]
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
            heartbeat: HeartbeatSection::default(),
            gateway: GatewaySection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            in_memory: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
        }
    }
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: default_ping_interval(),
            timeout_secs: default_ping_timeout(),
            max_missed: default_max_missed(),
            sweep_interval_secs: default_sweep_interval(),
            max_idle_secs: default_max_idle(),
        }
    }
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            drain_pacing_ms: default_drain_pacing(),
            broadcast_channels: default_broadcast_channels(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "tether.toml",
            "/etc/tether/tether.toml",
            "~/.config/tether/tether.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
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
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid host:port")
    }

    /// Build the gateway configuration from this file's sections.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(self.heartbeat.interval_secs),
                timeout: Duration::from_secs(self.heartbeat.timeout_secs),
                max_missed: self.heartbeat.max_missed,
                sweep_interval: Duration::from_secs(self.heartbeat.sweep_interval_secs),
                max_idle: Duration::from_secs(self.heartbeat.max_idle_secs),
            },
            drain_pacing: Duration::from_millis(self.gateway.drain_pacing_ms),
            broadcast_channels: self.gateway.broadcast_channels.clone(),
            ..GatewayConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.heartbeat.max_missed, 3);
        assert!(!config.store.in_memory);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [store]
            in_memory = true

            [heartbeat]
            interval_secs = 15
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(config.store.in_memory);
        assert_eq!(config.heartbeat.interval_secs, 15);
        // Untouched sections keep their defaults.
        assert_eq!(config.heartbeat.max_missed, 3);
        assert_eq!(config.gateway.drain_pacing_ms, 25);
    }

    #[test]
    fn test_gateway_config_conversion() {
        let config = Config::default();
        let gateway = config.gateway_config();
        assert_eq!(gateway.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(gateway.heartbeat.max_idle, Duration::from_secs(120));
        assert_eq!(gateway.drain_pacing, Duration::from_millis(25));
        assert_eq!(gateway.broadcast_channels, vec!["product_updates"]);
    }
}
