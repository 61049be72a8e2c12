//! Configuration resolution for certquery.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/certquery/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binaries)

use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{MESSAGE_TTL_MS, REQUEST_QUEUE};

/// Complete certquery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub queue: QueueConfig,
    pub reconnect: ReconnectConfig,
    pub database: DatabaseConfig,
    pub client: ClientConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            queue: QueueConfig::default(),
            reconnect: ReconnectConfig::default(),
            database: DatabaseConfig::default(),
            client: ClientConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Message broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "rabbitmq".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Connection URI for this endpoint.
    ///
    /// Credentials and vhost are carried as structured fields, so no
    /// escaping is involved.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString::default(),
        }
    }

    /// Endpoint without credentials, for logging.
    pub fn display_addr(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost)
    }
}

/// Request queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Durable queue the worker consumes.
    pub name: String,
    /// Per-message TTL declared as `x-message-ttl`.
    pub message_ttl_ms: u32,
    /// Unacknowledged deliveries the broker may push at once.
    pub prefetch: u16,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: REQUEST_QUEUE.to_string(),
            message_ttl_ms: MESSAGE_TTL_MS,
            prefetch: 1,
        }
    }
}

/// Broker reconnection settings. Defaults give a fixed 5 second interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Consecutive protocol-level rejections (bad credentials, unknown
    /// vhost) tolerated before giving up.
    pub max_rejected_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 5_000,
            multiplier: 1.0,
            max_rejected_attempts: 3,
        }
    }
}

/// Certificate store settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
    /// Open the store read-only; the schema is then owned by whoever
    /// writes certificates.
    pub read_only: bool,
}

impl DatabaseConfig {
    /// Configured path, falling back to the platform default.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(database_path)
    }
}

/// Requester-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long to wait for a reply; also sent as the message expiration.
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` is a settings file named on the command line; unlike the
/// global file it must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            config = load_config_file(&global_path)?;
        }
    }

    if let Some(path) = explicit {
        config = load_config_file(path)?;
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("certquery").join("settings.json"))
}

/// Get the default certificate database path.
pub fn database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("certquery").join("certificates.db"))
}

/// Parse a settings file. Missing keys keep their defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("CERTQUERY_BROKER_HOST") {
        config.broker.host = val;
    }
    if let Some(n) = var("CERTQUERY_BROKER_PORT").and_then(|v| v.parse().ok()) {
        config.broker.port = n;
    }
    if let Some(val) = var("CERTQUERY_BROKER_VHOST") {
        config.broker.vhost = val;
    }
    if let Some(val) = var("CERTQUERY_BROKER_USERNAME") {
        config.broker.username = val;
    }
    if let Some(val) = var("CERTQUERY_BROKER_PASSWORD") {
        config.broker.password = val;
    }
    if let Some(val) = var("CERTQUERY_DB_PATH") {
        config.database.path = Some(PathBuf::from(val));
    }
    if let Some(flag) = var("CERTQUERY_DB_READ_ONLY").and_then(|v| v.parse().ok()) {
        config.database.read_only = flag;
    }
    if let Some(val) = var("CERTQUERY_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(ms) = var("CERTQUERY_RETRY_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.reconnect.initial_delay_ms = ms;
        config.reconnect.max_delay_ms = config.reconnect.max_delay_ms.max(ms);
    }
}
