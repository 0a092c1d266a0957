//! Configuration management for lanesync nodes
//!
//! Configuration is loaded from a TOML file or from `LANESYNC_*` environment
//! variables. Every section has defaults, so a file only needs to carry the
//! values it overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity and cluster behaviour
    pub node: NodeConfig,

    /// Load stage tuning
    pub load: LoadConfig,

    /// Alarm delivery
    pub alarm: AlarmConfig,

    /// Status endpoint
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Node identity and cluster behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Cluster-wide node identifier
    pub node_id: String,

    /// Address other nodes and operators know this node by
    pub address: String,

    /// Allow preempting a lock that carries this node's own identity
    pub force_assign: bool,

    /// Whether load statistics are uploaded by this node
    pub upload_statistic: bool,

    /// Delay before the first heartbeat, in seconds
    pub heartbeat_initial_delay_secs: u64,

    /// Heartbeat interval, in seconds
    pub heartbeat_interval_secs: u64,

    /// A holder whose last heartbeat is older than this is considered stale
    pub stale_holder_secs: u64,

    /// Attempts for a version-checked ownership write before giving up
    pub write_attempts: u32,

    /// Capacity of the task event channel
    pub event_channel_capacity: usize,

    /// Concurrency ceiling; 0 means unlimited
    pub work_limit: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::from("node-1"),
            address: String::from("127.0.0.1"),
            force_assign: false,
            upload_statistic: true,
            heartbeat_initial_delay_secs: 10,
            heartbeat_interval_secs: 30,
            stale_holder_secs: 90,
            write_attempts: 5,
            event_channel_capacity: 1024,
            work_limit: 0,
        }
    }
}

impl NodeConfig {
    /// Create a new config builder
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Validate the node section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "node.node_id".to_string(),
            });
        }

        if self.node_id.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "node.node_id".to_string(),
                reason: "Must not contain '/'".to_string(),
            });
        }

        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "node.heartbeat_interval_secs".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.stale_holder_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue {
                field: "node.stale_holder_secs".to_string(),
                reason: "Must be greater than the heartbeat interval".to_string(),
            });
        }

        if self.write_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "node.write_attempts".to_string(),
                reason: "Must allow at least 1 attempt".to_string(),
            });
        }

        if self.event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "node.event_channel_capacity".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    pub fn heartbeat_initial_delay(&self) -> Duration {
        Duration::from_secs(self.heartbeat_initial_delay_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_holder_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_holder_secs)
    }
}

/// Builder for [`NodeConfig`]
#[derive(Debug, Default)]
pub struct NodeConfigBuilder {
    node_id: Option<String>,
    address: Option<String>,
    force_assign: Option<bool>,
    upload_statistic: Option<bool>,
    heartbeat_initial_delay_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    stale_holder_secs: Option<u64>,
    write_attempts: Option<u32>,
    event_channel_capacity: Option<usize>,
    work_limit: Option<u32>,
}

impl NodeConfigBuilder {
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn force_assign(mut self, enable: bool) -> Self {
        self.force_assign = Some(enable);
        self
    }

    pub fn upload_statistic(mut self, enable: bool) -> Self {
        self.upload_statistic = Some(enable);
        self
    }

    pub fn heartbeat_initial_delay_secs(mut self, secs: u64) -> Self {
        self.heartbeat_initial_delay_secs = Some(secs);
        self
    }

    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = Some(secs);
        self
    }

    pub fn stale_holder_secs(mut self, secs: u64) -> Self {
        self.stale_holder_secs = Some(secs);
        self
    }

    pub fn write_attempts(mut self, attempts: u32) -> Self {
        self.write_attempts = Some(attempts);
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = Some(capacity);
        self
    }

    pub fn work_limit(mut self, limit: u32) -> Self {
        self.work_limit = Some(limit);
        self
    }

    /// Build and validate the config
    pub fn build(self) -> Result<NodeConfig, ConfigError> {
        let defaults = NodeConfig::default();
        let config = NodeConfig {
            node_id: self.node_id.unwrap_or(defaults.node_id),
            address: self.address.unwrap_or(defaults.address),
            force_assign: self.force_assign.unwrap_or(defaults.force_assign),
            upload_statistic: self.upload_statistic.unwrap_or(defaults.upload_statistic),
            heartbeat_initial_delay_secs: self
                .heartbeat_initial_delay_secs
                .unwrap_or(defaults.heartbeat_initial_delay_secs),
            heartbeat_interval_secs: self
                .heartbeat_interval_secs
                .unwrap_or(defaults.heartbeat_interval_secs),
            stale_holder_secs: self.stale_holder_secs.unwrap_or(defaults.stale_holder_secs),
            write_attempts: self.write_attempts.unwrap_or(defaults.write_attempts),
            event_channel_capacity: self
                .event_channel_capacity
                .unwrap_or(defaults.event_channel_capacity),
            work_limit: self.work_limit.unwrap_or(defaults.work_limit),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Load stage tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Bounded wait for the next batch, in milliseconds
    pub stage_wait_timeout_ms: u64,

    /// Interval of the backlog / stuck-load monitor, in seconds
    pub position_check_interval_secs: u64,

    /// Backlog size that raises an alarm
    pub backlog_alarm_threshold: i64,

    /// A load running longer than this raises an alarm, in seconds
    pub stuck_load_threshold_secs: u64,

    /// Capacity of each stage queue
    pub queue_capacity: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            stage_wait_timeout_ms: 50,
            position_check_interval_secs: 60,
            backlog_alarm_threshold: 10_000,
            stuck_load_threshold_secs: 300,
            queue_capacity: 64,
        }
    }
}

impl LoadConfig {
    pub fn stage_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_wait_timeout_ms)
    }

    pub fn position_check_interval(&self) -> Duration {
        Duration::from_secs(self.position_check_interval_secs)
    }

    pub fn stuck_load_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_load_threshold_secs)
    }
}

/// Alarm delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Identical alarms inside this window are sent once, in seconds
    pub dedup_window_secs: u64,

    /// Optional webhook endpoint
    pub webhook_url: Option<String>,

    /// Optional bearer token for the webhook
    pub webhook_token: Option<String>,

    /// Webhook request timeout, in seconds
    pub webhook_timeout_secs: u64,

    /// Webhook retries on failure
    pub webhook_max_retries: u32,

    /// Default recipients attached to every alarm
    pub recipients: Vec<String>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 300,
            webhook_url: None,
            webhook_token: None,
            webhook_timeout_secs: 10,
            webhook_max_retries: 3,
            recipients: Vec::new(),
        }
    }
}

/// Status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve `/health`, `/metrics` and `/node`
    pub enabled: bool,

    /// Bind address
    pub bind_address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(node_id) = std::env::var("LANESYNC_NODE_ID") {
            config.node.node_id = node_id;
        }
        if let Ok(address) = std::env::var("LANESYNC_NODE_ADDRESS") {
            config.node.address = address;
        }
        if let Some(force) = env_parse("LANESYNC_FORCE_ASSIGN") {
            config.node.force_assign = force;
        }
        if let Some(upload) = env_parse("LANESYNC_UPLOAD_STATISTIC") {
            config.node.upload_statistic = upload;
        }
        if let Some(secs) = env_parse("LANESYNC_HEARTBEAT_INTERVAL") {
            config.node.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = env_parse("LANESYNC_HEARTBEAT_DELAY") {
            config.node.heartbeat_initial_delay_secs = secs;
        }
        if let Some(secs) = env_parse("LANESYNC_STALE_HOLDER") {
            config.node.stale_holder_secs = secs;
        }
        if let Some(threshold) = env_parse("LANESYNC_BACKLOG_ALARM") {
            config.load.backlog_alarm_threshold = threshold;
        }
        if let Some(secs) = env_parse("LANESYNC_STUCK_LOAD") {
            config.load.stuck_load_threshold_secs = secs;
        }
        if let Ok(url) = std::env::var("LANESYNC_WEBHOOK_URL") {
            config.alarm.webhook_url = Some(url);
        }
        if let Ok(token) = std::env::var("LANESYNC_WEBHOOK_TOKEN") {
            config.alarm.webhook_token = Some(token);
        }
        if let Ok(addr) = std::env::var("LANESYNC_BIND_ADDRESS") {
            config.server.bind_address = addr
                .parse()
                .with_context(|| format!("Invalid LANESYNC_BIND_ADDRESS: {addr}"))?;
        }
        if let Ok(level) = std::env::var("LANESYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("LANESYNC_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node.validate()?;

        if self.load.stage_wait_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "load.stage_wait_timeout_ms".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.load.position_check_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "load.position_check_interval_secs".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.load.stuck_load_threshold_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "load.stuck_load_threshold_secs".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.load.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "load.queue_capacity".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::InvalidValue {
                field: "logging.format".to_string(),
                reason: format!("Unknown format '{}'", self.logging.format),
            });
        }

        Ok(())
    }
}
