//! Configuration management for the monitoring core

use config::{Config, ConfigError, Environment as EnvSource, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::Environment;

/// Main configuration structure for the monitoring core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Deployment environment
    pub environment: Environment,

    /// Log pipeline settings
    pub logging: LoggingConfig,

    /// Health check settings
    pub health: HealthConfig,

    /// Alerting and notification settings
    pub alerting: AlertingConfig,

    /// Violation intake settings
    pub violations: ViolationsConfig,

    /// Network reachability probe settings
    pub network: NetworkConfig,

    /// Durable sink settings
    pub sink: SinkConfig,

    /// Process-wide hook settings
    pub hooks: HooksConfig,

    /// Metrics exporter settings
    pub metrics: MetricsConfig,
}

/// Log pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Entries buffered before a flush is forced
    pub buffer_size: usize,

    /// Background flush interval in milliseconds
    pub flush_interval_ms: u64,

    /// Ceiling on buffered-but-unflushed entries under sink failure
    pub max_pending: usize,

    /// Override local mirroring (defaults to on outside production)
    pub mirror_local: Option<bool>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 50,
            flush_interval_ms: 5_000,
            max_pending: 500,
            mirror_local: None,
        }
    }
}

impl LoggingConfig {
    /// Flush interval as a duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Aggregation cycle interval in seconds
    pub check_interval_secs: u64,

    /// Default per-check timeout in milliseconds
    pub default_timeout_ms: u64,

    /// Datastore round-trip above which the check is degraded
    pub datastore_degraded_ms: u64,

    /// Datastore round-trip above which the check warns
    pub datastore_warning_ms: u64,

    /// Round-trip threshold for secondary dependencies
    pub secondary_degraded_ms: u64,

    /// Realtime subscription timeout in milliseconds
    pub realtime_timeout_ms: u64,

    /// Scratch directory for the local storage round-trip
    pub scratch_dir: Option<PathBuf>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            default_timeout_ms: 5_000,
            datastore_degraded_ms: 500,
            datastore_warning_ms: 1_000,
            secondary_degraded_ms: 2_000,
            realtime_timeout_ms: 3_000,
            scratch_dir: None,
        }
    }
}

impl HealthConfig {
    /// Aggregation interval as a duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Default per-check timeout as a duration
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Window in which repeated alerts of the same type and level are not re-sent
    pub cooldown_secs: u64,

    /// Request latency above which a performance alert is raised
    pub slow_request_ms: u64,

    /// Webhook endpoints notified for each dispatched alert
    pub webhook_urls: Vec<String>,

    /// Webhook request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            slow_request_ms: 3_000,
            webhook_urls: vec![],
            request_timeout_secs: 10,
        }
    }
}

impl AlertingConfig {
    /// Cooldown window as a duration
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Violation intake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolationsConfig {
    /// Ring buffer capacity
    pub capacity: usize,
}

impl Default for ViolationsConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// Network reachability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address dialed to decide whether the host is online
    pub probe_address: String,

    /// Poll interval for online/offline transitions in seconds
    pub poll_interval_secs: u64,

    /// Probe connect timeout in milliseconds
    pub probe_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_address: "1.1.1.1:443".to_string(),
            poll_interval_secs: 15,
            probe_timeout_ms: 2_000,
        }
    }
}

/// Kind of durable sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// In-process memory, lost on restart
    Memory,

    /// Newline-delimited JSON files, one per collection
    Jsonl,

    /// Postgres tables, one per collection
    Postgres,
}

/// Durable sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Sink backend
    pub kind: SinkKind,

    /// Output directory for the JSONL sink
    pub path: PathBuf,

    /// Connection URL for the Postgres sink
    pub database_url: Option<String>,

    /// Postgres pool size
    pub pool_size: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Memory,
            path: PathBuf::from("./data/vigil"),
            database_url: None,
            pool_size: 5,
        }
    }
}

/// Process-wide hook configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Skip the previously installed panic hook after logging
    pub suppress_default_panic_output: bool,
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,

    /// Prometheus bind address
    pub prometheus_bind_address: String,

    /// Prometheus port
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prometheus_bind_address: "0.0.0.0".to_string(),
            prometheus_port: 9095,
        }
    }
}

impl VigilConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default values
            .add_source(File::with_name("config/vigil").required(false))
            // Add environment-specific config
            .add_source(
                File::with_name(&format!(
                    "config/vigil-{}",
                    std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into())
                ))
                .required(false),
            )
            // Add local config (gitignored)
            .add_source(File::with_name("config/vigil-local").required(false))
            // Add environment variables with VIGIL_ prefix
            .add_source(EnvSource::with_prefix("VIGIL").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a single file, falling back to defaults for missing keys
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path))
            .add_source(EnvSource::with_prefix("VIGIL").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Whether the log pipeline mirrors entries locally
    pub fn mirrors_locally(&self) -> bool {
        self.logging
            .mirror_local
            .unwrap_or_else(|| self.environment.mirrors_locally())
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.logging.buffer_size == 0 {
            return Err(ConfigError::Message(
                "logging.buffer_size must be greater than 0".into(),
            ));
        }

        if self.logging.max_pending < self.logging.buffer_size {
            return Err(ConfigError::Message(format!(
                "logging.max_pending ({}) must be at least logging.buffer_size ({})",
                self.logging.max_pending, self.logging.buffer_size
            )));
        }

        if self.logging.flush_interval_ms == 0 {
            return Err(ConfigError::Message(
                "logging.flush_interval_ms must be greater than 0".into(),
            ));
        }

        if self.health.check_interval_secs == 0 || self.health.default_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "health intervals and timeouts must be greater than 0".into(),
            ));
        }

        if self.health.datastore_warning_ms < self.health.datastore_degraded_ms {
            return Err(ConfigError::Message(
                "health.datastore_warning_ms must not be below health.datastore_degraded_ms"
                    .into(),
            ));
        }

        if self.violations.capacity == 0 {
            return Err(ConfigError::Message(
                "violations.capacity must be greater than 0".into(),
            ));
        }

        if self.network.poll_interval_secs == 0 {
            return Err(ConfigError::Message(
                "network.poll_interval_secs must be greater than 0".into(),
            ));
        }

        for webhook in &self.alerting.webhook_urls {
            if Url::parse(webhook).is_err() {
                return Err(ConfigError::Message(format!(
                    "Invalid webhook URL: {}",
                    webhook
                )));
            }
        }

        if self.sink.kind == SinkKind::Postgres && self.sink.database_url.is_none() {
            return Err(ConfigError::Message(
                "sink.database_url is required for the postgres sink".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VigilConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.buffer_size, 50);
        assert_eq!(config.logging.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.health.check_interval(), Duration::from_secs(30));
        assert_eq!(config.violations.capacity, 100);
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config = VigilConfig::default();
        config.logging.max_pending = 10;
        assert!(config.validate().is_err());

        let mut config = VigilConfig::default();
        config.alerting.webhook_urls = vec!["not a url".to_string()];
        assert!(config.validate().is_err());

        let mut config = VigilConfig::default();
        config.sink.kind = SinkKind::Postgres;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mirroring_override() {
        let mut config = VigilConfig::default();
        config.environment = Environment::Production;
        assert!(!config.mirrors_locally());

        config.logging.mirror_local = Some(true);
        assert!(config.mirrors_locally());
    }
}
