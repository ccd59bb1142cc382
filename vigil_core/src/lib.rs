//! # Vigil Core
//!
//! Process-wide observability and security-monitoring core. Folds the health
//! of independent subsystems into one system-wide status, pipes every
//! structured log event through a redaction engine before it leaves the
//! process, and escalates dangerous browser-reported policy violations into
//! alerts.
//!
//! Components, leaf to root:
//!
//! 1. [`redaction`] - ordered regex substitution over strings, lists and maps
//! 2. [`logging`] - buffered, redacted log pipeline with forced flush on critical
//! 3. [`health`] - concurrent, timed health checks and the escalation policy
//! 4. [`violations`] - bounded intake of content-security-policy violations
//! 5. [`monitoring`] - current health, alert list and notification dispatch
//! 6. [`lifecycle`] - wiring, process-wide hooks and teardown

pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod logging;
pub mod monitoring;
pub mod redaction;
pub mod sink;
pub mod violations;

pub use config::VigilConfig;
pub use dispatch::{Dispatch, LogDispatch, WebhookDispatch};
pub use error::{Result, VigilError};
pub use health::{
    escalate, DependencyKind, HealthAggregator, HealthCheck, HealthCheckResult, HealthStatus,
    SystemHealthReport,
};
pub use lifecycle::{Collaborators, Lifecycle, SystemStatus, ViolationReporter};
pub use logging::{LogCategory, LogEntry, LogLevel, LogPipeline, NoSession, SessionResolver};
pub use monitoring::{AlertLevel, AlertSink, MonitoringService, PerformanceMetric, SecurityAlert};
pub use sink::{GuardedSink, JsonlSink, MemorySink, PgSink, Sink};
pub use violations::{
    sanitize_user_input, validate_audio_data_uri, CspViolation, InputContext, ThreatKind,
    ValidationResult, ViolationIntake,
};

/// Current version of the monitoring core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// System identifier attached to dispatched alerts
pub const SYSTEM_NAME: &str = "vigil-core";

/// Deployment environment the process runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Local development, entries mirrored to the console
    Development,

    /// Automated test runs
    Testing,

    /// Pre-production deployment
    Staging,

    /// Production deployment, no local mirroring
    Production,
}

impl Environment {
    /// Whether entries are mirrored to the local developer-visible sink
    pub fn mirrors_locally(&self) -> bool {
        !matches!(self, Environment::Production)
    }

    /// Get the default log level for this environment
    pub fn log_level(&self) -> &'static str {
        match self {
            Environment::Development => "debug",
            Environment::Testing => "info",
            Environment::Staging => "info",
            Environment::Production => "warn",
        }
    }

    /// Get the environment as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testing" | "test" => Ok(Environment::Testing),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(VigilError::InvalidEnvironment(s.to_string())),
        }
    }
}
