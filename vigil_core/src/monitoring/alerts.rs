//! Security alerts and performance samples

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::health::HealthStatus;
use crate::logging::LogLevel;

/// Alert type raised by the health cycle
pub const ALERT_TYPE_SYSTEM_HEALTH: &str = "system_health";

/// Alert type raised for slow requests
pub const ALERT_TYPE_PERFORMANCE: &str = "performance";

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational alert
    Info,

    /// Warning - should be investigated
    Warning,

    /// Critical - requires immediate action
    Critical,
}

impl AlertLevel {
    /// Get the level as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }

    /// Alert level a health outcome maps to, if it warrants one
    pub fn for_health(status: HealthStatus) -> Option<Self> {
        match status {
            HealthStatus::Critical => Some(AlertLevel::Critical),
            HealthStatus::Degraded => Some(AlertLevel::Warning),
            HealthStatus::Healthy | HealthStatus::Unknown => None,
        }
    }

    /// Alert level an error-or-worse log entry maps to
    pub fn for_log(level: LogLevel) -> Option<Self> {
        match level {
            LogLevel::Critical => Some(AlertLevel::Critical),
            LogLevel::Error => Some(AlertLevel::Warning),
            _ => None,
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A raised alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlert {
    /// Alert ID
    pub id: Uuid,

    /// Severity level
    pub level: AlertLevel,

    /// Alert type, e.g. `system_health` or a log category
    pub alert_type: String,

    /// Human-readable description
    pub message: String,

    /// When the alert was first raised
    pub timestamp: DateTime<Utc>,

    /// Whether an operator has resolved it
    pub resolved: bool,

    /// When it was resolved
    pub resolved_at: Option<DateTime<Utc>>,

    /// Times this alert was raised, including repeats folded in during cooldown
    pub occurrences: u64,

    /// Additional context
    pub metadata: Value,
}

impl SecurityAlert {
    /// Create a new unresolved alert
    pub fn new(level: AlertLevel, alert_type: impl Into<String>, message: impl Into<String>, metadata: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            alert_type: alert_type.into(),
            message: message.into(),
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
            occurrences: 1,
            metadata,
        }
    }

    /// Mark the alert as resolved, returning false if it already was
    pub fn resolve(&mut self) -> bool {
        if self.resolved {
            return false;
        }
        self.resolved = true;
        self.resolved_at = Some(Utc::now());
        true
    }

    /// Fold a repeat occurrence into this alert
    pub fn repeat(&mut self, message: &str, metadata: Value) {
        self.occurrences += 1;
        self.message = message.to_string();
        self.metadata = metadata;
    }

    /// Record mirrored to the `alerts` collection
    pub fn to_record(&self, event: &str) -> Value {
        json!({
            "event": event,
            "alert": self,
        })
    }
}

/// One request latency sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub endpoint: String,
    pub method: String,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
}

impl PerformanceMetric {
    /// Create a sample stamped now
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>, response_time_ms: u64, status_code: u16) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            response_time_ms,
            status_code,
            timestamp: Utc::now(),
            user_id: None,
        }
    }

    /// Attach the user the request ran for
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}
