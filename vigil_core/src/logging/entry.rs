//! Structured log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::redaction;
use crate::{Environment, Result, VigilError};

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Get the level as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    /// Whether entries at this level are forwarded to the alerting path
    pub fn raises_alert(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Critical)
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" | "fatal" => Ok(LogLevel::Critical),
            _ => Err(VigilError::InvalidLevel(s.to_string())),
        }
    }
}

/// Functional area a log entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Auth,
    Api,
    Database,
    Payment,
    Security,
    Performance,
    System,
    Ui,
    HealthCheck,
    CspViolation,
    Network,
}

impl LogCategory {
    /// Get the category as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Auth => "auth",
            LogCategory::Api => "api",
            LogCategory::Database => "database",
            LogCategory::Payment => "payment",
            LogCategory::Security => "security",
            LogCategory::Performance => "performance",
            LogCategory::System => "system",
            LogCategory::Ui => "ui",
            LogCategory::HealthCheck => "health_check",
            LogCategory::CspViolation => "csp_violation",
            LogCategory::Network => "network",
        }
    }
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogCategory {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auth" => Ok(LogCategory::Auth),
            "api" => Ok(LogCategory::Api),
            "database" => Ok(LogCategory::Database),
            "payment" => Ok(LogCategory::Payment),
            "security" => Ok(LogCategory::Security),
            "performance" => Ok(LogCategory::Performance),
            "system" => Ok(LogCategory::System),
            "ui" => Ok(LogCategory::Ui),
            "health_check" => Ok(LogCategory::HealthCheck),
            "csp_violation" => Ok(LogCategory::CspViolation),
            "network" => Ok(LogCategory::Network),
            _ => Err(VigilError::InvalidCategory(s.to_string())),
        }
    }
}

/// One redacted, timestamped log record
///
/// Entries can only be built through [`LogEntry::redacted`], so every entry
/// that exists has already been through the redaction engine.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    pub context: Map<String, Value>,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub environment: Environment,
    pub stack_trace: Option<String>,
    masked: bool,
}

impl LogEntry {
    /// Build an entry, passing message, context and stack trace through redaction
    pub fn redacted(
        level: LogLevel,
        category: LogCategory,
        message: &str,
        context: Option<&Map<String, Value>>,
        stack_trace: Option<String>,
        user_id: Option<String>,
        environment: Environment,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            category,
            message: redaction::redact_str(message),
            context: context.map(redaction::redact_map).unwrap_or_default(),
            user_id,
            timestamp: Utc::now(),
            environment,
            stack_trace: stack_trace.as_deref().map(redaction::redact_str),
            masked: true,
        }
    }

    /// Whether the entry has been through redaction
    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// Serialize for the sink
    pub fn to_record(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Render an error and its source chain, plus a backtrace when capture is enabled
pub fn describe_error(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str("\n  caused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }

    let backtrace = std::backtrace::Backtrace::capture();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        rendered.push('\n');
        rendered.push_str(&backtrace.to_string());
    }

    rendered
}

/// Resolves the user the current request runs on behalf of
pub trait SessionResolver: Send + Sync {
    /// Current user id, if any
    fn current_user_id(&self) -> Option<String>;
}

/// Resolver for hosts without session state
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSession;

impl SessionResolver for NoSession {
    fn current_user_id(&self) -> Option<String> {
        None
    }
}

/// Resolver that always reports the same user
#[derive(Debug, Clone)]
pub struct StaticSession(pub String);

impl SessionResolver for StaticSession {
    fn current_user_id(&self) -> Option<String> {
        Some(self.0.clone())
    }
}
