//! Health outcomes and the escalation policy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Outcome of one health check, or of the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Operating normally
    Healthy,

    /// Functional but impaired
    Degraded,

    /// Not functional
    Critical,

    /// Could not be determined; never worsens the overall verdict
    Unknown,
}

impl HealthStatus {
    /// Get the status as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Check if the status requires attention
    pub fn requires_attention(&self) -> bool {
        matches!(self, HealthStatus::Degraded | HealthStatus::Critical)
    }

    /// Value exported on the overall health gauge
    pub fn gauge_value(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 0.0,
            HealthStatus::Degraded => 1.0,
            HealthStatus::Critical => 2.0,
            HealthStatus::Unknown => -1.0,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fold per-check statuses into one overall status
///
/// Two or more critical checks make the system critical. One critical, or
/// two or more degraded, make it degraded. Anything else is healthy.
/// `Unknown` is neutral.
pub fn escalate(statuses: &[HealthStatus]) -> HealthStatus {
    let critical = statuses
        .iter()
        .filter(|s| **s == HealthStatus::Critical)
        .count();
    let degraded = statuses
        .iter()
        .filter(|s| **s == HealthStatus::Degraded)
        .count();

    if critical >= 2 {
        HealthStatus::Critical
    } else if critical == 1 || degraded >= 2 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Result of a single health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Check name
    pub name: String,

    /// Check outcome
    pub status: HealthStatus,

    /// Status message
    pub message: String,

    /// Round-trip time in milliseconds
    pub latency_ms: u64,

    /// When the check completed
    pub timestamp: DateTime<Utc>,

    /// Additional details
    pub details: Map<String, Value>,
}

impl HealthCheckResult {
    /// Create a result stamped now
    pub fn new(name: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            latency_ms: 0,
            timestamp: Utc::now(),
            details: Map::new(),
        }
    }

    pub fn healthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy, message)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Degraded, message)
    }

    pub fn critical(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Critical, message)
    }

    pub fn unknown(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Unknown, message)
    }

    /// Set the measured latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }

    /// Add a detail
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Check if the result is healthy
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Aggregated health of every registered check
///
/// Only built through [`SystemHealthReport::from_checks`], so `overall`
/// always matches `checks`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthReport {
    overall: HealthStatus,

    /// Per-check results in registration order
    pub checks: Vec<HealthCheckResult>,

    /// Report timestamp
    pub timestamp: DateTime<Utc>,

    /// Time since the aggregator started
    pub uptime_ms: u64,

    /// Checks run in this cycle
    pub checks_performed: usize,

    /// Checks that came back healthy
    pub checks_passed: usize,

    /// Checks that came back degraded or critical
    pub checks_failed: usize,
}

impl SystemHealthReport {
    /// Build a report, computing the overall status with [`escalate`]
    pub fn from_checks(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let statuses: Vec<HealthStatus> = checks.iter().map(|c| c.status).collect();
        let checks_passed = checks.iter().filter(|c| c.is_healthy()).count();
        let checks_failed = checks
            .iter()
            .filter(|c| c.status.requires_attention())
            .count();

        Self {
            overall: escalate(&statuses),
            checks_performed: checks.len(),
            checks_passed,
            checks_failed,
            checks,
            timestamp: Utc::now(),
            uptime_ms: uptime.as_millis() as u64,
        }
    }

    /// Overall system status
    pub fn overall(&self) -> HealthStatus {
        self.overall
    }

    /// Checks that came back degraded or critical
    pub fn failed_checks(&self) -> Vec<&HealthCheckResult> {
        self.checks
            .iter()
            .filter(|c| c.status.requires_attention())
            .collect()
    }

    /// Look up a check result by name
    pub fn check(&self, name: &str) -> Option<&HealthCheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// One-line summary for alerts and logs
    pub fn summary(&self) -> String {
        let failed: Vec<String> = self
            .failed_checks()
            .iter()
            .map(|c| format!("{} ({})", c.name, c.status))
            .collect();

        if failed.is_empty() {
            format!("System {}: all {} checks passed", self.overall, self.checks_performed)
        } else {
            format!("System {}: {}", self.overall, failed.join(", "))
        }
    }
}
