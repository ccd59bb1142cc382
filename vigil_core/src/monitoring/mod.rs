//! Monitoring orchestration: current health, alerts and notification

pub mod alerts;
pub mod service;

pub use alerts::{AlertLevel, PerformanceMetric, SecurityAlert, ALERT_TYPE_PERFORMANCE, ALERT_TYPE_SYSTEM_HEALTH};
pub use service::MonitoringService;

use serde_json::Value;

use crate::logging::{LogCategory, LogLevel};

/// Receives error-or-worse log events
///
/// Called synchronously from the log path, so implementations must not
/// block; any I/O is spawned.
pub trait AlertSink: Send + Sync {
    fn raise(&self, level: LogLevel, category: LogCategory, message: &str, metadata: Value);
}
