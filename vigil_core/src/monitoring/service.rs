//! Monitoring service: health cycles, alert book and notification
//!
//! The in-memory alert list is the source of truth. Every path that raises
//! an alert pushes it there before any sink or dispatch I/O is attempted,
//! and that I/O is spawned so callers never wait on it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VigilConfig;
use crate::dispatch::Dispatch;
use crate::health::{HealthAggregator, SystemHealthReport};
use crate::logging::{LogCategory, LogLevel};
use crate::monitoring::alerts::{
    AlertLevel, PerformanceMetric, SecurityAlert, ALERT_TYPE_PERFORMANCE, ALERT_TYPE_SYSTEM_HEALTH,
};
use crate::monitoring::AlertSink;
use crate::sink::{
    Sink, COLLECTION_ALERTS, COLLECTION_ERROR_LOGS, COLLECTION_PERFORMANCE_METRICS,
    COLLECTION_SYSTEM_HEALTH_LOGS,
};

/// Performance samples kept in memory
const MAX_PERFORMANCE_SAMPLES: usize = 1000;

/// Resolved alerts are pruned, oldest first, beyond this many alerts
const MAX_RETAINED_ALERTS: usize = 1000;

/// Monitoring service settings
#[derive(Debug, Clone)]
pub struct MonitoringSettings {
    /// Health cycle interval
    pub check_interval: Duration,

    /// Window in which a repeated `(type, level)` alert is not re-sent
    pub cooldown: Duration,

    /// Request latency above which a performance alert is raised
    pub slow_request_ms: u64,
}

impl MonitoringSettings {
    pub fn from_config(config: &VigilConfig) -> Self {
        Self {
            check_interval: config.health.check_interval(),
            cooldown: config.alerting.cooldown(),
            slow_request_ms: config.alerting.slow_request_ms,
        }
    }
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self::from_config(&VigilConfig::default())
    }
}

/// Owns current health, the alert list and notification
pub struct MonitoringService {
    aggregator: Arc<HealthAggregator>,
    sink: Arc<dyn Sink>,
    dispatch: Arc<dyn Dispatch>,
    settings: MonitoringSettings,

    /// Last completed health report
    current: RwLock<Option<SystemHealthReport>>,

    /// Raised alerts, oldest first
    alerts: Mutex<Vec<SecurityAlert>>,

    /// Last notification time per `(type, level)`
    cooldowns: DashMap<(String, AlertLevel), Instant>,

    /// Recent request latency samples
    performance: Mutex<VecDeque<PerformanceMetric>>,
}

impl MonitoringService {
    /// Create a new monitoring service
    pub fn new(
        aggregator: Arc<HealthAggregator>,
        sink: Arc<dyn Sink>,
        dispatch: Arc<dyn Dispatch>,
        settings: MonitoringSettings,
    ) -> Self {
        Self {
            aggregator,
            sink,
            dispatch,
            settings,
            current: RwLock::new(None),
            alerts: Mutex::new(Vec::new()),
            cooldowns: DashMap::new(),
            performance: Mutex::new(VecDeque::with_capacity(MAX_PERFORMANCE_SAMPLES)),
        }
    }

    /// Run one health cycle and alert on a degraded or critical result
    pub async fn perform_health_check(&self) -> SystemHealthReport {
        let report = self.aggregator.run_all().await;
        let overall = report.overall();

        *self.current.write() = Some(report.clone());
        metrics::gauge!("vigil_overall_health", overall.gauge_value());

        self.mirror(
            COLLECTION_SYSTEM_HEALTH_LOGS,
            json!({
                "overall": overall,
                "summary": report.summary(),
                "checks_performed": report.checks_performed,
                "checks_failed": report.checks_failed,
                "timestamp": report.timestamp,
            }),
        );

        if let Some(level) = AlertLevel::for_health(overall) {
            let failed: Vec<Value> = report
                .failed_checks()
                .iter()
                .map(|c| json!({"name": c.name, "status": c.status, "message": c.message}))
                .collect();

            self.raise_with_cooldown(
                level,
                ALERT_TYPE_SYSTEM_HEALTH,
                &report.summary(),
                json!({ "overall": overall, "failed_checks": failed }),
            );
        }

        report
    }

    /// Force a fresh health cycle
    pub async fn check_now(&self) -> SystemHealthReport {
        self.perform_health_check().await
    }

    /// Last completed report, without running a cycle
    pub fn current_health(&self) -> Option<SystemHealthReport> {
        self.current.read().clone()
    }

    /// Run health cycles on the configured interval until cancelled
    ///
    /// The first cycle runs one interval after the call. A cycle still
    /// running at cancellation is dropped.
    pub fn spawn_health_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let period = self.settings.check_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            info!(interval_secs = period.as_secs(), "Health loop started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    report = service.perform_health_check() => {
                        debug!(overall = %report.overall(), "Health cycle complete");
                    }
                }
            }
            debug!("Health loop stopped");
        })
    }

    /// Mark an alert resolved
    ///
    /// Returns false only for an unknown id. Resolving twice is a no-op.
    pub fn resolve_alert(&self, id: Uuid) -> bool {
        let resolved = {
            let mut alerts = self.alerts.lock();
            let Some(alert) = alerts.iter_mut().find(|a| a.id == id) else {
                return false;
            };
            if !alert.resolve() {
                return true;
            }
            alert.clone()
        };

        self.cooldowns
            .remove(&(resolved.alert_type.clone(), resolved.level));
        info!(alert_id = %id, alert_type = %resolved.alert_type, "Alert resolved");
        self.mirror(COLLECTION_ALERTS, resolved.to_record("resolved"));
        true
    }

    /// Unresolved alerts, oldest first
    pub fn active_alerts(&self) -> Vec<SecurityAlert> {
        self.alerts
            .lock()
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Every retained alert, oldest first
    pub fn all_alerts(&self) -> Vec<SecurityAlert> {
        self.alerts.lock().clone()
    }

    /// Record a request latency sample
    pub fn track_performance(&self, metric: PerformanceMetric) {
        {
            let mut samples = self.performance.lock();
            samples.push_back(metric.clone());
            while samples.len() > MAX_PERFORMANCE_SAMPLES {
                samples.pop_front();
            }
        }

        let record = serde_json::to_value(&metric).unwrap_or(Value::Null);
        self.mirror(COLLECTION_PERFORMANCE_METRICS, record.clone());

        if metric.response_time_ms > self.settings.slow_request_ms {
            let message = format!(
                "Slow response on {} {}: {} ms",
                metric.method, metric.endpoint, metric.response_time_ms
            );
            self.raise_with_cooldown(AlertLevel::Warning, ALERT_TYPE_PERFORMANCE, &message, record);
        }
    }

    /// The `n` most recent samples, oldest first
    pub fn recent_performance(&self, n: usize) -> Vec<PerformanceMetric> {
        let samples = self.performance.lock();
        let skip = samples.len().saturating_sub(n);
        samples.iter().skip(skip).cloned().collect()
    }

    /// Record an error-or-worse event from the log path
    ///
    /// Critical events are dispatched immediately, ignoring the cooldown.
    /// Error events are recorded as warnings without notification, and
    /// repeats of the same category within the cooldown fold into the open
    /// warning.
    pub fn log_error(&self, level: LogLevel, category: LogCategory, message: &str, metadata: Value) {
        self.mirror(
            COLLECTION_ERROR_LOGS,
            json!({
                "level": level,
                "category": category,
                "message": message,
                "metadata": metadata,
                "timestamp": chrono::Utc::now(),
            }),
        );

        match AlertLevel::for_log(level) {
            Some(AlertLevel::Critical) => {
                let alert = SecurityAlert::new(AlertLevel::Critical, category.as_str(), message, metadata);
                self.record(alert.clone());
                self.dispatch(alert);
            }
            Some(alert_level) => {
                let alert_type = category.as_str();
                if self.in_cooldown(alert_level, alert_type)
                    && self.fold_repeat(alert_level, alert_type, message, &metadata)
                {
                    return;
                }
                self.record(SecurityAlert::new(alert_level, alert_type, message, metadata));
            }
            None => {}
        }
    }

    /// Record an alert, notifying unless the same `(type, level)` was
    /// notified within the cooldown
    fn raise_with_cooldown(&self, level: AlertLevel, alert_type: &str, message: &str, metadata: Value) {
        if self.in_cooldown(level, alert_type) && self.fold_repeat(level, alert_type, message, &metadata) {
            return;
        }

        let alert = SecurityAlert::new(level, alert_type, message, metadata);
        self.record(alert.clone());
        self.dispatch(alert);
    }

    /// Whether `(type, level)` was raised within the cooldown; otherwise
    /// starts a new window
    fn in_cooldown(&self, level: AlertLevel, alert_type: &str) -> bool {
        let now = Instant::now();
        match self.cooldowns.entry((alert_type.to_string(), level)) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < self.settings.cooldown {
                    true
                } else {
                    last.insert(now);
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                false
            }
        }
    }

    /// Fold a repeat into the latest open alert of the same type and level
    fn fold_repeat(&self, level: AlertLevel, alert_type: &str, message: &str, metadata: &Value) -> bool {
        let mut alerts = self.alerts.lock();
        match alerts
            .iter_mut()
            .rev()
            .find(|a| !a.resolved && a.level == level && a.alert_type == alert_type)
        {
            Some(existing) => {
                existing.repeat(message, metadata.clone());
                metrics::counter!("vigil_alerts_suppressed_total", 1, "type" => alert_type.to_string());
                debug!(
                    alert_id = %existing.id,
                    occurrences = existing.occurrences,
                    "Repeat alert folded in during cooldown"
                );
                true
            }
            None => false,
        }
    }

    /// Push an alert onto the in-memory list, then mirror it
    fn record(&self, alert: SecurityAlert) {
        metrics::counter!("vigil_alerts_raised_total", 1, "level" => alert.level.as_str());
        let record = alert.to_record("raised");

        {
            let mut alerts = self.alerts.lock();
            alerts.push(alert);
            prune_resolved(&mut alerts);
        }

        self.mirror(COLLECTION_ALERTS, record);
    }

    fn dispatch(&self, alert: SecurityAlert) {
        let dispatch = Arc::clone(&self.dispatch);
        spawn_io(async move {
            if let Err(e) = dispatch.send(&alert).await {
                warn!(
                    alert_id = %alert.id,
                    channel = dispatch.channel(),
                    error = %e,
                    "Alert dispatch failed"
                );
            }
        });
    }

    fn mirror(&self, collection: &'static str, record: Value) {
        let sink = Arc::clone(&self.sink);
        spawn_io(async move {
            if let Err(e) = sink.append(collection, vec![record]).await {
                warn!(collection, error = %e, "Failed to mirror record");
            }
        });
    }
}

impl AlertSink for MonitoringService {
    fn raise(&self, level: LogLevel, category: LogCategory, message: &str, metadata: Value) {
        self.log_error(level, category, message, metadata);
    }
}

fn prune_resolved(alerts: &mut Vec<SecurityAlert>) {
    let mut excess = alerts.len().saturating_sub(MAX_RETAINED_ALERTS);
    if excess == 0 {
        return;
    }
    alerts.retain(|a| {
        if excess > 0 && a.resolved {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

/// Spawn background I/O on the current runtime, if there is one
fn spawn_io<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!("No async runtime available, background write skipped"),
    }
}
