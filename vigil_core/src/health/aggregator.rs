//! Concurrent execution of the registered health checks

use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::health::checks::HealthCheck;
use crate::health::status::{HealthCheckResult, HealthStatus, SystemHealthReport};
use crate::lifecycle::hooks::{panic_message, CatchPanics};
use crate::sink::{Sink, COLLECTION_HEALTH_CHECK_REPORTS};

/// Runs every registered check and folds the results
pub struct HealthAggregator {
    /// Registered checks, in report order
    checks: Vec<Arc<dyn HealthCheck>>,

    /// Destination for best-effort report persistence
    sink: Arc<dyn Sink>,

    /// Start time for uptime
    started: Instant,

    /// Completed cycles
    cycles: AtomicU64,
}

impl HealthAggregator {
    /// Create an aggregator over a fixed set of checks
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>, sink: Arc<dyn Sink>) -> Self {
        info!(
            checks = checks.len(),
            "Health aggregator created with checks: {}",
            checks.iter().map(|c| c.name()).collect::<Vec<_>>().join(", ")
        );

        Self {
            checks,
            sink,
            started: Instant::now(),
            cycles: AtomicU64::new(0),
        }
    }

    /// Run every check concurrently and build the report
    ///
    /// Never fails: timeouts, errors and panics inside a check become
    /// results. Waits for the slowest check, bounded by its timeout.
    pub async fn run_all(&self) -> SystemHealthReport {
        let results = join_all(self.checks.iter().cloned().map(run_guarded)).await;
        let report = SystemHealthReport::from_checks(results, self.uptime());
        self.cycles.fetch_add(1, Ordering::Relaxed);

        match report.overall() {
            HealthStatus::Healthy => debug!("{}", report.summary()),
            _ => warn!(overall = %report.overall(), "{}", report.summary()),
        }

        self.persist(&report);
        report
    }

    /// Time since the aggregator was created
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Names of the registered checks
    pub fn check_names(&self) -> Vec<String> {
        self.checks.iter().map(|c| c.name().to_string()).collect()
    }

    /// Completed aggregation cycles
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    fn persist(&self, report: &SystemHealthReport) {
        let record = match serde_json::to_value(report) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Failed to serialize health report");
                return;
            }
        };

        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.append(COLLECTION_HEALTH_CHECK_REPORTS, vec![record]).await {
                warn!(error = %e, "Failed to persist health report");
            }
        });
    }
}

/// Run one check under its timeout, converting every failure into a result
async fn run_guarded(check: Arc<dyn HealthCheck>) -> HealthCheckResult {
    let name = check.name().to_string();
    let timeout = check.timeout();
    let failure = check.kind().failure_status();
    let start = Instant::now();

    let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(CatchPanics::new(check.run())).catch_unwind()).await;
    let elapsed = start.elapsed();

    let mut result = match outcome {
        Err(_) => HealthCheckResult::degraded(
            name.clone(),
            format!("Timed out after {} ms", timeout.as_millis()),
        )
        .with_latency(elapsed)
        .with_detail("timeout_ms", timeout.as_millis() as u64),

        Ok(Ok(Ok(mut result))) => {
            if result.latency_ms == 0 {
                result.latency_ms = elapsed.as_millis() as u64;
            }
            result
        }

        Ok(Ok(Err(e))) => HealthCheckResult::new(name.clone(), failure, format!("Check failed: {}", e))
            .with_latency(elapsed)
            .with_detail("error", e.to_string()),

        Ok(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            HealthCheckResult::new(name.clone(), failure, format!("Check panicked: {}", message))
                .with_latency(elapsed)
                .with_detail("error", message)
        }
    };
    result.name = name.clone();

    metrics::histogram!("vigil_health_check_latency_ms", result.latency_ms as f64, "check" => name);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::checks::DependencyKind;
    use crate::sink::MemorySink;
    use crate::{Result, VigilError};
    use async_trait::async_trait;

    enum Behaviour {
        Status(HealthStatus),
        Fail,
        Panic,
        Hang,
    }

    struct Scripted {
        name: &'static str,
        kind: DependencyKind,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl HealthCheck for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> DependencyKind {
            self.kind
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        async fn run(&self) -> Result<HealthCheckResult> {
            match self.behaviour {
                Behaviour::Status(status) => Ok(HealthCheckResult::new(self.name, status, "scripted")),
                Behaviour::Fail => Err(VigilError::check(self.name, "boom")),
                Behaviour::Panic => panic!("check exploded"),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    unreachable!()
                }
            }
        }
    }

    fn check(name: &'static str, kind: DependencyKind, behaviour: Behaviour) -> Arc<dyn HealthCheck> {
        Arc::new(Scripted { name, kind, behaviour })
    }

    #[tokio::test]
    async fn test_failures_become_results() {
        let sink = Arc::new(MemorySink::new());
        let aggregator = HealthAggregator::new(
            vec![
                check("datastore", DependencyKind::Essential, Behaviour::Fail),
                check("object_storage", DependencyKind::Auxiliary, Behaviour::Fail),
                check("realtime", DependencyKind::Auxiliary, Behaviour::Hang),
                check("local_storage", DependencyKind::Essential, Behaviour::Panic),
            ],
            sink,
        );

        let started = Instant::now();
        let report = aggregator.run_all().await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let datastore = report.check("datastore").unwrap();
        assert_eq!(datastore.status, HealthStatus::Critical);
        assert_eq!(datastore.details["error"], "Health check failed: datastore - boom");

        assert_eq!(report.check("object_storage").unwrap().status, HealthStatus::Degraded);

        let realtime = report.check("realtime").unwrap();
        assert_eq!(realtime.status, HealthStatus::Degraded);
        assert_eq!(realtime.message, "Timed out after 50 ms");

        let local = report.check("local_storage").unwrap();
        assert_eq!(local.status, HealthStatus::Critical);
        assert_eq!(local.details["error"], "check exploded");

        // Two essential failures
        assert_eq!(report.overall(), HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_report_is_persisted() {
        let sink = Arc::new(MemorySink::new());
        let aggregator = HealthAggregator::new(
            vec![check("network", DependencyKind::Essential, Behaviour::Status(HealthStatus::Healthy))],
            sink.clone(),
        );

        aggregator.run_all().await;
        for _ in 0..50 {
            if !sink.records(COLLECTION_HEALTH_CHECK_REPORTS).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let records = sink.records(COLLECTION_HEALTH_CHECK_REPORTS);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["overall"], "healthy");
        assert_eq!(aggregator.cycles(), 1);
        assert_eq!(aggregator.check_names(), vec!["network".to_string()]);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_swallowed() {
        let sink = Arc::new(MemorySink::new());
        sink.set_failing(true);
        let aggregator = HealthAggregator::new(
            vec![check("datastore", DependencyKind::Essential, Behaviour::Status(HealthStatus::Degraded))],
            sink,
        );

        let report = aggregator.run_all().await;
        assert_eq!(report.overall(), HealthStatus::Healthy);
    }
}
