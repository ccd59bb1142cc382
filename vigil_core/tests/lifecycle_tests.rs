//! Integration tests for the lifecycle manager
//!
//! Drives the full core through its public surface with scripted checks, a
//! memory sink and a recording dispatch.

mod test_utils;

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use test_utils::{collaborators, test_config, wait_for_condition, ScriptedCheck};
use vigil_core::health::{DependencyKind, HealthCheck, HealthCheckResult};
use vigil_core::sink::{COLLECTION_SECURE_LOGS, COLLECTION_HEALTH_CHECK_REPORTS};
use vigil_core::{
    AlertLevel, CspViolation, HealthStatus, Lifecycle, LogCategory, LogLevel, PerformanceMetric,
    SessionResolver,
};

#[tokio::test]
async fn test_overall_status_follows_escalation() {
    let a = ScriptedCheck::new("datastore", HealthStatus::Healthy);
    let b = ScriptedCheck::new("local_storage", HealthStatus::Healthy);
    let c = ScriptedCheck::new("network", HealthStatus::Healthy);
    let (collaborators, _sink, _dispatch) = collaborators(vec![a.clone(), b.clone(), c.clone()]);

    let lifecycle = Lifecycle::new(test_config(), collaborators);
    assert_ok!(lifecycle.initialize().await);
    assert_eq!(lifecycle.status().overall, HealthStatus::Healthy);

    a.set(HealthStatus::Critical);
    let report = assert_ok!(lifecycle.check_now().await);
    assert_eq!(report.overall(), HealthStatus::Degraded);

    b.set(HealthStatus::Critical);
    let report = assert_ok!(lifecycle.check_now().await);
    assert_eq!(report.overall(), HealthStatus::Critical);
    assert_eq!(report.failed_checks().len(), 2);

    a.set(HealthStatus::Degraded);
    b.set(HealthStatus::Degraded);
    let report = assert_ok!(lifecycle.check_now().await);
    assert_eq!(report.overall(), HealthStatus::Degraded);

    a.set(HealthStatus::Unknown);
    b.set(HealthStatus::Unknown);
    let report = assert_ok!(lifecycle.check_now().await);
    assert_eq!(report.overall(), HealthStatus::Healthy);

    assert_eq!(
        lifecycle.current_health().map(|r| r.overall()),
        Some(HealthStatus::Healthy)
    );

    lifecycle.teardown().await;
}

#[tokio::test]
async fn test_alert_kept_when_sink_and_dispatch_are_down() {
    let a = ScriptedCheck::new("datastore", HealthStatus::Critical);
    let b = ScriptedCheck::new("local_storage", HealthStatus::Critical);
    let (collaborators, sink, dispatch) = collaborators(vec![a, b]);
    sink.set_failing(true);
    dispatch.set_failing(true);

    let lifecycle = Lifecycle::new(test_config(), collaborators);
    assert_ok!(lifecycle.initialize().await);

    let alerts = lifecycle.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].level, AlertLevel::Critical);
    assert_eq!(alerts[0].alert_type, "system_health");

    assert!(wait_for_condition(|| dispatch.sent().len() == 1, Duration::from_secs(2)).await);

    // A repeat within the cooldown folds into the same alert
    assert_ok!(lifecycle.check_now().await);
    let alerts = lifecycle.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].occurrences, 2);
    assert_eq!(sink.total_records(), 0);

    lifecycle.teardown().await;
}

#[tokio::test]
async fn test_resolve_alert_clears_active_list() {
    let a = ScriptedCheck::new("datastore", HealthStatus::Critical);
    let (collaborators, _sink, _dispatch) = collaborators(vec![a]);

    let lifecycle = Lifecycle::new(test_config(), collaborators);
    assert_ok!(lifecycle.initialize().await);

    let alerts = lifecycle.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert!(assert_ok!(lifecycle.resolve_alert(alerts[0].id)));
    assert!(lifecycle.active_alerts().is_empty());
    assert!(!assert_ok!(lifecycle.resolve_alert(uuid::Uuid::new_v4())));

    lifecycle.teardown().await;
}

#[tokio::test]
async fn test_violation_intake_keeps_latest_hundred() {
    let (collaborators, _sink, _dispatch) = collaborators(vec![]);
    let lifecycle = Lifecycle::new(test_config(), collaborators);
    assert_ok!(lifecycle.initialize().await);

    let reporter = assert_ok!(lifecycle.violation_reporter());
    for i in 0..150 {
        assert_ok!(reporter.report(CspViolation::new(
            "https://app.example.com/",
            "img-src",
            "img-src",
            format!("https://cdn.example.com/{}.png", i),
        )));
    }

    let drained = wait_for_condition(
        || {
            lifecycle
                .recent_violations(1)
                .first()
                .map(|v| v.blocked_uri.ends_with("/149.png"))
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(drained);

    let retained = lifecycle.recent_violations(1000);
    assert_eq!(retained.len(), 100);
    assert_eq!(retained[0].blocked_uri, "https://cdn.example.com/50.png");
    assert!(lifecycle.critical_violations().is_empty());

    lifecycle.teardown().await;
}

#[tokio::test]
async fn test_critical_violation_raises_alert() {
    let (collaborators, _sink, dispatch) = collaborators(vec![]);
    let lifecycle = Lifecycle::new(test_config(), collaborators);
    assert_ok!(lifecycle.initialize().await);

    let reporter = assert_ok!(lifecycle.violation_reporter());
    let body = r#"{"csp-report": {"document-uri": "https://app.example.com/", "violated-directive": "script-src", "blocked-uri": "inline"}}"#;
    assert_ok!(reporter.report_json(body));

    let raised = wait_for_condition(
        || {
            lifecycle
                .active_alerts()
                .iter()
                .any(|a| a.alert_type == "csp_violation" && a.level == AlertLevel::Critical)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(raised);
    assert_eq!(lifecycle.critical_violations().len(), 1);
    assert_eq!(lifecycle.status().critical_violations, 1);
    assert!(wait_for_condition(|| !dispatch.sent().is_empty(), Duration::from_secs(2)).await);

    lifecycle.teardown().await;
}

#[tokio::test]
async fn test_logged_message_is_redacted_end_to_end() {
    let (collaborators, sink, _dispatch) = collaborators(vec![]);
    let lifecycle = Lifecycle::new(test_config(), collaborators);
    assert_ok!(lifecycle.initialize().await);

    assert_ok!(lifecycle.log(
        LogLevel::Warn,
        LogCategory::Auth,
        "user password: s3cr3t, contact a@b.com",
        Some(json!({ "password": "hunter2", "attempt": 3 })),
        None,
    ));

    lifecycle.teardown().await;

    let records = sink.records(COLLECTION_SECURE_LOGS);
    let record = records
        .iter()
        .find(|r| r["category"] == "auth")
        .expect("auth entry flushed on teardown");
    assert_eq!(record["message"], "user password: [REDACTED], contact ***@b.com");
    assert_eq!(record["context"]["password"], "***REDACTED***");
    assert_eq!(record["context"]["attempt"], 3);

    let serialized = serde_json::to_string(&records).unwrap();
    assert!(!serialized.contains("s3cr3t"));
    assert!(!serialized.contains("hunter2"));
    assert!(!serialized.contains("a@b.com"));
}

#[tokio::test]
async fn test_teardown_twice_then_reinitialize() {
    let a = ScriptedCheck::new("datastore", HealthStatus::Healthy);
    let (collaborators, sink, _dispatch) = collaborators(vec![a]);
    let lifecycle = Lifecycle::new(test_config(), collaborators);

    assert_ok!(lifecycle.initialize().await);
    let first = lifecycle.pipeline().expect("pipeline while initialized");
    assert_ok!(lifecycle.log(LogLevel::Info, LogCategory::Ui, "page rendered", None, None));

    lifecycle.teardown().await;
    lifecycle.teardown().await;

    assert!(!lifecycle.is_initialized());
    assert!(first.is_destroyed());
    assert_eq!(lifecycle.status().overall, HealthStatus::Unknown);
    assert!(lifecycle.log(LogLevel::Info, LogCategory::Ui, "late", None, None).is_err());
    assert!(sink
        .records(COLLECTION_SECURE_LOGS)
        .iter()
        .any(|r| r["message"] == "page rendered"));

    assert_ok!(lifecycle.initialize().await);
    let second = lifecycle.pipeline().expect("pipeline after reinitialize");
    assert!(!std::sync::Arc::ptr_eq(&first, &second));
    lifecycle.teardown().await;
}

#[tokio::test]
async fn test_duplicate_check_names_rejected() {
    let a = ScriptedCheck::new("datastore", HealthStatus::Healthy);
    let b = ScriptedCheck::new("datastore", HealthStatus::Healthy);
    let (collaborators, _sink, _dispatch) = collaborators(vec![a, b]);
    let lifecycle = Lifecycle::new(test_config(), collaborators);

    let err = lifecycle.initialize().await.unwrap_err();
    assert_eq!(err.category(), "initialization");
    assert!(!lifecycle.is_initialized());
}

#[tokio::test]
async fn test_health_reports_persisted() {
    let a = ScriptedCheck::new("datastore", HealthStatus::Healthy);
    let (collaborators, sink, _dispatch) = collaborators(vec![a]);
    let lifecycle = Lifecycle::new(test_config(), collaborators);
    assert_ok!(lifecycle.initialize().await);

    let persisted = wait_for_condition(
        || !sink.records(COLLECTION_HEALTH_CHECK_REPORTS).is_empty(),
        Duration::from_secs(2),
    )
    .await;
    assert!(persisted);

    lifecycle.teardown().await;
}

#[tokio::test]
async fn test_supervised_failure_is_logged() {
    let (collaborators, sink, _dispatch) = collaborators(vec![]);
    let lifecycle = Lifecycle::new(test_config(), collaborators);
    assert_ok!(lifecycle.initialize().await);

    let handle = assert_ok!(lifecycle.spawn_supervised("sync", async {
        Err::<(), _>("upstream closed the stream")
    }));
    assert_ok!(handle.await);

    let alerts = lifecycle.active_alerts();
    assert!(alerts
        .iter()
        .any(|a| a.message == "Task sync failed: upstream closed the stream"
            && a.level == AlertLevel::Warning));

    lifecycle.teardown().await;
    assert!(sink
        .records(COLLECTION_SECURE_LOGS)
        .iter()
        .any(|r| r["level"] == "error" && r["category"] == "system"));
}

/// Auxiliary check that panics on every run
struct ExplodingCheck;

#[async_trait]
impl HealthCheck for ExplodingCheck {
    fn name(&self) -> &str {
        "object_storage"
    }

    fn kind(&self) -> DependencyKind {
        DependencyKind::Auxiliary
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn run(&self) -> vigil_core::Result<HealthCheckResult> {
        panic!("bucket listing exploded");
    }
}

#[tokio::test]
async fn test_panicking_auxiliary_check_stays_degraded() {
    let healthy = ScriptedCheck::new("datastore", HealthStatus::Healthy);
    let (mut collaborators, _sink, dispatch) = collaborators(vec![healthy]);
    collaborators.checks.push(Arc::new(ExplodingCheck));

    let lifecycle = Lifecycle::new(test_config(), collaborators);
    assert_ok!(lifecycle.initialize().await);

    for _ in 0..3 {
        let report = assert_ok!(lifecycle.check_now().await);
        let result = report
            .checks
            .iter()
            .find(|c| c.name == "object_storage")
            .expect("exploding check reported");
        assert_eq!(result.status, HealthStatus::Degraded);
        assert_eq!(report.overall(), HealthStatus::Healthy);
    }

    // Give any stray critical entry time to reach the alert path
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(lifecycle
        .active_alerts()
        .iter()
        .all(|a| a.level != AlertLevel::Critical));
    assert!(dispatch
        .sent()
        .iter()
        .all(|a| a.level != AlertLevel::Critical));

    lifecycle.teardown().await;
}

struct SignedIn;

impl SessionResolver for SignedIn {
    fn current_user_id(&self) -> Option<String> {
        Some("user-42".to_string())
    }
}

#[tokio::test]
async fn test_performance_sample_attributed_to_session_user() {
    let (collaborators, _sink, _dispatch) = collaborators(vec![]);
    let lifecycle = Lifecycle::new(test_config(), collaborators.with_session(Arc::new(SignedIn)));
    assert_ok!(lifecycle.initialize().await);

    assert_ok!(lifecycle.track_performance(PerformanceMetric::new("/api/orders", "GET", 120, 200)));
    assert_ok!(lifecycle.track_performance(
        PerformanceMetric::new("/api/admin", "POST", 80, 201).with_user("operator-7")
    ));

    let monitoring = lifecycle.monitoring().expect("monitoring while initialized");
    let samples = monitoring.recent_performance(10);
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].user_id.as_deref(), Some("user-42"));
    assert_eq!(samples[1].user_id.as_deref(), Some("operator-7"));

    lifecycle.teardown().await;
}

#[tokio::test]
async fn test_audio_whitelist_scoped_to_running_core() {
    let (collaborators, _sink, _dispatch) = collaborators(vec![]);
    let lifecycle = Lifecycle::new(test_config(), collaborators);
    assert!(lifecycle.whitelist_audio_source("https://media.example.com/").is_err());

    assert_ok!(lifecycle.initialize().await);
    assert_ok!(lifecycle.whitelist_audio_source("https://media.example.com/"));
    assert!(lifecycle.is_audio_source_whitelisted("https://media.example.com/alerts/chime.ogg"));

    lifecycle.teardown().await;
    assert!(!lifecycle.is_audio_source_whitelisted("https://media.example.com/alerts/chime.ogg"));
}
