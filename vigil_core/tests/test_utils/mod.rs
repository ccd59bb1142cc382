//! Test utilities and helpers
//!
//! Scripted collaborators and fixtures shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vigil_core::health::{DependencyKind, HealthCheck, HealthCheckResult, HealthStatus};
use vigil_core::{
    AlertSink, Collaborators, Dispatch, Environment, LogCategory, LogLevel, MemorySink, Result,
    SecurityAlert, VigilConfig, VigilError,
};

/// Configuration for tests: no mirroring, short cooldown, slow timers
pub fn test_config() -> VigilConfig {
    let mut config = VigilConfig::default();
    config.environment = Environment::Testing;
    config.logging.mirror_local = Some(false);
    config.logging.flush_interval_ms = 60_000;
    config.health.check_interval_secs = 3_600;
    config
}

/// Health check whose status can be changed between cycles
pub struct ScriptedCheck {
    name: String,
    kind: DependencyKind,
    status: Mutex<HealthStatus>,
}

impl ScriptedCheck {
    pub fn new(name: &str, status: HealthStatus) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind: DependencyKind::Essential,
            status: Mutex::new(status),
        })
    }

    pub fn set(&self, status: HealthStatus) {
        *self.status.lock() = status;
    }
}

#[async_trait]
impl HealthCheck for ScriptedCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DependencyKind {
        self.kind
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn run(&self) -> Result<HealthCheckResult> {
        let status = *self.status.lock();
        Ok(HealthCheckResult::new(self.name.clone(), status, format!("scripted {}", status)))
    }
}

/// Dispatch that records every alert and can be told to fail
#[derive(Default)]
pub struct RecordingDispatch {
    sent: Mutex<Vec<SecurityAlert>>,
    failing: AtomicBool,
}

impl RecordingDispatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SecurityAlert> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Dispatch for RecordingDispatch {
    async fn send(&self, alert: &SecurityAlert) -> Result<()> {
        self.sent.lock().push(alert.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(VigilError::dispatch("recording", "endpoint unreachable"));
        }
        Ok(())
    }

    fn channel(&self) -> &'static str {
        "recording"
    }
}

/// Alert sink that only remembers what was raised
#[derive(Default)]
pub struct RecordingAlerts {
    pub raised: Mutex<Vec<(LogLevel, LogCategory, String)>>,
}

impl AlertSink for RecordingAlerts {
    fn raise(&self, level: LogLevel, category: LogCategory, message: &str, _metadata: Value) {
        self.raised.lock().push((level, category, message.to_string()));
    }
}

/// Collaborators over a memory sink and a recording dispatch
pub fn collaborators(
    checks: Vec<Arc<ScriptedCheck>>,
) -> (Collaborators, Arc<MemorySink>, Arc<RecordingDispatch>) {
    let sink = Arc::new(MemorySink::new());
    let dispatch = RecordingDispatch::new();
    let collaborators = Collaborators::new(sink.clone())
        .with_dispatch(dispatch.clone())
        .with_checks(
            checks
                .into_iter()
                .map(|c| c as Arc<dyn HealthCheck>)
                .collect(),
        );
    (collaborators, sink, dispatch)
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_for_condition<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
