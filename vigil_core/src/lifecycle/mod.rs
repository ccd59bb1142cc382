//! Lifecycle manager: wiring, background tasks and teardown
//!
//! `Lifecycle` owns every component. Components are built bottom-up on
//! `initialize` and torn down on `teardown`; both are idempotent and
//! serialized against each other.

pub mod connectivity;
pub mod hooks;

pub use connectivity::{spawn_connectivity_watcher, NetworkProbe, TcpProbe};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VigilConfig;
use crate::dispatch::{Dispatch, LogDispatch};
use crate::health::{HealthAggregator, HealthCheck, HealthStatus, SystemHealthReport};
use crate::logging::{LogCategory, LogLevel, LogPipeline, NoSession, SessionResolver};
use crate::monitoring::service::MonitoringSettings;
use crate::monitoring::{MonitoringService, PerformanceMetric, SecurityAlert};
use crate::sink::{GuardedSink, Sink};
use crate::violations::{CspViolation, ViolationIntake};
use crate::{Environment, Result, VigilError};

/// Queue depth between violation reporters and the intake
const VIOLATION_QUEUE_DEPTH: usize = 256;

/// External collaborators supplied by the host
pub struct Collaborators {
    pub sink: Arc<dyn Sink>,
    pub dispatch: Arc<dyn Dispatch>,
    pub checks: Vec<Arc<dyn HealthCheck>>,
    pub session: Arc<dyn SessionResolver>,
    pub network: Option<Arc<dyn NetworkProbe>>,
}

impl Collaborators {
    /// Collaborators with log-only dispatch, no checks and no session
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            dispatch: Arc::new(LogDispatch),
            checks: Vec::new(),
            session: Arc::new(NoSession),
            network: None,
        }
    }

    pub fn with_dispatch(mut self, dispatch: Arc<dyn Dispatch>) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_checks(mut self, checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        self.checks.extend(checks);
        self
    }

    pub fn with_session(mut self, session: Arc<dyn SessionResolver>) -> Self {
        self.session = session;
        self
    }

    /// Watch this probe for online/offline transitions
    pub fn with_network(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.network = Some(probe);
        self
    }
}

/// Point-in-time snapshot for external query
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub initialized: bool,
    pub environment: Environment,
    pub overall: HealthStatus,
    pub health: Option<SystemHealthReport>,
    pub critical_violations: usize,
    pub active_alerts: usize,
    pub pending_log_entries: usize,
    pub dropped_log_entries: u64,
}

/// Handle for feeding policy violations into a running core
#[derive(Clone)]
pub struct ViolationReporter {
    tx: mpsc::Sender<CspViolation>,
}

impl ViolationReporter {
    /// Queue a violation without waiting
    pub fn report(&self, violation: CspViolation) -> Result<()> {
        self.tx.try_send(violation).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => VigilError::internal("violation queue full"),
            mpsc::error::TrySendError::Closed(_) => {
                VigilError::initialization("monitoring core is not running")
            }
        })
    }

    /// Parse a browser report body and queue it
    pub fn report_json(&self, body: &str) -> Result<()> {
        self.report(CspViolation::from_report_json(body)?)
    }
}

/// Everything built by one `initialize`
struct Components {
    pipeline: Arc<LogPipeline>,
    monitoring: Arc<MonitoringService>,
    intake: Arc<ViolationIntake>,
    reporter: ViolationReporter,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Components {
    /// Cancel the background tasks, wait for them, then flush
    async fn shutdown(&self) {
        self.token.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.pipeline.destroy().await;
        hooks::clear_target(&self.pipeline);
    }
}

/// Owns and wires the monitoring core
pub struct Lifecycle {
    config: VigilConfig,
    collaborators: Collaborators,
    state: RwLock<Option<Arc<Components>>>,
    transition: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
}

impl Lifecycle {
    pub fn new(config: VigilConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            state: RwLock::new(None),
            transition: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Build and start every component
    ///
    /// Runs one health cycle before returning, so `current_health` is never
    /// empty once this succeeds. Calling it again while initialized does
    /// nothing.
    pub async fn initialize(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        if self.state.read().is_some() {
            debug!("Already initialized");
            return Ok(());
        }

        self.config.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|e| VigilError::initialization(format!("a tokio runtime is required: {}", e)))?;
        self.validate_checks()?;

        info!(
            environment = %self.config.environment,
            checks = self.collaborators.checks.len(),
            "Initializing monitoring core"
        );

        let components = Arc::new(self.build());

        if let Err(e) = self.start(&components).await {
            components.shutdown().await;
            return Err(e);
        }

        *self.state.write() = Some(components.clone());
        self.initialized.store(true, Ordering::SeqCst);
        components
            .pipeline
            .info(LogCategory::System, "Monitoring core initialized");
        Ok(())
    }

    /// Stop everything and flush; safe to call repeatedly
    pub async fn teardown(&self) {
        let _transition = self.transition.lock().await;
        let taken = self.state.write().take();
        self.initialized.store(false, Ordering::SeqCst);

        let Some(components) = taken else {
            return;
        };

        info!("Tearing down monitoring core");
        components.shutdown().await;
        info!("Monitoring core stopped");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn environment(&self) -> Environment {
        self.config.environment
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    /// Snapshot of health, alerts, violations and log backlog
    pub fn status(&self) -> SystemStatus {
        let components = self.components();
        let health = components.as_ref().and_then(|c| c.monitoring.current_health());

        SystemStatus {
            initialized: self.is_initialized(),
            environment: self.config.environment,
            overall: health
                .as_ref()
                .map(|h| h.overall())
                .unwrap_or(HealthStatus::Unknown),
            health,
            critical_violations: components
                .as_ref()
                .map(|c| c.intake.critical_count())
                .unwrap_or(0),
            active_alerts: components
                .as_ref()
                .map(|c| c.monitoring.active_alerts().len())
                .unwrap_or(0),
            pending_log_entries: components.as_ref().map(|c| c.pipeline.pending()).unwrap_or(0),
            dropped_log_entries: components
                .as_ref()
                .map(|c| c.pipeline.dropped_entries())
                .unwrap_or(0),
        }
    }

    /// Last completed health report
    pub fn current_health(&self) -> Option<SystemHealthReport> {
        self.components().and_then(|c| c.monitoring.current_health())
    }

    /// Force a fresh health cycle
    pub async fn check_now(&self) -> Result<SystemHealthReport> {
        let components = self.require()?;
        Ok(components.monitoring.check_now().await)
    }

    pub fn active_alerts(&self) -> Vec<SecurityAlert> {
        self.components()
            .map(|c| c.monitoring.active_alerts())
            .unwrap_or_default()
    }

    pub fn resolve_alert(&self, id: Uuid) -> Result<bool> {
        Ok(self.require()?.monitoring.resolve_alert(id))
    }

    pub fn recent_violations(&self, n: usize) -> Vec<CspViolation> {
        self.components()
            .map(|c| c.intake.recent_violations(n))
            .unwrap_or_default()
    }

    pub fn critical_violations(&self) -> Vec<CspViolation> {
        self.components()
            .map(|c| c.intake.critical_violations())
            .unwrap_or_default()
    }

    /// Record a structured log event
    pub fn log(
        &self,
        level: LogLevel,
        category: LogCategory,
        message: &str,
        context: Option<Value>,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) -> Result<Uuid> {
        Ok(self.require()?.pipeline.log(level, category, message, context, error))
    }

    /// Record a request timing, attributed to the session user when unset
    pub fn track_performance(&self, metric: PerformanceMetric) -> Result<()> {
        let components = self.require()?;
        let metric = match (&metric.user_id, self.collaborators.session.current_user_id()) {
            (None, Some(user)) => metric.with_user(user),
            _ => metric,
        };
        components.monitoring.track_performance(metric);
        Ok(())
    }

    /// Trust audio served from `source` for the running core
    pub fn whitelist_audio_source(&self, source: &str) -> Result<()> {
        self.require()?.intake.whitelist_audio_source(source);
        Ok(())
    }

    pub fn is_audio_source_whitelisted(&self, source: &str) -> bool {
        self.components()
            .map(|c| c.intake.is_audio_source_whitelisted(source))
            .unwrap_or(false)
    }

    /// Handle for reporting policy violations
    pub fn violation_reporter(&self) -> Result<ViolationReporter> {
        Ok(self.require()?.reporter.clone())
    }

    /// Log pipeline of the running core
    pub fn pipeline(&self) -> Option<Arc<LogPipeline>> {
        self.components().map(|c| c.pipeline.clone())
    }

    /// Monitoring service of the running core
    pub fn monitoring(&self) -> Option<Arc<MonitoringService>> {
        self.components().map(|c| c.monitoring.clone())
    }

    /// Spawn a task whose failure or panic is logged through the pipeline
    pub fn spawn_supervised<F, T, E>(&self, name: &str, future: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let components = self.require()?;
        Ok(hooks::supervise(Arc::downgrade(&components.pipeline), name, future))
    }

    fn components(&self) -> Option<Arc<Components>> {
        self.state.read().clone()
    }

    fn require(&self) -> Result<Arc<Components>> {
        self.components()
            .ok_or_else(|| VigilError::initialization("monitoring core is not initialized"))
    }

    fn validate_checks(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for check in &self.collaborators.checks {
            if !seen.insert(check.name().to_string()) {
                return Err(VigilError::initialization(format!(
                    "duplicate health check name: {}",
                    check.name()
                )));
            }
        }
        Ok(())
    }

    fn build(&self) -> Components {
        let sink: Arc<dyn Sink> = Arc::new(GuardedSink::new(self.collaborators.sink.clone()));

        let aggregator = Arc::new(HealthAggregator::new(
            self.collaborators.checks.clone(),
            sink.clone(),
        ));
        let monitoring = Arc::new(MonitoringService::new(
            aggregator,
            sink.clone(),
            self.collaborators.dispatch.clone(),
            MonitoringSettings::from_config(&self.config),
        ));
        let pipeline = Arc::new(LogPipeline::new(
            self.config.logging.clone(),
            self.config.environment,
            monitoring.clone(),
            sink,
            self.collaborators.session.clone(),
        ));
        let intake = Arc::new(ViolationIntake::new(
            self.config.violations.capacity,
            monitoring.clone(),
        ));

        let (tx, rx) = mpsc::channel(VIOLATION_QUEUE_DEPTH);
        let token = CancellationToken::new();
        let listener = spawn_violation_listener(intake.clone(), rx, token.clone());

        Components {
            pipeline,
            monitoring,
            intake,
            reporter: ViolationReporter { tx },
            token,
            tasks: Mutex::new(vec![listener]),
        }
    }

    async fn start(&self, components: &Arc<Components>) -> Result<()> {
        let report = components.monitoring.perform_health_check().await;
        info!(overall = %report.overall(), "Initial health check complete");

        components.pipeline.start();

        let mut tasks = vec![components
            .monitoring
            .spawn_health_loop(components.token.clone())];

        if let Some(probe) = &self.collaborators.network {
            tasks.push(spawn_connectivity_watcher(
                probe.clone(),
                std::time::Duration::from_secs(self.config.network.poll_interval_secs),
                components.pipeline.clone(),
                components.token.clone(),
            ));
        }
        components.tasks.lock().extend(tasks);

        if std::thread::panicking() {
            return Err(VigilError::initialization(
                "cannot install process hooks while panicking",
            ));
        }
        hooks::install_panic_hook(self.config.hooks.suppress_default_panic_output);
        hooks::set_target(&components.pipeline);

        Ok(())
    }
}

fn spawn_violation_listener(
    intake: Arc<ViolationIntake>,
    mut rx: mpsc::Receiver<CspViolation>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                violation = rx.recv() => match violation {
                    Some(violation) => {
                        intake.on_violation(violation);
                    }
                    None => break,
                },
            }
        }
        debug!("Violation listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn config() -> VigilConfig {
        let mut config = VigilConfig::default();
        config.environment = Environment::Testing;
        config.logging.mirror_local = Some(false);
        config
    }

    #[tokio::test]
    async fn test_uninitialized_queries() {
        let lifecycle = Lifecycle::new(config(), Collaborators::new(Arc::new(MemorySink::new())));

        assert!(!lifecycle.status().initialized);
        assert_eq!(lifecycle.status().overall, HealthStatus::Unknown);
        assert!(lifecycle.current_health().is_none());
        assert!(lifecycle.check_now().await.is_err());
        assert!(lifecycle.log(LogLevel::Info, LogCategory::Ui, "x", None, None).is_err());
        assert!(lifecycle.active_alerts().is_empty());

        // Teardown without initialize is fine
        lifecycle.teardown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_fails_initialize() {
        let mut config = config();
        config.logging.buffer_size = 0;
        let lifecycle = Lifecycle::new(config, Collaborators::new(Arc::new(MemorySink::new())));

        let err = lifecycle.initialize().await.unwrap_err();
        assert_eq!(err.category(), "config");
        assert!(!lifecycle.is_initialized());
        lifecycle.teardown().await;
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let lifecycle = Lifecycle::new(config(), Collaborators::new(Arc::new(MemorySink::new())));
        lifecycle.initialize().await.unwrap();
        let first = lifecycle.pipeline().unwrap();
        lifecycle.initialize().await.unwrap();

        assert!(Arc::ptr_eq(&first, &lifecycle.pipeline().unwrap()));
        assert!(lifecycle.status().initialized);
        assert_eq!(lifecycle.status().overall, HealthStatus::Healthy);
        assert!(hooks::is_installed());

        lifecycle.teardown().await;
        assert!(first.is_destroyed());
    }
}
