//! Health check contract and the provided checks

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::config::HealthConfig;
use crate::health::status::{HealthCheckResult, HealthStatus};
use crate::lifecycle::connectivity::NetworkProbe;
use crate::{Result, VigilError};

/// How much a dependency matters to the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// The system cannot work without it
    Essential,

    /// The system works, impaired, without it
    Auxiliary,
}

impl DependencyKind {
    /// Status recorded when a check of this kind fails outright
    pub fn failure_status(&self) -> HealthStatus {
        match self {
            DependencyKind::Essential => HealthStatus::Critical,
            DependencyKind::Auxiliary => HealthStatus::Degraded,
        }
    }
}

/// A named health check
///
/// Errors returned from `run` are converted by the aggregator into a
/// failure result according to `kind`.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Check name, unique within an aggregator
    fn name(&self) -> &str;

    /// Dependency kind
    fn kind(&self) -> DependencyKind;

    /// Time allowed before the check counts as degraded
    fn timeout(&self) -> Duration;

    /// Run the check once
    async fn run(&self) -> Result<HealthCheckResult>;
}

/// Answer from a collaborator ping
#[derive(Debug, Clone, Default)]
pub struct PingOutcome {
    /// Whether the collaborator answered positively
    pub ok: bool,

    /// Message from the collaborator
    pub message: String,

    /// Additional details
    pub details: Map<String, Value>,
}

impl PingOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn negative(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            details: Map::new(),
        }
    }
}

/// Opaque round-trip to an external collaborator
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self) -> Result<PingOutcome>;
}

/// Latency thresholds that downgrade an otherwise-healthy answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyPolicy {
    /// At or above this the result is degraded
    pub degraded_ms: u64,

    /// Above this the degraded result carries a warning
    pub warning_ms: Option<u64>,
}

impl LatencyPolicy {
    pub fn new(degraded_ms: u64, warning_ms: Option<u64>) -> Self {
        Self {
            degraded_ms,
            warning_ms,
        }
    }

    /// Classify a round-trip; never worse than degraded
    pub fn classify(&self, latency_ms: u64) -> (HealthStatus, Option<&'static str>) {
        match self.warning_ms {
            Some(warning) if latency_ms > warning => {
                (HealthStatus::Degraded, Some("Very slow response"))
            }
            _ if latency_ms >= self.degraded_ms => (HealthStatus::Degraded, Some("Slow response")),
            _ => (HealthStatus::Healthy, None),
        }
    }
}

/// Health check around any [`Pinger`]
pub struct PingCheck {
    name: String,
    kind: DependencyKind,
    timeout: Duration,
    policy: LatencyPolicy,
    negative_is_healthy: bool,
    pinger: Arc<dyn Pinger>,
}

impl PingCheck {
    /// Create a check with explicit settings
    pub fn new(
        name: impl Into<String>,
        kind: DependencyKind,
        timeout: Duration,
        policy: LatencyPolicy,
        pinger: Arc<dyn Pinger>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            timeout,
            policy,
            negative_is_healthy: false,
            pinger,
        }
    }

    /// Treat a negative answer as proof the collaborator is reachable
    pub fn negative_is_healthy(mut self) -> Self {
        self.negative_is_healthy = true;
        self
    }

    /// Primary datastore
    pub fn datastore(pinger: Arc<dyn Pinger>, config: &HealthConfig) -> Self {
        Self::new(
            "datastore",
            DependencyKind::Essential,
            config.default_timeout(),
            LatencyPolicy::new(config.datastore_degraded_ms, Some(config.datastore_warning_ms)),
            pinger,
        )
    }

    /// Authentication session service
    pub fn auth_session(pinger: Arc<dyn Pinger>, config: &HealthConfig) -> Self {
        Self::new(
            "auth_session",
            DependencyKind::Auxiliary,
            config.default_timeout(),
            LatencyPolicy::new(config.secondary_degraded_ms, None),
            pinger,
        )
    }

    /// Object storage listing
    pub fn object_storage(pinger: Arc<dyn Pinger>, config: &HealthConfig) -> Self {
        Self::new(
            "object_storage",
            DependencyKind::Auxiliary,
            config.default_timeout(),
            LatencyPolicy::new(config.secondary_degraded_ms, None),
            pinger,
        )
    }

    /// Serverless functions; any answer, even an error body, means available
    pub fn functions(pinger: Arc<dyn Pinger>, config: &HealthConfig) -> Self {
        Self::new(
            "functions",
            DependencyKind::Auxiliary,
            config.default_timeout(),
            LatencyPolicy::new(config.secondary_degraded_ms, None),
            pinger,
        )
        .negative_is_healthy()
    }

    /// Realtime subscription; no subscription within the timeout is degraded
    pub fn realtime(pinger: Arc<dyn Pinger>, config: &HealthConfig) -> Self {
        Self::new(
            "realtime",
            DependencyKind::Auxiliary,
            Duration::from_millis(config.realtime_timeout_ms),
            LatencyPolicy::new(config.secondary_degraded_ms, None),
            pinger,
        )
    }
}

#[async_trait]
impl HealthCheck for PingCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DependencyKind {
        self.kind
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let outcome = self.pinger.ping().await?;
        let latency = start.elapsed();
        let latency_ms = latency.as_millis() as u64;

        let (status, message) = if outcome.ok {
            match self.policy.classify(latency_ms) {
                (status, Some(note)) => (status, format!("{} ({} ms)", note, latency_ms)),
                (status, None) => (status, outcome.message.clone()),
            }
        } else if self.negative_is_healthy {
            (
                HealthStatus::Healthy,
                format!("Reachable, responded: {}", outcome.message),
            )
        } else {
            (self.kind.failure_status(), outcome.message.clone())
        };

        let mut result = HealthCheckResult::new(self.name.clone(), status, message).with_latency(latency);
        result.details = outcome.details;
        Ok(result)
    }
}

/// Datastore ping over a Postgres pool
pub struct PgPinger {
    pool: PgPool,
}

impl PgPinger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Pinger for PgPinger {
    async fn ping(&self) -> Result<PingOutcome> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        let mut outcome = PingOutcome::ok("Database connection successful");
        outcome
            .details
            .insert("pool_size".to_string(), Value::from(self.pool.size()));
        Ok(outcome)
    }
}

/// Write, read back and remove a scratch file
pub struct LocalStorageCheck {
    dir: PathBuf,
    timeout: Duration,
}

impl LocalStorageCheck {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    /// Use the configured scratch directory, or the system temp directory
    pub fn from_config(config: &HealthConfig) -> Self {
        let dir = config
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        Self::new(dir, config.default_timeout())
    }
}

#[async_trait]
impl HealthCheck for LocalStorageCheck {
    fn name(&self) -> &str {
        "local_storage"
    }

    fn kind(&self) -> DependencyKind {
        DependencyKind::Essential
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let token = Uuid::new_v4().to_string();
        let path = self.dir.join(format!(".vigil-health-{}", token));

        tokio::fs::write(&path, token.as_bytes()).await?;
        let read_back = tokio::fs::read_to_string(&path).await;
        let removed = tokio::fs::remove_file(&path).await;
        let read_back = read_back?;
        removed?;

        if read_back != token {
            return Err(VigilError::check("local_storage", "scratch file read back different contents"));
        }

        debug!(dir = %self.dir.display(), "Local storage round-trip ok");
        Ok(
            HealthCheckResult::healthy(self.name(), "Local storage available")
                .with_latency(start.elapsed())
                .with_detail("dir", self.dir.display().to_string()),
        )
    }
}

/// Reachability of the network
pub struct NetworkCheck {
    probe: Arc<dyn NetworkProbe>,
    timeout: Duration,
}

impl NetworkCheck {
    pub fn new(probe: Arc<dyn NetworkProbe>, timeout: Duration) -> Self {
        Self { probe, timeout }
    }
}

#[async_trait]
impl HealthCheck for NetworkCheck {
    fn name(&self) -> &str {
        "network"
    }

    fn kind(&self) -> DependencyKind {
        DependencyKind::Essential
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let result = match self.probe.is_online().await {
            Ok(true) => HealthCheckResult::healthy("network", "Online"),
            Ok(false) => HealthCheckResult::critical("network", "Offline"),
            Err(e) => HealthCheckResult::unknown("network", "Network status could not be determined")
                .with_detail("error", e.to_string()),
        };
        Ok(result.with_latency(start.elapsed()))
    }
}
