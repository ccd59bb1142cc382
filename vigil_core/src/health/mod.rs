//! Health checks and system-wide health aggregation

pub mod aggregator;
pub mod checks;
pub mod status;

pub use aggregator::HealthAggregator;
pub use checks::{
    DependencyKind, HealthCheck, LatencyPolicy, LocalStorageCheck, NetworkCheck, PgPinger, PingCheck,
    PingOutcome, Pinger,
};
pub use status::{escalate, HealthCheckResult, HealthStatus, SystemHealthReport};
