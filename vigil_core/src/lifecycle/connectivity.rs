//! Network reachability probe and online/offline watcher

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::logging::{LogCategory, LogPipeline};
use crate::{Result, VigilError};

/// Answers whether the host currently has network access
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_online(&self) -> Result<bool>;
}

/// Probe that dials a TCP address
///
/// A completed or refused connection means the network is up; a timeout or
/// any other connect error means it is down.
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            config.probe_address.clone(),
            Duration::from_millis(config.probe_timeout_ms),
        )
    }
}

#[async_trait]
impl NetworkProbe for TcpProbe {
    async fn is_online(&self) -> Result<bool> {
        let valid = self
            .address
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Err(VigilError::check(
                "network".to_string(),
                format!("invalid probe address: {}", self.address),
            ));
        }

        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Ok(true),
            Ok(Err(e)) => {
                debug!(address = %self.address, error = %e, "Network probe failed");
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }
}

/// Poll the probe and log online/offline transitions
///
/// The first observation is logged only when offline. Probe errors are
/// ignored and do not count as a transition.
pub fn spawn_connectivity_watcher(
    probe: Arc<dyn NetworkProbe>,
    poll_interval: Duration,
    pipeline: Arc<LogPipeline>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last: Option<bool> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let outcome = tokio::select! {
                _ = token.cancelled() => break,
                outcome = probe.is_online() => outcome,
            };

            let online = match outcome {
                Ok(online) => online,
                Err(e) => {
                    debug!(error = %e, "Network status unknown");
                    continue;
                }
            };

            match (last, online) {
                (Some(false), true) => {
                    pipeline.info(LogCategory::Network, "Network connection restored, back online");
                }
                (Some(true), false) | (None, false) => {
                    pipeline.warn(LogCategory::Network, "Network connection lost, offline");
                }
                _ => {}
            }
            last = Some(online);
        }

        debug!("Connectivity watcher stopped");
    })
}
