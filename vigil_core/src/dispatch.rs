//! Outbound alert notification

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::AlertingConfig;
use crate::monitoring::{AlertLevel, SecurityAlert};
use crate::{Result, VigilError, SYSTEM_NAME};

/// Notification channel for raised alerts
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Deliver one alert
    async fn send(&self, alert: &SecurityAlert) -> Result<()>;

    /// Channel name for diagnostics
    fn channel(&self) -> &'static str;
}

/// Dispatch that only writes the alert to the process log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatch;

#[async_trait]
impl Dispatch for LogDispatch {
    async fn send(&self, alert: &SecurityAlert) -> Result<()> {
        match alert.level {
            AlertLevel::Critical => error!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                occurrences = alert.occurrences,
                "CRITICAL alert: {}",
                alert.message
            ),
            AlertLevel::Warning => warn!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "Warning alert: {}",
                alert.message
            ),
            AlertLevel::Info => info!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "Alert: {}",
                alert.message
            ),
        }
        Ok(())
    }

    fn channel(&self) -> &'static str {
        "log"
    }
}

/// Dispatch that POSTs the alert JSON to every configured webhook
pub struct WebhookDispatch {
    client: reqwest::Client,
    urls: Vec<Url>,
}

impl WebhookDispatch {
    /// Create a webhook dispatch with the given endpoints and request timeout
    pub fn new(urls: Vec<Url>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, urls })
    }

    /// Build from alerting settings
    pub fn from_config(config: &AlertingConfig) -> Result<Self> {
        let urls = config
            .webhook_urls
            .iter()
            .map(|raw| {
                Url::parse(raw).map_err(|e| VigilError::dispatch("webhook".to_string(), format!("{}: {}", raw, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(urls, Duration::from_secs(config.request_timeout_secs))
    }

    /// Configured endpoints
    pub fn urls(&self) -> &[Url] {
        &self.urls
    }
}

#[async_trait]
impl Dispatch for WebhookDispatch {
    async fn send(&self, alert: &SecurityAlert) -> Result<()> {
        let body = json!({
            "system": SYSTEM_NAME,
            "alert": alert,
        });

        let mut failures = Vec::new();
        for url in &self.urls {
            let outcome = self
                .client
                .post(url.clone())
                .json(&body)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match outcome {
                Ok(_) => debug!(url = %url, alert_id = %alert.id, "Alert delivered"),
                Err(e) => failures.push(format!("{}: {}", url, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(VigilError::dispatch("webhook".to_string(), failures.join("; ")))
        }
    }

    fn channel(&self) -> &'static str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn test_log_dispatch_always_succeeds() {
        let alert = SecurityAlert::new(AlertLevel::Critical, "security", "breach", Value::Null);
        assert!(LogDispatch.send(&alert).await.is_ok());
    }

    #[test]
    fn test_webhook_from_config_rejects_bad_url() {
        let mut config = AlertingConfig::default();
        config.webhook_urls = vec!["::nope".to_string()];
        assert!(WebhookDispatch::from_config(&config).is_err());

        config.webhook_urls = vec!["https://hooks.example.com/alerts".to_string()];
        let dispatch = WebhookDispatch::from_config(&config).unwrap();
        assert_eq!(dispatch.urls().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_reports_unreachable_endpoint() {
        let dispatch = WebhookDispatch::new(
            vec![Url::parse("http://127.0.0.1:9/alerts").unwrap()],
            Duration::from_millis(500),
        )
        .unwrap();
        let alert = SecurityAlert::new(AlertLevel::Warning, "performance", "slow", Value::Null);

        let err = dispatch.send(&alert).await.unwrap_err();
        assert_eq!(err.category(), "dispatch");
    }
}
