//! Webhook alarm channel
//!
//! Posts each alarm as JSON to an HTTP endpoint.
//!
//! # Payload
//!
//! ```json
//! {
//!   "id": "9b2c…",
//!   "kind": "task_stop",
//!   "task_id": "orders_sync",
//!   "swimlane_id": "lane-0",
//!   "title": "Task stopped",
//!   "message": "loader rejected batch",
//!   "recipients": ["dba-oncall"],
//!   "metadata": {"node": "n1"},
//!   "created_at": "2026-01-01T12:00:00Z"
//! }
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{Channel, ChannelError, ChannelResult, DeliveryStatus};
use crate::notifications::Alarm;

/// Webhook endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Sent as a Bearer token
    pub auth_token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first attempt
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles on every further retry
    #[serde(default = "default_backoff")]
    pub backoff_base_ms: u64,
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

fn default_backoff() -> u64 {
    1000
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            max_retries: default_retries(),
            backoff_base_ms: default_backoff(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_base_ms(mut self, backoff_base_ms: u64) -> Self {
        self.backoff_base_ms = backoff_base_ms;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Webhook URL cannot be empty".to_string());
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("Webhook URL must start with http:// or https://".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }
        Ok(())
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Delivers alarms with HTTP POST, retrying server errors and transport
/// failures with exponential backoff
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> ChannelResult<Self> {
        config.validate().map_err(ChannelError::InvalidConfig)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChannelError::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    pub fn from_url(url: impl Into<String>) -> ChannelResult<Self> {
        Self::new(WebhookConfig::new(url))
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn build_payload(&self, alarm: &Alarm) -> serde_json::Value {
        serde_json::json!({
            "id": alarm.id,
            "kind": alarm.kind.as_str(),
            "task_id": alarm.task_id,
            "swimlane_id": alarm.swimlane_id,
            "title": alarm.title,
            "message": alarm.message,
            "recipients": alarm.recipients,
            "metadata": alarm.metadata,
            "created_at": alarm.created_at.to_rfc3339(),
        })
    }

    async fn send_with_retry(&self, payload: &serde_json::Value) -> ChannelResult<()> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
                tracing::debug!(
                    attempt = attempt + 1,
                    max_attempts = self.config.max_retries + 1,
                    "Retrying webhook request"
                );
            }

            let mut request = self.client.post(&self.config.url);
            if let Some(token) = &self.config.auth_token {
                request = request.bearer_auth(token);
            }
            for (key, value) in &self.config.headers {
                request = request.header(key, value);
            }

            match request.json(payload).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(url = %self.config.url, status = %response.status(), "Webhook delivered");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unable to read response body".to_string());
                    last_error = Some(ChannelError::Other(format!("HTTP {status}: {body}")));

                    // 4xx will not improve on retry
                    if status.is_client_error() {
                        break;
                    }
                }
                Err(e) => last_error = Some(ChannelError::HttpError(e)),
            }
        }

        Err(last_error.unwrap_or_else(|| ChannelError::Other("Unknown error".to_string())))
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alarm: &Alarm) -> ChannelResult<DeliveryStatus> {
        let payload = self.build_payload(alarm);

        match self.send_with_retry(&payload).await {
            Ok(()) => Ok(DeliveryStatus::success_with_message(
                "webhook",
                format!("Delivered to {}", self.config.url),
            )),
            Err(e) => {
                tracing::error!(url = %self.config.url, alarm_id = %alarm.id, error = %e, "Webhook delivery failed");
                Ok(DeliveryStatus::failure("webhook", e.to_string()))
            }
        }
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "url": self.config.url,
            "timeout_secs": self.config.timeout_secs,
            "max_retries": self.config.max_retries,
            "has_auth": self.config.auth_token.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::AlarmKind;

    #[test]
    fn test_webhook_config_validation() {
        assert!(WebhookConfig::new("https://example.com/hook").validate().is_ok());
        assert!(WebhookConfig::new("").validate().is_err());
        assert!(WebhookConfig::new("example.com/hook").validate().is_err());
        assert!(WebhookConfig::new("https://example.com")
            .with_timeout(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = WebhookConfig::new("https://example.com").with_backoff_base_ms(100);
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_from_url() {
        let channel = WebhookChannel::from_url("https://example.com/alarms").unwrap();
        assert_eq!(channel.name(), "webhook");
        assert_eq!(channel.url(), "https://example.com/alarms");
        assert!(WebhookChannel::from_url("not-a-url").is_err());
    }

    #[test]
    fn test_payload() {
        let channel = WebhookChannel::from_url("https://example.com/hook").unwrap();
        let alarm = Alarm::task(AlarmKind::TaskStop, "T1", "S1", "Task stopped", "bad row")
            .with_recipients(vec!["dba".to_string()]);

        let payload = channel.build_payload(&alarm);
        assert_eq!(payload["kind"], "task_stop");
        assert_eq!(payload["task_id"], "T1");
        assert_eq!(payload["swimlane_id"], "S1");
        assert_eq!(payload["recipients"][0], "dba");
        assert!(payload["created_at"].is_string());
    }

    #[test]
    fn test_config_serialization_defaults() {
        let config: WebhookConfig =
            serde_json::from_str(r#"{"url":"https://example.com","auth_token":null}"#).unwrap();
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_base_ms, 1000);
    }
}
