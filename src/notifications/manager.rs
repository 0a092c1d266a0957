//! Notification manager for alarm fan-out

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::channels::Channel;
use super::{Alarm, AlarmSink};
use crate::config::AlarmConfig;

/// Deduplicating [`AlarmSink`] that delivers to every registered channel
pub struct NotificationManager {
    /// Registered notification channels
    channels: Vec<Arc<dyn Channel>>,

    /// Deduplication: last delivery time per alarm key
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,

    /// Minimum time between duplicate alarms
    dedup_window: Duration,

    /// Recipients appended to every alarm
    default_recipients: Vec<String>,
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationManager {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            last_sent: Mutex::new(HashMap::new()),
            dedup_window: Duration::minutes(5),
            default_recipients: Vec::new(),
        }
    }

    /// Build a manager from configuration: a log channel always, plus a
    /// webhook when one is configured
    pub fn from_config(config: &AlarmConfig) -> Result<Self, super::ChannelError> {
        let mut manager = Self::new()
            .with_dedup_window(Duration::seconds(config.dedup_window_secs as i64))
            .with_default_recipients(config.recipients.clone());
        manager.add_channel(Arc::new(super::LogChannel::new()));

        if let Some(url) = &config.webhook_url {
            let mut webhook = super::WebhookConfig::new(url.clone())
                .with_timeout(config.webhook_timeout_secs)
                .with_max_retries(config.webhook_max_retries);
            if let Some(token) = &config.webhook_token {
                webhook = webhook.with_auth_token(token.clone());
            }
            manager.add_channel(Arc::new(super::WebhookChannel::new(webhook)?));
        }
        Ok(manager)
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_default_recipients(mut self, recipients: Vec<String>) -> Self {
        self.default_recipients = recipients;
        self
    }

    pub fn add_channel(&mut self, channel: Arc<dyn Channel>) {
        self.channels.push(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Record the alarm and report whether it should be delivered
    fn admit(&self, alarm: &Alarm) -> bool {
        let key = alarm.dedup_key();
        let now = Utc::now();
        let mut last_sent = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(&last) = last_sent.get(&key) {
            if now - last < self.dedup_window {
                return false;
            }
        }
        last_sent.insert(key, now);

        // Forget keys that can no longer suppress anything
        let window = self.dedup_window;
        last_sent.retain(|_, at| now - *at < window);
        true
    }

    fn prepare(&self, mut alarm: Alarm) -> Alarm {
        for recipient in &self.default_recipients {
            if !alarm.recipients.contains(recipient) {
                alarm.recipients.push(recipient.clone());
            }
        }
        alarm
    }

    /// Deliver to every channel and wait for the results
    pub async fn deliver(&self, alarm: &Alarm) -> Vec<super::DeliveryStatus> {
        deliver_all(&self.channels, alarm).await
    }
}

async fn deliver_all(channels: &[Arc<dyn Channel>], alarm: &Alarm) -> Vec<super::DeliveryStatus> {
    let mut statuses = Vec::with_capacity(channels.len());
    for channel in channels {
        match channel.send(alarm).await {
            Ok(status) => {
                if !status.success {
                    tracing::warn!(alarm_id = %alarm.id, %status, "Alarm delivery failed");
                }
                statuses.push(status);
            }
            Err(e) => {
                tracing::error!(alarm_id = %alarm.id, channel = channel.name(), error = %e, "Failed to send alarm");
                statuses.push(super::DeliveryStatus::failure(channel.name(), e.to_string()));
            }
        }
    }
    statuses
}

impl AlarmSink for NotificationManager {
    fn notify(&self, alarm: Alarm) {
        if !self.admit(&alarm) {
            tracing::debug!(key = %alarm.dedup_key(), "Duplicate alarm suppressed");
            return;
        }

        let alarm = self.prepare(alarm);
        let channels = self.channels.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    deliver_all(&channels, &alarm).await;
                });
            }
            Err(_) => {
                tracing::warn!(alarm_id = %alarm.id, "No runtime available, alarm dropped");
            }
        }
    }
}
