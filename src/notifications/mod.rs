//! Alarm delivery
//!
//! Pipeline and cluster code raise alarms through the [`AlarmSink`] trait,
//! which never blocks and never fails. [`NotificationManager`] is the
//! production sink: it drops duplicates inside a window and fans the rest out
//! to its channels on a background task.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │      NotificationManager (AlarmSink)       │
//! │  - Deduplication window                    │
//! │  - Spawned fan-out                         │
//! └────────────────────────────────────────────┘
//!                     │
//!             ┌───────┴───────┐
//!             ▼               ▼
//!        ┌─────────┐    ┌─────────┐
//!        │   Log   │    │ Webhook │
//!        │ Channel │    │ Channel │
//!        └─────────┘    └─────────┘
//! ```

pub mod channels;
mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub use channels::log::LogChannel;
pub use channels::webhook::{WebhookChannel, WebhookConfig};
pub use channels::{Channel, ChannelError, DeliveryStatus};
pub use manager::NotificationManager;

/// Kind of alarm, mirroring how operators route them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    /// Advisory condition on a running task (backlog, slow target)
    TaskWarning,
    /// Incidental failure inside a task; the task keeps running
    TaskLog,
    /// The task was stopped
    TaskStop,
    /// Node level condition
    NodeWarning,
}

impl AlarmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskWarning => "task_warning",
            Self::TaskLog => "task_log",
            Self::TaskStop => "task_stop",
            Self::NodeWarning => "node_warning",
        }
    }
}

impl std::fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One alarm instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub kind: AlarmKind,
    pub task_id: Option<String>,
    pub swimlane_id: Option<String>,
    pub title: String,
    pub message: String,
    /// People or groups to notify
    pub recipients: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Alarm {
    pub fn new(kind: AlarmKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            task_id: None,
            swimlane_id: None,
            title: title.into(),
            message: message.into(),
            recipients: Vec::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Alarm scoped to one task swimlane
    pub fn task(
        kind: AlarmKind,
        task_id: impl Into<String>,
        swimlane_id: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut alarm = Self::new(kind, title, message);
        alarm.task_id = Some(task_id.into());
        alarm.swimlane_id = Some(swimlane_id.into());
        alarm
    }

    pub fn with_recipients(mut self, recipients: Vec<String>) -> Self {
        self.recipients = recipients;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Key used to recognise repeats of the same alarm
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind,
            self.task_id.as_deref().unwrap_or("-"),
            self.swimlane_id.as_deref().unwrap_or("-"),
            self.title
        )
    }
}

/// Fire-and-forget alarm destination
pub trait AlarmSink: Send + Sync {
    fn notify(&self, alarm: Alarm);
}
