//! Records persisted in the coordination store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Lifecycle status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Accepting and running work
    Working,
    /// Registered and running, but not recruiting new work
    Pending,
    /// Not accepting work
    Suspend,
}

impl NodeStatus {
    /// Whether this status belongs to the working family
    pub fn is_working(&self) -> bool {
        matches!(self, Self::Working | Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "WORKING",
            Self::Pending => "PENDING",
            Self::Suspend => "SUSPEND",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse node health reported on every heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLevel {
    #[default]
    Green,
    Yellow,
    Red,
}

/// Node record stored at `node/<id>/stat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub address: String,
    pub host_name: String,
    pub process_id: u32,
    pub status: NodeStatus,
    #[serde(default)]
    pub health_level: HealthLevel,
    #[serde(default)]
    pub health_level_desc: String,
    #[serde(default)]
    pub heartbeat: Option<DateTime<Utc>>,
    /// taskId → swimlane ids owned by this node
    #[serde(default)]
    pub tasks: BTreeMap<String, BTreeSet<String>>,
}

impl Node {
    /// Add ownership of one swimlane. Returns false if it was already owned.
    pub fn assign(&mut self, task_id: &str, swimlane_id: &str) -> bool {
        self.tasks
            .entry(task_id.to_string())
            .or_default()
            .insert(swimlane_id.to_string())
    }

    /// Remove ownership of one swimlane, dropping the task key once empty.
    /// Returns false if it was not owned.
    pub fn unassign(&mut self, task_id: &str, swimlane_id: &str) -> bool {
        let Some(swimlanes) = self.tasks.get_mut(task_id) else {
            return false;
        };
        let removed = swimlanes.remove(swimlane_id);
        if swimlanes.is_empty() {
            self.tasks.remove(task_id);
        }
        removed
    }

    pub fn owns(&self, task_id: &str, swimlane_id: &str) -> bool {
        self.tasks
            .get(task_id)
            .is_some_and(|s| s.contains(swimlane_id))
    }

    /// All owned (task, swimlane) pairs
    pub fn owned_pairs(&self) -> Vec<(String, String)> {
        self.tasks
            .iter()
            .flat_map(|(task, swimlanes)| swimlanes.iter().map(move |s| (task.clone(), s.clone())))
            .collect()
    }

    /// Whether the last heartbeat is older than `max_age`
    pub fn is_stale(&self, max_age: std::time::Duration) -> bool {
        match self.heartbeat {
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                age.to_std().map(|a| a > max_age).unwrap_or(false)
            }
            None => true,
        }
    }
}

/// Mutual-exclusion marker naming its holder. Used for node identity locks
/// and for task locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskLock {
    pub node_id: String,
    pub address: String,
}

impl TaskLock {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
        }
    }

    /// Whether this lock names the given identity
    pub fn held_by(&self, node_id: &str, address: &str) -> bool {
        self.node_id == node_id && self.address == address
    }
}

/// Desired state of a task swimlane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Working,
    Stopped,
}

impl TaskStatus {
    pub fn is_working(&self) -> bool {
        matches!(self, Self::Working)
    }
}

/// Task configuration stored at `task/<id>/dist/<swimlane>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub task_id: String,
    pub swimlane_id: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Alarm recipients for this task
    #[serde(default)]
    pub receivers: Vec<String>,
    /// Routing metadata, opaque to the cluster layer
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl TaskConfig {
    pub fn new(task_id: impl Into<String>, swimlane_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            swimlane_id: swimlane_id.into(),
            status: TaskStatus::Working,
            receivers: Vec::new(),
            properties: HashMap::new(),
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_receivers(mut self, receivers: Vec<String>) -> Self {
        self.receivers = receivers;
        self
    }
}

/// Marker stored at `task/<id>/error/<swimlane>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMarker {
    pub node_id: String,
    pub reason: String,
    pub stopped_at: DateTime<Utc>,
}
