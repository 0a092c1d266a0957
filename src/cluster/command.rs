//! Closed command and event types
//!
//! - [`NodeCommand`]: node-directed instructions read from `node/<id>/order/*`
//! - [`ClusterCommand`]: cluster-state changes issued by the local node
//! - [`TaskEvent`]: task transitions raised for the local task runner

use serde::{Deserialize, Serialize};

use super::model::{NodeStatus, TaskConfig};

/// Instruction addressed to a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCommand {
    /// Stop every task swimlane owned by the node
    ReleaseWork,
    /// Switch the node status
    ChangeStatus { status: NodeStatus },
    /// Update the concurrency ceiling; negative values are ignored
    WorkLimit { work_limit: i64 },
}

impl NodeCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReleaseWork => "release_work",
            Self::ChangeStatus { .. } => "change_status",
            Self::WorkLimit { .. } => "work_limit",
        }
    }
}

/// Cluster-state change issued by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterCommand {
    /// Register the node identity and start heartbeating
    NodeRegister { upload_statistic: bool },
    /// Suspend the node and free its identity
    Shutdown,
    /// Record ownership of a swimlane
    TaskAssigned {
        task_id: String,
        swimlane_id: String,
    },
    /// Drop ownership of a swimlane and release its lock
    TaskStop {
        task_id: String,
        swimlane_id: String,
    },
    /// Publish a durable position for other nodes to resume from
    TaskPositionUpload {
        task_id: String,
        swimlane_id: String,
        position: String,
    },
    /// Mark a swimlane as stopped by error
    TaskStoppedByError {
        task_id: String,
        swimlane_id: String,
        reason: String,
    },
}

impl ClusterCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeRegister { .. } => "node_register",
            Self::Shutdown => "shutdown",
            Self::TaskAssigned { .. } => "task_assigned",
            Self::TaskStop { .. } => "task_stop",
            Self::TaskPositionUpload { .. } => "task_position_upload",
            Self::TaskStoppedByError { .. } => "task_stopped_by_error",
        }
    }
}

/// Task transition raised for the local task runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Assign(TaskConfig),
    Stop(TaskConfig),
}

impl TaskEvent {
    pub fn config(&self) -> &TaskConfig {
        match self {
            Self::Assign(cfg) | Self::Stop(cfg) => cfg,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Assign(_) => "assign",
            Self::Stop(_) => "stop",
        }
    }
}
