//! Single entry point for cluster-state changes issued by this node

use async_trait::async_trait;
use std::sync::Arc;

use super::assignment::TaskAssignmentController;
use super::command::ClusterCommand;
use super::registry::NodeRegistry;
use crate::error::Result;

/// Anything that can apply a [`ClusterCommand`]
#[async_trait]
pub trait ClusterBroadcaster: Send + Sync {
    async fn broadcast(&self, command: ClusterCommand) -> Result<()>;
}

/// Routes every [`ClusterCommand`] to the component that owns it
pub struct ClusterProvider {
    registry: Arc<NodeRegistry>,
    assignment: Arc<TaskAssignmentController>,
}

impl ClusterProvider {
    pub fn new(registry: Arc<NodeRegistry>, assignment: Arc<TaskAssignmentController>) -> Self {
        Self {
            registry,
            assignment,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn assignment(&self) -> &Arc<TaskAssignmentController> {
        &self.assignment
    }
}

#[async_trait]
impl ClusterBroadcaster for ClusterProvider {
    async fn broadcast(&self, command: ClusterCommand) -> Result<()> {
        tracing::debug!(command = command.kind(), "Cluster command");
        match command {
            ClusterCommand::NodeRegister { upload_statistic } => {
                self.registry.context().set_upload_statistic(upload_statistic);
                self.registry.register().await?;
                self.registry.start_heartbeat().await;
            }
            ClusterCommand::Shutdown => self.registry.shutdown().await?,
            ClusterCommand::TaskAssigned {
                task_id,
                swimlane_id,
            } => {
                self.assignment.assign(&task_id, &swimlane_id).await?;
            }
            ClusterCommand::TaskStop {
                task_id,
                swimlane_id,
            } => {
                self.assignment.release(&task_id, &swimlane_id).await?;
                let key = super::context::progress_key(&task_id, &swimlane_id);
                self.registry.context().remove_consume_progress(&key).await;
            }
            ClusterCommand::TaskPositionUpload {
                task_id,
                swimlane_id,
                position,
            } => {
                self.assignment
                    .upload_position(&task_id, &swimlane_id, &position)
                    .await?
            }
            ClusterCommand::TaskStoppedByError {
                task_id,
                swimlane_id,
                reason,
            } => {
                self.assignment
                    .mark_error_stopped(&task_id, &swimlane_id, &reason)
                    .await?
            }
        }
        Ok(())
    }
}
