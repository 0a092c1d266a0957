//! Task locks and ownership bookkeeping
//!
//! Ownership of a (task, swimlane) pair is recorded twice:
//!
//! - `task/<id>/lock/<swimlane>` names the holder and is created atomically,
//!   which is what makes two nodes racing for the same swimlane safe.
//! - the owner's `node/<id>/stat` record lists the pair in its task map. That
//!   entry is shared with heartbeat and command handling, so every mutation
//!   holds the local path lock and writes back with a version check.

use chrono::Utc;
use std::sync::Arc;

use super::context::NodeContext;
use super::locks::PathLockRegistry;
use super::model::{ErrorMarker, Node, TaskLock};
use crate::coordination::{paths, CoordinationClient, StoreError, ANY_VERSION};
use crate::error::{Error, Result};
use crate::metrics;

/// Distributed lock and ownership controller for the local node
pub struct TaskAssignmentController {
    client: Arc<dyn CoordinationClient>,
    context: Arc<NodeContext>,
    locks: PathLockRegistry,
    write_attempts: u32,
}

impl TaskAssignmentController {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        context: Arc<NodeContext>,
        locks: PathLockRegistry,
        write_attempts: u32,
    ) -> Self {
        Self {
            client,
            context,
            locks,
            write_attempts: write_attempts.max(1),
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    /// Record ownership of a swimlane in the node record.
    /// Returns false if it was already recorded.
    pub async fn assign(&self, task_id: &str, swimlane_id: &str) -> Result<bool> {
        let changed = self
            .mutate_ownership(|node| node.assign(task_id, swimlane_id))
            .await?;
        if changed {
            tracing::info!(task_id = %task_id, swimlane_id = %swimlane_id, "Task swimlane assigned");
        }
        Ok(changed)
    }

    /// Remove ownership of a swimlane from the node record.
    /// Returns false if it was not recorded.
    pub async fn unassign(&self, task_id: &str, swimlane_id: &str) -> Result<bool> {
        let changed = self
            .mutate_ownership(|node| node.unassign(task_id, swimlane_id))
            .await?;
        if changed {
            tracing::info!(task_id = %task_id, swimlane_id = %swimlane_id, "Task swimlane unassigned");
        }
        Ok(changed)
    }

    /// Owned (task, swimlane) pairs as currently persisted
    pub async fn owned(&self) -> Result<Vec<(String, String)>> {
        let path = paths::node_stat(self.context.node_id());
        match self.client.get_data(&path).await? {
            Some((data, _)) => Ok(serde_json::from_str::<Node>(&data)?.owned_pairs()),
            None => Ok(Vec::new()),
        }
    }

    async fn mutate_ownership<F>(&self, mutate: F) -> Result<bool>
    where
        F: Fn(&mut Node) -> bool,
    {
        let path = paths::node_stat(self.context.node_id());
        let _guard = self.locks.lock(&path).await;

        for attempt in 1..=self.write_attempts {
            let Some((data, version)) = self.client.get_data(&path).await? else {
                let mut node = self.context.node_record(Default::default()).await;
                let changed = mutate(&mut node);
                let payload = serde_json::to_string(&node)?;
                if self.client.create_when_not_exists(&path, &payload).await? {
                    return Ok(changed);
                }
                // Someone else created it; read and retry
                continue;
            };

            let mut node = match serde_json::from_str::<Node>(&data) {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Unreadable node record, rebuilding");
                    self.context.node_record(Default::default()).await
                }
            };

            if !mutate(&mut node) {
                return Ok(false);
            }

            let payload = serde_json::to_string(&node)?;
            match self.client.set_data(&path, &payload, version).await {
                Ok(_) => return Ok(true),
                Err(StoreError::BadVersion { expected, actual, .. }) => {
                    tracing::debug!(
                        path = %path,
                        attempt,
                        expected,
                        actual,
                        "Ownership write lost the race, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::VersionConflict {
            path,
            attempts: self.write_attempts,
        })
    }

    /// Whether a task lock blocks this node from taking the swimlane.
    ///
    /// Under force-assign a lock that names this node's own identity is not a
    /// conflict. Store failures count as locked.
    pub async fn is_locked(&self, task_id: &str, swimlane_id: &str) -> bool {
        let path = paths::task_lock(task_id, swimlane_id);
        match self.client.get_data(&path).await {
            Ok(None) => false,
            Ok(Some((data, _))) => {
                if !self.context.force_assign() {
                    return true;
                }
                match serde_json::from_str::<TaskLock>(&data) {
                    Ok(lock) => !lock.held_by(self.context.node_id(), self.context.address()),
                    Err(_) => true,
                }
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Lock check failed, treating as locked");
                true
            }
        }
    }

    /// Whether the swimlane carries an error-stop marker. Store failures count
    /// as not stopped.
    pub async fn is_error_stopped(&self, task_id: &str, swimlane_id: &str) -> bool {
        let path = paths::task_error(task_id, swimlane_id);
        match self.client.exists(&path).await {
            Ok(version) => version.is_some(),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Error marker check failed");
                false
            }
        }
    }

    /// Delete a lock left behind by an earlier instance of this node.
    ///
    /// Only valid under force-assign. The identity check trusts any process
    /// presenting the same (node id, address); there is no fencing token.
    pub async fn try_preempt(&self, lock_path: &str) -> bool {
        if !self.context.force_assign() {
            return false;
        }

        let holder = match self.client.get_data(lock_path).await {
            Ok(Some((data, _))) => serde_json::from_str::<TaskLock>(&data).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(path = %lock_path, error = %e, "Preempt read failed");
                None
            }
        };

        let Some(holder) = holder else {
            return false;
        };
        if !holder.held_by(self.context.node_id(), self.context.address()) {
            return false;
        }

        match self.client.delete(lock_path).await {
            Ok(_) => {
                tracing::warn!(path = %lock_path, "Preempted lock carrying this node's identity");
                true
            }
            Err(e) => {
                tracing::warn!(path = %lock_path, error = %e, "Preempt delete failed");
                false
            }
        }
    }

    /// Take the task lock and record ownership. Returns false when another
    /// holder owns the lock.
    pub async fn acquire(&self, task_id: &str, swimlane_id: &str) -> Result<bool> {
        let path = paths::task_lock(task_id, swimlane_id);
        let payload = serde_json::to_string(&self.context.identity())?;

        let mut created = self.client.create_when_not_exists(&path, &payload).await?;
        if !created && self.try_preempt(&path).await {
            created = self.client.create_when_not_exists(&path, &payload).await?;
        }
        if !created {
            tracing::debug!(task_id = %task_id, swimlane_id = %swimlane_id, "Task lock held elsewhere");
            return Ok(false);
        }

        metrics::record_task_lock(true);
        if let Err(e) = self.assign(task_id, swimlane_id).await {
            // Ownership could not be recorded; give the lock back
            if let Err(delete_err) = self.client.delete(&path).await {
                tracing::error!(
                    path = %path,
                    error = %delete_err,
                    "Could not give back task lock; it stays held without an ownership record"
                );
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Drop ownership and delete the task lock if it names this node.
    /// Returns whether a lock was deleted.
    pub async fn release(&self, task_id: &str, swimlane_id: &str) -> Result<bool> {
        let path = paths::task_lock(task_id, swimlane_id);
        self.unassign(task_id, swimlane_id).await?;

        let owned = match self.client.get_data(&path).await? {
            Some((data, _)) => serde_json::from_str::<TaskLock>(&data)
                .map(|lock| lock.held_by(self.context.node_id(), self.context.address()))
                .unwrap_or(false),
            None => false,
        };
        if !owned {
            return Ok(false);
        }

        let deleted = self.client.delete(&path).await?;
        if deleted {
            metrics::record_task_lock(false);
            tracing::info!(task_id = %task_id, swimlane_id = %swimlane_id, "Task lock released");
        }
        Ok(deleted)
    }

    /// Create the error-stop marker for a swimlane
    pub async fn mark_error_stopped(&self, task_id: &str, swimlane_id: &str, reason: &str) -> Result<()> {
        let marker = ErrorMarker {
            node_id: self.context.node_id().to_string(),
            reason: reason.to_string(),
            stopped_at: Utc::now(),
        };
        let path = paths::task_error(task_id, swimlane_id);
        let created = self
            .client
            .create_when_not_exists(&path, &serde_json::to_string(&marker)?)
            .await?;
        if created {
            tracing::warn!(task_id = %task_id, swimlane_id = %swimlane_id, reason = %reason, "Swimlane stopped by error");
        }
        Ok(())
    }

    /// Publish a rendered position for nodes resuming this swimlane
    pub async fn upload_position(&self, task_id: &str, swimlane_id: &str, position: &str) -> Result<()> {
        let path = paths::task_position(task_id, swimlane_id);
        if !self.client.create_when_not_exists(&path, position).await? {
            self.client.set_data(&path, position, ANY_VERSION).await?;
        }
        tracing::debug!(task_id = %task_id, swimlane_id = %swimlane_id, position = %position, "Position uploaded");
        Ok(())
    }

    /// Last published position of a swimlane
    pub async fn resume_position(&self, task_id: &str, swimlane_id: &str) -> Result<Option<String>> {
        let path = paths::task_position(task_id, swimlane_id);
        Ok(self.client.get_data(&path).await?.map(|(data, _)| data))
    }
}
