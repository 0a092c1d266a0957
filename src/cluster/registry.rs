//! Node identity lifecycle
//!
//! Registration, the heartbeat loop, node command handling and shutdown.
//! Commands arrive as entries under `node/<id>/order`; each one is deleted
//! right after dispatch whatever the outcome, so a command is never replayed.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use super::assignment::TaskAssignmentController;
use super::bus::ClusterListener;
use super::command::{NodeCommand, TaskEvent};
use super::context::NodeContext;
use super::locks::PathLockRegistry;
use super::model::{Node, NodeStatus, TaskConfig, TaskLock, TaskStatus};
use crate::config::NodeConfig;
use crate::coordination::{paths, CoordinationClient, StoreError, WatchEvent, WatchKind};
use crate::error::{Error, Result};
use crate::metrics;

/// Marks one command path as being handled by this process
struct CommandClaim<'a> {
    in_flight: &'a StdMutex<HashSet<String>>,
    path: String,
}

impl<'a> CommandClaim<'a> {
    fn take(in_flight: &'a StdMutex<HashSet<String>>, path: &str) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(path.to_string()).then(|| Self {
            in_flight,
            path: path.to_string(),
        })
    }
}

impl Drop for CommandClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.path);
    }
}

struct HeartbeatTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Outcome of one heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Written,
    /// Lost to a concurrent writer; the next tick catches up
    Conflict,
}

/// Registry of the local node in the cluster
pub struct NodeRegistry {
    client: Arc<dyn CoordinationClient>,
    context: Arc<NodeContext>,
    assignment: Arc<TaskAssignmentController>,
    locks: PathLockRegistry,
    config: NodeConfig,
    events: broadcast::Sender<TaskEvent>,
    heartbeat: Mutex<Option<HeartbeatTask>>,
    in_flight: StdMutex<HashSet<String>>,
}

impl NodeRegistry {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        context: Arc<NodeContext>,
        assignment: Arc<TaskAssignmentController>,
        locks: PathLockRegistry,
        config: NodeConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            client,
            context,
            assignment,
            locks,
            config,
            events,
            heartbeat: Mutex::new(None),
            in_flight: StdMutex::new(HashSet::new()),
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    /// Subscribe to task events raised by this node
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TaskEvent) {
        metrics::record_task_event(event.kind());
        let cfg = event.config();
        tracing::info!(
            event = event.kind(),
            task_id = %cfg.task_id,
            swimlane_id = %cfg.swimlane_id,
            "Task event raised"
        );
        // No local runner subscribed is fine
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Claim the node identity and publish the node record.
    ///
    /// An existing identity lock is adopted only when it names this node's
    /// own (node id, address). Under force-assign a lock whose holder has a
    /// stale heartbeat is deleted and the claim retried once.
    pub async fn register(&self) -> Result<()> {
        let node_id = self.context.node_id();
        let lock_path = paths::node_lock(node_id);
        let identity = self.context.identity();
        let payload = serde_json::to_string(&identity)?;

        self.client
            .create_when_not_exists(&paths::node(node_id), "")
            .await?;

        let mut preempted = false;
        loop {
            if self.client.create_when_not_exists(&lock_path, &payload).await? {
                break;
            }

            let Some((data, _)) = self.client.get_data(&lock_path).await? else {
                // Holder went away in between
                continue;
            };
            let holder = serde_json::from_str::<TaskLock>(&data).ok();

            if holder
                .as_ref()
                .is_some_and(|h| h.held_by(&identity.node_id, &identity.address))
            {
                self.warn_on_duplicate_identity().await;
                tracing::info!(node_id = %node_id, "Adopting identity lock from a previous instance");
                break;
            }

            if self.context.force_assign() && !preempted && self.holder_is_stale().await {
                tracing::warn!(node_id = %node_id, holder = %data, "Deleting stale identity lock");
                self.client.delete(&lock_path).await?;
                preempted = true;
                continue;
            }

            return Err(Error::NodeAlreadyRegistered {
                node_id: node_id.to_string(),
                holder: holder
                    .map(|h| format!("{}@{}", h.node_id, h.address))
                    .unwrap_or(data),
            });
        }

        self.publish_record().await?;
        self.context.set_registered(true);
        metrics::update_node_working(self.context.status().await.is_working());
        tracing::info!(
            node_id = %node_id,
            address = %self.context.address(),
            process_id = self.context.process_id(),
            "Node registered"
        );
        Ok(())
    }

    async fn stored_record(&self) -> Option<Node> {
        let path = paths::node_stat(self.context.node_id());
        match self.client.get_data(&path).await {
            Ok(Some((data, _))) => serde_json::from_str(&data).ok(),
            _ => None,
        }
    }

    async fn holder_is_stale(&self) -> bool {
        match self.stored_record().await {
            Some(node) => node.is_stale(self.config.stale_holder_threshold()),
            None => true,
        }
    }

    async fn warn_on_duplicate_identity(&self) {
        let Some(node) = self.stored_record().await else {
            return;
        };
        if node.process_id != self.context.process_id()
            && !node.is_stale(self.config.stale_holder_threshold())
        {
            tracing::warn!(
                node_id = %self.context.node_id(),
                other_process = node.process_id,
                other_host = %node.host_name,
                "Identity lock adopted while another process with the same identity is heartbeating"
            );
        }
    }

    /// Create the node record, or refresh an existing one in place so the
    /// ownership map left by a previous instance survives a restart
    async fn publish_record(&self) -> Result<()> {
        let path = paths::node_stat(self.context.node_id());
        let _guard = self.locks.lock(&path).await;

        for attempt in 1..=self.config.write_attempts {
            let Some((data, version)) = self.client.get_data(&path).await? else {
                let record = self.context.node_record(Default::default()).await;
                if self
                    .client
                    .create_when_not_exists(&path, &serde_json::to_string(&record)?)
                    .await?
                {
                    return Ok(());
                }
                continue;
            };

            let mut node = match serde_json::from_str::<Node>(&data) {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Unreadable node record, rebuilding");
                    self.context.node_record(Default::default()).await
                }
            };
            self.context.refresh_record(&mut node).await;

            match self
                .client
                .set_data(&path, &serde_json::to_string(&node)?, version)
                .await
            {
                Ok(_) => {
                    if !node.tasks.is_empty() {
                        tracing::info!(
                            path = %path,
                            tasks = node.tasks.len(),
                            "Kept task ownership from a previous instance"
                        );
                    }
                    return Ok(());
                }
                Err(StoreError::BadVersion { .. }) => {
                    tracing::debug!(path = %path, attempt, "Node record changed underneath, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::VersionConflict {
            path,
            attempts: self.config.write_attempts,
        })
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    /// Refresh the node record once, conditioned on its current version
    pub async fn heartbeat_once(&self) -> Result<HeartbeatOutcome> {
        let path = paths::node_stat(self.context.node_id());
        let _guard = self.locks.lock(&path).await;

        let Some((data, version)) = self.client.get_data(&path).await? else {
            let record = self.context.node_record(Default::default()).await;
            self.client
                .create_when_not_exists(&path, &serde_json::to_string(&record)?)
                .await?;
            metrics::record_heartbeat();
            return Ok(HeartbeatOutcome::Written);
        };

        let mut node = match serde_json::from_str::<Node>(&data) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Unreadable node record, rebuilding");
                self.context.node_record(Default::default()).await
            }
        };
        self.context.refresh_record(&mut node).await;

        match self
            .client
            .set_data(&path, &serde_json::to_string(&node)?, version)
            .await
        {
            Ok(_) => {
                metrics::record_heartbeat();
                Ok(HeartbeatOutcome::Written)
            }
            Err(StoreError::BadVersion { expected, actual, .. }) => {
                tracing::debug!(path = %path, expected, actual, "Heartbeat lost to a concurrent writer");
                metrics::record_heartbeat_conflict();
                Ok(HeartbeatOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Start the fixed-rate heartbeat loop. A running loop is left alone.
    pub async fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock().await;
        if slot.is_some() {
            return;
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let registry = Arc::clone(self);
        let delay = self.config.heartbeat_initial_delay();
        let interval = self.config.heartbeat_interval();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => return,
            }

            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.heartbeat_once().await {
                            metrics::record_heartbeat_error();
                            tracing::warn!(error = %e, "Heartbeat failed");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            tracing::debug!("Heartbeat loop stopped");
        });

        *slot = Some(HeartbeatTask { stop, handle });
    }

    async fn stop_heartbeat(&self) {
        let task = self.heartbeat.lock().await.take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                tracing::error!(error = %e, "Heartbeat task panicked");
            }
        }
    }

    /// Suspend the node, free its identity lock and stop heartbeating
    pub async fn shutdown(&self) -> Result<()> {
        self.context.set_status(NodeStatus::Suspend).await;
        metrics::update_node_working(false);
        self.stop_heartbeat().await;

        if let Err(e) = self.heartbeat_once().await {
            tracing::warn!(error = %e, "Could not persist suspended status");
        }

        self.client
            .delete(&paths::node_lock(self.context.node_id()))
            .await?;
        self.context.set_registered(false);
        tracing::info!(node_id = %self.context.node_id(), "Node shut down");
        Ok(())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Process one command entry and delete it
    pub async fn handle_command(&self, path: &str) -> Result<()> {
        // Claimed instead of path-locked: dispatch takes the stat entry lock
        let Some(_claim) = CommandClaim::take(&self.in_flight, path) else {
            tracing::debug!(path = %path, "Command already being handled");
            return Ok(());
        };

        // Already consumed by an earlier delivery
        let Some((data, _)) = self.client.get_data(path).await? else {
            return Ok(());
        };

        let outcome = match serde_json::from_str::<NodeCommand>(&data) {
            Ok(command) => {
                metrics::record_command(command.kind());
                tracing::info!(path = %path, command = command.kind(), "Node command received");
                self.dispatch(command).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &outcome {
            tracing::warn!(path = %path, error = %e, "Node command failed");
        }

        if let Err(e) = self.client.delete(path).await {
            tracing::warn!(path = %path, error = %e, "Could not delete processed command");
        }
        Ok(())
    }

    async fn dispatch(&self, command: NodeCommand) -> Result<()> {
        match command {
            NodeCommand::ReleaseWork => self.release_work().await,
            NodeCommand::ChangeStatus { status } => self.change_status(status).await,
            NodeCommand::WorkLimit { work_limit } => {
                if work_limit > -1 {
                    let limit = u32::try_from(work_limit).unwrap_or(u32::MAX);
                    self.context.set_work_limit(limit);
                    tracing::info!(work_limit = limit, "Work limit updated");
                }
                Ok(())
            }
        }
    }

    async fn release_work(&self) -> Result<()> {
        let owned = self.assignment.owned().await?;
        for (task_id, swimlane_id) in owned {
            let config = self
                .task_config(&task_id, &swimlane_id)
                .await
                .unwrap_or_else(|| TaskConfig::new(&task_id, &swimlane_id));
            self.emit(TaskEvent::Stop(config.with_status(TaskStatus::Stopped)));
        }
        Ok(())
    }

    async fn change_status(&self, status: NodeStatus) -> Result<()> {
        let previous = self.context.set_status(status).await;
        metrics::update_node_working(status.is_working());
        tracing::info!(from = %previous, to = %status, "Node status changed");

        if let Err(e) = self.heartbeat_once().await {
            tracing::warn!(error = %e, "Could not persist status change");
        }

        if !previous.is_working() && status.is_working() {
            self.recruit().await?;
        }
        Ok(())
    }

    async fn task_config(&self, task_id: &str, swimlane_id: &str) -> Option<TaskConfig> {
        let path = paths::task_dist(task_id, swimlane_id);
        match self.client.get_data(&path).await {
            Ok(Some((data, _))) => match serde_json::from_str(&data) {
                Ok(cfg) => Some(cfg),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Unreadable task config");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Task config read failed");
                None
            }
        }
    }

    /// Raise an assign event for every swimlane that is free, not stopped by
    /// error and configured to work
    pub async fn recruit(&self) -> Result<usize> {
        let mut raised = 0;
        for task_id in self.client.get_children(paths::TASK_ROOT).await? {
            let swimlanes = self
                .client
                .get_children(&paths::task_dist_root(&task_id))
                .await?;
            for swimlane_id in swimlanes {
                if self.assignment.is_locked(&task_id, &swimlane_id).await
                    || self.assignment.is_error_stopped(&task_id, &swimlane_id).await
                {
                    continue;
                }
                let Some(config) = self.task_config(&task_id, &swimlane_id).await else {
                    continue;
                };
                if config.status.is_working() {
                    self.emit(TaskEvent::Assign(config));
                    raised += 1;
                }
            }
        }
        tracing::info!(raised, "Recruited pending task swimlanes");
        Ok(raised)
    }
}

#[async_trait]
impl ClusterListener for NodeRegistry {
    fn name(&self) -> &str {
        "node-registry"
    }

    fn listen_path(&self) -> String {
        paths::node(self.context.node_id())
    }

    fn accepts(&self, event: &WatchEvent) -> bool {
        event.kind != WatchKind::Offline && paths::is_node_order(&event.path)
    }

    async fn on_event(&self, event: WatchEvent) -> Result<()> {
        self.handle_command(&event.path).await
    }

    async fn on_resync(&self) -> Result<()> {
        let orders = paths::node_orders(self.context.node_id());
        let mut pending = self.client.get_children(&orders).await?;
        pending.sort();
        for command_id in pending {
            self.handle_command(&paths::node_order(self.context.node_id(), &command_id))
                .await?;
        }
        Ok(())
    }
}
