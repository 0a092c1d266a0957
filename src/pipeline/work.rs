//! Per-swimlane task context shared by every stage

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::cluster::{progress_key, ClusterBroadcaster, ClusterCommand};
use crate::notifications::{Alarm, AlarmKind, AlarmSink};
use crate::stats::StatsCollector;

/// Runtime state of one (task, swimlane) on this node
pub struct TaskWork {
    task_id: String,
    swimlane_id: String,
    recipients: Vec<String>,
    stop_tx: watch::Sender<bool>,
    triggered: AtomicBool,
    stats: Arc<StatsCollector>,
    alarms: Arc<dyn AlarmSink>,
    cluster: Arc<dyn ClusterBroadcaster>,
}

impl TaskWork {
    pub fn new(
        task_id: impl Into<String>,
        swimlane_id: impl Into<String>,
        alarms: Arc<dyn AlarmSink>,
        cluster: Arc<dyn ClusterBroadcaster>,
    ) -> Self {
        let task_id = task_id.into();
        let swimlane_id = swimlane_id.into();
        let (stop_tx, _) = watch::channel(false);
        Self {
            stats: Arc::new(StatsCollector::new(&task_id, &swimlane_id)),
            task_id,
            swimlane_id,
            recipients: Vec::new(),
            stop_tx,
            triggered: AtomicBool::new(false),
            alarms,
            cluster,
        }
    }

    pub fn with_recipients(mut self, recipients: Vec<String>) -> Self {
        self.recipients = recipients;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn swimlane_id(&self) -> &str {
        &self.swimlane_id
    }

    pub fn progress_key(&self) -> String {
        progress_key(&self.task_id, &self.swimlane_id)
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// Ask every stage to finish
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Whether the task was stopped by a stop-trigger failure
    pub fn trigger_stopped(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Raise an alarm scoped to this swimlane
    pub fn alarm(&self, kind: AlarmKind, title: impl Into<String>, message: impl Into<String>) {
        let alarm = Alarm::task(kind, &self.task_id, &self.swimlane_id, title, message)
            .with_recipients(self.recipients.clone());
        self.alarms.notify(alarm);
    }

    /// Apply a cluster command, logging failures instead of returning them
    pub async fn broadcast(&self, command: ClusterCommand) -> bool {
        let kind = command.kind();
        match self.cluster.broadcast(command).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    task_id = %self.task_id,
                    swimlane_id = %self.swimlane_id,
                    command = kind,
                    error = %e,
                    "Cluster command failed"
                );
                false
            }
        }
    }

    /// Stop the task after a data-integrity failure; runs once per task
    pub async fn stop_and_alarm(&self, reason: &str) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(
            task_id = %self.task_id,
            swimlane_id = %self.swimlane_id,
            reason,
            "Stopping task"
        );
        self.stop();
        self.alarm(
            AlarmKind::TaskStop,
            format!("{}-{} stopped", self.task_id, self.swimlane_id),
            reason,
        );

        self.broadcast(ClusterCommand::TaskStoppedByError {
            task_id: self.task_id.clone(),
            swimlane_id: self.swimlane_id.clone(),
            reason: reason.to_string(),
        })
        .await;
        self.broadcast(ClusterCommand::TaskStop {
            task_id: self.task_id.clone(),
            swimlane_id: self.swimlane_id.clone(),
        })
        .await;
    }
}
