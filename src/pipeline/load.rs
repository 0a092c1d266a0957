//! Load stage: applies batches to the target and commits positions
//!
//! For each batch the stage
//! 1. hands the rows to the [`Loader`]; a batch-level failure stops the task,
//! 2. commits the batch position through the [`DataConsumer`] and caches the
//!    backlog it reports,
//! 3. broadcasts the rendered position to the cluster when the position is
//!    eligible and differs from the last broadcast,
//! 4. folds the per-row outcomes into the task statistics.
//!
//! A separate monitor raises advisory alarms for a large backlog or a load
//! call that has been running for too long.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::bucket::EtlBucket;
use super::position::Position;
use super::queue::StageQueue;
use super::stage::{Stage, StageError};
use super::work::TaskWork;
use crate::cluster::{ClusterCommand, NodeContext};
use crate::config::LoadConfig;
use crate::metrics;
use crate::notifications::AlarmKind;
use crate::stats::SubmitStatObject;

const NOT_LOADING: i64 = 0;

/// Result of applying one batch
#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    /// `false` means the batch could not be applied as a whole
    pub succeeded: bool,
    pub rows: Vec<SubmitStatObject>,
}

impl LoadOutcome {
    pub fn success(rows: Vec<SubmitStatObject>) -> Self {
        Self {
            succeeded: true,
            rows,
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }
}

/// Writes batches to the target system
#[async_trait]
pub trait Loader: Send + Sync {
    async fn startup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Apply one batch, reporting an outcome for every row applied
    async fn load(&self, bucket: &EtlBucket) -> anyhow::Result<LoadOutcome>;

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Source side of a swimlane
#[async_trait]
pub trait DataConsumer: Send + Sync {
    fn swimlane_id(&self) -> &str;

    /// Whether the source advances its own cursor
    fn is_auto_commit_position(&self) -> bool;

    /// Persist the position locally and return the remaining backlog
    async fn commit_position(&self, position: &dyn Position) -> anyhow::Result<i64>;
}

pub struct LoadStage {
    work: Arc<TaskWork>,
    input: Arc<StageQueue<EtlBucket>>,
    loader: Arc<dyn Loader>,
    consumer: Arc<dyn DataConsumer>,
    context: Arc<NodeContext>,
    config: LoadConfig,
    backlog: AtomicI64,
    /// Epoch millis when the running load call started
    load_started: AtomicI64,
    last_broadcast: Mutex<Option<String>>,
}

impl LoadStage {
    pub fn new(
        work: Arc<TaskWork>,
        input: Arc<StageQueue<EtlBucket>>,
        loader: Arc<dyn Loader>,
        consumer: Arc<dyn DataConsumer>,
        context: Arc<NodeContext>,
        config: LoadConfig,
    ) -> Self {
        Self {
            work,
            input,
            loader,
            consumer,
            context,
            config,
            backlog: AtomicI64::new(0),
            load_started: AtomicI64::new(NOT_LOADING),
            last_broadcast: Mutex::new(None),
        }
    }

    /// Backlog reported by the last commit
    pub fn backlog(&self) -> i64 {
        self.backlog.load(Ordering::SeqCst)
    }

    /// How long the running load call has taken, if one is running
    pub fn load_elapsed(&self) -> Option<Duration> {
        let started = self.load_started.load(Ordering::SeqCst);
        if started == NOT_LOADING {
            return None;
        }
        let elapsed = Utc::now().timestamp_millis().saturating_sub(started);
        Some(Duration::from_millis(elapsed.max(0) as u64))
    }

    fn mark_load_started(&self) {
        self.load_started
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn clear_load_started(&self) {
        self.load_started.store(NOT_LOADING, Ordering::SeqCst);
    }

    /// Commit a position locally, then share it with the cluster if eligible
    pub async fn commit(&self, position: &dyn Position) -> Result<i64, StageError> {
        let task_id = self.work.task_id();
        let swimlane_id = self.work.swimlane_id();
        let rendered = position.render();

        let backlog = self
            .consumer
            .commit_position(position)
            .await
            .map_err(|e| StageError::Failed(e.context(format!("commit of {rendered} failed"))))?;
        self.backlog.store(backlog, Ordering::SeqCst);
        metrics::update_backlog(task_id, swimlane_id, backlog);

        if position.checksum() && self.should_broadcast(&rendered) {
            tracing::debug!(task_id, swimlane_id, position = %rendered, backlog, "Broadcasting position");
            let uploaded = self
                .work
                .broadcast(ClusterCommand::TaskPositionUpload {
                    task_id: task_id.to_string(),
                    swimlane_id: swimlane_id.to_string(),
                    position: rendered.clone(),
                })
                .await;
            if uploaded {
                *self.last_broadcast.lock().unwrap_or_else(|e| e.into_inner()) = Some(rendered);
            }
        }

        self.context
            .flush_consume_progress(self.work.progress_key(), backlog)
            .await;
        Ok(backlog)
    }

    fn should_broadcast(&self, rendered: &str) -> bool {
        let last = self.last_broadcast.lock().unwrap_or_else(|e| e.into_inner());
        last.as_deref() != Some(rendered)
    }

    /// One pass of the backlog and stuck-load checks
    pub fn check_once(&self) {
        let backlog = self.backlog();
        let threshold = self.config.backlog_alarm_threshold;
        if threshold > 0 && backlog >= threshold {
            self.work.alarm(
                AlarmKind::TaskWarning,
                format!(
                    "{}-{} backlog {backlog}",
                    self.work.task_id(),
                    self.work.swimlane_id()
                ),
                format!("unconsumed events: {backlog}, alarm threshold: {threshold}"),
            );
        }

        if let Some(elapsed) = self.load_elapsed() {
            let limit = self.config.stuck_load_threshold();
            if elapsed > limit {
                self.work.alarm(
                    AlarmKind::TaskWarning,
                    format!(
                        "{}-{} target commit waiting",
                        self.work.task_id(),
                        self.work.swimlane_id()
                    ),
                    format!(
                        "load running for {}s, alarm threshold: {}s",
                        elapsed.as_secs(),
                        limit.as_secs()
                    ),
                );
            }
        }
    }

    /// Run [`Self::check_once`] on the configured interval until the task stops
    pub fn spawn_monitor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.position_check_interval();
        if period.is_zero() {
            return None;
        }

        let stage = Arc::clone(self);
        let mut stop = self.work.stop_signal();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => stage.check_once(),
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(
                task_id = stage.work.task_id(),
                swimlane_id = stage.work.swimlane_id(),
                "Load monitor stopped"
            );
        }))
    }
}

#[async_trait]
impl Stage for LoadStage {
    fn name(&self) -> &str {
        "load"
    }

    fn input(&self) -> &StageQueue<EtlBucket> {
        &self.input
    }

    fn stop_waiting(&self) -> bool {
        self.consumer.is_auto_commit_position()
    }

    async fn startup(&self) -> anyhow::Result<()> {
        self.loader.startup().await
    }

    async fn handle(&self, mut bucket: EtlBucket) -> Result<(), StageError> {
        if let Some(exception) = &bucket.exception {
            return Err(StageError::StopTrigger(exception.clone()));
        }

        let task_id = self.work.task_id();
        let swimlane_id = self.work.swimlane_id();

        // Nothing to apply, but the source still moved forward
        if bucket.is_empty() {
            if let Some(position) = bucket.position.clone() {
                self.commit(position.as_ref()).await?;
            }
            return Ok(());
        }

        self.mark_load_started();
        let timer = metrics::start_load_timer(task_id, swimlane_id);
        let result = self.loader.load(&bucket).await;
        drop(timer);
        self.clear_load_started();

        let outcome = result.map_err(StageError::Failed)?;
        metrics::record_batch(task_id, swimlane_id, outcome.succeeded);
        if !outcome.succeeded {
            return Err(StageError::StopTrigger(format!(
                "batch {} failed to load",
                bucket.sequence
            )));
        }

        if let Some(position) = bucket.position.clone() {
            self.commit(position.as_ref()).await?;
        }

        let batch_position = bucket.position.as_ref().map(|p| p.render());
        let misses = self
            .work
            .stats()
            .record_batch(&outcome.rows, batch_position.as_deref());
        tracing::debug!(
            task_id,
            swimlane_id,
            sequence = bucket.sequence,
            rows = outcome.rows.len(),
            misses,
            "Batch loaded"
        );
        bucket.mark_unused();
        Ok(())
    }

    async fn on_exit(&self) {
        if let Err(e) = self.loader.shutdown().await {
            tracing::warn!(
                task_id = self.work.task_id(),
                swimlane_id = self.work.swimlane_id(),
                error = %format!("{e:#}"),
                "Loader shutdown failed"
            );
        }
    }
}
