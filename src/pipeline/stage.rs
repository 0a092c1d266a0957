//! Generic stage contract and its run loop

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::bucket::EtlBucket;
use super::queue::StageQueue;
use super::work::TaskWork;
use crate::notifications::AlarmKind;

/// Failure of one stage iteration
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Data-integrity failure: the task must stop
    #[error("Stop trigger: {0}")]
    StopTrigger(String),

    /// Incidental failure: logged and alarmed, the loop keeps going
    #[error("{0:#}")]
    Failed(anyhow::Error),
}

impl StageError {
    pub fn is_stop_trigger(&self) -> bool {
        matches!(self, Self::StopTrigger(_))
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

/// One long-lived step of a task pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Queue this stage consumes
    fn input(&self) -> &StageQueue<EtlBucket>;

    /// Exit immediately on stop instead of draining queued batches
    fn stop_waiting(&self) -> bool {
        true
    }

    async fn startup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle(&self, bucket: EtlBucket) -> Result<(), StageError>;

    async fn on_exit(&self) {}
}

/// Drives one [`Stage`] until it is stopped or its input is exhausted
pub struct StageRunner {
    stage: Arc<dyn Stage>,
    work: Arc<TaskWork>,
    wait_timeout: Duration,
}

impl StageRunner {
    pub fn new(stage: Arc<dyn Stage>, work: Arc<TaskWork>, wait_timeout: Duration) -> Self {
        Self {
            stage,
            work,
            wait_timeout,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let stage = self.stage.name().to_string();
        let task_id = self.work.task_id().to_string();
        let swimlane_id = self.work.swimlane_id().to_string();

        if let Err(e) = self.stage.startup().await {
            self.work
                .stop_and_alarm(&format!("{stage} startup failed: {e:#}"))
                .await;
            self.stage.input().close().await;
            self.stage.on_exit().await;
            return;
        }
        tracing::debug!(%task_id, %swimlane_id, %stage, "Stage started");

        loop {
            if self.work.trigger_stopped() {
                break;
            }

            let input = self.stage.input();
            let bucket = if self.work.is_stopping() {
                if self.stage.stop_waiting() {
                    break;
                }
                // Drain what is already queued, then leave
                match input.poll().await {
                    Some(bucket) => bucket,
                    None => break,
                }
            } else {
                match input.wait_event(self.wait_timeout).await {
                    Some(bucket) => bucket,
                    None if input.is_exhausted() => break,
                    None => continue,
                }
            };

            let sequence = bucket.sequence;
            match self.stage.handle(bucket).await {
                Ok(()) => {}
                Err(StageError::StopTrigger(reason)) => {
                    tracing::error!(%task_id, %swimlane_id, %stage, sequence, %reason, "Stage hit stop trigger");
                    self.work.stop_and_alarm(&reason).await;
                    break;
                }
                Err(StageError::Failed(e)) => {
                    tracing::error!(%task_id, %swimlane_id, %stage, sequence, error = %format!("{e:#}"), "Stage iteration failed");
                    self.work.alarm(
                        AlarmKind::TaskLog,
                        format!("{task_id}-{swimlane_id} {stage} error"),
                        format!("batch {sequence}: {e:#}"),
                    );
                }
            }
        }

        // Nobody reads this queue any more; release producers blocked on it
        let dropped = self.stage.input().close().await;
        if dropped > 0 {
            tracing::warn!(%task_id, %swimlane_id, %stage, dropped, "Dropped unprocessed batches on exit");
        }
        self.stage.on_exit().await;
        tracing::debug!(%task_id, %swimlane_id, %stage, "Stage exited");
    }
}
