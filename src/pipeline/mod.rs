//! Staged execution of one task swimlane
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Source    │     │  Transform  │     │    Load     │
//! │  (submit)   │────▶│    Stage    │────▶│    Stage    │────▶ target
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                StageQueue          StageQueue       │
//!                                                     ├─▶ DataConsumer::commit_position
//!                                                     └─▶ TaskPositionUpload broadcast
//! ```
//!
//! Each stage runs in its own [`StageRunner`] loop. A stop-trigger failure in
//! any stage stops the whole task through [`TaskWork::stop_and_alarm`].

pub mod bucket;
pub mod converter;
pub mod load;
pub mod position;
pub mod queue;
pub mod stage;
pub mod transform;
pub mod work;

pub use bucket::{EtlBucket, EtlRow, EventType};
pub use converter::{EventConverter, PassThroughConverter};
pub use load::{DataConsumer, LoadOutcome, LoadStage, Loader};
pub use position::{OffsetPosition, Position};
pub use queue::{QueueSealed, StageQueue};
pub use stage::{Stage, StageError, StageRunner};
pub use transform::TransformStage;
pub use work::TaskWork;

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cluster::NodeContext;
use crate::config::LoadConfig;

/// Pluggable collaborators of one pipeline
pub struct PipelineParts {
    pub converter: Arc<dyn EventConverter>,
    pub loader: Arc<dyn Loader>,
    pub consumer: Arc<dyn DataConsumer>,
}

/// Running transform and load stages for one (task, swimlane)
pub struct TaskPipeline {
    work: Arc<TaskWork>,
    source: Arc<StageQueue<EtlBucket>>,
    load: Arc<LoadStage>,
    stages: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl TaskPipeline {
    /// Spawn every stage and the load monitor
    pub fn start(
        work: Arc<TaskWork>,
        parts: PipelineParts,
        context: Arc<NodeContext>,
        config: &LoadConfig,
    ) -> Self {
        let stop_waiting = parts.consumer.is_auto_commit_position();
        let source = Arc::new(StageQueue::new(config.queue_capacity));
        let transformed = Arc::new(StageQueue::new(config.queue_capacity));

        let transform = Arc::new(TransformStage::new(
            Arc::clone(&source),
            Arc::clone(&transformed),
            parts.converter,
            stop_waiting,
        ));
        let load = Arc::new(LoadStage::new(
            Arc::clone(&work),
            transformed,
            parts.loader,
            parts.consumer,
            context,
            config.clone(),
        ));

        let wait_timeout = config.stage_wait_timeout();
        let stages = vec![
            StageRunner::new(transform, Arc::clone(&work), wait_timeout).spawn(),
            StageRunner::new(
                Arc::clone(&load) as Arc<dyn Stage>,
                Arc::clone(&work),
                wait_timeout,
            )
            .spawn(),
        ];
        let monitor = load.spawn_monitor();

        tracing::info!(
            task_id = work.task_id(),
            swimlane_id = work.swimlane_id(),
            "Task pipeline started"
        );

        Self {
            work,
            source,
            load,
            stages,
            monitor,
        }
    }

    pub fn work(&self) -> &Arc<TaskWork> {
        &self.work
    }

    pub fn load_stage(&self) -> &Arc<LoadStage> {
        &self.load
    }

    /// Feed one batch, waiting while the pipeline is saturated
    pub async fn submit(&self, bucket: EtlBucket) -> Result<(), QueueSealed> {
        if self.work.is_stopping() {
            return Err(QueueSealed);
        }
        self.source.push(bucket).await
    }

    /// No more batches will be submitted; stages exit once drained
    pub fn finish(&self) {
        self.source.seal();
    }

    pub fn stop(&self) {
        self.work.stop();
    }

    /// Wait for every stage to exit, then stop the monitor
    pub async fn join(self) {
        for handle in self.stages {
            if let Err(e) = handle.await {
                tracing::error!(task_id = self.work.task_id(), error = %e, "Stage task panicked");
            }
        }

        self.work.stop();
        if let Some(monitor) = self.monitor {
            let _ = monitor.await;
        }
        tracing::info!(
            task_id = self.work.task_id(),
            swimlane_id = self.work.swimlane_id(),
            "Task pipeline finished"
        );
    }
}
