//! Row conversion stage

use async_trait::async_trait;
use std::sync::Arc;

use super::bucket::EtlBucket;
use super::converter::EventConverter;
use super::queue::StageQueue;
use super::stage::{Stage, StageError};

/// Applies an [`EventConverter`] to every row and forwards the batch
pub struct TransformStage {
    input: Arc<StageQueue<EtlBucket>>,
    output: Arc<StageQueue<EtlBucket>>,
    converter: Arc<dyn EventConverter>,
    stop_waiting: bool,
}

impl TransformStage {
    pub fn new(
        input: Arc<StageQueue<EtlBucket>>,
        output: Arc<StageQueue<EtlBucket>>,
        converter: Arc<dyn EventConverter>,
        stop_waiting: bool,
    ) -> Self {
        Self {
            input,
            output,
            converter,
            stop_waiting,
        }
    }

    fn convert(&self, mut bucket: EtlBucket) -> EtlBucket {
        if bucket.exception.is_some() {
            return bucket;
        }

        let mut rows = Vec::with_capacity(bucket.rows.len());
        for row in std::mem::take(&mut bucket.rows) {
            let table = row.qualified_table();
            match self.converter.convert(row) {
                Ok(Some(converted)) => rows.push(converted),
                Ok(None) => {}
                Err(e) => {
                    bucket.exception = Some(format!(
                        "{} failed on {table} in batch {}: {e:#}",
                        self.converter.name(),
                        bucket.sequence
                    ));
                    rows.clear();
                    break;
                }
            }
        }
        bucket.rows = rows;
        bucket
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn name(&self) -> &str {
        "transform"
    }

    fn input(&self) -> &StageQueue<EtlBucket> {
        &self.input
    }

    fn stop_waiting(&self) -> bool {
        self.stop_waiting
    }

    async fn handle(&self, bucket: EtlBucket) -> Result<(), StageError> {
        let bucket = self.convert(bucket);
        let sequence = bucket.sequence;
        if self.output.push(bucket).await.is_err() {
            // Load has exited; the batch is replayed from the last shared position
            tracing::warn!(sequence, "Load stage gone, dropping converted batch");
        }
        Ok(())
    }

    async fn on_exit(&self) {
        self.output.seal();
    }
}
