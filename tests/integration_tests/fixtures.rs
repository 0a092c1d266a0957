//! Shared builders and fakes for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lanesync::cluster::{Cluster, NodeCommand, NodeContext, TaskConfig, TaskStatus};
use lanesync::config::NodeConfig;
use lanesync::coordination::{paths, CoordinationClient, MemoryStore};
use lanesync::notifications::{Alarm, AlarmKind, AlarmSink};
use lanesync::pipeline::{DataConsumer, EtlBucket, EtlRow, EventType, LoadOutcome, Loader, OffsetPosition, Position};
use lanesync::stats::SubmitStatObject;

// ============================================================================
// Cluster
// ============================================================================

pub fn node_config(node_id: &str, address: &str, force_assign: bool) -> NodeConfig {
    NodeConfig::builder()
        .node_id(node_id)
        .address(address)
        .force_assign(force_assign)
        .heartbeat_initial_delay_secs(3600)
        .build()
        .unwrap()
}

/// Cluster layer for one node, with a fixed host name and process id
pub fn cluster(store: &Arc<MemoryStore>, node_id: &str, address: &str, force_assign: bool) -> Cluster {
    cluster_with_pid(store, node_id, address, force_assign, 1000)
}

pub fn cluster_with_pid(
    store: &Arc<MemoryStore>,
    node_id: &str,
    address: &str,
    force_assign: bool,
    process_id: u32,
) -> Cluster {
    let config = node_config(node_id, address, force_assign);
    let context = Arc::new(NodeContext::with_identity(
        &config,
        format!("host-{node_id}"),
        process_id,
    ));
    Cluster::with_context(store.clone(), context, config)
}

/// Publish a task swimlane configuration
pub async fn put_task(store: &MemoryStore, task_id: &str, swimlane_id: &str, status: TaskStatus) {
    let config = TaskConfig::new(task_id, swimlane_id).with_status(status);
    store
        .create(
            &paths::task_dist(task_id, swimlane_id),
            &serde_json::to_string(&config).unwrap(),
        )
        .await
        .unwrap();
}

/// Write a command entry for a node
pub async fn send_command(store: &MemoryStore, node_id: &str, command_id: &str, command: &NodeCommand) -> String {
    let path = paths::node_order(node_id, command_id);
    store
        .create(&path, &serde_json::to_string(command).unwrap())
        .await
        .unwrap();
    path
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Alarms
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    alarms: Mutex<Vec<Alarm>>,
}

impl RecordingSink {
    pub fn alarms(&self) -> Vec<Alarm> {
        self.alarms.lock().unwrap().clone()
    }

    pub fn count(&self, kind: AlarmKind) -> usize {
        self.alarms.lock().unwrap().iter().filter(|a| a.kind == kind).count()
    }
}

impl AlarmSink for RecordingSink {
    fn notify(&self, alarm: Alarm) {
        self.alarms.lock().unwrap().push(alarm);
    }
}

// ============================================================================
// Pipeline collaborators
// ============================================================================

/// Loader that fails the batches whose sequence is listed, and reports
/// `affect = 0` for rows whose table is `ghost`
#[derive(Default)]
pub struct FakeLoader {
    fail_sequences: Vec<u64>,
    delay: Duration,
    loaded: Mutex<Vec<u64>>,
    started: AtomicUsize,
    stopped: AtomicUsize,
}

impl FakeLoader {
    pub fn failing_on(fail_sequences: Vec<u64>) -> Self {
        Self {
            fail_sequences,
            ..Self::default()
        }
    }

    /// Spend `delay` inside every load call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn loaded(&self) -> Vec<u64> {
        self.loaded.lock().unwrap().clone()
    }

    pub fn lifecycle(&self) -> (usize, usize) {
        (
            self.started.load(Ordering::SeqCst),
            self.stopped.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl Loader for FakeLoader {
    async fn startup(&self) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, bucket: &EtlBucket) -> anyhow::Result<LoadOutcome> {
        self.loaded.lock().unwrap().push(bucket.sequence);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_sequences.contains(&bucket.sequence) {
            return Ok(LoadOutcome::failure());
        }
        let rows = bucket
            .rows
            .iter()
            .map(|row| {
                let affect = if row.table == "ghost" { 0 } else { 1 };
                let mut stat = SubmitStatObject::new(&row.schema, &row.table, row.op, affect);
                stat.position = row.position.clone();
                stat
            })
            .collect();
        Ok(LoadOutcome::success(rows))
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Consumer whose backlog is `end - offset`
pub struct FakeConsumer {
    end: i64,
    auto_commit: bool,
    committed: Mutex<Vec<String>>,
}

impl FakeConsumer {
    pub fn new(end: i64, auto_commit: bool) -> Self {
        Self {
            end,
            auto_commit,
            committed: Mutex::new(Vec::new()),
        }
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataConsumer for FakeConsumer {
    fn swimlane_id(&self) -> &str {
        "S1"
    }

    fn is_auto_commit_position(&self) -> bool {
        self.auto_commit
    }

    async fn commit_position(&self, position: &dyn Position) -> anyhow::Result<i64> {
        let rendered = position.render();
        let offset = OffsetPosition::parse(&rendered)
            .map(|p| p.offset as i64)
            .unwrap_or_default();
        self.committed.lock().unwrap().push(rendered);
        Ok((self.end - offset).max(0))
    }
}

/// Batch of `rows` insert rows on `app.<table>` ending at `offset`
pub fn batch(sequence: u64, table: &str, rows: usize, offset: u64) -> EtlBucket {
    let rows = (0..rows)
        .map(|i| {
            EtlRow::new("app", table, EventType::Insert)
                .with_column("id", Some(&i.to_string()))
                .with_position(format!("0:{offset}"))
        })
        .collect();
    EtlBucket::new(sequence, rows).with_position(OffsetPosition::new(0, offset))
}
