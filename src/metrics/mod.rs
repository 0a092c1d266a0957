//! Prometheus metrics for the cluster and pipeline layers
//!
//! This module provides metrics tracking for:
//! - Cluster: heartbeats, version conflicts, commands, task events, task locks
//! - Pipeline: batches loaded/failed, applied rows, backlog, load duration
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all cluster metrics
struct ClusterMetrics {
    heartbeats: Counter,
    heartbeat_conflicts: Counter,
    heartbeat_errors: Counter,
    commands: CounterVec,
    task_events: CounterVec,
    locks_acquired: Counter,
    locks_released: Counter,
    node_working: Gauge,
}

/// Container for all pipeline metrics
struct PipelineMetrics {
    batches_loaded: CounterVec,
    batches_failed: CounterVec,
    rows_applied: CounterVec,
    backlog: GaugeVec,
    load_duration: HistogramVec,
}

/// Global storage for cluster metrics
static CLUSTER_METRICS: OnceLock<ClusterMetrics> = OnceLock::new();

/// Global storage for pipeline metrics
static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once. If registration fails, the error is returned
/// and every recording helper stays a no-op.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let cluster = ClusterMetrics {
        heartbeats: register_counter!(
            "lanesync_node_heartbeats_total",
            "Total number of heartbeats written"
        )?,
        heartbeat_conflicts: register_counter!(
            "lanesync_node_heartbeat_conflicts_total",
            "Heartbeats skipped because of a version conflict"
        )?,
        heartbeat_errors: register_counter!(
            "lanesync_node_heartbeat_errors_total",
            "Heartbeats that failed for other reasons"
        )?,
        commands: register_counter_vec!(
            "lanesync_node_commands_total",
            "Node commands processed by kind",
            &["command"]
        )?,
        task_events: register_counter_vec!(
            "lanesync_task_events_total",
            "Task events raised by kind",
            &["event"]
        )?,
        locks_acquired: register_counter!(
            "lanesync_task_locks_acquired_total",
            "Task locks acquired by this node"
        )?,
        locks_released: register_counter!(
            "lanesync_task_locks_released_total",
            "Task locks released by this node"
        )?,
        node_working: register_gauge!(
            "lanesync_node_working",
            "Whether the node is in a working state (1 = yes, 0 = no)"
        )?,
    };

    let pipeline = PipelineMetrics {
        batches_loaded: register_counter_vec!(
            "lanesync_load_batches_total",
            "Batches applied to the target",
            &["task", "swimlane"]
        )?,
        batches_failed: register_counter_vec!(
            "lanesync_load_batches_failed_total",
            "Batches rejected by the loader",
            &["task", "swimlane"]
        )?,
        rows_applied: register_counter_vec!(
            "lanesync_load_rows_total",
            "Rows applied by table, operation and outcome",
            &["table", "op", "outcome"]
        )?,
        backlog: register_gauge_vec!(
            "lanesync_consume_backlog",
            "Unconsumed events reported by the last position commit",
            &["task", "swimlane"]
        )?,
        load_duration: register_histogram_vec!(
            "lanesync_load_duration_seconds",
            "Time spent inside the loader per batch",
            &["task", "swimlane"],
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 300.0]
        )?,
    };

    CLUSTER_METRICS
        .set(cluster)
        .map_err(|_| "Cluster metrics already initialized")?;
    PIPELINE_METRICS
        .set(pipeline)
        .map_err(|_| "Pipeline metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    CLUSTER_METRICS.get().is_some() && PIPELINE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a successful heartbeat write
pub fn record_heartbeat() {
    if let Some(m) = CLUSTER_METRICS.get() {
        m.heartbeats.inc();
    }
}

/// Record a heartbeat lost to a concurrent writer
pub fn record_heartbeat_conflict() {
    if let Some(m) = CLUSTER_METRICS.get() {
        m.heartbeat_conflicts.inc();
    }
}

/// Record a heartbeat failure
pub fn record_heartbeat_error() {
    if let Some(m) = CLUSTER_METRICS.get() {
        m.heartbeat_errors.inc();
    }
}

/// Record a processed node command
pub fn record_command(command: &str) {
    if let Some(m) = CLUSTER_METRICS.get() {
        m.commands.with_label_values(&[command]).inc();
    }
}

/// Record a raised task event
pub fn record_task_event(event: &str) {
    if let Some(m) = CLUSTER_METRICS.get() {
        m.task_events.with_label_values(&[event]).inc();
    }
}

/// Record a task lock transition
pub fn record_task_lock(acquired: bool) {
    let Some(m) = CLUSTER_METRICS.get() else {
        return;
    };

    if acquired {
        m.locks_acquired.inc();
    } else {
        m.locks_released.inc();
    }
}

/// Update the node working flag
pub fn update_node_working(working: bool) {
    if let Some(m) = CLUSTER_METRICS.get() {
        m.node_working.set(if working { 1.0 } else { 0.0 });
    }
}

/// Record the outcome of one loader call
pub fn record_batch(task: &str, swimlane: &str, succeeded: bool) {
    let Some(m) = PIPELINE_METRICS.get() else {
        return;
    };

    if succeeded {
        m.batches_loaded.with_label_values(&[task, swimlane]).inc();
    } else {
        m.batches_failed.with_label_values(&[task, swimlane]).inc();
    }
}

/// Record one applied row
pub fn record_row(table: &str, op: &str, hit: bool) {
    if let Some(m) = PIPELINE_METRICS.get() {
        let outcome = if hit { "success" } else { "error" };
        m.rows_applied.with_label_values(&[table, op, outcome]).inc();
    }
}

/// Update the backlog gauge after a position commit
pub fn update_backlog(task: &str, swimlane: &str, backlog: i64) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.backlog
            .with_label_values(&[task, swimlane])
            .set(backlog as f64);
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a load timer for one batch
pub fn start_load_timer(task: &str, swimlane: &str) -> MetricsTimer {
    match PIPELINE_METRICS.get() {
        Some(m) => MetricsTimer::new(
            m.load_duration
                .with_label_values(&[task, swimlane])
                .start_timer(),
        ),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
