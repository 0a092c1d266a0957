//! Task pipelines wired to the real cluster provider

use std::sync::Arc;
use std::time::Duration;

use lanesync::cluster::model::ErrorMarker;
use lanesync::cluster::{Cluster, TaskStatus};
use lanesync::config::LoadConfig;
use lanesync::coordination::{paths, CoordinationClient, MemoryStore};
use lanesync::notifications::AlarmKind;
use lanesync::pipeline::{
    EtlBucket, EtlRow, EventConverter, EventType, OffsetPosition, PassThroughConverter,
    PipelineParts, TaskPipeline, TaskWork,
};

use super::fixtures::{batch, cluster, put_task, FakeConsumer, FakeLoader, RecordingSink};

struct Harness {
    store: Arc<MemoryStore>,
    node: Cluster,
    sink: Arc<RecordingSink>,
    loader: Arc<FakeLoader>,
    consumer: Arc<FakeConsumer>,
    pipeline: TaskPipeline,
}

async fn harness(loader: FakeLoader, converter: Arc<dyn EventConverter>) -> Harness {
    harness_with(loader, converter, 64).await
}

async fn harness_with(
    loader: FakeLoader,
    converter: Arc<dyn EventConverter>,
    queue_capacity: usize,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);
    put_task(&store, "T1", "S1", TaskStatus::Working).await;
    node.registry.register().await.unwrap();
    assert!(node.assignment.acquire("T1", "S1").await.unwrap());

    let sink = Arc::new(RecordingSink::default());
    let loader = Arc::new(loader);
    let consumer = Arc::new(FakeConsumer::new(100, true));
    let work = Arc::new(
        TaskWork::new("T1", "S1", sink.clone(), node.provider.clone())
            .with_recipients(vec!["dba".to_string()]),
    );
    let config = LoadConfig {
        stage_wait_timeout_ms: 10,
        queue_capacity,
        ..LoadConfig::default()
    };
    let pipeline = TaskPipeline::start(
        work,
        PipelineParts {
            converter,
            loader: loader.clone(),
            consumer: consumer.clone(),
        },
        node.context.clone(),
        &config,
    );

    Harness {
        store,
        node,
        sink,
        loader,
        consumer,
        pipeline,
    }
}

async fn run_to_end(pipeline: TaskPipeline, batches: Vec<EtlBucket>) {
    for bucket in batches {
        // Submissions after a stop are refused
        if pipeline.submit(bucket).await.is_err() {
            break;
        }
    }
    pipeline.finish();
    tokio::time::timeout(Duration::from_secs(5), pipeline.join())
        .await
        .expect("pipeline should exit");
}

/// Rejects rows of the `poison` table
struct PoisonConverter;

impl EventConverter for PoisonConverter {
    fn name(&self) -> &str {
        "poison_check"
    }

    fn convert(&self, row: EtlRow) -> anyhow::Result<Option<EtlRow>> {
        if row.table == "poison" {
            anyhow::bail!("column id is not numeric");
        }
        Ok(Some(row))
    }
}

#[tokio::test]
async fn test_batches_flow_to_target_and_positions_are_shared() {
    let h = harness(FakeLoader::default(), Arc::new(PassThroughConverter)).await;
    let work = h.pipeline.work().clone();

    run_to_end(
        h.pipeline,
        vec![
            batch(1, "orders", 2, 10),
            batch(2, "orders", 2, 20),
            batch(3, "orders", 2, 30),
        ],
    )
    .await;

    assert_eq!(h.loader.loaded(), vec![1, 2, 3]);
    assert_eq!(h.loader.lifecycle(), (1, 1));
    assert_eq!(h.consumer.committed(), vec!["0:10", "0:20", "0:30"]);
    assert_eq!(
        h.node
            .assignment
            .resume_position("T1", "S1")
            .await
            .unwrap()
            .as_deref(),
        Some("0:30")
    );

    let stat = work.stats().table("app", "orders").unwrap();
    assert_eq!(stat.insert_rows, 6);
    assert_eq!(stat.total_errors(), 0);
    assert_eq!(stat.progress.as_deref(), Some("0:30"));

    assert_eq!(h.node.context.consume_progress("T1-S1").await, Some(70));
    assert!(!work.trigger_stopped());
    assert!(h.sink.alarms().is_empty());
    assert!(h
        .store
        .exists(&paths::task_lock("T1", "S1"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_failed_batch_stops_the_swimlane() {
    let h = harness(FakeLoader::failing_on(vec![2]), Arc::new(PassThroughConverter)).await;
    let work = h.pipeline.work().clone();

    run_to_end(
        h.pipeline,
        vec![
            batch(1, "orders", 1, 10),
            batch(2, "orders", 1, 20),
            batch(3, "orders", 1, 30),
        ],
    )
    .await;

    assert!(work.trigger_stopped());
    assert_eq!(h.loader.loaded(), vec![1, 2]);
    assert_eq!(h.consumer.committed(), vec!["0:10"]);

    // Error marker written, lock and ownership released
    let (data, _) = h
        .store
        .get_data(&paths::task_error("T1", "S1"))
        .await
        .unwrap()
        .unwrap();
    let marker: ErrorMarker = serde_json::from_str(&data).unwrap();
    assert_eq!(marker.node_id, "n1");
    assert!(marker.reason.contains("batch 2 failed to load"));
    assert!(h
        .store
        .exists(&paths::task_lock("T1", "S1"))
        .await
        .unwrap()
        .is_none());
    assert!(h.node.assignment.owned().await.unwrap().is_empty());
    assert!(h.node.assignment.is_error_stopped("T1", "S1").await);
    assert_eq!(h.node.context.consume_progress("T1-S1").await, None);

    // The last good position is what another node resumes from
    assert_eq!(
        h.node
            .assignment
            .resume_position("T1", "S1")
            .await
            .unwrap()
            .as_deref(),
        Some("0:10")
    );

    assert_eq!(h.sink.count(AlarmKind::TaskStop), 1);
    let alarm = &h.sink.alarms()[0];
    assert_eq!(alarm.task_id.as_deref(), Some("T1"));
    assert_eq!(alarm.recipients, vec!["dba".to_string()]);
}

#[tokio::test]
async fn test_row_misses_are_counted_without_stopping() {
    let h = harness(FakeLoader::default(), Arc::new(PassThroughConverter)).await;
    let work = h.pipeline.work().clone();

    let mut rows = vec![EtlRow::new("app", "orders", EventType::Update).with_position("0:5")];
    rows.extend((0..3).map(|_| EtlRow::new("app", "ghost", EventType::Delete)));
    let mixed = EtlBucket::new(1, rows).with_position(OffsetPosition::new(0, 5));

    run_to_end(h.pipeline, vec![mixed, batch(2, "orders", 1, 6)]).await;

    assert!(!work.trigger_stopped());
    assert_eq!(h.loader.loaded(), vec![1, 2]);

    let ghost = work.stats().table("app", "ghost").unwrap();
    assert_eq!(ghost.error_delete_rows, 3);
    assert_eq!(ghost.total_success(), 0);

    let orders = work.stats().table("app", "orders").unwrap();
    assert_eq!(orders.update_rows, 1);
    assert_eq!(orders.insert_rows, 1);
    assert!(h.sink.alarms().is_empty());
}

#[tokio::test]
async fn test_conversion_failure_stops_before_loading() {
    let h = harness(FakeLoader::default(), Arc::new(PoisonConverter)).await;
    let work = h.pipeline.work().clone();

    run_to_end(
        h.pipeline,
        vec![batch(1, "orders", 2, 10), batch(2, "poison", 2, 20)],
    )
    .await;

    assert!(work.trigger_stopped());
    assert_eq!(h.loader.loaded(), vec![1]);

    let alarms = h.sink.alarms();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].kind, AlarmKind::TaskStop);
    assert!(alarms[0].message.contains("poison_check failed on app.poison in batch 2"));
    assert!(alarms[0].message.contains("column id is not numeric"));
    assert!(h.node.assignment.is_error_stopped("T1", "S1").await);
}

#[tokio::test]
async fn test_empty_batch_advances_position() {
    let h = harness(FakeLoader::default(), Arc::new(PassThroughConverter)).await;

    let empty = EtlBucket::new(1, Vec::new()).with_position(OffsetPosition::new(0, 40));
    run_to_end(h.pipeline, vec![empty]).await;

    assert!(h.loader.loaded().is_empty());
    assert_eq!(h.consumer.committed(), vec!["0:40"]);
    assert_eq!(h.node.context.consume_progress("T1-S1").await, Some(60));
}

#[tokio::test]
async fn test_stop_releases_saturated_pipeline() {
    let loader = FakeLoader::failing_on(vec![1]).with_delay(Duration::from_millis(100));
    let h = harness_with(loader, Arc::new(PassThroughConverter), 1).await;
    let work = h.pipeline.work().clone();

    let mut accepted = 0;
    for sequence in 1..=6 {
        let offset = sequence * 10;
        let submitted = tokio::time::timeout(
            Duration::from_secs(1),
            h.pipeline.submit(batch(sequence, "orders", 1, offset)),
        )
        .await
        .unwrap_or_else(|_| panic!("submit of batch {sequence} stayed blocked"));
        if submitted.is_err() {
            break;
        }
        accepted += 1;
    }
    assert!(accepted < 6);

    h.pipeline.finish();
    tokio::time::timeout(Duration::from_secs(2), h.pipeline.join())
        .await
        .expect("pipeline should exit after a stop trigger");

    assert!(work.trigger_stopped());
    assert_eq!(h.loader.loaded(), vec![1]);
    assert!(h.consumer.committed().is_empty());
    assert_eq!(h.sink.count(AlarmKind::TaskStop), 1);
    assert!(h.node.assignment.is_error_stopped("T1", "S1").await);
}
