//! Coordination store faults and recovery

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use lanesync::cluster::{Node, NodeCommand, TaskEvent, TaskLock, TaskStatus};
use lanesync::coordination::{paths, CoordinationClient, MemoryStore, StoreError, ANY_VERSION};
use lanesync::error::Error;

use super::fixtures::{cluster, cluster_with_pid, put_task, send_command, wait_until};

#[tokio::test]
async fn test_command_survives_session_loss_once() {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);
    put_task(&store, "T1", "S1", TaskStatus::Working).await;
    assert!(node.assignment.acquire("T1", "S1").await.unwrap());

    let mut events = node.registry.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bus = node.event_bus(store.clone()).start(shutdown_rx);

    // The command is both notified and picked up by the resync
    let path = send_command(&store, "n1", "c1", &NodeCommand::ReleaseWork).await;
    store.simulate_session_loss();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("stop event")
        .unwrap();
    assert!(matches!(event, TaskEvent::Stop(_)));

    let store_ref = store.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            let store = store_ref.clone();
            let path = path.clone();
            async move { store.exists(&path).await.unwrap().is_none() }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "command must be handled once");

    shutdown_tx.send_replace(true);
    bus.join().await;
}

#[tokio::test]
async fn test_expired_session_resyncs_pending_commands() {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bus = node.event_bus(store.clone()).start(shutdown_rx);

    let path = send_command(&store, "n1", "c1", &NodeCommand::WorkLimit { work_limit: 3 }).await;
    store.expire_session();

    let context = node.context.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            let context = context.clone();
            async move { context.work_limit() == 3 }
        })
        .await
    );
    let store_ref = store.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            let store = store_ref.clone();
            let path = path.clone();
            async move { store.exists(&path).await.unwrap().is_none() }
        })
        .await
    );

    shutdown_tx.send_replace(true);
    bus.join().await;
}

#[tokio::test]
async fn test_failed_write_surfaces_and_next_attempt_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);

    store.fail_next_writes(1);
    let err = node.assignment.assign("T1", "S1").await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::Connection(_))));
    assert!(node.assignment.owned().await.unwrap().is_empty());

    assert!(node.assignment.assign("T1", "S1").await.unwrap());
    assert_eq!(node.assignment.owned().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_lock_given_back_when_ownership_cannot_be_recorded() {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);
    node.registry.register().await.unwrap();

    // Every version-checked attempt loses the race
    store.conflict_next_writes(5);
    let err = node.assignment.acquire("T1", "S1").await.unwrap_err();
    assert!(matches!(err, Error::VersionConflict { attempts: 5, .. }));
    assert!(store
        .exists(&paths::task_lock("T1", "S1"))
        .await
        .unwrap()
        .is_none());

    assert!(node.assignment.acquire("T1", "S1").await.unwrap());
}

#[tokio::test]
async fn test_malformed_command_is_deleted() {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);

    let path = paths::node_order("n1", "c1");
    store.create(&path, "{not json").await.unwrap();
    node.registry.handle_command(&path).await.unwrap();
    assert!(store.exists(&path).await.unwrap().is_none());

    // Unknown command names are rejected the same way
    let path = paths::node_order("n1", "c2");
    store.create(&path, r#"{"command":"REBOOT"}"#).await.unwrap();
    node.registry.handle_command(&path).await.unwrap();
    assert!(store.exists(&path).await.unwrap().is_none());
}

#[tokio::test]
async fn test_restarted_node_preempts_own_lock_under_force() {
    let store = Arc::new(MemoryStore::new());
    let before = cluster_with_pid(&store, "n1", "10.0.0.1", true, 1000);
    assert!(before.assignment.acquire("T1", "S1").await.unwrap());

    let restarted = cluster_with_pid(&store, "n1", "10.0.0.1", true, 2000);
    assert!(restarted.assignment.acquire("T1", "S1").await.unwrap());
    let (data, _) = store
        .get_data(&paths::task_lock("T1", "S1"))
        .await
        .unwrap()
        .unwrap();
    let lock: TaskLock = serde_json::from_str(&data).unwrap();
    assert!(lock.held_by("n1", "10.0.0.1"));

    let without_force = cluster_with_pid(&store, "n1", "10.0.0.1", false, 3000);
    assert!(!without_force.assignment.acquire("T1", "S1").await.unwrap());

    let stranger = cluster(&store, "n2", "10.0.0.2", true);
    assert!(!stranger.assignment.acquire("T1", "S1").await.unwrap());
}

#[tokio::test]
async fn test_restart_without_force_keeps_owned_swimlanes() {
    let store = Arc::new(MemoryStore::new());
    let before = cluster_with_pid(&store, "n1", "10.0.0.1", false, 1000);
    before.registry.register().await.unwrap();
    assert!(before.assignment.acquire("T1", "S1").await.unwrap());

    // Crash: no shutdown, the identity and task locks stay behind
    let restarted = cluster_with_pid(&store, "n1", "10.0.0.1", false, 2000);
    restarted.registry.register().await.unwrap();
    assert_eq!(
        restarted.assignment.owned().await.unwrap(),
        vec![("T1".to_string(), "S1".to_string())]
    );
    assert!(restarted.assignment.is_locked("T1", "S1").await);

    // The kept ownership is what lets RELEASE_WORK reach the swimlane
    let mut events = restarted.registry.subscribe();
    let path = send_command(&store, "n1", "c1", &NodeCommand::ReleaseWork).await;
    restarted.registry.handle_command(&path).await.unwrap();
    match events.try_recv() {
        Ok(TaskEvent::Stop(config)) => {
            assert_eq!(config.task_id, "T1");
            assert_eq!(config.swimlane_id, "S1");
        }
        other => panic!("expected a stop event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stale_identity_holder_is_replaced_under_force() {
    let store = Arc::new(MemoryStore::new());
    let first = cluster(&store, "n1", "10.0.0.1", false);
    first.registry.register().await.unwrap();

    let replacement = cluster(&store, "n1", "10.0.0.2", true);
    let err = replacement.registry.register().await.unwrap_err();
    assert!(matches!(err, Error::NodeAlreadyRegistered { .. }));

    // The first holder stops heartbeating
    let stat = paths::node_stat("n1");
    let (data, _) = store.get_data(&stat).await.unwrap().unwrap();
    let mut record: Node = serde_json::from_str(&data).unwrap();
    record.heartbeat = Some(Utc::now() - chrono::Duration::minutes(10));
    store
        .set_data(&stat, &serde_json::to_string(&record).unwrap(), ANY_VERSION)
        .await
        .unwrap();

    replacement.registry.register().await.unwrap();
    let (data, _) = store
        .get_data(&paths::node_lock("n1"))
        .await
        .unwrap()
        .unwrap();
    let lock: TaskLock = serde_json::from_str(&data).unwrap();
    assert!(lock.held_by("n1", "10.0.0.2"));
}
