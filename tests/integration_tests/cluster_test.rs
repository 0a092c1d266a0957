//! Multi-node coordination scenarios

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use lanesync::cluster::{
    ClusterBroadcaster, ClusterCommand, HeartbeatOutcome, NodeCommand, NodeStatus, TaskEvent,
    TaskStatus,
};
use lanesync::coordination::{paths, CoordinationClient, MemoryStore};
use lanesync::error::Error;

use super::fixtures::{cluster, put_task, send_command, wait_until};

fn drain(events: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_racing_nodes_get_one_lock() {
    let store = Arc::new(MemoryStore::new());
    let a = cluster(&store, "n1", "10.0.0.1", false);
    let b = cluster(&store, "n2", "10.0.0.2", false);

    let (got_a, got_b) = tokio::join!(
        a.assignment.acquire("T1", "S1"),
        b.assignment.acquire("T1", "S1")
    );
    let (got_a, got_b) = (got_a.unwrap(), got_b.unwrap());
    assert!(got_a ^ got_b, "exactly one node must win the lock");

    let (winner, loser) = if got_a { (&a, &b) } else { (&b, &a) };
    assert_eq!(
        winner.assignment.owned().await.unwrap(),
        vec![("T1".to_string(), "S1".to_string())]
    );
    assert!(loser.assignment.owned().await.unwrap().is_empty());
    assert!(loser.assignment.is_locked("T1", "S1").await);
}

#[tokio::test]
async fn test_is_locked_depends_on_identity_and_force() {
    let store = Arc::new(MemoryStore::new());
    let holder = cluster(&store, "n1", "10.0.0.1", true);
    assert!(!holder.assignment.is_locked("T1", "S1").await);
    assert!(holder.assignment.acquire("T1", "S1").await.unwrap());

    // Same identity under force-assign is not blocked by its own lock
    assert!(!holder.assignment.is_locked("T1", "S1").await);

    let same_identity_no_force = cluster(&store, "n1", "10.0.0.1", false);
    assert!(same_identity_no_force.assignment.is_locked("T1", "S1").await);

    let same_id_other_address = cluster(&store, "n1", "10.0.0.9", true);
    assert!(same_id_other_address.assignment.is_locked("T1", "S1").await);

    let other = cluster(&store, "n2", "10.0.0.2", true);
    assert!(other.assignment.is_locked("T1", "S1").await);
}

#[tokio::test]
async fn test_release_work_through_event_bus() {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);
    put_task(&store, "T1", "S1", TaskStatus::Working).await;
    put_task(&store, "T1", "S2", TaskStatus::Working).await;
    for (task, swim) in [("T1", "S1"), ("T1", "S2"), ("T2", "S1")] {
        assert!(node.assignment.acquire(task, swim).await.unwrap());
    }

    let mut events = node.registry.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bus = node.event_bus(store.clone()).start(shutdown_rx);

    let path = send_command(&store, "n1", "c1", &NodeCommand::ReleaseWork).await;

    let mut stopped = HashSet::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("stop event")
            .unwrap();
        let TaskEvent::Stop(config) = event else {
            panic!("expected a stop event");
        };
        assert_eq!(config.status, TaskStatus::Stopped);
        stopped.insert((config.task_id, config.swimlane_id));
    }
    assert_eq!(stopped.len(), 3);
    // T2/S1 has no published config; the stop event is synthesized
    assert!(stopped.contains(&("T2".to_string(), "S1".to_string())));

    let store_ref = store.clone();
    let path_ref = path.clone();
    assert!(
        wait_until(Duration::from_secs(2), move || {
            let store = store_ref.clone();
            let path = path_ref.clone();
            async move { store.exists(&path).await.unwrap().is_none() }
        })
        .await
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut events).is_empty(), "command must be handled once");

    shutdown_tx.send_replace(true);
    bus.join().await;
}

#[tokio::test]
async fn test_resume_working_recruits_free_swimlanes() {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);
    let other = cluster(&store, "n2", "10.0.0.2", false);

    put_task(&store, "T1", "S1", TaskStatus::Working).await;
    put_task(&store, "T1", "S2", TaskStatus::Working).await;
    put_task(&store, "T2", "S1", TaskStatus::Working).await;
    put_task(&store, "T2", "S2", TaskStatus::Working).await;
    put_task(&store, "T3", "S1", TaskStatus::Working).await;
    put_task(&store, "T3", "S2", TaskStatus::Stopped).await;

    assert!(other.assignment.acquire("T2", "S2").await.unwrap());
    other
        .assignment
        .mark_error_stopped("T3", "S1", "bad row")
        .await
        .unwrap();

    let mut events = node.registry.subscribe();

    let suspend = send_command(
        &store,
        "n1",
        "c1",
        &NodeCommand::ChangeStatus {
            status: NodeStatus::Suspend,
        },
    )
    .await;
    node.registry.handle_command(&suspend).await.unwrap();
    assert_eq!(node.context.status().await, NodeStatus::Suspend);
    assert!(drain(&mut events).is_empty());

    let resume = send_command(
        &store,
        "n1",
        "c2",
        &NodeCommand::ChangeStatus {
            status: NodeStatus::Working,
        },
    )
    .await;
    node.registry.handle_command(&resume).await.unwrap();
    assert_eq!(node.context.status().await, NodeStatus::Working);

    let recruited: HashSet<(String, String)> = drain(&mut events)
        .into_iter()
        .map(|event| match event {
            TaskEvent::Assign(cfg) => (cfg.task_id, cfg.swimlane_id),
            TaskEvent::Stop(_) => panic!("unexpected stop event"),
        })
        .collect();
    let expected: HashSet<(String, String)> = [("T1", "S1"), ("T1", "S2"), ("T2", "S1")]
        .into_iter()
        .map(|(t, s)| (t.to_string(), s.to_string()))
        .collect();
    assert_eq!(recruited, expected);

    assert!(store.exists(&suspend).await.unwrap().is_none());
    assert!(store.exists(&resume).await.unwrap().is_none());
}

#[tokio::test]
async fn test_negative_work_limit_is_ignored() {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);

    let path = send_command(&store, "n1", "c1", &NodeCommand::WorkLimit { work_limit: 5 }).await;
    node.registry.handle_command(&path).await.unwrap();
    assert_eq!(node.context.work_limit(), 5);

    let path = send_command(&store, "n1", "c2", &NodeCommand::WorkLimit { work_limit: -1 }).await;
    node.registry.handle_command(&path).await.unwrap();
    assert_eq!(node.context.work_limit(), 5);
    assert!(store.exists(&path).await.unwrap().is_none());
}

#[tokio::test]
async fn test_identity_is_free_after_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let first = cluster(&store, "n1", "10.0.0.1", false);
    let second = cluster(&store, "n1", "10.0.0.2", false);

    first
        .provider
        .broadcast(ClusterCommand::NodeRegister {
            upload_statistic: true,
        })
        .await
        .unwrap();
    assert!(first.context.is_registered());

    let err = second.registry.register().await.unwrap_err();
    assert!(matches!(err, Error::NodeAlreadyRegistered { .. }));

    first.provider.broadcast(ClusterCommand::Shutdown).await.unwrap();
    assert!(!first.context.is_registered());
    assert_eq!(first.context.status().await, NodeStatus::Suspend);

    second.registry.register().await.unwrap();
    let (holder, _) = store
        .get_data(&paths::node_lock("n1"))
        .await
        .unwrap()
        .unwrap();
    assert!(holder.contains("10.0.0.2"));
}

#[tokio::test]
async fn test_heartbeat_conflict_then_recovers() {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);
    node.registry.register().await.unwrap();

    store.conflict_next_writes(1);
    assert_eq!(
        node.registry.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::Conflict
    );
    assert_eq!(
        node.registry.heartbeat_once().await.unwrap(),
        HeartbeatOutcome::Written
    );
}

#[tokio::test]
async fn test_heartbeat_keeps_ownership() {
    let store = Arc::new(MemoryStore::new());
    let node = cluster(&store, "n1", "10.0.0.1", false);
    node.registry.register().await.unwrap();
    assert!(node.assignment.acquire("T1", "S1").await.unwrap());

    node.registry.heartbeat_once().await.unwrap();
    node.registry.heartbeat_once().await.unwrap();

    assert_eq!(
        node.assignment.owned().await.unwrap(),
        vec![("T1".to_string(), "S1".to_string())]
    );
}
