//! Offline queue behaviour through the engine.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tidesync_engine::{
    MemoryRemoteStore, OfflineAction, PushOutcome, SyncNotification, WireValue,
};

#[tokio::test]
async fn queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline_queue.bin");
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_connected(false);

    {
        let a = device_with(&remote, config().with_queue_path(&path));
        let mut n = note("n1", None, "Draft", "first");
        assert!(matches!(
            a.engine.create(&n).await.unwrap(),
            PushOutcome::Queued { .. }
        ));
        n.body = "second".into();
        a.engine.update(&mut n).await.unwrap();

        // Same key, so the update replaced the insert.
        assert_eq!(a.engine.queue().len(), 1);
        let pending = a.engine.queue().pending_for("notes", "n1").unwrap();
        assert_eq!(pending.action, OfflineAction::Update);
    }

    let restarted = device_with(&remote, config().with_queue_path(&path));
    assert_eq!(restarted.engine.queue().len(), 1);

    remote.set_connected(true);
    assert_eq!(restarted.engine.replay_offline_queue().await, 1);
    assert!(restarted.engine.queue().is_empty());

    let row = remote.row("notes", "n1").unwrap();
    assert_eq!(row.get("version"), Some(&WireValue::version(2)));
}

#[tokio::test]
async fn queued_delete_replays_as_narrow_update() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);

    let mut n = note("n1", None, "Doomed", "x");
    a.engine.create(&n).await.unwrap();

    remote.set_connected(false);
    assert!(matches!(
        a.engine.delete(&mut n).await.unwrap(),
        PushOutcome::Queued { .. }
    ));
    remote.set_connected(true);

    assert_eq!(a.engine.replay_offline_queue().await, 1);
    assert_eq!(remote.update_calls(), 1);
    assert_eq!(remote.upsert_calls(), 1);

    let row = remote.row("notes", "n1").unwrap();
    assert_eq!(row.get("deleted"), Some(&WireValue::Bool(true)));
    assert_eq!(row.get("version"), Some(&WireValue::version(2)));
    assert_eq!(row.get("title"), Some(&WireValue::from("Doomed")));
}

#[tokio::test]
async fn rejected_replay_is_dropped_and_reported() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);
    let b = device(&remote);

    let mut original = note("n1", None, "Shared", "v1");
    a.engine.create(&original).await.unwrap();
    let mut stale = b
        .engine
        .materialize::<Note>(&remote.row("notes", "n1").unwrap())
        .await
        .unwrap()
        .unwrap();

    remote.set_connected(false);
    stale.body = "offline edit".into();
    b.engine.update(&mut stale).await.unwrap();
    remote.set_connected(true);

    for body in ["v2", "v3"] {
        original.body = body.into();
        a.engine.update(&mut original).await.unwrap();
    }

    assert_eq!(b.engine.replay_offline_queue().await, 0);
    assert!(b.engine.queue().is_empty());
    assert_eq!(b.engine.stats().version_regressions, 1);
    assert!(b.observer.notifications().contains(&SyncNotification::VersionRegression {
        entity_type: "Note".into(),
        entity_id: "n1".into(),
        table: "notes".into(),
    }));
}

#[tokio::test]
async fn still_offline_keeps_operations() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);
    remote.set_connected(false);

    a.engine.create(&note("n1", None, "One", "1")).await.unwrap();
    a.engine.create(&note("n2", None, "Two", "2")).await.unwrap();

    assert_eq!(a.engine.replay_offline_queue().await, 0);
    let pending: Vec<_> = a
        .engine
        .queue()
        .snapshot()
        .into_iter()
        .map(|op| op.entity_id)
        .collect();
    assert_eq!(pending, vec!["n1", "n2"]);
}

#[tokio::test(start_paused = true)]
async fn background_replay_drains_queue() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);

    remote.set_connected(false);
    a.engine.create(&note("n1", None, "Later", "x")).await.unwrap();
    remote.set_connected(true);

    let handle = Arc::clone(&a.engine).spawn_queue_replay(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(a.engine.queue().is_empty());
    assert!(remote.row("notes", "n1").is_some());
    handle.abort();
}

#[tokio::test]
async fn delete_after_offline_create_stays_deleted() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);
    let b = device(&remote);

    let mut n = note("n1", None, "Short-lived", "x");
    remote.set_connected(false);
    a.engine.create(&n).await.unwrap();
    remote.set_connected(true);

    assert_eq!(a.engine.delete(&mut n).await.unwrap(), PushOutcome::Pushed);
    assert!(a.engine.queue().is_empty());
    assert_eq!(a.engine.replay_offline_queue().await, 0);

    let row = remote.row("notes", "n1").unwrap();
    assert_eq!(row.get("deleted"), Some(&WireValue::Bool(true)));
    assert_eq!(row.get("version"), Some(&WireValue::version(2)));

    // Another device never materializes the tombstone.
    assert!(b.engine.materialize::<Note>(&row).await.unwrap().is_none());
}

#[tokio::test]
async fn stale_queued_update_is_not_reported_as_drift() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);

    let mut n = note("n1", None, "Title", "v1");
    a.engine.create(&n).await.unwrap();

    remote.set_connected(false);
    n.body = "v2".into();
    a.engine.update(&mut n).await.unwrap();
    remote.set_connected(true);

    n.body = "v3".into();
    assert_eq!(a.engine.update(&mut n).await.unwrap(), PushOutcome::Pushed);

    assert_eq!(a.engine.replay_offline_queue().await, 0);
    assert_eq!(a.engine.stats().version_regressions, 0);
    assert!(!a
        .observer
        .notifications()
        .iter()
        .any(|n| matches!(n, SyncNotification::VersionRegression { .. })));
    assert_eq!(
        remote.row("notes", "n1").unwrap().get("version"),
        Some(&WireValue::version(3))
    );
}
