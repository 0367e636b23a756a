//! End-to-end scenarios: devices sharing one in-memory remote.

mod common;

use async_trait::async_trait;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tidesync_engine::{
    ChangeEvent, ChangeSink, MemoryRemoteStore, MergeOutcome, PushOutcome, RejectReason,
    RouteOutcome, SkipReason, SyncNotification, SyncResult, WireRecord, WireValue,
};
use tokio::sync::mpsc;

#[tokio::test]
async fn encrypted_fields_are_sealed_on_the_wire() {
    init_tracing();
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);
    let b = device(&remote);

    a.engine
        .create(&note("n1", None, "Groceries", "milk, eggs"))
        .await
        .unwrap();

    let row = remote.row("notes", "n1").unwrap();
    let body = row.get("body").and_then(WireValue::as_str).unwrap();
    assert!(body.starts_with("enc:"));
    assert_eq!(row.get("title"), Some(&WireValue::from("Groceries")));
    assert_eq!(row.get("user_id"), Some(&WireValue::from(USER)));

    let copy = b.engine.materialize::<Note>(&row).await.unwrap().unwrap();
    assert_eq!(copy.body, "milk, eggs");
    assert_eq!(copy.version, 1);
    assert_eq!(b.local().get::<Note>("n1").unwrap(), copy);
}

#[tokio::test]
async fn second_device_sees_updates_and_deletes() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);
    let b = device(&remote);

    let mut original = note("n1", None, "Draft", "first");
    a.engine.create(&original).await.unwrap();
    let mut copy = b
        .engine
        .materialize::<Note>(&remote.row("notes", "n1").unwrap())
        .await
        .unwrap()
        .unwrap();

    original.body = "second".into();
    a.engine.update(&mut original).await.unwrap();

    let row = remote.row("notes", "n1").unwrap();
    let outcome = b.engine.merge_remote(&row, Some(&mut copy)).await.unwrap();
    assert_eq!(outcome, MergeOutcome::Updated);
    assert_eq!(copy.body, "second");
    assert_eq!(copy.version, 2);

    a.engine.delete(&mut original).await.unwrap();
    let row = remote.row("notes", "n1").unwrap();
    b.engine.merge_remote(&row, Some(&mut copy)).await.unwrap();
    assert!(copy.deleted);
    assert_eq!(copy.version, 3);
    assert!(b.local().get::<Note>("n1").unwrap().deleted);
}

#[tokio::test]
async fn own_push_is_not_merged_back() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);

    let mut n = note("n1", None, "Mine", "body");
    a.engine.create(&n).await.unwrap();
    let row = remote.row("notes", "n1").unwrap();

    let outcome = a.engine.merge_remote(&row, Some(&mut n)).await.unwrap();
    assert_eq!(outcome, MergeOutcome::Skipped(SkipReason::Echo));
}

#[tokio::test]
async fn stale_write_is_rejected_and_reported() {
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

    original.body = "v2".into();
    a.engine.update(&mut original).await.unwrap();
    original.body = "v3".into();
    a.engine.update(&mut original).await.unwrap();

    // B is at 1, bumps to 2, remote is at 3.
    stale.body = "conflicting".into();
    let outcome = b.engine.update(&mut stale).await.unwrap();
    assert!(matches!(outcome, PushOutcome::Rejected { .. }));
    assert!(b.engine.queue().is_empty());
    assert!(b.observer.notifications().contains(&SyncNotification::VersionRegression {
        entity_type: "Note".into(),
        entity_id: "n1".into(),
        table: "notes".into(),
    }));

    // The local edit survives until reconciliation pulls the newer row.
    assert_eq!(b.local().get::<Note>("n1").unwrap().body, "conflicting");
}

#[tokio::test]
async fn same_version_from_two_devices_is_a_duplicate() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);
    let b = device(&remote);

    let mut first = note("n1", None, "Race", "a");
    a.engine.create(&first).await.unwrap();
    let mut second = b
        .engine
        .materialize::<Note>(&remote.row("notes", "n1").unwrap())
        .await
        .unwrap()
        .unwrap();

    first.body = "from a".into();
    second.body = "from b".into();
    assert_eq!(a.engine.update(&mut first).await.unwrap(), PushOutcome::Pushed);
    assert_eq!(b.engine.update(&mut second).await.unwrap(), PushOutcome::Duplicate);
    assert_eq!(b.engine.stats().duplicates, 1);
}

#[tokio::test(start_paused = true)]
async fn empty_remote_title_never_overwrites_local() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);

    let mut n = note("n1", None, "Keep me", "body");
    a.engine.create(&n).await.unwrap();

    let incoming = WireRecord::new()
        .with("id", "n1")
        .with("version", WireValue::version(5))
        .with("deleted", false)
        .with("title", "")
        .with("body", "plain legacy body");
    // Let the echo window of our own push lapse.
    tokio::time::sleep(Duration::from_secs(6)).await;

    let outcome = a.engine.merge_remote(&incoming, Some(&mut n)).await.unwrap();
    assert_eq!(
        outcome,
        MergeOutcome::Rejected(RejectReason::ProtectedField {
            column: "title".into()
        })
    );
    assert_eq!(n.title, "Keep me");
    assert_eq!(n.version, 1);
}

#[tokio::test]
async fn undelete_revives_on_every_device() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);
    let b = device(&remote);

    let mut n = note("n1", None, "Phoenix", "ash");
    a.engine.create(&n).await.unwrap();
    let mut copy = b
        .engine
        .materialize::<Note>(&remote.row("notes", "n1").unwrap())
        .await
        .unwrap()
        .unwrap();

    a.engine.delete(&mut n).await.unwrap();
    b.engine
        .merge_remote(&remote.row("notes", "n1").unwrap(), Some(&mut copy))
        .await
        .unwrap();
    assert!(copy.deleted);

    a.engine.undelete(&mut n).await.unwrap();
    assert_eq!(n.version, 1002);

    let outcome = b
        .engine
        .merge_remote(&remote.row("notes", "n1").unwrap(), Some(&mut copy))
        .await
        .unwrap();
    assert_eq!(outcome, MergeOutcome::Updated);
    assert!(!copy.deleted);
    assert_eq!(copy.version, 1002);
    assert_eq!(copy.body, "ash");
}

#[tokio::test]
async fn note_change_asks_for_folder_bump() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);

    let mut parent = folder("f1", "Work");
    a.engine.create(&parent).await.unwrap();
    a.engine
        .create(&note("n1", Some("f1"), "Task", "do it"))
        .await
        .unwrap();

    let bumps: Vec<_> = a
        .observer
        .notifications()
        .into_iter()
        .filter(|n| matches!(n, SyncNotification::ParentNeedsBump { .. }))
        .collect();
    assert_eq!(
        bumps,
        vec![SyncNotification::ParentNeedsBump {
            parent_table: "folders".into(),
            parent_id: "f1".into(),
        }]
    );

    a.engine.bump_hierarchy(&mut parent).await.unwrap();
    let row = remote.row("folders", "f1").unwrap();
    assert_eq!(row.get("version"), Some(&WireValue::version(2)));
}

#[tokio::test(start_paused = true)]
async fn bursts_of_changes_notify_once() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);

    let mut n = note("n1", None, "Burst", "0");
    a.engine.create(&n).await.unwrap();
    for i in 1..5 {
        n.body = i.to_string();
        a.engine.update(&mut n).await.unwrap();
    }
    assert_eq!(a.observer.changes_for("Note"), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(a.observer.changes_for("Note"), 1);
}

struct ForwardingSink {
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[async_trait]
impl ChangeSink for ForwardingSink {
    async fn apply_change(&self, event: ChangeEvent) -> SyncResult<()> {
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[tokio::test]
async fn realtime_changes_reach_other_devices_only() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let a = device(&remote);
    let b = device(&remote);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handles = b
        .engine
        .start_realtime(Arc::new(ForwardingSink { tx }))
        .await
        .unwrap();
    assert_eq!(handles.len(), 2);

    a.engine
        .create(&note("n1", None, "Live", "stream"))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.table, "notes");
    assert_eq!(event.entity_id().unwrap(), "n1");

    let (own_tx, _own_rx) = mpsc::unbounded_channel();
    let own_router = a.engine.realtime_router(Arc::new(ForwardingSink { tx: own_tx }));
    assert_eq!(own_router.handle(event).await, RouteOutcome::Echo);

    for handle in handles {
        handle.abort();
    }
}
