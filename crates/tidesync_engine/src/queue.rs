//! Durable queue of mutations that failed to reach the remote store.
//!
//! ## File format
//!
//! ```text
//! | Magic (4 bytes: "TSQ1") | CBOR array of OfflineOperation |
//! ```
//!
//! The file is replaced atomically (temp file, fsync, rename) on every
//! change. A missing or unreadable file loads as an empty queue.

use crate::error::{ErrorClass, SyncError, SyncResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tidesync_protocol::{OfflineAction, OfflineOperation};
use tracing::{debug, info, warn};

/// Magic bytes at the start of a queue file.
pub const QUEUE_MAGIC: [u8; 4] = *b"TSQ1";

#[derive(Default)]
struct QueueState {
    operations: Vec<OfflineOperation>,
    last_queued_at: Option<DateTime<Utc>>,
}

/// Offline mutation queue, at most one operation per `(table, entity_id)`.
pub struct OfflineQueue {
    path: Option<PathBuf>,
    state: Mutex<QueueState>,
    /// Serializes file writes so a stale snapshot never lands last.
    persist_lock: Mutex<()>,
    replaying: AtomicBool,
}

impl OfflineQueue {
    /// Creates a queue that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(QueueState::default()),
            persist_lock: Mutex::new(()),
            replaying: AtomicBool::new(false),
        }
    }

    /// Opens the queue stored at `path`.
    ///
    /// A missing file yields an empty queue. So does a corrupt one; it is
    /// logged and overwritten on the next change.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let operations = match load(&path) {
            Ok(operations) => operations,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "offline queue unreadable, starting empty");
                Vec::new()
            }
        };
        if !operations.is_empty() {
            info!(path = %path.display(), pending = operations.len(), "loaded offline queue");
        }

        let last_queued_at = operations.iter().map(|op| op.queued_at).max();
        Self {
            path: Some(path),
            state: Mutex::new(QueueState {
                operations,
                last_queued_at,
            }),
            persist_lock: Mutex::new(()),
            replaying: AtomicBool::new(false),
        }
    }

    /// Backing file, if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Queues an operation, replacing any pending one for the same key.
    ///
    /// Returns the stored operation. Its `queued_at` is strictly greater
    /// than that of any operation enqueued before it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the queue file could not be written. The
    /// operation stays queued in memory either way.
    pub fn enqueue(
        &self,
        table: &str,
        action: OfflineAction,
        payload: Option<Vec<u8>>,
        entity_id: &str,
    ) -> SyncResult<OfflineOperation> {
        let operation = {
            let mut state = self.state.lock();
            let queued_at = next_timestamp(state.last_queued_at);
            state.last_queued_at = Some(queued_at);

            let operation = OfflineOperation {
                table: table.to_string(),
                action,
                payload,
                entity_id: entity_id.to_string(),
                queued_at,
            };
            state.operations.retain(|op| !op.same_key(&operation));
            state.operations.push(operation.clone());
            operation
        };

        debug!(table, entity_id, action = action.as_str(), "queued offline operation");
        self.persist()?;
        Ok(operation)
    }

    /// Removes the pending operation for `(table, entity_id)` if it is not
    /// newer than `version`.
    ///
    /// Called once a write at `version` reached the remote, so the stale
    /// operation is never replayed over it. An operation whose payload has
    /// no readable version counts as stale.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the queue file could not be written. The
    /// operation is removed from memory either way.
    pub fn supersede(
        &self,
        table: &str,
        entity_id: &str,
        version: u64,
    ) -> SyncResult<Option<OfflineOperation>> {
        let removed = {
            let mut state = self.state.lock();
            let Some(index) = state.operations.iter().position(|op| {
                op.key() == (table, entity_id) && queued_version(op).map_or(true, |v| v <= version)
            }) else {
                return Ok(None);
            };
            state.operations.remove(index)
        };

        debug!(table, entity_id, version, action = removed.action.as_str(), "superseded queued operation");
        self.persist()?;
        Ok(Some(removed))
    }

    /// Replays every queued operation through `executor`, one at a time.
    ///
    /// Works on a snapshot, so the lock is not held while operations run.
    /// Operations superseded or replaced after the snapshot was taken are
    /// skipped. Afterwards:
    /// - operations that succeeded, or failed permanently, are removed, but
    ///   only if they were not re-enqueued in the meantime;
    /// - operations that failed transiently are re-added unless a newer
    ///   operation for the same key arrived during the replay.
    ///
    /// Returns the number of operations the remote accepted. A call made
    /// while another replay is running returns 0 immediately.
    pub async fn process_queue<F, Fut>(&self, mut executor: F) -> usize
    where
        F: FnMut(OfflineOperation) -> Fut,
        Fut: Future<Output = SyncResult<()>>,
    {
        if self
            .replaying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("offline queue replay already running");
            return 0;
        }
        let _guard = ReplayGuard(&self.replaying);

        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return 0;
        }

        let mut succeeded = 0;
        let mut consumed = Vec::with_capacity(snapshot.len());
        let mut failed = Vec::new();

        for operation in snapshot {
            if !self.is_queued(&operation) {
                debug!(table = %operation.table, entity_id = %operation.entity_id, "skipping superseded operation");
                continue;
            }
            match executor(operation.clone()).await {
                Ok(()) => {
                    succeeded += 1;
                    consumed.push(operation);
                }
                Err(e) => match e.classify() {
                    ErrorClass::Benign => {
                        debug!(table = %operation.table, entity_id = %operation.entity_id, error = %e, "queued operation already applied remotely");
                        succeeded += 1;
                        consumed.push(operation);
                    }
                    ErrorClass::Transient => {
                        debug!(table = %operation.table, entity_id = %operation.entity_id, error = %e, "queued operation still failing");
                        failed.push(operation);
                    }
                    ErrorClass::Permanent | ErrorClass::Configuration => {
                        warn!(table = %operation.table, entity_id = %operation.entity_id, error = %e, "dropping queued operation rejected permanently");
                        consumed.push(operation);
                    }
                },
            }
        }

        {
            let mut state = self.state.lock();
            state
                .operations
                .retain(|current| !consumed.iter().any(|done| done.same_enqueue(current)));
            for operation in failed {
                if !state.operations.iter().any(|current| current.same_key(&operation)) {
                    state.operations.push(operation);
                }
            }
        }

        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist offline queue after replay");
        }
        succeeded
    }

    /// Returns a copy of the pending operations in queue order.
    pub fn snapshot(&self) -> Vec<OfflineOperation> {
        self.state.lock().operations.clone()
    }

    /// Returns the pending operation for `(table, entity_id)`.
    pub fn pending_for(&self, table: &str, entity_id: &str) -> Option<OfflineOperation> {
        self.state
            .lock()
            .operations
            .iter()
            .find(|op| op.key() == (table, entity_id))
            .cloned()
    }

    fn is_queued(&self, operation: &OfflineOperation) -> bool {
        self.state
            .lock()
            .operations
            .iter()
            .any(|current| current.same_enqueue(operation))
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.state.lock().operations.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every pending operation.
    pub fn clear(&self) -> SyncResult<()> {
        let dropped = std::mem::take(&mut self.state.lock().operations);
        if !dropped.is_empty() {
            info!(dropped = dropped.len(), "offline queue cleared");
        }
        self.persist()
    }

    fn persist(&self) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _write = self.persist_lock.lock();
        let operations = self.snapshot();
        let encoded = OfflineOperation::encode_list(&operations)?;

        let mut data = Vec::with_capacity(QUEUE_MAGIC.len() + encoded.len());
        data.extend_from_slice(&QUEUE_MAGIC);
        data.extend(encoded);

        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("path", &self.path)
            .field("pending", &self.len())
            .finish()
    }
}

struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn load(path: &Path) -> SyncResult<Vec<OfflineOperation>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let body = data
        .strip_prefix(&QUEUE_MAGIC[..])
        .ok_or_else(|| SyncError::build("queue file has no TSQ1 header"))?;
    Ok(OfflineOperation::decode_list(body)?)
}

fn queued_version(operation: &OfflineOperation) -> Option<u64> {
    operation.record().ok().flatten()?.version().ok()
}

/// Wall-clock time, nudged forward so enqueue stamps never repeat.
fn next_timestamp(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match last {
        Some(last) if now <= last => last + ChronoDuration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tidesync_protocol::{WireRecord, WireValue, ID_COLUMN, VERSION_COLUMN};

    fn payload(tag: u8) -> Option<Vec<u8>> {
        Some(vec![tag])
    }

    #[test]
    fn enqueue_replaces_same_key() {
        let queue = OfflineQueue::in_memory();
        queue.enqueue("notes", OfflineAction::Update, payload(1), "n1").unwrap();
        queue.enqueue("notes", OfflineAction::Update, payload(2), "n2").unwrap();
        let second = queue.enqueue("notes", OfflineAction::Delete, payload(3), "n1").unwrap();

        assert_eq!(queue.len(), 2);
        let pending = queue.pending_for("notes", "n1").unwrap();
        assert_eq!(pending, second);
        assert_eq!(pending.action, OfflineAction::Delete);
        assert_eq!(queue.snapshot().last().unwrap().entity_id, "n1");
    }

    #[test]
    fn queued_at_strictly_increases() {
        let queue = OfflineQueue::in_memory();
        let mut last = None;
        for i in 0..50 {
            let op = queue.enqueue("notes", OfflineAction::Update, None, &format!("n{i}")).unwrap();
            if let Some(prev) = last {
                assert!(op.queued_at > prev);
            }
            last = Some(op.queued_at);
        }
    }

    #[test]
    fn same_key_different_tables() {
        let queue = OfflineQueue::in_memory();
        queue.enqueue("notes", OfflineAction::Update, None, "x").unwrap();
        queue.enqueue("folders", OfflineAction::Update, None, "x").unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn replay_removes_successes_and_keeps_transient_failures() {
        let queue = OfflineQueue::in_memory();
        queue.enqueue("notes", OfflineAction::Update, payload(1), "ok").unwrap();
        queue.enqueue("notes", OfflineAction::Update, payload(2), "flaky").unwrap();
        queue.enqueue("notes", OfflineAction::Update, payload(3), "stale").unwrap();
        queue.enqueue("notes", OfflineAction::Update, payload(4), "dup").unwrap();

        let succeeded = queue
            .process_queue(|op| async move {
                match op.entity_id.as_str() {
                    "ok" => Ok(()),
                    "flaky" => Err(SyncError::transport_retryable("connection lost")),
                    "stale" => Err(SyncError::version_regression("remote ahead")),
                    _ => Err(SyncError::duplicate_version("already there")),
                }
            })
            .await;

        assert_eq!(succeeded, 2);
        let remaining: Vec<_> = queue.snapshot().into_iter().map(|op| op.entity_id).collect();
        assert_eq!(remaining, vec!["flaky"]);
    }

    #[tokio::test]
    async fn replay_keeps_operation_enqueued_during_run() {
        let queue = OfflineQueue::in_memory();
        queue.enqueue("notes", OfflineAction::Update, payload(1), "k").unwrap();

        let succeeded = queue
            .process_queue(|_| {
                queue.enqueue("notes", OfflineAction::Update, payload(2), "k").unwrap();
                async { Ok(()) }
            })
            .await;

        assert_eq!(succeeded, 1);
        let pending = queue.pending_for("notes", "k").unwrap();
        assert_eq!(pending.payload, payload(2));
    }

    #[tokio::test]
    async fn failed_replay_keeps_newer_operation_enqueued_during_run() {
        let queue = OfflineQueue::in_memory();
        queue.enqueue("notes", OfflineAction::Update, payload(1), "k").unwrap();
        queue.enqueue("notes", OfflineAction::Update, payload(5), "other").unwrap();

        let succeeded = queue
            .process_queue(|op| {
                if op.entity_id == "k" {
                    queue.enqueue("notes", OfflineAction::Delete, payload(2), "k").unwrap();
                }
                async { Err(SyncError::transport_retryable("connection lost")) }
            })
            .await;

        assert_eq!(succeeded, 0);
        assert_eq!(queue.len(), 2);
        let pending = queue.pending_for("notes", "k").unwrap();
        assert_eq!(pending.action, OfflineAction::Delete);
        assert_eq!(pending.payload, payload(2));
        assert_eq!(queue.pending_for("notes", "other").unwrap().payload, payload(5));
    }

    #[test]
    fn supersede_removes_only_that_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let queue = OfflineQueue::open(&path);
        queue.enqueue("notes", OfflineAction::Insert, payload(1), "n1").unwrap();
        queue.enqueue("notes", OfflineAction::Update, payload(2), "n2").unwrap();

        let removed = queue.supersede("notes", "n1", 1).unwrap().unwrap();
        assert_eq!(removed.action, OfflineAction::Insert);
        assert!(queue.supersede("notes", "n1", 1).unwrap().is_none());
        assert!(queue.supersede("folders", "n2", 1).unwrap().is_none());

        let reopened = OfflineQueue::open(&path);
        assert_eq!(reopened.len(), 1);
        assert!(reopened.pending_for("notes", "n2").is_some());
    }

    #[test]
    fn supersede_keeps_newer_operation() {
        let queue = OfflineQueue::in_memory();
        let record = |version| {
            WireRecord::new()
                .with(ID_COLUMN, "n1")
                .with(VERSION_COLUMN, WireValue::version(version))
                .encode()
                .ok()
        };
        queue.enqueue("notes", OfflineAction::Update, record(3), "n1").unwrap();

        assert!(queue.supersede("notes", "n1", 2).unwrap().is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.supersede("notes", "n1", 3).unwrap().is_some());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn replay_skips_operations_superseded_mid_run() {
        let queue = OfflineQueue::in_memory();
        queue.enqueue("notes", OfflineAction::Update, payload(1), "a").unwrap();
        queue.enqueue("notes", OfflineAction::Update, payload(2), "b").unwrap();
        let executed = parking_lot::Mutex::new(Vec::new());

        let succeeded = queue
            .process_queue(|op| {
                executed.lock().push(op.entity_id.clone());
                queue.supersede("notes", "b", 1).unwrap();
                async { Ok(()) }
            })
            .await;

        assert_eq!(succeeded, 1);
        assert_eq!(*executed.lock(), vec!["a"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn empty_queue_is_noop() {
        let queue = OfflineQueue::in_memory();
        let calls = AtomicUsize::new(0);
        let succeeded = queue
            .process_queue(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert_eq!(succeeded, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.bin");

        let queue = OfflineQueue::open(&path);
        queue.enqueue("notes", OfflineAction::Insert, payload(9), "n1").unwrap();
        queue.enqueue("notes", OfflineAction::Delete, None, "n2").unwrap();
        drop(queue);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"TSQ1");

        let reopened = OfflineQueue::open(&path);
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.pending_for("notes", "n1").unwrap().payload, payload(9));

        let later = reopened.enqueue("notes", OfflineAction::Update, None, "n3").unwrap();
        let earlier = reopened.pending_for("notes", "n2").unwrap();
        assert!(later.queued_at > earlier.queued_at);
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        fs::write(&path, b"garbage that is not a queue").unwrap();

        let queue = OfflineQueue::open(&path);
        assert!(queue.is_empty());

        queue.enqueue("notes", OfflineAction::Update, None, "n1").unwrap();
        assert_eq!(OfflineQueue::open(&path).len(), 1);
    }

    #[test]
    fn clear_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let queue = OfflineQueue::open(&path);
        queue.enqueue("notes", OfflineAction::Update, None, "n1").unwrap();
        queue.clear().unwrap();

        assert!(queue.is_empty());
        assert!(OfflineQueue::open(&path).is_empty());
    }
}
