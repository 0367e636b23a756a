//! Remote store abstraction.
//!
//! Provides a trait for the hosted table backend and an in-memory
//! implementation for testing that enforces the same version guards as
//! the production database triggers.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tidesync_protocol::{
    ChangeEvent, VersionState, WireRecord, WireValue, DEFAULT_UNDELETE_DELTA, ID_COLUMN,
    UPDATED_AT_COLUMN,
};
use tokio::sync::mpsc;

/// Realtime change events for one table.
pub type ChangeStream = mpsc::Receiver<ChangeEvent>;

/// Capacity of a change stream channel.
pub const CHANGE_STREAM_CAPACITY: usize = 1024;

/// Row filter for `select`.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnFilter {
    /// `column = value`.
    Eq(String, WireValue),
    /// `column IN (values)`.
    In(String, Vec<WireValue>),
}

impl ColumnFilter {
    /// Creates an equality filter.
    pub fn eq(column: impl Into<String>, value: impl Into<WireValue>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    /// Creates a membership filter.
    pub fn any_of<V: Into<WireValue>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    /// Returns true if the row passes the filter.
    pub fn matches(&self, record: &WireRecord) -> bool {
        match self {
            ColumnFilter::Eq(column, value) => record.get(column) == Some(value),
            ColumnFilter::In(column, values) => record
                .get(column)
                .is_some_and(|current| values.contains(current)),
        }
    }
}

/// Hosted table backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Inserts or replaces rows, matching existing ones on `conflict_key`.
    async fn upsert(&self, table: &str, records: &[WireRecord], conflict_key: &str)
        -> SyncResult<()>;

    /// Updates only the given columns of the row with this ID.
    ///
    /// Returns the number of rows matched, 0 if the row does not exist.
    async fn update(&self, table: &str, partial: &WireRecord, id: &str) -> SyncResult<usize>;

    /// Reads rows, optionally projected to `columns` (empty means all).
    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        filter: Option<&ColumnFilter>,
    ) -> SyncResult<Vec<WireRecord>>;

    /// Opens the realtime change stream of a table.
    async fn subscribe(&self, table: &str) -> SyncResult<ChangeStream>;
}

/// In-memory remote store for testing.
///
/// Enforces, per row:
/// - the version never decreases;
/// - a tombstone is cleared only by a jump of at least the undelete delta;
/// - a same-version write must carry the same content.
pub struct MemoryRemoteStore {
    tables: RwLock<HashMap<String, BTreeMap<String, WireRecord>>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<ChangeEvent>>>>,
    failures: Mutex<VecDeque<SyncError>>,
    connected: AtomicBool,
    undelete_delta: u64,
    upsert_calls: AtomicUsize,
    update_calls: AtomicUsize,
    select_calls: AtomicUsize,
}

impl MemoryRemoteStore {
    /// Creates an empty store with the default undelete delta.
    pub fn new() -> Self {
        Self::with_undelete_delta(DEFAULT_UNDELETE_DELTA)
    }

    /// Creates an empty store with a custom undelete delta.
    pub fn with_undelete_delta(undelete_delta: u64) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(true),
            undelete_delta,
            upsert_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            select_calls: AtomicUsize::new(0),
        }
    }

    /// Simulates losing or regaining the connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes the next call fail with `error`. Calls queue up in order.
    pub fn fail_next(&self, error: SyncError) {
        self.failures.lock().push_back(error);
    }

    /// Stores a row directly, bypassing guards and subscribers.
    pub fn insert_row(&self, table: &str, record: WireRecord) -> SyncResult<()> {
        let id = record.id()?.to_string();
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(id, record);
        Ok(())
    }

    /// Returns one row.
    pub fn row(&self, table: &str, id: &str) -> Option<WireRecord> {
        self.tables.read().get(table)?.get(id).cloned()
    }

    /// Returns all rows of a table, ordered by ID.
    pub fn rows(&self, table: &str) -> Vec<WireRecord> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of `upsert` calls that reached the store.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Number of `update` calls that reached the store.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of `select` calls that reached the store.
    pub fn select_calls(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> SyncResult<()> {
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("connection lost"));
        }
        Ok(())
    }

    /// Applies the row guards to a write of `incoming` over `existing`.
    ///
    /// Returns false for an idempotent repeat that changes nothing.
    fn check_guards(
        &self,
        id: &str,
        existing: &WireRecord,
        incoming: &WireRecord,
    ) -> SyncResult<bool> {
        let current = existing.version_state()?;
        let next = incoming.version_state()?;

        if next.version < current.version {
            return Err(SyncError::version_regression(format!(
                "{id}: version {} is behind stored version {}",
                next.version, current.version
            )));
        }
        if current.deleted && !next.deleted && !is_undelete(current, next, self.undelete_delta) {
            return Err(SyncError::invalid_undelete(format!(
                "{id}: version {} does not clear tombstone at version {}",
                next.version, current.version
            )));
        }
        if next.version == current.version {
            if same_content(existing, incoming) {
                return Ok(false);
            }
            return Err(SyncError::duplicate_version(format!(
                "{id}: row already at version {}",
                current.version
            )));
        }
        Ok(true)
    }

    fn emit(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(&event.table) {
            senders.retain(|sender| match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemoteStore")
            .field("tables", &self.tables.read().len())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

fn is_undelete(current: VersionState, next: VersionState, delta: u64) -> bool {
    next.version
        .checked_sub(current.version)
        .is_some_and(|jump| jump >= delta)
}

fn same_content(a: &WireRecord, b: &WireRecord) -> bool {
    let strip = |record: &WireRecord| {
        let mut copy = record.clone();
        copy.remove(UPDATED_AT_COLUMN);
        copy
    };
    strip(a) == strip(b)
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn upsert(
        &self,
        table: &str,
        records: &[WireRecord],
        conflict_key: &str,
    ) -> SyncResult<()> {
        self.check_available()?;
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);

        let mut events = Vec::new();
        {
            let mut tables = self.tables.write();
            let rows = tables.entry(table.to_string()).or_default();

            // Validate the whole batch first so a rejected row aborts it.
            let mut writes = Vec::with_capacity(records.len());
            for record in records {
                let key = record
                    .get(conflict_key)
                    .and_then(WireValue::to_text)
                    .ok_or_else(|| SyncError::from_backend(Some("23502"), format!("null value in column {conflict_key}")))?;
                let changed = match rows.get(&key) {
                    Some(existing) => self.check_guards(&key, existing, record)?,
                    None => true,
                };
                if changed {
                    writes.push((key, record.clone()));
                }
            }

            for (key, record) in writes {
                let event = match rows.insert(key, record.clone()) {
                    Some(old) => ChangeEvent::update(table, record, Some(old)),
                    None => ChangeEvent::insert(table, record),
                };
                events.push(event);
            }
        }

        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn update(&self, table: &str, partial: &WireRecord, id: &str) -> SyncResult<usize> {
        self.check_available()?;
        self.update_calls.fetch_add(1, Ordering::SeqCst);

        let event = {
            let mut tables = self.tables.write();
            let Some(existing) = tables.get_mut(table).and_then(|rows| rows.get_mut(id)) else {
                return Ok(0);
            };

            let mut merged = existing.clone();
            for (column, value) in partial.iter() {
                merged.insert(column.clone(), value.clone());
            }
            merged.insert(ID_COLUMN, id);

            if !self.check_guards(id, existing, &merged)? {
                return Ok(1);
            }
            let old = std::mem::replace(existing, merged.clone());
            ChangeEvent::update(table, merged, Some(old))
        };

        self.emit(event);
        Ok(1)
    }

    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        filter: Option<&ColumnFilter>,
    ) -> SyncResult<Vec<WireRecord>> {
        self.check_available()?;
        self.select_calls.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.read();
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|row| filter.map_or(true, |f| f.matches(row)))
            .map(|row| {
                if columns.is_empty() {
                    row.clone()
                } else {
                    row.project(columns)
                }
            })
            .collect())
    }

    async fn subscribe(&self, table: &str) -> SyncResult<ChangeStream> {
        self.check_available()?;
        let (sender, receiver) = mpsc::channel(CHANGE_STREAM_CAPACITY);
        self.subscribers
            .lock()
            .entry(table.to_string())
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}
