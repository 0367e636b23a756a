//! Realtime change events.
//!
//! The remote store pushes one event per row change. Events carry no
//! origin information, so a client sees its own writes come back; the
//! engine filters those through its echo tracker.

use crate::error::{ProtocolError, ProtocolResult};
use crate::value::WireRecord;
use crate::version::VersionState;
use crate::ID_COLUMN;

/// Type of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Row was inserted.
    Insert,
    /// Row was updated.
    Update,
    /// Row was physically deleted.
    Delete,
}

/// A single row change from the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Remote table name.
    pub table: String,
    /// Type of change.
    pub kind: ChangeKind,
    /// Row image after the change (Insert/Update).
    pub new_record: Option<WireRecord>,
    /// Row image before the change, when the backend provides one.
    pub old_record: Option<WireRecord>,
}

impl ChangeEvent {
    /// Creates an insert event.
    pub fn insert(table: impl Into<String>, record: WireRecord) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            new_record: Some(record),
            old_record: None,
        }
    }

    /// Creates an update event.
    pub fn update(table: impl Into<String>, record: WireRecord, old: Option<WireRecord>) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            new_record: Some(record),
            old_record: old,
        }
    }

    /// Creates a delete event.
    pub fn delete(table: impl Into<String>, old: WireRecord) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            new_record: None,
            old_record: Some(old),
        }
    }

    /// Returns the most recent row image available.
    pub fn record(&self) -> Option<&WireRecord> {
        self.new_record.as_ref().or(self.old_record.as_ref())
    }

    /// Returns the affected entity ID.
    pub fn entity_id(&self) -> ProtocolResult<&str> {
        self.record()
            .ok_or_else(|| ProtocolError::missing_column(ID_COLUMN))?
            .id()
    }

    /// Returns the row's version state after the change, if known.
    pub fn version_state(&self) -> Option<VersionState> {
        self.new_record
            .as_ref()
            .and_then(|record| record.version_state().ok())
    }
}
