//! Offline mutation records.

use crate::error::{ProtocolError, ProtocolResult};
use crate::value::WireRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfflineAction {
    /// Entity was created.
    Insert,
    /// Entity was updated (full upsert).
    Update,
    /// Entity was tombstoned (narrow update).
    Delete,
}

impl OfflineAction {
    /// Returns a stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineAction::Insert => "insert",
            OfflineAction::Update => "update",
            OfflineAction::Delete => "delete",
        }
    }
}

/// A mutation that failed to reach the remote store and waits for replay.
///
/// Operations are keyed by `(table, entity_id)`; a queue holds at most one
/// per key. `queued_at` identifies a particular enqueue of that key, so a
/// replay can tell the operation it ran apart from a newer one for the same
/// entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    /// Remote table name.
    pub table: String,
    /// Mutation kind.
    pub action: OfflineAction,
    /// CBOR-encoded `WireRecord`, if the action carries one.
    pub payload: Option<Vec<u8>>,
    /// Entity ID.
    pub entity_id: String,
    /// When the operation was enqueued.
    pub queued_at: DateTime<Utc>,
}

impl OfflineOperation {
    /// Creates an operation carrying an encoded record.
    pub fn new(
        table: impl Into<String>,
        action: OfflineAction,
        record: Option<&WireRecord>,
        entity_id: impl Into<String>,
        queued_at: DateTime<Utc>,
    ) -> ProtocolResult<Self> {
        let payload = record.map(WireRecord::encode).transpose()?;
        Ok(Self {
            table: table.into(),
            action,
            payload,
            entity_id: entity_id.into(),
            queued_at,
        })
    }

    /// Returns the deduplication key.
    pub fn key(&self) -> (&str, &str) {
        (&self.table, &self.entity_id)
    }

    /// Returns true if `other` targets the same `(table, entity_id)`.
    pub fn same_key(&self, other: &OfflineOperation) -> bool {
        self.key() == other.key()
    }

    /// Returns true if `other` is this exact enqueue (same key and time).
    pub fn same_enqueue(&self, other: &OfflineOperation) -> bool {
        self.same_key(other) && self.queued_at == other.queued_at
    }

    /// Decodes the payload record.
    pub fn record(&self) -> ProtocolResult<Option<WireRecord>> {
        self.payload.as_deref().map(WireRecord::decode).transpose()
    }

    /// Encodes a list of operations, preserving order.
    pub fn encode_list(operations: &[OfflineOperation]) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(operations, &mut buf)
            .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes a list of operations.
    pub fn decode_list(bytes: &[u8]) -> ProtocolResult<Vec<OfflineOperation>> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ID_COLUMN;
    use chrono::Duration;

    fn make_op(entity_id: &str, at: DateTime<Utc>) -> OfflineOperation {
        let record = WireRecord::new().with(ID_COLUMN, entity_id);
        OfflineOperation::new("notes", OfflineAction::Update, Some(&record), entity_id, at).unwrap()
    }

    #[test]
    fn key_identity() {
        let now = Utc::now();
        let a = make_op("x", now);
        let b = make_op("x", now + Duration::milliseconds(1));
        let c = make_op("y", now);

        assert!(a.same_key(&b));
        assert!(!a.same_enqueue(&b));
        assert!(a.same_enqueue(&a.clone()));
        assert!(!a.same_key(&c));
    }

    #[test]
    fn payload_decodes_back() {
        let op = make_op("x", Utc::now());
        let record = op.record().unwrap().unwrap();
        assert_eq!(record.id().unwrap(), "x");
    }

    #[test]
    fn list_preserves_order() {
        let now = Utc::now();
        let ops = vec![make_op("b", now), make_op("a", now)];
        let bytes = OfflineOperation::encode_list(&ops).unwrap();
        let decoded = OfflineOperation::decode_list(&bytes).unwrap();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn action_names() {
        assert_eq!(OfflineAction::Insert.as_str(), "insert");
        assert_eq!(OfflineAction::Delete.as_str(), "delete");
    }
}
