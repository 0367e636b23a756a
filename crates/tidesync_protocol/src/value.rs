//! Wire scalar and record types.

use crate::error::{ProtocolError, ProtocolResult};
use crate::version::VersionState;
use crate::{DELETED_COLUMN, ID_COLUMN, VERSION_COLUMN};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed scalar as exchanged with the remote store.
///
/// Rows are flat maps of column name to one of these. Dates, UUIDs and
/// enums travel as `Text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Double-precision float.
    Double(f64),
    /// UTF-8 text.
    Text(String),
}

impl WireValue {
    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, WireValue::Null)
    }

    /// Returns the text payload without coercion.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Coerces to an integer.
    ///
    /// Accepts integers, integral doubles and numeric text (the latter is
    /// what a decrypted field looks like).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::Integer(v) => Some(*v),
            WireValue::Double(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            WireValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Coerces to a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WireValue::Double(v) => Some(*v),
            WireValue::Integer(v) => Some(*v as f64),
            WireValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Coerces to a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(v) => Some(*v),
            WireValue::Integer(0) => Some(false),
            WireValue::Integer(1) => Some(true),
            WireValue::Text(s) => match s.trim() {
                "true" | "t" | "1" => Some(true),
                "false" | "f" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Coerces to a version number.
    ///
    /// Versions are unsigned locally but travel as signed 64-bit integers;
    /// values above `i64::MAX` round-trip through their two's-complement image.
    pub fn as_version(&self) -> Option<u64> {
        match self {
            WireValue::Integer(v) => Some(*v as u64),
            WireValue::Text(s) => s.trim().parse().ok(),
            WireValue::Double(v) if v.fract() == 0.0 && *v >= 0.0 => Some(*v as u64),
            _ => None,
        }
    }

    /// Returns the string representation used for field encryption.
    ///
    /// `Null` has no representation.
    pub fn to_text(&self) -> Option<String> {
        match self {
            WireValue::Null => None,
            WireValue::Bool(v) => Some(v.to_string()),
            WireValue::Integer(v) => Some(v.to_string()),
            WireValue::Double(v) => Some(v.to_string()),
            WireValue::Text(s) => Some(s.clone()),
        }
    }

    /// Returns true if the value carries no content: null, or text that is
    /// empty after trimming.
    pub fn is_empty_content(&self) -> bool {
        match self {
            WireValue::Null => true,
            WireValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Encodes a version for the wire.
    pub fn version(version: u64) -> Self {
        WireValue::Integer(version as i64)
    }
}

impl From<bool> for WireValue {
    fn from(v: bool) -> Self {
        WireValue::Bool(v)
    }
}

impl From<i64> for WireValue {
    fn from(v: i64) -> Self {
        WireValue::Integer(v)
    }
}

impl From<i32> for WireValue {
    fn from(v: i32) -> Self {
        WireValue::Integer(i64::from(v))
    }
}

impl From<f64> for WireValue {
    fn from(v: f64) -> Self {
        WireValue::Double(v)
    }
}

impl From<String> for WireValue {
    fn from(v: String) -> Self {
        WireValue::Text(v)
    }
}

impl From<&str> for WireValue {
    fn from(v: &str) -> Self {
        WireValue::Text(v.to_string())
    }
}

impl<T: Into<WireValue>> From<Option<T>> for WireValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(WireValue::Null, Into::into)
    }
}

/// A flat column → scalar row, as sent to or received from the remote store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    columns: BTreeMap<String, WireValue>,
}

impl WireRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<WireValue>) -> Self {
        self.insert(column, value);
        self
    }

    /// Sets a column, replacing any previous value.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<WireValue>) {
        self.columns.insert(column.into(), value.into());
    }

    /// Returns a column's value.
    pub fn get(&self, column: &str) -> Option<&WireValue> {
        self.columns.get(column)
    }

    /// Removes a column.
    pub fn remove(&mut self, column: &str) -> Option<WireValue> {
        self.columns.remove(column)
    }

    /// Returns true if the column is present (even if null).
    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Iterates columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &WireValue)> {
        self.columns.iter()
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the record has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns the row's primary key.
    pub fn id(&self) -> ProtocolResult<&str> {
        self.get(ID_COLUMN)
            .ok_or_else(|| ProtocolError::missing_column(ID_COLUMN))?
            .as_str()
            .ok_or_else(|| ProtocolError::invalid_column(ID_COLUMN, "text"))
    }

    /// Returns the row's version.
    pub fn version(&self) -> ProtocolResult<u64> {
        self.get(VERSION_COLUMN)
            .ok_or_else(|| ProtocolError::missing_column(VERSION_COLUMN))?
            .as_version()
            .ok_or_else(|| ProtocolError::invalid_column(VERSION_COLUMN, "version"))
    }

    /// Returns the row's tombstone flag. Absent or null means not deleted.
    pub fn is_deleted(&self) -> ProtocolResult<bool> {
        match self.get(DELETED_COLUMN) {
            None | Some(WireValue::Null) => Ok(false),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| ProtocolError::invalid_column(DELETED_COLUMN, "bool")),
        }
    }

    /// Returns the comparable `(version, deleted)` pair of this row.
    pub fn version_state(&self) -> ProtocolResult<VersionState> {
        Ok(VersionState::new(self.version()?, self.is_deleted()?))
    }

    /// Returns a copy holding only the given columns.
    #[must_use]
    pub fn project(&self, columns: &[&str]) -> Self {
        let columns = self
            .columns
            .iter()
            .filter(|(name, _)| columns.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self { columns }
    }

    /// Encodes to CBOR bytes (the offline queue payload format).
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
    }
}

impl FromIterator<(String, WireValue)> for WireRecord {
    fn from_iter<I: IntoIterator<Item = (String, WireValue)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercions_accept_text() {
        assert_eq!(WireValue::from("42").as_i64(), Some(42));
        assert_eq!(WireValue::from("2.5").as_f64(), Some(2.5));
        assert_eq!(WireValue::from("true").as_bool(), Some(true));
        assert_eq!(WireValue::from("nope").as_bool(), None);
        assert_eq!(WireValue::Integer(1).as_bool(), Some(true));
        assert_eq!(WireValue::Double(3.0).as_i64(), Some(3));
        assert_eq!(WireValue::Double(3.5).as_i64(), None);
    }

    #[test]
    fn empty_content() {
        assert!(WireValue::Null.is_empty_content());
        assert!(WireValue::from("   ").is_empty_content());
        assert!(!WireValue::from(" x ").is_empty_content());
        assert!(!WireValue::Integer(0).is_empty_content());
    }

    #[test]
    fn option_conversion() {
        let none: Option<String> = None;
        assert_eq!(WireValue::from(none), WireValue::Null);
        assert_eq!(WireValue::from(Some(7i64)), WireValue::Integer(7));
    }

    #[test]
    fn version_survives_high_values() {
        let v = u64::MAX - 3;
        assert_eq!(WireValue::version(v).as_version(), Some(v));
    }

    #[test]
    fn record_version_state() {
        let record = WireRecord::new()
            .with(ID_COLUMN, "a")
            .with(VERSION_COLUMN, 5i64)
            .with(DELETED_COLUMN, true);

        assert_eq!(record.id().unwrap(), "a");
        assert_eq!(record.version_state().unwrap(), VersionState::new(5, true));
    }

    #[test]
    fn record_missing_columns() {
        let record = WireRecord::new().with(ID_COLUMN, "a");
        assert_eq!(
            record.version(),
            Err(ProtocolError::missing_column(VERSION_COLUMN))
        );
        // Absent tombstone flag reads as live.
        assert_eq!(record.is_deleted(), Ok(false));
    }

    #[test]
    fn project_keeps_requested_columns() {
        let record = WireRecord::new()
            .with(ID_COLUMN, "a")
            .with(VERSION_COLUMN, 1i64)
            .with("title", "hello");

        let narrow = record.project(&[ID_COLUMN, VERSION_COLUMN]);
        assert_eq!(narrow.len(), 2);
        assert!(!narrow.contains("title"));
    }

    #[test]
    fn cbor_payload_roundtrip() {
        let record = WireRecord::new()
            .with(ID_COLUMN, "a")
            .with("score", 1.25)
            .with("note", WireValue::Null)
            .with("pinned", false);

        let bytes = record.encode().unwrap();
        assert_eq!(WireRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(WireRecord::decode(&[0xff, 0x00, 0x13]).is_err());
    }
}
