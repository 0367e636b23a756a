//! # tidesync protocol
//!
//! Wire-level types shared by every tidesync component.
//!
//! This crate provides:
//! - `WireValue` / `WireRecord`, the flat column → scalar row representation
//! - `VersionState` and the version/tombstone conflict resolver
//! - `OfflineOperation` for the durable mutation queue
//! - `ChangeEvent` for realtime change notifications
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod error;
mod operation;
mod value;
mod version;

pub use change::{ChangeEvent, ChangeKind};
pub use error::{ProtocolError, ProtocolResult};
pub use operation::{OfflineAction, OfflineOperation};
pub use value::{WireRecord, WireValue};
pub use version::{
    resolve, resolve_existence, ExistenceAction, SyncAction, VersionState,
    DEFAULT_UNDELETE_DELTA,
};

/// Primary key column of every synced table.
pub const ID_COLUMN: &str = "id";
/// Monotonic version column.
pub const VERSION_COLUMN: &str = "version";
/// Tombstone flag column.
pub const DELETED_COLUMN: &str = "deleted";
/// Last-modified timestamp column (RFC 3339 text).
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Columns of the narrow projection used by reconciliation.
pub const VERSION_PROJECTION: [&str; 3] = [ID_COLUMN, VERSION_COLUMN, DELETED_COLUMN];
