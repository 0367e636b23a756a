//! Error types for the sync engine.

use thiserror::Error;
use tidesync_crypto::CryptoError;
use tidesync_protocol::ProtocolError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How a failure should be handled by the push pipeline and queue replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Misconfiguration; surfaced to the caller, never retried.
    Configuration,
    /// Worth retrying later; the mutation is queued.
    Transient,
    /// The remote refused the write for good; reconciliation takes over.
    Permanent,
    /// The remote already holds an equivalent write.
    Benign,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried inline.
        retryable: bool,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Backend error with no more specific mapping.
    #[error("backend error{}: {message}", .code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Backend {
        /// Backend error code, if any.
        code: Option<String>,
        /// Error message.
        message: String,
    },

    /// The remote row has a higher version than the one written.
    #[error("version regression: {message}")]
    VersionRegression {
        /// Error message.
        message: String,
    },

    /// A tombstone was cleared without a large enough version jump.
    #[error("invalid undelete: {message}")]
    InvalidUndelete {
        /// Error message.
        message: String,
    },

    /// The remote row is already at this version with other content.
    #[error("duplicate version: {message}")]
    DuplicateVersion {
        /// Error message.
        message: String,
    },

    /// Entity type was never registered.
    #[error("entity type {entity_type} is not registered")]
    NotRegistered {
        /// Entity type name.
        entity_type: String,
    },

    /// Entity type or table registered twice.
    #[error("{what} is already registered")]
    AlreadyRegistered {
        /// Entity type or table name.
        what: String,
    },

    /// No registered entity type owns this table.
    #[error("no entity type registered for table {table}")]
    UnknownTable {
        /// Table name.
        table: String,
    },

    /// Owner-scoped operation without a signed-in user.
    #[error("no signed-in user")]
    NoSession,

    /// The entity type has no factory for materializing remote rows.
    #[error("entity type {entity_type} has no factory")]
    NoFactory {
        /// Entity type name.
        entity_type: String,
    },

    /// A wire record could not be built or applied.
    #[error("build error: {message}")]
    Build {
        /// Error message.
        message: String,
    },

    /// A column value could not be converted to the field's type.
    #[error("invalid value for column {column}: {message}")]
    InvalidField {
        /// Column name.
        column: String,
        /// Error message.
        message: String,
    },

    /// Wire encoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Field encryption error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Local store error.
    #[error("local store error: {message}")]
    LocalStore {
        /// Error message.
        message: String,
    },

    /// Offline queue I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backend codes that mean the connection dropped.
const CONNECTION_CODES: &[&str] = &["08000", "08001", "08003", "08006", "-1005", "-1009"];
/// Backend codes that mean the request timed out.
const TIMEOUT_CODES: &[&str] = &["57014", "-1001"];

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a version regression error.
    pub fn version_regression(message: impl Into<String>) -> Self {
        Self::VersionRegression {
            message: message.into(),
        }
    }

    /// Creates an invalid undelete error.
    pub fn invalid_undelete(message: impl Into<String>) -> Self {
        Self::InvalidUndelete {
            message: message.into(),
        }
    }

    /// Creates a duplicate version error.
    pub fn duplicate_version(message: impl Into<String>) -> Self {
        Self::DuplicateVersion {
            message: message.into(),
        }
    }

    /// Creates a build error.
    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
        }
    }

    /// Creates an invalid field error.
    pub fn invalid_field(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Creates a local store error.
    pub fn local_store(message: impl Into<String>) -> Self {
        Self::LocalStore {
            message: message.into(),
        }
    }

    /// Creates a not registered error.
    pub fn not_registered(entity_type: impl Into<String>) -> Self {
        Self::NotRegistered {
            entity_type: entity_type.into(),
        }
    }

    /// Maps a backend error code and message onto a typed error.
    ///
    /// Guard violations are recognised by marker text in the message; the
    /// server-side triggers raise them with these phrases.
    pub fn from_backend(code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("version_regression") || lower.contains("version regression") {
            return Self::VersionRegression { message };
        }
        if lower.contains("invalid_undelete") || lower.contains("invalid undelete") {
            return Self::InvalidUndelete { message };
        }
        if lower.contains("duplicate_version")
            || lower.contains("duplicate version")
            || lower.contains("already at version")
        {
            return Self::DuplicateVersion { message };
        }

        if code.is_some_and(|c| TIMEOUT_CODES.contains(&c)) || lower.contains("timed out") {
            return Self::Timeout;
        }
        if code.is_some_and(|c| CONNECTION_CODES.contains(&c))
            || lower.contains("connection lost")
            || lower.contains("network connection was lost")
            || lower.contains("connection reset")
        {
            return Self::transport_retryable(message);
        }

        Self::Backend {
            code: code.map(str::to_owned),
            message,
        }
    }

    /// Returns true if this error can be retried inline.
    ///
    /// Only known-transient failures qualify; everything else transient
    /// goes straight to the offline queue.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true if the failure means local and remote disagree in a
    /// way only reconciliation can fix.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(
            self,
            SyncError::VersionRegression { .. } | SyncError::InvalidUndelete { .. }
        )
    }

    /// Classifies this error for the push pipeline and queue replay.
    pub fn classify(&self) -> ErrorClass {
        match self {
            SyncError::NotRegistered { .. }
            | SyncError::AlreadyRegistered { .. }
            | SyncError::UnknownTable { .. }
            | SyncError::NoSession
            | SyncError::NoFactory { .. } => ErrorClass::Configuration,

            SyncError::VersionRegression { .. }
            | SyncError::InvalidUndelete { .. }
            | SyncError::Build { .. }
            | SyncError::InvalidField { .. }
            | SyncError::Protocol(_)
            | SyncError::Crypto(_) => ErrorClass::Permanent,

            SyncError::DuplicateVersion { .. } => ErrorClass::Benign,

            SyncError::Transport { .. }
            | SyncError::Timeout
            | SyncError::Backend { .. }
            | SyncError::LocalStore { .. }
            | SyncError::Io(_) => ErrorClass::Transient,
        }
    }
}
