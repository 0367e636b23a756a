//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while reading or encoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a value to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A required column is absent from a wire record.
    #[error("missing column: {column}")]
    MissingColumn {
        /// Name of the missing column.
        column: String,
    },

    /// A column holds a value that cannot be coerced to the expected type.
    #[error("column {column} is not a valid {expected}")]
    InvalidColumn {
        /// Name of the column.
        column: String,
        /// Expected type name.
        expected: &'static str,
    },
}

impl ProtocolError {
    /// Creates an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Creates a missing column error.
    pub fn missing_column(column: impl Into<String>) -> Self {
        Self::MissingColumn {
            column: column.into(),
        }
    }

    /// Creates an invalid column error.
    pub fn invalid_column(column: impl Into<String>, expected: &'static str) -> Self {
        Self::InvalidColumn {
            column: column.into(),
            expected,
        }
    }
}
