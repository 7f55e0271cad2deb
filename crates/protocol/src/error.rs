//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Event errors
    /// A test event payload could not be accepted.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A required event field was absent or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A metric value was not a primitive (string, number, bool or null).
    #[error("metric {key} must be a primitive value")]
    NonPrimitiveMetric {
        /// The offending metric key.
        key: String,
    },

    // Record errors
    /// A stored record field could not be decoded.
    #[error("invalid field {field}: {value}")]
    InvalidField {
        /// Name of the field.
        field: &'static str,
        /// The raw value that failed to decode.
        value: String,
    },

    /// An unknown session status string was encountered.
    #[error("unknown session status: {0}")]
    UnknownStatus(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
