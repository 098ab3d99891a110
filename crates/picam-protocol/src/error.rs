//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// Failed to serialize or deserialize a JSON payload.
    #[error("Invalid JSON command: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection closed in the middle of a frame.
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// Zero-length frame received.
    #[error("empty message")]
    EmptyMessage,

    /// Operation timed out.
    #[error("timeout during {operation}")]
    Timeout { operation: String },
}

impl ProtocolError {
    /// Creates a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Returns true if the framing itself is intact and only the payload was bad.
    ///
    /// After such an error the stream is still positioned at a frame boundary.
    pub fn is_payload_error(&self) -> bool {
        matches!(self, Self::Serialization(_))
    }
}

/// The `action` field names no known handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown action '{0}'.")]
pub struct UnknownAction(pub String);

/// Errors turning a [`crate::CommandEnvelope`] into a typed [`crate::Request`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Action not present in the action table.
    #[error(transparent)]
    UnknownAction(#[from] UnknownAction),

    /// Arguments do not match the action's schema.
    #[error("Invalid arguments for '{action}': {message}")]
    InvalidArgs { action: String, message: String },
}
