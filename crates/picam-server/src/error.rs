//! Server error types.
//!
//! Every variant renders to the single `error_message` sent in the terminal
//! error reply before the control connection is closed.

use std::io;

use picam_core::MediaError;
use picam_protocol::{ProtocolError, RequestError, UnknownAction};
use thiserror::Error;

use crate::camera::CameraError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed or undecodable message on the command or data channel.
    #[error("{0}")]
    Protocol(ProtocolError),

    /// The action names no handler.
    #[error(transparent)]
    UnknownAction(#[from] UnknownAction),

    /// Out-of-range or malformed arguments.
    #[error("{0}")]
    Validation(String),

    /// Capture, record or autofocus failure reported by the camera.
    #[error("{0}")]
    Hardware(#[from] CameraError),

    /// Short write, early close or bad hello on the data channel.
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// The action exists but has no implementation.
    #[error("{0}")]
    NotImplemented(String),

    /// A network operation exceeded its deadline.
    #[error("Timed out during {0}")]
    Timeout(String),

    /// The camera is claimed by another connection.
    #[error("Camera device is busy ({holder}); try again once it is released.")]
    DeviceBusy { holder: String },

    /// IO error (socket bind, accept, ...).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl ServerError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a transfer error.
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer(message.into())
    }

    /// Creates a not-implemented error.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented(message.into())
    }

    /// Creates a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout(operation.into())
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Short machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::UnknownAction(_) => "unknown_action",
            Self::Validation(_) => "validation",
            Self::Hardware(_) => "hardware",
            Self::Transfer(_) => "transfer",
            Self::NotImplemented(_) => "not_implemented",
            Self::Timeout(_) => "timeout",
            Self::DeviceBusy { .. } => "device_busy",
            Self::Io(_) => "io",
            Self::Config { .. } => "config",
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Timeout { operation } => Self::Timeout(operation),
            other => Self::Protocol(other),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::Serialization(err))
    }
}

impl From<RequestError> for ServerError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::UnknownAction(unknown) => Self::UnknownAction(unknown),
            invalid @ RequestError::InvalidArgs { .. } => Self::Validation(invalid.to_string()),
        }
    }
}

impl From<MediaError> for ServerError {
    fn from(err: MediaError) -> Self {
        Self::Validation(err.to_string())
    }
}
