//! Client error types.

use std::fmt;

use picam_protocol::ProtocolError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug)]
pub enum ClientError {
    /// The server answered with `status == "error"`.
    Camera(String),
    /// Short read or early close on the data channel.
    Transfer(String),
    /// A network operation exceeded its deadline.
    Timeout(String),
    /// Connection to the server failed or is broken.
    Connection(String),
    /// Protocol/framing error.
    Protocol(String),
    /// IO error.
    Io(std::io::Error),
    /// Configuration error.
    Config(String),
    /// A caller-supplied argument is unusable.
    InvalidArgument(String),
}

impl ClientError {
    /// Short machine-readable kind, reported as `error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Camera(_) => "camera",
            Self::Transfer(_) => "transfer",
            Self::Timeout(_) => "timeout",
            Self::Connection(_) => "connection",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::InvalidArgument(_) => "invalid_argument",
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Camera(msg) => write!(f, "camera error: {}", msg),
            Self::Transfer(msg) => write!(f, "transfer failed: {}", msg),
            Self::Timeout(msg) => write!(f, "timeout: {}", msg),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Timeout { operation } => Self::Timeout(operation),
            ProtocolError::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_error_carries_server_message() {
        let err = ClientError::Camera("Unknown action 'dance'.".into());
        assert_eq!(err.to_string(), "camera error: Unknown action 'dance'.");
        assert_eq!(err.kind(), "camera");
    }

    #[test]
    fn protocol_timeout_becomes_timeout() {
        let err: ClientError = ProtocolError::timeout("reading reply").into();
        assert!(matches!(err, ClientError::Timeout(ref op) if op == "reading reply"));
    }

    #[test]
    fn protocol_io_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: ClientError = ProtocolError::Io(io).into();
        assert_eq!(err.kind(), "io");
        assert!(std::error::Error::source(&err).is_some());
    }
}
