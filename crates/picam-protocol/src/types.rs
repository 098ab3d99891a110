//! Command and response envelopes exchanged on the command channel.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::actions::Action;

/// Handler-specific key/value payload of an envelope.
pub type Details = Map<String, Value>;

/// Well-known keys inside `args` and `details`.
pub mod keys {
    pub const ERROR_MESSAGE: &str = "error_message";
    pub const WARNING_MESSAGE: &str = "warning_message";
    /// Client-side only: classifies transport failures folded into a reply.
    pub const ERROR_KIND: &str = "error_kind";
    pub const FILE_NAME: &str = "file_name";
    pub const FILE_SIZE: &str = "file_size";
    pub const TRANSFER_TOKEN: &str = "transfer_token";
    pub const URL: &str = "url";
    pub const DESTINATION: &str = "destination";
    pub const BYTES_SENT: &str = "bytes_sent";
    pub const DURATION: &str = "duration";
    pub const PATH: &str = "path";
    pub const BYTES_RECEIVED: &str = "bytes_received";
}

/// Reserved `status` sentinel for non-fatal advisories.
pub const STATUS_WARNING: &str = "warning";

/// Reserved `status` sentinel for failures.
pub const STATUS_ERROR: &str = "error";

/// A request on the command channel: `{"action": ..., "args": {...}}`.
///
/// `action` stays a plain string on the wire so that unknown actions still
/// decode and can be answered with a descriptive error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Name of the handler to run.
    pub action: String,
    /// Keyword arguments for the handler.
    #[serde(default)]
    pub args: Details,
}

impl CommandEnvelope {
    /// Creates an envelope with no arguments.
    pub fn new(action: Action) -> Self {
        Self {
            action: action.as_str().to_string(),
            args: Details::new(),
        }
    }

    /// Creates an envelope for an arbitrary action name.
    pub fn raw(action: impl Into<String>, args: Details) -> Self {
        Self {
            action: action.into(),
            args,
        }
    }

    /// Creates an envelope whose args are the serialized fields of `args`.
    pub fn with_args<A: Serialize>(action: Action, args: &A) -> serde_json::Result<Self> {
        let args = match serde_json::to_value(args)? {
            Value::Object(map) => map,
            Value::Null => Details::new(),
            other => {
                let mut map = Details::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Ok(Self {
            action: action.as_str().to_string(),
            args,
        })
    }
}

/// Classification of a reply's `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Free-form success description.
    Success,
    /// `"warning"`: returned to the caller as ordinary data.
    Warning,
    /// `"error"`: always raised on the client.
    Error,
}

/// A reply on the command channel: `{"status": ..., "details": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Success description, or one of the `warning`/`error` sentinels.
    pub status: String,
    /// Handler-specific payload.
    #[serde(default)]
    pub details: Details,
}

impl ResponseEnvelope {
    /// Creates a success reply with the given description.
    pub fn success(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            details: Details::new(),
        }
    }

    /// Creates a warning reply.
    pub fn warning(message: impl Into<String>) -> Self {
        Self::success(STATUS_WARNING).with_detail(keys::WARNING_MESSAGE, message.into())
    }

    /// Creates an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self::success(STATUS_ERROR).with_detail(keys::ERROR_MESSAGE, message.into())
    }

    /// Builder: set a detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Builder: merge every field of a serializable struct into `details`.
    pub fn with_details_from<T: Serialize>(mut self, value: &T) -> serde_json::Result<Self> {
        if let Value::Object(map) = serde_json::to_value(value)? {
            self.details.extend(map);
        }
        Ok(self)
    }

    /// Sets a detail entry in place.
    pub fn set_detail(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.details.insert(key.into(), value.into());
    }

    /// Classifies the status field.
    pub fn kind(&self) -> ReplyStatus {
        match self.status.as_str() {
            STATUS_WARNING => ReplyStatus::Warning,
            STATUS_ERROR => ReplyStatus::Error,
            _ => ReplyStatus::Success,
        }
    }

    /// Returns true for `status == "error"`.
    pub fn is_error(&self) -> bool {
        self.kind() == ReplyStatus::Error
    }

    /// Returns true for `status == "warning"`.
    pub fn is_warning(&self) -> bool {
        self.kind() == ReplyStatus::Warning
    }

    /// Returns a string detail.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }

    /// Returns an unsigned integer detail.
    pub fn detail_u64(&self, key: &str) -> Option<u64> {
        self.details.get(key).and_then(Value::as_u64)
    }

    /// Deserializes the whole `details` map into `T`.
    pub fn details_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.details.clone()))
    }

    /// The error message of an error reply.
    pub fn error_message(&self) -> Option<&str> {
        self.detail_str(keys::ERROR_MESSAGE)
    }

    /// The warning message of a warning reply.
    pub fn warning_message(&self) -> Option<&str> {
        self.detail_str(keys::WARNING_MESSAGE)
    }
}
