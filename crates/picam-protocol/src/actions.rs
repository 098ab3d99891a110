//! The action table and typed arguments for every command.

use std::fmt;
use std::str::FromStr;

use picam_core::{ImageFormat, Resolution};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{RequestError, UnknownAction};
use crate::types::{CommandEnvelope, Details};

/// Every action the camera server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    TemplateAction,
    Capture,
    StartVideo,
    StopVideo,
    StartStream,
    StopStream,
    ReadBarcode,
    ReadQrcode,
}

impl Action {
    /// The complete action table.
    pub const ALL: [Action; 8] = [
        Self::TemplateAction,
        Self::Capture,
        Self::StartVideo,
        Self::StopVideo,
        Self::StartStream,
        Self::StopStream,
        Self::ReadBarcode,
        Self::ReadQrcode,
    ];

    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TemplateAction => "template_action",
            Self::Capture => "capture",
            Self::StartVideo => "start_video",
            Self::StopVideo => "stop_video",
            Self::StartStream => "start_stream",
            Self::StopStream => "stop_stream",
            Self::ReadBarcode => "read_barcode",
            Self::ReadQrcode => "read_qrcode",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// Arguments of `template_action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateArgs {
    pub test_int: i64,
}

/// Arguments of `capture`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureArgs {
    pub file_format: ImageFormat,
    pub resolution: Resolution,
    /// Run an autofocus cycle before capturing.
    pub autofocus: bool,
    /// Manual lens position, only honoured when `autofocus` is false.
    pub focus_length: f64,
}

/// Arguments of `start_video`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VideoArgs {
    #[serde(default)]
    pub resolution: Resolution,
}

/// Arguments of `start_stream`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamArgs {
    #[serde(default)]
    pub resolution: Resolution,
    /// Explicit destination host; `None` streams back to the caller.
    #[serde(rename = "IP_out", default)]
    pub ip_out: Option<String>,
}

/// A decoded, typed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    TemplateAction(TemplateArgs),
    Capture(CaptureArgs),
    StartVideo(VideoArgs),
    StopVideo,
    StartStream(StreamArgs),
    StopStream,
    ReadBarcode,
    ReadQrcode,
}

impl Request {
    /// The action this request dispatches to.
    pub fn action(&self) -> Action {
        match self {
            Self::TemplateAction(_) => Action::TemplateAction,
            Self::Capture(_) => Action::Capture,
            Self::StartVideo(_) => Action::StartVideo,
            Self::StopVideo => Action::StopVideo,
            Self::StartStream(_) => Action::StartStream,
            Self::StopStream => Action::StopStream,
            Self::ReadBarcode => Action::ReadBarcode,
            Self::ReadQrcode => Action::ReadQrcode,
        }
    }

    /// Looks the envelope's action up in the action table and parses its args.
    ///
    /// Actions without parameters ignore whatever args were sent.
    pub fn from_envelope(envelope: &CommandEnvelope) -> Result<Self, RequestError> {
        let action: Action = envelope.action.parse()?;
        let request = match action {
            Action::TemplateAction => Self::TemplateAction(parse_args(action, &envelope.args)?),
            Action::Capture => Self::Capture(parse_args(action, &envelope.args)?),
            Action::StartVideo => Self::StartVideo(parse_args(action, &envelope.args)?),
            Action::StopVideo => Self::StopVideo,
            Action::StartStream => Self::StartStream(parse_args(action, &envelope.args)?),
            Action::StopStream => Self::StopStream,
            Action::ReadBarcode => Self::ReadBarcode,
            Action::ReadQrcode => Self::ReadQrcode,
        };
        Ok(request)
    }

    /// Builds the wire envelope for this request.
    pub fn to_envelope(&self) -> serde_json::Result<CommandEnvelope> {
        let action = self.action();
        match self {
            Self::TemplateAction(args) => CommandEnvelope::with_args(action, args),
            Self::Capture(args) => CommandEnvelope::with_args(action, args),
            Self::StartVideo(args) => CommandEnvelope::with_args(action, args),
            Self::StartStream(args) => CommandEnvelope::with_args(action, args),
            Self::StopVideo | Self::StopStream | Self::ReadBarcode | Self::ReadQrcode => {
                Ok(CommandEnvelope::new(action))
            }
        }
    }
}

fn parse_args<T: DeserializeOwned>(action: Action, args: &Details) -> Result<T, RequestError> {
    serde_json::from_value(Value::Object(args.clone())).map_err(|e| RequestError::InvalidArgs {
        action: action.as_str().to_string(),
        message: e.to_string(),
    })
}

/// One-time token binding a data connection to the reply that announced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferToken(Uuid);

impl TransferToken {
    /// Generates a fresh random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TransferToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// First frame a client sends on a freshly opened data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHello {
    pub transfer_token: TransferToken,
}

/// Describes a data-channel transfer announced in a command reply.
///
/// Flattened into the reply's `details`. `file_size` is present only for
/// finite transfers; continuous transfers end when the server closes the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub resolution: Resolution,
    pub format: String,
    pub transfer_token: TransferToken,
}

impl TransferDescriptor {
    /// Descriptor for a still whose encoded size is already known.
    pub fn finite(
        file_name: impl Into<String>,
        file_size: u64,
        resolution: Resolution,
        format: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_size: Some(file_size),
            resolution,
            format: format.into(),
            transfer_token: TransferToken::new(),
        }
    }

    /// Descriptor for a close-terminated recording.
    pub fn continuous(
        file_name: impl Into<String>,
        resolution: Resolution,
        format: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            file_size: None,
            resolution,
            format: format.into(),
            transfer_token: TransferToken::new(),
        }
    }

    /// Returns true if the transfer length is known up front.
    pub fn is_finite(&self) -> bool {
        self.file_size.is_some()
    }
}
