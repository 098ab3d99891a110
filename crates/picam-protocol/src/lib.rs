//! Command channel protocol for the picam camera server.
//!
//! # Protocol Overview
//!
//! The command channel is a persistent TCP connection. Every message is
//! length-prefixed JSON:
//! - 4 bytes: message length (u32, big-endian)
//! - N bytes: JSON payload
//!
//! Requests are [`CommandEnvelope`]s (`{"action": ..., "args": {...}}`) and
//! replies are [`ResponseEnvelope`]s (`{"status": ..., "details": {...}}`).
//! Requests and replies alternate one-for-one, except that a handler may
//! send several replies and that an active streaming session answers every
//! command other than its stop action with a warning.
//!
//! Bulk bytes travel on a separate data connection. A reply announcing a
//! transfer carries a [`TransferDescriptor`]; the client opens the data
//! connection, sends a framed [`DataHello`] with the transfer token, then
//! reads raw bytes.
//!
//! # Example
//!
//! ```rust
//! use picam_protocol::{Request, VideoArgs, encode_message, decode_message, CommandEnvelope};
//!
//! let envelope = Request::StartVideo(VideoArgs::default()).to_envelope().unwrap();
//! let bytes = encode_message(&envelope).unwrap();
//! let decoded: CommandEnvelope = decode_message(&bytes).unwrap();
//! assert_eq!(Request::from_envelope(&decoded).unwrap(), Request::StartVideo(VideoArgs::default()));
//! ```

mod actions;
mod error;
mod framing;
mod types;

pub use actions::{
    Action, CaptureArgs, DataHello, Request, StreamArgs, TemplateArgs, TransferDescriptor,
    TransferToken, VideoArgs,
};
pub use error::{ProtocolError, ProtocolResult, RequestError, UnknownAction};
pub use framing::{FrameReader, FrameWriter, decode_message, decode_payload, encode_message};
pub use types::{
    CommandEnvelope, Details, ReplyStatus, ResponseEnvelope, STATUS_ERROR, STATUS_WARNING, keys,
};

/// Default TCP port of the command channel.
pub const DEFAULT_COMMAND_PORT: u16 = 8000;

/// Default TCP port of the data channel.
pub const DEFAULT_DATA_PORT: u16 = 8001;

/// Default UDP port the live stream is sent to.
pub const DEFAULT_STREAM_PORT: u16 = 8002;

/// Maximum message size (1 MB).
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
