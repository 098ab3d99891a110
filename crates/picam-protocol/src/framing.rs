//! Length-prefixed JSON frames.
//!
//! Used for every message on the command channel and for the token hello
//! that opens a data connection:
//!
//! ```text
//! +----------------+------------------+
//! | length (u32 BE)|  JSON payload    |
//! +----------------+------------------+
//! ```
//!
//! Zero-length frames are rejected. A clean EOF is only possible before the
//! length prefix; anywhere else it is an `IncompleteMessage`.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

const PREFIX_LEN: usize = 4;

/// Validates a payload length against [`MAX_MESSAGE_SIZE`].
fn checked_len(len: usize) -> ProtocolResult<usize> {
    match u32::try_from(len) {
        Ok(size) if size <= MAX_MESSAGE_SIZE => Ok(len),
        Ok(size) => Err(ProtocolError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        }),
        Err(_) => Err(ProtocolError::MessageTooLarge {
            size: u32::MAX,
            max: MAX_MESSAGE_SIZE,
        }),
    }
}

/// Serializes `message` into one complete frame.
///
/// ```rust
/// use picam_protocol::{encode_message, CommandEnvelope, Action};
///
/// let envelope = CommandEnvelope::new(Action::StopVideo);
/// let bytes = encode_message(&envelope).unwrap();
/// assert!(bytes.len() > 4);
/// ```
pub fn encode_message<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    let len = checked_len(json.len())? as u32;

    let mut frame = Vec::with_capacity(PREFIX_LEN + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Decodes one complete frame held in memory.
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> ProtocolResult<T> {
    let (prefix, rest) = data
        .split_first_chunk::<PREFIX_LEN>()
        .ok_or(ProtocolError::IncompleteMessage {
            expected: PREFIX_LEN,
            received: data.len(),
        })?;
    let len = checked_len(u32::from_be_bytes(*prefix) as usize)?;
    let payload = rest.get(..len).ok_or(ProtocolError::IncompleteMessage {
        expected: PREFIX_LEN + len,
        received: data.len(),
    })?;
    decode_payload(payload)
}

/// Decodes a frame payload (no length prefix).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> ProtocolResult<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Reads frames off an async byte stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the payload of the next frame without decoding it.
    ///
    /// Returns `Ok(None)` if the peer closed the stream between frames.
    /// Callers that need to tell a bad payload from a broken stream decode
    /// the bytes themselves with [`decode_payload`].
    pub async fn read_frame(&mut self) -> ProtocolResult<Option<Vec<u8>>> {
        let mut prefix = [0u8; PREFIX_LEN];
        match fill(&mut self.reader, &mut prefix).await? {
            0 => return Ok(None),
            PREFIX_LEN => {}
            received => {
                return Err(ProtocolError::IncompleteMessage {
                    expected: PREFIX_LEN,
                    received,
                });
            }
        }

        let len = checked_len(u32::from_be_bytes(prefix) as usize)?;
        if len == 0 {
            return Err(ProtocolError::EmptyMessage);
        }

        let mut payload = vec![0u8; len];
        let received = fill(&mut self.reader, &mut payload).await?;
        if received < len {
            return Err(ProtocolError::IncompleteMessage {
                expected: len,
                received,
            });
        }
        Ok(Some(payload))
    }

    /// Reads and decodes the next frame.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> ProtocolResult<Option<T>> {
        match self.read_frame().await? {
            Some(payload) => decode_payload(&payload).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}

/// Writes frames to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one frame with a single `write_all`, then flushes.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> ProtocolResult<()> {
        let frame = encode_message(message)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

/// Reads until `buf` is full or EOF; returns how many bytes arrived.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
