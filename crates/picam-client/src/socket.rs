//! Persistent command-channel client.
//!
//! [`CommandClient::send`] never returns a transport error: any failure on
//! the way out or back is folded into an error-shaped reply carrying
//! `error_message` and `error_kind`, and the connection is marked broken so
//! later sends fail fast until [`CommandClient::reconnect`].

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, warn};

use picam_protocol::{CommandEnvelope, FrameReader, FrameWriter, ResponseEnvelope, keys};

use crate::config::Timeouts;
use crate::error::{ClientError, ClientResult};

struct Channel {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    peer: SocketAddr,
}

/// Client end of one control connection.
pub struct CommandClient {
    endpoint: String,
    timeouts: Timeouts,
    channel: Option<Channel>,
    broken: Option<String>,
}

impl CommandClient {
    /// Connects to the command channel at `endpoint` (`host:port`).
    pub async fn connect(endpoint: impl Into<String>, timeouts: Timeouts) -> ClientResult<Self> {
        let endpoint = endpoint.into();
        let channel = open(&endpoint, timeouts).await?;
        Ok(Self {
            endpoint,
            timeouts,
            channel: Some(channel),
            broken: None,
        })
    }

    /// The `host:port` this client talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Address of the connected server, if connected.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.channel.as_ref().map(|c| c.peer)
    }

    /// Returns true once a transport failure or an error reply has closed
    /// the connection.
    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    /// Sends one command and waits for its reply.
    pub async fn send(&mut self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        if let Some(reason) = &self.broken {
            return failure_reply(&ClientError::Connection(format!(
                "connection is broken ({reason}); reconnect first"
            )));
        }

        match self.exchange(envelope).await {
            Ok(reply) => {
                if reply.is_error() {
                    // The server closes the connection after every error reply.
                    self.mark_broken("server closed the connection after an error");
                }
                reply
            }
            Err(e) => {
                warn!(action = %envelope.action, error = %e, "Command transport failed");
                self.mark_broken(e.to_string());
                failure_reply(&e)
            }
        }
    }

    async fn exchange(&mut self, envelope: &CommandEnvelope) -> ClientResult<ResponseEnvelope> {
        let timeouts = self.timeouts;
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| ClientError::Connection("not connected".into()))?;

        debug!(action = %envelope.action, "Sending command");
        timeout(timeouts.command, channel.writer.write_message(envelope))
            .await
            .map_err(|_| ClientError::Timeout("sending command".into()))??;
        read_reply(channel, timeouts).await
    }

    /// Drops the current connection, if any, and opens a fresh one.
    pub async fn reconnect(&mut self) -> ClientResult<()> {
        self.channel = None;
        let channel = open(&self.endpoint, self.timeouts).await?;
        self.channel = Some(channel);
        self.broken = None;
        debug!(endpoint = %self.endpoint, "Reconnected");
        Ok(())
    }

    /// Closes the connection.
    pub fn close(&mut self) {
        self.channel = None;
        self.broken = Some("closed".into());
    }

    fn mark_broken(&mut self, reason: impl Into<String>) {
        self.channel = None;
        self.broken = Some(reason.into());
    }
}

async fn open(endpoint: &str, timeouts: Timeouts) -> ClientResult<Channel> {
    debug!(endpoint = %endpoint, "Connecting to camera server");
    let stream = timeout(timeouts.connect, TcpStream::connect(endpoint))
        .await
        .map_err(|_| {
            ClientError::Timeout(format!(
                "connecting to {} after {:.1}s",
                endpoint,
                timeouts.connect.as_secs_f64()
            ))
        })?
        .map_err(|e| ClientError::Connection(format!("failed to connect to {}: {}", endpoint, e)))?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let (read, write) = stream.into_split();
    Ok(Channel {
        reader: FrameReader::new(read),
        writer: FrameWriter::new(write),
        peer,
    })
}

async fn read_reply(channel: &mut Channel, timeouts: Timeouts) -> ClientResult<ResponseEnvelope> {
    let reply = timeout(timeouts.command, channel.reader.read_message::<ResponseEnvelope>())
        .await
        .map_err(|_| ClientError::Timeout("waiting for reply".into()))??;
    reply.ok_or_else(|| ClientError::Connection("server closed the connection".into()))
}

/// Error-shaped reply standing in for a transport failure.
fn failure_reply(err: &ClientError) -> ResponseEnvelope {
    ResponseEnvelope::error(err.to_string()).with_detail(keys::ERROR_KIND, err.kind())
}
