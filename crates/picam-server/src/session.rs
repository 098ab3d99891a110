//! Streaming session state machine.
//!
//! A [`StreamingSession`] is one recording-to-file or recording-to-network
//! activity, bounded by a `start_*` command and its matching `stop_*`.
//!
//! ```text
//!   Idle ──start()──▶ Active ──stop()──▶ Stopping ──▶ Idle (lease released)
//! ```
//!
//! The session owns the [`DeviceLease`] for its whole lifetime, so at most
//! one session can be Active per process. While Active, the connection is
//! in restricted mode ([`StreamingSession::await_stop`]): only the matching
//! stop action is accepted, everything else gets a warning.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use picam_core::Resolution;
use picam_protocol::{Action, CommandEnvelope, ResponseEnvelope, decode_payload};

use crate::camera::VideoEncoding;
use crate::data::{MediaSink, pump};
use crate::device::DeviceLease;
use crate::error::{ServerError, ServerResult};
use crate::socket::Connection;

/// Chunks buffered between the encoder and the sink.
const CHUNK_BUFFER: usize = 64;

/// What a session records to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// H.264 elementary stream over the data channel.
    VideoFile,
    /// MPEG-TS over UDP datagrams.
    UdpStream,
}

impl SessionKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoFile => "video_file",
            Self::UdpStream => "udp_stream",
        }
    }

    /// Action that starts this kind of session.
    pub fn start_action(&self) -> Action {
        match self {
            Self::VideoFile => Action::StartVideo,
            Self::UdpStream => Action::StartStream,
        }
    }

    /// The only action accepted while this kind of session is Active.
    pub fn stop_action(&self) -> Action {
        match self {
            Self::VideoFile => Action::StopVideo,
            Self::UdpStream => Action::StopStream,
        }
    }

    /// Encoder output this kind of session needs.
    pub fn encoding(&self) -> VideoEncoding {
        match self {
            Self::VideoFile => VideoEncoding::H264,
            Self::UdpStream => VideoEncoding::MpegTs,
        }
    }

    /// Status of the final reply after a clean stop.
    pub fn stopped_status(&self) -> &'static str {
        match self {
            Self::VideoFile => "Video successfully recorded and data socket closed",
            Self::UdpStream => "UDP stream stopped.",
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Stopping,
}

/// Why restricted mode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTrigger {
    /// The matching stop action arrived.
    StopRequested,
    /// The client closed the control connection.
    PeerClosed,
}

/// One recording session and the camera lease it holds.
pub struct StreamingSession {
    kind: SessionKind,
    resolution: Resolution,
    state: SessionState,
    lease: Option<DeviceLease>,
    pump: Option<JoinHandle<ServerResult<u64>>>,
}

impl StreamingSession {
    /// Creates an Idle session owning `lease`.
    pub fn new(kind: SessionKind, resolution: Resolution, lease: DeviceLease) -> Self {
        Self {
            kind,
            resolution,
            state: SessionState::Idle,
            lease: Some(lease),
            pump: None,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn lease(&self) -> ServerResult<&DeviceLease> {
        self.lease
            .as_ref()
            .ok_or_else(|| ServerError::transfer("session has already released the camera"))
    }

    /// Configures the camera's video pipeline for this session.
    pub async fn prepare(&self) -> ServerResult<()> {
        let resolution = self.resolution;
        self.lease()?
            .run(move |camera| camera.configure_video(resolution))
            .await?;
        Ok(())
    }

    /// Starts recording into `sink`: Idle → Active.
    pub async fn start(&mut self, sink: MediaSink, write_timeout: Duration) -> ServerResult<()> {
        if self.state != SessionState::Idle {
            return Err(ServerError::validation(format!(
                "Session '{}' is already {:?}.",
                self.kind.as_str(),
                self.state
            )));
        }

        let label = sink.describe();
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let pump_task = tokio::spawn(pump(rx, sink, write_timeout));

        let encoding = self.kind.encoding();
        let started = self
            .lease()?
            .run(move |camera| camera.start_recording(encoding, tx))
            .await;

        if let Err(e) = started {
            // The sender went down with the closure; the pump closes the sink.
            let _ = pump_task.await;
            return Err(e.into());
        }

        self.pump = Some(pump_task);
        self.state = SessionState::Active;
        info!(
            kind = self.kind.as_str(),
            resolution = %self.resolution,
            sink = %label,
            "Streaming session active"
        );
        Ok(())
    }

    /// Restricted receive mode: waits, without timeout, for the stop action.
    ///
    /// Every other command, including one whose JSON does not decode, gets a
    /// warning and the wait continues. Framing and IO failures are returned.
    pub async fn await_stop(&self, conn: &mut Connection) -> ServerResult<StopTrigger> {
        let stop = self.kind.stop_action();
        loop {
            let Some(frame) = conn.read_frame_untimed().await? else {
                return Ok(StopTrigger::PeerClosed);
            };

            let rejected = match decode_payload::<CommandEnvelope>(&frame) {
                Ok(envelope) if envelope.action == stop.as_str() => {
                    return Ok(StopTrigger::StopRequested);
                }
                Ok(envelope) => format!("'{}'", envelope.action),
                Err(e) if e.is_payload_error() => format!("({e})"),
                Err(e) => return Err(e.into()),
            };

            debug!(command = %rejected, "Rejected command during active session");
            let warning = ResponseEnvelope::warning(format!(
                "Command {rejected} could not be executed, because of active action. \
                 Allowed action: '{stop}'",
                stop = stop.as_str()
            ));
            conn.respond(&warning).await?;
        }
    }

    /// Stops recording and drains the sink: Active → Stopping → Idle.
    ///
    /// The camera is stopped first; the sink is closed only once the encoder
    /// has gone away. The lease is released when this returns successfully.
    /// Returns the number of bytes the sink accepted.
    pub async fn stop(&mut self, teardown_timeout: Duration) -> ServerResult<u64> {
        if self.state != SessionState::Active {
            return Err(ServerError::validation(format!(
                "Session '{}' is not active.",
                self.kind.as_str()
            )));
        }
        self.state = SessionState::Stopping;

        let teardown = async {
            let lease = self.lease()?;
            lease
                .run(|camera| {
                    camera.stop_recording()?;
                    camera.stop()
                })
                .await?;
            match self.pump.take() {
                Some(task) => task
                    .await
                    .map_err(|e| ServerError::transfer(format!("media pump failed: {e}")))?,
                None => Ok(0),
            }
        };

        let sent = tokio::time::timeout(teardown_timeout, teardown)
            .await
            .map_err(|_| ServerError::timeout("session teardown"))??;

        self.state = SessionState::Idle;
        self.lease = None;
        info!(kind = self.kind.as_str(), bytes = sent, "Streaming session stopped");
        Ok(sent)
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        if let Some(lease) = self.lease.take() {
            warn!(
                kind = self.kind.as_str(),
                state = ?self.state,
                "Streaming session dropped without clean stop; stopping camera"
            );
            lease.abandon();
        }
    }
}
