//! High-level camera driver.
//!
//! [`CameraDriver`] wraps a [`CommandClient`] and completes whatever data
//! transfer a reply announces: stills are received in the foreground and
//! written to disk, recordings are handed to a background
//! [`RecordingReceiver`] that runs until `stop_video`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use picam_core::{ImageFormat, Resolution};
use picam_protocol::{
    Action, CaptureArgs, CommandEnvelope, ResponseEnvelope, StreamArgs, TemplateArgs,
    TransferDescriptor, VideoArgs, keys,
};

use crate::config::{ClientConfig, Timeouts};
use crate::error::{ClientError, ClientResult};
use crate::socket::CommandClient;
use crate::transfer::{RecordingReceiver, receive_finite};

/// Parameters of a still capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub file_format: ImageFormat,
    pub resolution: Resolution,
    pub autofocus: bool,
    pub focus_length: f64,
    /// Persisted name without extension; the server's name when `None`.
    pub file_name: Option<String>,
    pub file_path: PathBuf,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            file_format: ImageFormat::Jpeg,
            resolution: Resolution::new(4608, 2592),
            autofocus: true,
            focus_length: 0.0,
            file_name: None,
            file_path: PathBuf::from("."),
        }
    }
}

/// Parameters of a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoOptions {
    pub resolution: Resolution,
    /// Persisted name without extension; the server's name when `None`.
    pub file_name: Option<String>,
    pub file_path: PathBuf,
    /// Record this long, then stop. `None` or zero leaves the recording
    /// running until [`CameraDriver::stop_video`].
    pub duration: Option<Duration>,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            file_name: None,
            file_path: PathBuf::from("."),
            duration: Some(Duration::from_secs(5)),
        }
    }
}

/// Drives a remote camera over the command and data channels.
pub struct CameraDriver {
    client: CommandClient,
    data_endpoint: String,
    timeouts: Timeouts,
    recording: Option<RecordingReceiver>,
}

impl CameraDriver {
    /// Connects using the endpoints and timeouts of `config`.
    pub async fn connect(config: &ClientConfig) -> ClientResult<Self> {
        Self::connect_to(
            config.command_endpoint(),
            config.data_endpoint(),
            config.timeouts.resolve(),
        )
        .await
    }

    /// Connects to explicit `host:port` endpoints.
    pub async fn connect_to(
        command_endpoint: impl Into<String>,
        data_endpoint: impl Into<String>,
        timeouts: Timeouts,
    ) -> ClientResult<Self> {
        let client = CommandClient::connect(command_endpoint, timeouts).await?;
        Ok(Self {
            client,
            data_endpoint: data_endpoint.into(),
            timeouts,
            recording: None,
        })
    }

    /// Returns true while a background recording receiver is running.
    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// The underlying command client.
    pub fn client(&self) -> &CommandClient {
        &self.client
    }

    /// Sends an arbitrary envelope and returns the reply unchecked.
    pub async fn send(&mut self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        self.client.send(envelope).await
    }

    /// Echo round trip.
    pub async fn template_action(&mut self, test_int: i64) -> ClientResult<ResponseEnvelope> {
        let envelope = CommandEnvelope::with_args(Action::TemplateAction, &TemplateArgs { test_int })?;
        self.request(&envelope).await
    }

    /// Captures a still and writes it under `options.file_path`.
    pub async fn capture(&mut self, options: &CaptureOptions) -> ClientResult<ResponseEnvelope> {
        let args = CaptureArgs {
            file_format: options.file_format,
            resolution: options.resolution,
            autofocus: options.autofocus,
            focus_length: options.focus_length,
        };
        ensure_dir(&options.file_path).await?;
        let reply = self
            .request(&CommandEnvelope::with_args(Action::Capture, &args)?)
            .await?;
        if reply.is_warning() {
            return Ok(reply);
        }

        let descriptor: TransferDescriptor = reply.details_as()?;
        let size = descriptor.file_size.ok_or_else(|| {
            ClientError::Protocol("capture reply carries no file_size".to_string())
        })?;
        debug!(size, token = %descriptor.transfer_token, "Receiving picture");
        let data = receive_finite(
            &self.data_endpoint,
            descriptor.transfer_token,
            size,
            self.timeouts,
        )
        .await?;

        let file_name = match &options.file_name {
            Some(name) => format!("{}.{}", name, options.file_format.extension()),
            None => descriptor.file_name,
        };
        let path = options.file_path.join(&file_name);
        tokio::fs::write(&path, &data).await.map_err(|e| {
            ClientError::InvalidArgument(format!("cannot write {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), bytes = data.len(), "Picture saved");

        Ok(ResponseEnvelope::success("Picture captured and saved to disk")
            .with_detail(keys::FILE_NAME, file_name)
            .with_detail(keys::FILE_SIZE, size)
            .with_detail(keys::PATH, path.display().to_string()))
    }

    /// Starts a recording and, when a duration is given, stops it again.
    pub async fn start_video(&mut self, options: &VideoOptions) -> ClientResult<ResponseEnvelope> {
        let args = VideoArgs {
            resolution: options.resolution,
        };
        ensure_dir(&options.file_path).await?;
        let mut reply = self
            .request(&CommandEnvelope::with_args(Action::StartVideo, &args)?)
            .await?;
        if reply.is_warning() {
            return Ok(reply);
        }

        let descriptor: TransferDescriptor = reply.details_as()?;
        let file_name = match &options.file_name {
            Some(name) => format!("{}.{}", name, picam_core::RECORDING_EXTENSION),
            None => descriptor.file_name,
        };
        let path = options.file_path.join(&file_name);
        let receiver = match RecordingReceiver::spawn(
            &self.data_endpoint,
            descriptor.transfer_token,
            path,
            self.timeouts,
        )
        .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                // The server gives up on the data accept and closes anyway.
                self.client.close();
                return Err(e);
            }
        };
        reply.set_detail(keys::PATH, receiver.path().display().to_string());
        self.recording = Some(receiver);

        match options.duration.filter(|d| !d.is_zero()) {
            None => {
                reply.set_detail(keys::DURATION, "N/A");
                Ok(reply)
            }
            Some(duration) => {
                info!(seconds = duration.as_secs_f64(), "Recording");
                tokio::time::sleep(duration).await;
                let mut stopped = self.stop_video().await?;
                stopped.set_detail(keys::FILE_NAME, file_name);
                stopped.set_detail(keys::DURATION, duration.as_secs_f64());
                Ok(stopped)
            }
        }
    }

    /// Stops the recording and waits for the receiver to drain.
    pub async fn stop_video(&mut self) -> ClientResult<ResponseEnvelope> {
        let mut reply = match self.request(&CommandEnvelope::new(Action::StopVideo)).await {
            Ok(reply) => reply,
            Err(e) => {
                if let Some(receiver) = self.recording.take() {
                    receiver.cancel();
                }
                return Err(e);
            }
        };
        if reply.is_warning() {
            return Ok(reply);
        }

        if let Some(receiver) = self.recording.take() {
            let path = receiver.path().display().to_string();
            let received = receiver.finish(self.timeouts.stop_join).await?;
            if let Some(sent) = reply.detail_u64(keys::BYTES_SENT) {
                if sent != received {
                    warn!(sent, received, "Recording size differs from what the server sent");
                }
            }
            reply.set_detail(keys::BYTES_RECEIVED, received);
            reply.set_detail(keys::PATH, path);
        }
        Ok(reply)
    }

    /// Starts a live MPEG-TS stream over UDP.
    ///
    /// With `ip_out` unset the server streams back to this client's address.
    pub async fn start_stream(
        &mut self,
        resolution: Resolution,
        ip_out: Option<String>,
    ) -> ClientResult<ResponseEnvelope> {
        let args = StreamArgs { resolution, ip_out };
        let reply = self
            .request(&CommandEnvelope::with_args(Action::StartStream, &args)?)
            .await?;
        if let Some(url) = reply.detail_str(keys::URL) {
            info!("Watch with: ffplay -f mpegts -probesize 32 {}", url);
        }
        Ok(reply)
    }

    /// Stops the live stream.
    pub async fn stop_stream(&mut self) -> ClientResult<ResponseEnvelope> {
        self.request(&CommandEnvelope::new(Action::StopStream)).await
    }

    pub async fn read_barcode(&mut self) -> ClientResult<ResponseEnvelope> {
        self.request(&CommandEnvelope::new(Action::ReadBarcode)).await
    }

    pub async fn read_qrcode(&mut self) -> ClientResult<ResponseEnvelope> {
        self.request(&CommandEnvelope::new(Action::ReadQrcode)).await
    }

    /// Re-opens the command connection after a failure.
    ///
    /// Any recording in progress is abandoned: the server tears its session
    /// down when the old connection closes.
    pub async fn reconnect(&mut self) -> ClientResult<()> {
        if let Some(receiver) = self.recording.take() {
            receiver.cancel();
        }
        self.client.reconnect().await
    }

    /// Closes the command connection and cancels any recording receiver.
    pub fn close(&mut self) {
        if let Some(receiver) = self.recording.take() {
            receiver.cancel();
        }
        self.client.close();
    }

    async fn request(&mut self, envelope: &CommandEnvelope) -> ClientResult<ResponseEnvelope> {
        let reply = self.client.send(envelope).await;
        check(reply)
    }
}

/// Creates the output directory before the server claims the device for us.
async fn ensure_dir(dir: &Path) -> ClientResult<()> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        ClientError::InvalidArgument(format!("cannot create directory {}: {}", dir.display(), e))
    })
}

/// Raises error replies; warnings are logged and passed through.
fn check(reply: ResponseEnvelope) -> ClientResult<ResponseEnvelope> {
    if reply.is_error() {
        let message = reply.error_message().unwrap_or(reply.status.as_str()).to_string();
        return Err(match reply.detail_str(keys::ERROR_KIND) {
            None => ClientError::Camera(message),
            Some("timeout") => ClientError::Timeout(message),
            Some(_) => ClientError::Connection(message),
        });
    }
    if let Some(message) = reply.warning_message() {
        warn!("{}", message);
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_becomes_camera_error() {
        let err = check(ResponseEnvelope::error("Unknown action 'dance'.")).unwrap_err();
        assert!(matches!(err, ClientError::Camera(ref m) if m == "Unknown action 'dance'."));
    }

    #[test]
    fn transport_failure_keeps_its_kind() {
        let reply = ResponseEnvelope::error("timeout: waiting for reply")
            .with_detail(keys::ERROR_KIND, "timeout");
        assert!(matches!(check(reply), Err(ClientError::Timeout(_))));

        let reply = ResponseEnvelope::error("connection error: server closed the connection")
            .with_detail(keys::ERROR_KIND, "connection");
        assert!(matches!(check(reply), Err(ClientError::Connection(_))));
    }

    #[test]
    fn warning_is_returned_as_data() {
        let reply = ResponseEnvelope::warning("careful");
        let checked = check(reply.clone()).unwrap();
        assert_eq!(checked, reply);
    }

    #[test]
    fn defaults() {
        let capture = CaptureOptions::default();
        assert_eq!(capture.file_format, ImageFormat::Jpeg);
        assert_eq!(capture.resolution, Resolution::new(4608, 2592));
        assert!(capture.autofocus);
        assert_eq!(VideoOptions::default().duration, Some(Duration::from_secs(5)));
        assert_eq!(VideoOptions::default().resolution, Resolution::new(1280, 720));
    }

    #[tokio::test]
    async fn nested_output_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("recordings").join("today");
        ensure_dir(&nested).await.unwrap();
        assert!(nested.is_dir());
        // Already there is fine.
        ensure_dir(&nested).await.unwrap();
    }

    #[tokio::test]
    async fn file_in_the_way_is_invalid_argument() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let err = ensure_dir(&blocker.join("below")).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(ref m) if m.starts_with("cannot create directory")));
    }
}
