//! Session dispatcher.
//!
//! Reads one command at a time from a control connection, routes it through
//! the action table and lets the handler emit every reply it needs. Any
//! error escaping a handler ends the connection: one error reply is sent
//! (if the socket still accepts it), then the connection is closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, info, warn};

use picam_core::{ImageFormat, RECORDING_EXTENSION, ResolutionBounds, check_focus_length};
use picam_protocol::{
    CaptureArgs, CommandEnvelope, Request, ResponseEnvelope, StreamArgs, TemplateArgs,
    TransferDescriptor, VideoArgs, keys,
};

use crate::camera::{Camera, CameraError};
use crate::config::ServerConfig;
use crate::data::{DataChannel, MediaSink};
use crate::device::Device;
use crate::error::{ServerError, ServerResult};
use crate::session::{SessionKind, StopTrigger, StreamingSession};
use crate::socket::Connection;

/// Host shown in a stream URL whose destination was chosen by the caller.
pub const OVERRIDDEN_HOST_PLACEHOLDER: &str = "<server_ip>";

/// What the connection loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Routes commands of one or more connections to the camera.
pub struct RequestHandler {
    config: ServerConfig,
    device: Device,
    data: Arc<DataChannel>,
}

impl RequestHandler {
    /// Creates a handler over the shared device and data channel.
    pub fn new(config: ServerConfig, device: Device, data: Arc<DataChannel>) -> Self {
        Self {
            config,
            device,
            data,
        }
    }

    /// Serves one control connection until the peer closes or a command fails.
    pub async fn handle_connection(&self, mut conn: Connection) {
        info!("Client connected");
        loop {
            let envelope = match conn.read_command().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    debug!("Client disconnected");
                    break;
                }
                Err(e) => {
                    fail(&mut conn, e).await;
                    break;
                }
            };

            match self.dispatch(&mut conn, &envelope).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    fail(&mut conn, e).await;
                    break;
                }
            }
        }
        info!("Connection closed");
    }

    async fn dispatch(&self, conn: &mut Connection, envelope: &CommandEnvelope) -> ServerResult<Flow> {
        let request = Request::from_envelope(envelope)?;
        debug!(action = %request.action(), "Dispatching command");

        match request {
            Request::TemplateAction(args) => self.template_action(conn, args).await,
            Request::Capture(args) => self.capture(conn, args).await,
            Request::StartVideo(args) => self.start_video(conn, args).await,
            Request::StartStream(args) => self.start_stream(conn, args).await,
            Request::StopVideo => stray_stop(conn, SessionKind::VideoFile).await,
            Request::StopStream => stray_stop(conn, SessionKind::UdpStream).await,
            Request::ReadBarcode => Err(ServerError::not_implemented(
                "'read_barcode' method not implemented",
            )),
            Request::ReadQrcode => Err(ServerError::not_implemented(
                "'read_qrcode' method not implemented",
            )),
        }
    }

    async fn template_action(&self, conn: &mut Connection, args: TemplateArgs) -> ServerResult<Flow> {
        let reply =
            ResponseEnvelope::success("template_action executed").with_detail("test_int", args.test_int);
        conn.respond(&reply).await?;
        Ok(Flow::Continue)
    }

    /// Captures one still and sends it as a finite transfer.
    ///
    /// Every argument is validated before the camera is touched.
    async fn capture(&self, conn: &mut Connection, args: CaptureArgs) -> ServerResult<Flow> {
        let resolution = ResolutionBounds::STILL.check(args.resolution)?;
        let focus = if args.autofocus {
            Focus::Auto
        } else {
            Focus::Manual(check_focus_length(args.focus_length)?)
        };
        let format = args.file_format;

        let lease = self.device.try_claim("capture")?;
        let settle = self.config.settle_delay;
        let picture = lease
            .run(move |camera| {
                camera.configure_still(resolution)?;
                camera.start()?;
                let captured = focus_and_capture(camera, focus, format, settle);
                let stopped = camera.stop();
                let picture = captured?;
                stopped?;
                Ok(picture)
            })
            .await?;

        let file_name = timestamped_name(format.extension());
        let descriptor =
            TransferDescriptor::finite(&file_name, picture.len() as u64, resolution, format.as_str());
        info!(file = %file_name, bytes = picture.len(), "Picture captured");

        let reply = ResponseEnvelope::success("picture captured, starting transfer...")
            .with_details_from(&descriptor)?;
        conn.respond(&reply).await?;

        self.data
            .send_finite(descriptor.transfer_token, &picture)
            .await?;
        drop(lease);
        debug!(file = %file_name, "Picture sent");
        Ok(Flow::Continue)
    }

    /// Starts an H.264 recording over the data channel.
    async fn start_video(&self, conn: &mut Connection, args: VideoArgs) -> ServerResult<Flow> {
        let resolution = ResolutionBounds::VIDEO.check(args.resolution)?;
        let lease = self.device.try_claim("start_video")?;
        let mut session = StreamingSession::new(SessionKind::VideoFile, resolution, lease);
        session.prepare().await?;

        let descriptor = TransferDescriptor::continuous(
            timestamped_name(RECORDING_EXTENSION),
            resolution,
            RECORDING_EXTENSION,
        );
        let reply =
            ResponseEnvelope::success("Video recording started...").with_details_from(&descriptor)?;
        conn.respond(&reply).await?;

        let stream = self.data.accept_transfer(descriptor.transfer_token).await?;
        session
            .start(MediaSink::Data(stream), self.config.write_timeout)
            .await?;
        self.run_session(conn, session).await
    }

    /// Starts an MPEG-TS stream over UDP.
    ///
    /// Without `IP_out` the stream goes back to the caller's address and the
    /// reported URL names it. With `IP_out` the server sends to the resolved
    /// override, reports it as `destination`, and keeps a placeholder host in
    /// `url` since it cannot know how the caller reaches that address.
    async fn start_stream(&self, conn: &mut Connection, args: StreamArgs) -> ServerResult<Flow> {
        let resolution = ResolutionBounds::VIDEO.check(args.resolution)?;
        let port = self.config.stream_port;
        let (destination, url) = match args.ip_out.as_deref() {
            None => {
                let destination = SocketAddr::new(conn.peer().ip(), port);
                (destination, format!("udp://{destination}"))
            }
            Some(host) => (
                resolve_destination(host, port).await?,
                format!("udp://{OVERRIDDEN_HOST_PLACEHOLDER}:{port}"),
            ),
        };

        let lease = self.device.try_claim("start_stream")?;
        let mut session = StreamingSession::new(SessionKind::UdpStream, resolution, lease);
        session.prepare().await?;
        let sink = MediaSink::datagram(destination).await?;
        session.start(sink, self.config.write_timeout).await?;

        info!(%destination, %url, "Streaming over UDP");
        let reply = ResponseEnvelope::success("Stream started over UDP stream socket.")
            .with_detail(keys::URL, url)
            .with_detail(keys::DESTINATION, destination.to_string())
            .with_detail("resolution", <[u32; 2]>::from(resolution).to_vec());
        if let Err(e) = conn.respond(&reply).await {
            return Err(teardown_after(session, self.config.teardown_timeout, e).await);
        }
        self.run_session(conn, session).await
    }

    /// Holds the connection in restricted mode until the session stops.
    async fn run_session(
        &self,
        conn: &mut Connection,
        mut session: StreamingSession,
    ) -> ServerResult<Flow> {
        let teardown = self.config.teardown_timeout;
        let trigger = match session.await_stop(conn).await {
            Ok(trigger) => trigger,
            Err(e) => return Err(teardown_after(session, teardown, e).await),
        };

        let kind = session.kind();
        let sent = session.stop(teardown).await?;
        match trigger {
            StopTrigger::StopRequested => {
                let reply = ResponseEnvelope::success(kind.stopped_status())
                    .with_detail(keys::BYTES_SENT, sent);
                conn.respond(&reply).await?;
                Ok(Flow::Continue)
            }
            StopTrigger::PeerClosed => {
                info!(kind = kind.as_str(), bytes = sent, "Client left during active session");
                Ok(Flow::Close)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Focus {
    Auto,
    Manual(f64),
}

fn focus_and_capture(
    camera: &mut dyn Camera,
    focus: Focus,
    format: ImageFormat,
    settle: Duration,
) -> Result<Vec<u8>, CameraError> {
    if !settle.is_zero() {
        std::thread::sleep(settle);
    }
    match focus {
        Focus::Auto => {
            if !camera.autofocus_cycle()? {
                return Err(CameraError::AutofocusFailed);
            }
        }
        Focus::Manual(position) => camera.set_lens_position(position)?,
    }
    camera.capture(format)
}

fn timestamped_name(extension: &str) -> String {
    format!("{}.{extension}", Local::now().format("picam_%Y%m%d_%H%M%S"))
}

async fn resolve_destination(host: &str, port: u16) -> ServerResult<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
        ServerError::validation(format!("Cannot resolve stream destination '{host}': {e}"))
    })?;
    addrs.next().ok_or_else(|| {
        ServerError::validation(format!("Stream destination '{host}' has no address."))
    })
}

/// Answers a stop action that arrives with no session running.
async fn stray_stop(conn: &mut Connection, kind: SessionKind) -> ServerResult<Flow> {
    let warning = ResponseEnvelope::warning(format!(
        "Command '{}' can only be executed, if '{}' was called before.",
        kind.stop_action(),
        kind.start_action()
    ));
    conn.respond(&warning).await?;
    Ok(Flow::Continue)
}

/// Stops `session` before surfacing `cause`.
async fn teardown_after(
    mut session: StreamingSession,
    teardown: Duration,
    cause: ServerError,
) -> ServerError {
    if let Err(e) = session.stop(teardown).await {
        warn!(error = %e, "Session teardown failed");
    }
    cause
}

/// Sends the terminal error reply; the caller then drops the connection.
async fn fail(conn: &mut Connection, err: ServerError) {
    warn!(kind = err.kind(), error = %err, "Command failed, closing connection");
    if let Err(e) = conn.respond(&ResponseEnvelope::error(err.to_string())).await {
        debug!(error = %e, "Could not deliver error reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SimulatedCamera;
    use crate::socket::CameraServer;
    use picam_protocol::{
        Action, DataHello, FrameReader, FrameWriter, ReplyStatus, TransferToken, encode_message,
    };
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    struct TestClient {
        reader: FrameReader<OwnedReadHalf>,
        writer: FrameWriter<OwnedWriteHalf>,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, write) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                reader: FrameReader::new(read),
                writer: FrameWriter::new(write),
            }
        }

        async fn call(&mut self, action: &str, args: serde_json::Value) -> ResponseEnvelope {
            let envelope = CommandEnvelope::raw(action, args.as_object().cloned().unwrap_or_default());
            self.writer.write_message(&envelope).await.unwrap();
            self.reply().await
        }

        async fn reply(&mut self) -> ResponseEnvelope {
            self.reader.read_message().await.unwrap().unwrap()
        }

        async fn is_closed(&mut self) -> bool {
            matches!(self.reader.read_frame().await, Ok(None) | Err(_))
        }
    }

    async fn spawn_server(camera: SimulatedCamera) -> (SocketAddr, SocketAddr, Device) {
        let server = CameraServer::bind(ServerConfig::ephemeral(), camera).await.unwrap();
        let command = server.command_addr().unwrap();
        let data = server.data_addr().unwrap();
        let device = server.device().clone();
        tokio::spawn(async move { server.run().await });
        (command, data, device)
    }

    async fn open_data(addr: SocketAddr, token: &str) -> TcpStream {
        let token: TransferToken = token.parse().unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = encode_message(&DataHello { transfer_token: token }).unwrap();
        stream.write_all(&hello).await.unwrap();
        stream
    }

    fn fast_camera() -> SimulatedCamera {
        SimulatedCamera::new().with_frame_interval(Duration::from_millis(2))
    }

    #[tokio::test]
    async fn template_action_echoes_argument() {
        let (addr, _, _) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let reply = client.call("template_action", json!({"test_int": 42})).await;
        insta::assert_json_snapshot!(reply, @r#"
        {
          "status": "template_action executed",
          "details": {
            "test_int": 42
          }
        }
        "#);
    }

    #[tokio::test]
    async fn unknown_action_is_fatal() {
        let (addr, _, _) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let reply = client.call("dance", json!({})).await;
        assert_eq!(reply.kind(), ReplyStatus::Error);
        assert_eq!(reply.error_message(), Some("Unknown action 'dance'."));
        assert_eq!(reply.details.len(), 1);
        assert!(client.is_closed().await);
    }

    #[tokio::test]
    async fn capture_announces_exact_size() {
        let (addr, data, device) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let reply = client
            .call(
                "capture",
                json!({"file_format": "jpeg", "resolution": [1280, 720], "autofocus": true, "focus_length": 0.0}),
            )
            .await;
        assert_eq!(reply.status, "picture captured, starting transfer...");
        let size = reply.detail_u64(keys::FILE_SIZE).unwrap();
        assert!(size > 0);
        let name = reply.detail_str(keys::FILE_NAME).unwrap();
        assert!(name.starts_with("picam_") && name.ends_with(".jpeg"));

        let mut stream = open_data(data, reply.detail_str(keys::TRANSFER_TOKEN).unwrap()).await;
        let mut picture = Vec::new();
        stream.read_to_end(&mut picture).await.unwrap();
        assert_eq!(picture.len() as u64, size);
        assert_eq!(&picture[..2], &[0xFF, 0xD8]);

        // The connection stays usable and the device is released.
        let reply = client.call("template_action", json!({"test_int": 1})).await;
        assert_eq!(reply.kind(), ReplyStatus::Success);
        assert!(device.is_idle());
    }

    #[tokio::test]
    async fn capture_rejects_out_of_bounds_width() {
        let (addr, _, device) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let reply = client
            .call(
                "capture",
                json!({"file_format": "png", "resolution": [5000, 720], "autofocus": true, "focus_length": 0.0}),
            )
            .await;
        assert!(reply.is_error());
        assert_eq!(
            reply.error_message(),
            Some("Invalid WIDTH resolution value '5000'. Expected INTEGER: 0<=WIDTH<=4608.")
        );
        assert!(client.is_closed().await);
        assert!(device.is_idle());
    }

    #[tokio::test]
    async fn manual_focus_is_validated() {
        let (addr, _, _) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let reply = client
            .call(
                "capture",
                json!({"file_format": "bmp", "resolution": [640, 480], "autofocus": false, "focus_length": 12.5}),
            )
            .await;
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn autofocus_failure_is_reported() {
        let (addr, _, device) = spawn_server(fast_camera().with_autofocus_failure(true)).await;
        let mut client = TestClient::connect(addr).await;
        let reply = client
            .call(
                "capture",
                json!({"file_format": "jpeg", "resolution": [640, 480], "autofocus": true, "focus_length": 0.0}),
            )
            .await;
        assert_eq!(reply.error_message(), Some("Autofocus cycle failed."));
        assert!(client.is_closed().await);
        assert!(device.is_idle());
    }

    #[tokio::test]
    async fn sensor_failure_closes_and_releases() {
        let (addr, _, device) = spawn_server(fast_camera().with_capture_failure(true)).await;
        let mut client = TestClient::connect(addr).await;
        let reply = client
            .call(
                "capture",
                json!({"file_format": "png", "resolution": [640, 480], "autofocus": false, "focus_length": 1.0}),
            )
            .await;
        assert!(reply.is_error());
        let message = reply.error_message().unwrap();
        assert!(message.contains("sensor returned no frame"), "{message}");
        assert!(client.is_closed().await);
        assert!(device.is_idle());
    }

    #[tokio::test]
    async fn stray_stop_is_a_warning() {
        let (addr, _, _) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let reply = client.call("stop_video", json!({})).await;
        assert!(reply.is_warning());
        assert_eq!(
            reply.warning_message(),
            Some("Command 'stop_video' can only be executed, if 'start_video' was called before.")
        );

        let reply = client.call("stop_stream", json!({})).await;
        assert!(reply.is_warning());
        let reply = client.call("template_action", json!({"test_int": 3})).await;
        assert_eq!(reply.kind(), ReplyStatus::Success);
    }

    #[tokio::test]
    async fn read_barcode_is_not_implemented() {
        let (addr, _, _) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let reply = client.call(Action::ReadBarcode.as_str(), json!({})).await;
        assert_eq!(
            reply.error_message(),
            Some("'read_barcode' method not implemented")
        );
        assert!(client.is_closed().await);
    }

    #[tokio::test]
    async fn video_session_restricts_commands() {
        let (addr, data, device) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let started = client.call("start_video", json!({"resolution": [640, 480]})).await;
        assert_eq!(started.status, "Video recording started...");
        assert_eq!(started.detail_u64(keys::FILE_SIZE), None);

        let mut stream = open_data(data, started.detail_str(keys::TRANSFER_TOKEN).unwrap()).await;
        let receiver = tokio::spawn(async move {
            let mut recording = Vec::new();
            stream.read_to_end(&mut recording).await.unwrap();
            recording
        });

        let warning = client.call("template_action", json!({"test_int": 1})).await;
        assert!(warning.is_warning());
        assert!(warning.warning_message().unwrap().contains("Allowed action: 'stop_video'"));

        let warning = client.call("stop_stream", json!({})).await;
        assert!(warning.is_warning());

        // A second connection cannot grab the camera meanwhile.
        let mut other = TestClient::connect(addr).await;
        let busy = other
            .call("capture", json!({"file_format": "jpeg", "resolution": [640, 480], "autofocus": true, "focus_length": 0.0}))
            .await;
        assert!(busy.is_error());
        assert!(busy.error_message().unwrap().contains("busy"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let stopped = client.call("stop_video", json!({})).await;
        assert_eq!(stopped.status, "Video successfully recorded and data socket closed");
        let sent = stopped.detail_u64(keys::BYTES_SENT).unwrap();

        let recording = receiver.await.unwrap();
        assert!(sent > 0);
        assert_eq!(recording.len() as u64, sent);
        assert!(device.is_idle());
    }

    #[tokio::test]
    async fn undecodable_command_during_session_is_a_warning() {
        let (addr, data, _) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let started = client.call("start_video", json!({})).await;
        let _stream = open_data(data, started.detail_str(keys::TRANSFER_TOKEN).unwrap()).await;

        // Allow the server to enter restricted mode.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let garbage = b"{not json";
        let mut frame = (garbage.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(garbage);
        client.writer.get_mut().write_all(&frame).await.unwrap();
        let warning = client.reply().await;
        assert!(warning.is_warning());

        let stopped = client.call("stop_video", json!({})).await;
        assert_eq!(stopped.kind(), ReplyStatus::Success);
    }

    #[tokio::test]
    async fn video_height_out_of_bounds() {
        let (addr, _, device) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let reply = client.call("start_video", json!({"resolution": [1280, 2000]})).await;
        assert_eq!(
            reply.error_message(),
            Some("Invalid HEIGHT resolution value '2000'. Expected INTEGER: 0<=HEIGHT<=1080.")
        );
        assert!(device.is_idle());
    }

    #[tokio::test]
    async fn stream_defaults_to_caller_address() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stream_port = receiver.local_addr().unwrap().port();
        let config = ServerConfig::ephemeral().with_stream_port(stream_port);
        let server = CameraServer::bind(config, fast_camera()).await.unwrap();
        let addr = server.command_addr().unwrap();
        tokio::spawn(async move { server.run().await });

        let mut client = TestClient::connect(addr).await;
        let started = client.call("start_stream", json!({"resolution": [640, 480], "IP_out": null})).await;
        assert_eq!(started.status, "Stream started over UDP stream socket.");
        assert_eq!(
            started.detail_str(keys::URL),
            Some(format!("udp://127.0.0.1:{stream_port}").as_str())
        );

        let mut datagram = vec![0u8; 2048];
        let n = receiver.recv(&mut datagram).await.unwrap();
        assert_eq!(n, crate::data::DATAGRAM_PAYLOAD);
        assert_eq!(datagram[0], 0x47);

        let stopped = client.call("stop_stream", json!({})).await;
        assert_eq!(stopped.status, "UDP stream stopped.");
        assert!(stopped.detail_u64(keys::BYTES_SENT).unwrap() > 0);
    }

    #[tokio::test]
    async fn stream_override_reports_placeholder() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stream_port = receiver.local_addr().unwrap().port();
        let config = ServerConfig::ephemeral().with_stream_port(stream_port);
        let server = CameraServer::bind(config, fast_camera()).await.unwrap();
        let addr = server.command_addr().unwrap();
        tokio::spawn(async move { server.run().await });

        let mut client = TestClient::connect(addr).await;
        let started = client
            .call("start_stream", json!({"IP_out": "127.0.0.1"}))
            .await;
        assert_eq!(
            started.detail_str(keys::URL),
            Some(format!("udp://<server_ip>:{stream_port}").as_str())
        );
        assert_eq!(
            started.detail_str(keys::DESTINATION),
            Some(format!("127.0.0.1:{stream_port}").as_str())
        );

        let stopped = client.call("stop_stream", json!({})).await;
        assert_eq!(stopped.kind(), ReplyStatus::Success);
    }

    #[tokio::test]
    async fn peer_close_during_session_releases_device() {
        let (addr, data, device) = spawn_server(fast_camera()).await;
        let mut client = TestClient::connect(addr).await;
        let started = client.call("start_video", json!({})).await;
        let mut stream = open_data(data, started.detail_str(keys::TRANSFER_TOKEN).unwrap()).await;
        drop(client);

        // The recording is closed by the server once teardown completes.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        for _ in 0..100 {
            if device.is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(device.is_idle());
    }
}
