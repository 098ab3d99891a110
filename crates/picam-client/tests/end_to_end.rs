//! Client and server talking over real sockets, with the simulated camera.

use std::time::Duration;

use picam_client::{CameraDriver, CaptureOptions, ClientError, Timeouts, VideoOptions};
use picam_core::{ImageFormat, Resolution};
use picam_protocol::{CommandEnvelope, keys};
use picam_server::{CameraServer, Device, ServerConfig, SimulatedCamera};

fn timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_secs(2),
        command: Duration::from_secs(5),
        transfer: Duration::from_secs(5),
        stop_join: Duration::from_secs(5),
    }
}

struct TestServer {
    command: String,
    data: String,
    device: Device,
}

impl TestServer {
    async fn start() -> Self {
        let camera = SimulatedCamera::new().with_frame_interval(Duration::from_millis(2));
        let server = CameraServer::bind(ServerConfig::ephemeral(), camera)
            .await
            .unwrap();
        let command = server.command_addr().unwrap().to_string();
        let data = server.data_addr().unwrap().to_string();
        let device = server.device().clone();
        tokio::spawn(async move { server.run().await });
        Self {
            command,
            data,
            device,
        }
    }

    async fn driver(&self) -> CameraDriver {
        CameraDriver::connect_to(&self.command, &self.data, timeouts())
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn template_action_roundtrip() {
    let server = TestServer::start().await;
    let mut driver = server.driver().await;
    let reply = driver.template_action(7).await.unwrap();
    assert_eq!(reply.status, "template_action executed");
    assert_eq!(reply.detail_u64("test_int"), Some(7));
}

#[tokio::test]
async fn capture_saves_announced_bytes() {
    let server = TestServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut driver = server.driver().await;

    let options = CaptureOptions {
        file_format: ImageFormat::Png,
        resolution: Resolution::new(640, 480),
        autofocus: false,
        focus_length: 2.5,
        file_name: Some("shot".into()),
        file_path: dir.path().to_path_buf(),
    };
    let reply = driver.capture(&options).await.unwrap();
    assert_eq!(reply.status, "Picture captured and saved to disk");
    assert_eq!(reply.detail_str(keys::FILE_NAME), Some("shot.png"));

    let size = reply.detail_u64(keys::FILE_SIZE).unwrap();
    assert!(size > 0);
    let saved = std::fs::read(dir.path().join("shot.png")).unwrap();
    assert_eq!(saved.len() as u64, size);
    assert!(server.device.is_idle());

    // The connection stays usable after a finite transfer.
    let again = driver
        .capture(&CaptureOptions {
            file_path: dir.path().to_path_buf(),
            resolution: Resolution::new(320, 240),
            ..CaptureOptions::default()
        })
        .await
        .unwrap();
    let name = again.detail_str(keys::FILE_NAME).unwrap();
    assert!(name.starts_with("picam_") && name.ends_with(".jpeg"), "{name}");
}

#[tokio::test]
async fn out_of_bounds_capture_is_an_error() {
    let server = TestServer::start().await;
    let mut driver = server.driver().await;

    let err = driver
        .capture(&CaptureOptions {
            resolution: Resolution::new(5000, 100),
            ..CaptureOptions::default()
        })
        .await
        .unwrap_err();
    match err {
        ClientError::Camera(message) => assert!(message.contains("5000"), "{message}"),
        other => panic!("expected Camera error, got {other:?}"),
    }
    assert!(driver.client().is_broken());
    assert!(server.device.is_idle());
}

#[tokio::test]
async fn stray_stop_is_a_warning() {
    let server = TestServer::start().await;
    let mut driver = server.driver().await;

    let reply = driver.stop_video().await.unwrap();
    assert!(reply.is_warning());
    assert_eq!(
        reply.warning_message(),
        Some("Command 'stop_video' can only be executed, if 'start_video' was called before.")
    );
    assert!(!driver.client().is_broken());
}

#[tokio::test]
async fn timed_video_persists_every_sent_byte() {
    let server = TestServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut driver = server.driver().await;

    let reply = driver
        .start_video(&VideoOptions {
            resolution: Resolution::new(640, 480),
            file_name: Some("clip".into()),
            file_path: dir.path().to_path_buf(),
            duration: Some(Duration::from_millis(300)),
        })
        .await
        .unwrap();

    assert_eq!(reply.status, "Video successfully recorded and data socket closed");
    assert_eq!(reply.detail_str(keys::FILE_NAME), Some("clip.h264"));
    let sent = reply.detail_u64(keys::BYTES_SENT).unwrap();
    let received = reply.detail_u64(keys::BYTES_RECEIVED).unwrap();
    assert!(sent > 0);
    assert_eq!(sent, received);

    let on_disk = std::fs::metadata(dir.path().join("clip.h264")).unwrap().len();
    assert_eq!(on_disk, sent);
    assert!(!driver.is_recording());
    assert!(server.device.is_idle());
}

#[tokio::test]
async fn second_connection_is_refused_while_recording() {
    let server = TestServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut recorder = server.driver().await;

    let started = recorder
        .start_video(&VideoOptions {
            file_path: dir.path().to_path_buf(),
            duration: None,
            ..VideoOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(started.status, "Video recording started...");
    assert_eq!(started.detail_str(keys::DURATION), Some("N/A"));
    assert!(recorder.is_recording());

    // Only stop_video is accepted on the recording connection.
    let busy_here = recorder.template_action(1).await.unwrap();
    assert!(busy_here.is_warning());

    let mut other = server.driver().await;
    let err = other
        .capture(&CaptureOptions {
            file_path: dir.path().to_path_buf(),
            ..CaptureOptions::default()
        })
        .await
        .unwrap_err();
    assert!(
        matches!(err, ClientError::Camera(ref m) if m.contains("busy")),
        "{err:?}"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stopped = recorder.stop_video().await.unwrap();
    assert_eq!(
        stopped.detail_u64(keys::BYTES_SENT),
        stopped.detail_u64(keys::BYTES_RECEIVED)
    );
    assert!(server.device.is_idle());
}

#[tokio::test]
async fn unknown_action_breaks_the_connection_until_reconnect() {
    let server = TestServer::start().await;
    let mut driver = server.driver().await;

    let reply = driver
        .send(&CommandEnvelope::raw("dance", Default::default()))
        .await;
    assert!(reply.is_error());
    assert_eq!(reply.error_message(), Some("Unknown action 'dance'."));
    assert!(driver.client().is_broken());

    let err = driver.template_action(1).await.unwrap_err();
    assert!(matches!(err, ClientError::Connection(_)));

    driver.reconnect().await.unwrap();
    assert!(driver.template_action(2).await.is_ok());
}

#[tokio::test]
async fn barcode_is_not_implemented() {
    let server = TestServer::start().await;
    let mut driver = server.driver().await;
    let err = driver.read_barcode().await.unwrap_err();
    assert!(matches!(err, ClientError::Camera(ref m) if m == "'read_barcode' method not implemented"));
}

#[tokio::test]
async fn video_into_missing_directory_creates_it() {
    let server = TestServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("recordings").join("today");
    let mut driver = server.driver().await;

    let reply = driver
        .start_video(&VideoOptions {
            resolution: Resolution::new(640, 480),
            file_name: Some("clip".into()),
            file_path: nested.clone(),
            duration: Some(Duration::from_millis(100)),
        })
        .await
        .unwrap();

    let sent = reply.detail_u64(keys::BYTES_SENT).unwrap();
    let on_disk = std::fs::metadata(nested.join("clip.h264")).unwrap().len();
    assert_eq!(on_disk, sent);
    assert!(server.device.is_idle());
}

#[tokio::test]
async fn capture_into_missing_directory_creates_it() {
    let server = TestServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("stills").join("today");
    let mut driver = server.driver().await;

    let reply = driver
        .capture(&CaptureOptions {
            resolution: Resolution::new(320, 240),
            file_name: Some("shot".into()),
            file_path: nested.clone(),
            ..CaptureOptions::default()
        })
        .await
        .unwrap();
    let size = reply.detail_u64(keys::FILE_SIZE).unwrap();
    assert_eq!(std::fs::metadata(nested.join("shot.jpeg")).unwrap().len(), size);
}

#[tokio::test]
async fn unusable_output_directory_never_claims_the_device() {
    let server = TestServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not_a_dir");
    std::fs::write(&blocker, b"x").unwrap();
    let mut driver = server.driver().await;

    let err = driver
        .start_video(&VideoOptions {
            file_path: blocker.join("clips"),
            duration: None,
            ..VideoOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)), "{err:?}");
    assert!(server.device.is_idle());
    assert!(!driver.is_recording());
    assert!(!driver.client().is_broken());
    assert!(driver.template_action(3).await.is_ok());
}
