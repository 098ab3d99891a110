//! Camera hardware abstraction.
//!
//! The server only ever drives the camera through the [`Camera`] trait:
//! configure, start/stop, focus, capture one still, and start/stop an
//! encoded recording. Encoders and autofocus live behind the trait.
//!
//! All methods are blocking; the server calls them from
//! `tokio::task::spawn_blocking` through a [`crate::DeviceLease`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use picam_core::{ImageFormat, Resolution};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Result type for camera operations.
pub type CameraResult<T> = Result<T, CameraError>;

/// Failures reported by the camera backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    #[error("Autofocus cycle failed.")]
    AutofocusFailed,

    #[error("Camera is not configured for {0} mode.")]
    NotConfigured(&'static str),

    #[error("A recording is already in progress.")]
    AlreadyRecording,

    #[error("No recording in progress.")]
    NotRecording,

    #[error("Camera backend failure: {0}")]
    Backend(String),
}

/// Encoded output produced by a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEncoding {
    /// Raw Annex-B H.264 elementary stream.
    H264,
    /// H.264 muxed into 188-byte MPEG transport stream packets.
    MpegTs,
}

/// Channel the camera pushes encoded chunks into while recording.
///
/// The camera must drop its sender once `stop_recording` returns.
pub type FrameSender = mpsc::Sender<Vec<u8>>;

/// Capture/record/stop primitives of the camera device.
pub trait Camera: Send + 'static {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Selects the still pipeline at the given size.
    fn configure_still(&mut self, resolution: Resolution) -> CameraResult<()>;

    /// Selects the video pipeline at the given size.
    fn configure_video(&mut self, resolution: Resolution) -> CameraResult<()>;

    /// Starts the sensor.
    fn start(&mut self) -> CameraResult<()>;

    /// Stops the sensor.
    fn stop(&mut self) -> CameraResult<()>;

    /// Runs one autofocus cycle; returns whether focus was achieved.
    fn autofocus_cycle(&mut self) -> CameraResult<bool>;

    /// Switches to manual focus at the given lens position.
    fn set_lens_position(&mut self, position: f64) -> CameraResult<()>;

    /// Captures one still image, fully encoded.
    fn capture(&mut self, format: ImageFormat) -> CameraResult<Vec<u8>>;

    /// Starts the encoder, pushing chunks into `output` until stopped.
    fn start_recording(&mut self, encoding: VideoEncoding, output: FrameSender)
    -> CameraResult<()>;

    /// Stops the encoder. No chunk is sent after this returns.
    fn stop_recording(&mut self) -> CameraResult<()>;
}

/// MPEG-TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Still(Resolution),
    Video(Resolution),
}

struct Recorder {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<u64>,
}

/// Deterministic in-process camera.
///
/// Produces well-formed headers for every still format and a steady
/// stream of fake H.264 access units, sized by resolution. Used when no
/// hardware backend is available and throughout the test suite.
pub struct SimulatedCamera {
    mode: Option<Mode>,
    running: bool,
    lens_position: Option<f64>,
    frame_interval: Duration,
    fail_autofocus: bool,
    fail_capture: bool,
    recorder: Option<Recorder>,
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCamera {
    /// Creates a simulated camera producing ~30 frames per second.
    pub fn new() -> Self {
        Self {
            mode: None,
            running: false,
            lens_position: None,
            frame_interval: Duration::from_millis(33),
            fail_autofocus: false,
            fail_capture: false,
            recorder: None,
        }
    }

    /// Builder: set the time between recorded frames.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Builder: make every autofocus cycle fail.
    pub fn with_autofocus_failure(mut self, fail: bool) -> Self {
        self.fail_autofocus = fail;
        self
    }

    /// Builder: make every capture fail with a backend error.
    pub fn with_capture_failure(mut self, fail: bool) -> Self {
        self.fail_capture = fail;
        self
    }

    /// Manual lens position last set, if any.
    pub fn lens_position(&self) -> Option<f64> {
        self.lens_position
    }

    /// Returns true while a recording thread is running.
    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }
}

impl Camera for SimulatedCamera {
    fn name(&self) -> &str {
        "simulated"
    }

    fn configure_still(&mut self, resolution: Resolution) -> CameraResult<()> {
        if self.recorder.is_some() {
            return Err(CameraError::AlreadyRecording);
        }
        self.mode = Some(Mode::Still(resolution));
        Ok(())
    }

    fn configure_video(&mut self, resolution: Resolution) -> CameraResult<()> {
        if self.recorder.is_some() {
            return Err(CameraError::AlreadyRecording);
        }
        self.mode = Some(Mode::Video(resolution));
        Ok(())
    }

    fn start(&mut self) -> CameraResult<()> {
        if self.mode.is_none() {
            return Err(CameraError::NotConfigured("any"));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> CameraResult<()> {
        self.running = false;
        Ok(())
    }

    fn autofocus_cycle(&mut self) -> CameraResult<bool> {
        if !self.running {
            return Err(CameraError::Backend("autofocus requires a started camera".into()));
        }
        self.lens_position = None;
        Ok(!self.fail_autofocus)
    }

    fn set_lens_position(&mut self, position: f64) -> CameraResult<()> {
        self.lens_position = Some(position);
        Ok(())
    }

    fn capture(&mut self, format: ImageFormat) -> CameraResult<Vec<u8>> {
        let Some(Mode::Still(resolution)) = self.mode else {
            return Err(CameraError::NotConfigured("still"));
        };
        if !self.running {
            return Err(CameraError::Backend("capture requires a started camera".into()));
        }
        if self.fail_capture {
            return Err(CameraError::Backend("sensor returned no frame".into()));
        }
        Ok(synthesize_still(format, resolution))
    }

    fn start_recording(
        &mut self,
        encoding: VideoEncoding,
        output: FrameSender,
    ) -> CameraResult<()> {
        let Some(Mode::Video(resolution)) = self.mode else {
            return Err(CameraError::NotConfigured("video"));
        };
        if self.recorder.is_some() {
            return Err(CameraError::AlreadyRecording);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let interval = self.frame_interval;
        let thread = thread::Builder::new()
            .name("sim-encoder".to_string())
            .spawn(move || record_loop(resolution, encoding, interval, output, thread_stop))
            .map_err(|e| CameraError::Backend(format!("failed to spawn encoder: {e}")))?;

        self.running = true;
        self.recorder = Some(Recorder { stop, thread });
        debug!(%resolution, ?encoding, "Simulated recording started");
        Ok(())
    }

    fn stop_recording(&mut self) -> CameraResult<()> {
        let recorder = self.recorder.take().ok_or(CameraError::NotRecording)?;
        recorder.stop.store(true, Ordering::Relaxed);
        let frames = recorder
            .thread
            .join()
            .map_err(|_| CameraError::Backend("encoder thread panicked".into()))?;
        self.running = false;
        debug!(frames, "Simulated recording stopped");
        Ok(())
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        if self.recorder.is_some()
            && let Err(e) = self.stop_recording()
        {
            warn!(error = %e, "Failed to stop simulated recording on drop");
        }
    }
}

/// Encoder loop; returns the number of frames emitted.
fn record_loop(
    resolution: Resolution,
    encoding: VideoEncoding,
    interval: Duration,
    output: FrameSender,
    stop: Arc<AtomicBool>,
) -> u64 {
    let mut frame_no = 0u64;
    while !stop.load(Ordering::Relaxed) {
        let unit = h264_access_unit(resolution, frame_no);
        let chunk = match encoding {
            VideoEncoding::H264 => unit,
            VideoEncoding::MpegTs => ts_packetize(&unit, frame_no),
        };
        if output.blocking_send(chunk).is_err() {
            break;
        }
        frame_no += 1;
        thread::sleep(interval);
    }
    frame_no
}

fn pattern(len: usize, seed: u64) -> impl Iterator<Item = u8> {
    (0..len).map(move |i| ((i as u64).wrapping_mul(31).wrapping_add(seed) % 251) as u8)
}

fn synthesize_still(format: ImageFormat, resolution: Resolution) -> Vec<u8> {
    let body_len = (resolution.pixel_count() / 32).max(64) as usize;
    let mut out = match format {
        ImageFormat::Jpeg => vec![0xFF, 0xD8, 0xFF, 0xE0],
        ImageFormat::Png => vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A],
        ImageFormat::Bmp => b"BM".to_vec(),
        ImageFormat::Gif => b"GIF89a".to_vec(),
    };
    out.reserve(body_len + 2);
    out.extend(pattern(body_len, resolution.pixel_count()));
    match format {
        ImageFormat::Jpeg => out.extend_from_slice(&[0xFF, 0xD9]),
        ImageFormat::Gif => out.push(0x3B),
        ImageFormat::Png | ImageFormat::Bmp => {}
    }
    out
}

fn h264_access_unit(resolution: Resolution, frame_no: u64) -> Vec<u8> {
    let len = (resolution.pixel_count() / 512).max(32) as usize;
    // IDR every 30 frames, non-IDR slices otherwise.
    let nal_type = if frame_no % 30 == 0 { 0x65 } else { 0x41 };
    let mut unit = vec![0x00, 0x00, 0x00, 0x01, nal_type];
    unit.extend(pattern(len, frame_no));
    unit
}

fn ts_packetize(payload: &[u8], frame_no: u64) -> Vec<u8> {
    const HEADER: usize = 4;
    let per_packet = TS_PACKET_SIZE - HEADER;
    let mut out = Vec::with_capacity(payload.len().div_ceil(per_packet) * TS_PACKET_SIZE);
    for (i, piece) in payload.chunks(per_packet).enumerate() {
        let start = if i == 0 { 0x40 } else { 0x00 };
        let continuity = ((frame_no as usize + i) & 0x0F) as u8;
        out.extend_from_slice(&[0x47, start | 0x01, 0x00, 0x10 | continuity]);
        out.extend_from_slice(piece);
        out.resize(out.len() + (per_packet - piece.len()), 0xFF);
    }
    out
}
