//! Camera server: command channel, data channel and streaming sessions.
//!
//! This crate provides the server side of the camera protocol:
//! - TCP command listener with one task per control connection
//! - Session dispatcher routing each command to its handler
//! - Data channel for finite (still) and continuous (recording) transfers
//! - Streaming session state machine with an exclusive camera guard
//! - Camera hardware abstraction and a simulated backend
//!
//! # Example
//!
//! ```rust,no_run
//! use picam_server::{CameraServer, ServerConfig, Shutdown, SimulatedCamera};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = CameraServer::bind(ServerConfig::default(), SimulatedCamera::new()).await?;
//!     let shutdown = Shutdown::new();
//!     shutdown.listen_for_signals();
//!     server.run_until_shutdown(shutdown.wait()).await?;
//!     Ok(())
//! }
//! ```

mod camera;
mod config;
mod data;
mod device;
mod error;
mod handler;
mod session;
mod signals;
mod socket;

pub use camera::{
    Camera, CameraError, CameraResult, FrameSender, SimulatedCamera, TS_PACKET_SIZE, VideoEncoding,
};
pub use config::{ServerConfig, ServerSettings, TimeoutSettings};
pub use data::{DATAGRAM_PAYLOAD, DataChannel, MediaSink, pump};
pub use device::{Device, DeviceLease};
pub use error::{ServerError, ServerResult};
pub use handler::{OVERRIDDEN_HOST_PLACEHOLDER, RequestHandler};
pub use session::{SessionKind, SessionState, StopTrigger, StreamingSession};
pub use signals::Shutdown;
pub use socket::{CameraServer, Connection};
