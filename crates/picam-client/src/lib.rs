//! Camera client: command connection, data-channel receivers and the `picam` CLI.
//!
//! [`CameraDriver`] is the entry point for programmatic use:
//!
//! ```no_run
//! # async fn demo() -> picam_client::ClientResult<()> {
//! use picam_client::{CameraDriver, CaptureOptions, ClientConfig};
//!
//! let mut driver = CameraDriver::connect(&ClientConfig::default()).await?;
//! let reply = driver.capture(&CaptureOptions::default()).await?;
//! println!("{}", reply.status);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod driver;
pub mod error;
pub mod socket;
pub mod transfer;

pub use cli::Cli;
pub use config::{ClientConfig, Timeouts};
pub use driver::{CameraDriver, CaptureOptions, VideoOptions};
pub use error::{ClientError, ClientResult};
pub use socket::CommandClient;
pub use transfer::{RecordingReceiver, receive_finite};
