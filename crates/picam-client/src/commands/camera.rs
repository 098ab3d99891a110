//! Camera commands: each one drives a [`CameraDriver`] and prints the reply.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use picam_core::{ImageFormat, Resolution};
use picam_protocol::ResponseEnvelope;

use crate::cli::CameraCommand;
use crate::driver::{CameraDriver, CaptureOptions, VideoOptions};
use crate::error::{ClientError, ClientResult};

/// How replies are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Text,
    Json,
}

/// Runs one camera command, writing media under `directory` unless the
/// command names its own output directory.
pub async fn run(
    driver: &mut CameraDriver,
    command: CameraCommand,
    directory: PathBuf,
    output: Output,
) -> ClientResult<()> {
    match command {
        CameraCommand::Template { test_int } => template(driver, test_int, output).await,
        CameraCommand::Capture {
            format,
            resolution,
            focus,
            name,
            output: dir,
        } => {
            let dir = dir.unwrap_or(directory);
            capture(driver, format, resolution, focus, name, dir, output).await
        }
        CameraCommand::Video {
            resolution,
            duration,
            name,
            output: dir,
        } => {
            let dir = dir.unwrap_or(directory);
            video(driver, resolution, duration, name, dir, output).await
        }
        CameraCommand::Stream { resolution, ip_out } => {
            stream(driver, resolution, ip_out, output).await
        }
        CameraCommand::Barcode => barcode(driver, output).await,
        CameraCommand::Qrcode => qrcode(driver, output).await,
    }
}

pub async fn template(driver: &mut CameraDriver, test_int: i64, output: Output) -> ClientResult<()> {
    let reply = driver.template_action(test_int).await?;
    print_reply(&reply, output)
}

pub async fn capture(
    driver: &mut CameraDriver,
    format: ImageFormat,
    resolution: Resolution,
    focus: Option<f64>,
    name: Option<String>,
    directory: PathBuf,
    output: Output,
) -> ClientResult<()> {
    let options = CaptureOptions {
        file_format: format,
        resolution,
        autofocus: focus.is_none(),
        focus_length: focus.unwrap_or(0.0),
        file_name: name,
        file_path: directory,
    };
    let reply = driver.capture(&options).await?;
    print_reply(&reply, output)
}

pub async fn video(
    driver: &mut CameraDriver,
    resolution: Resolution,
    seconds: f64,
    name: Option<String>,
    directory: PathBuf,
    output: Output,
) -> ClientResult<()> {
    let duration = Duration::try_from_secs_f64(seconds)
        .map_err(|_| ClientError::InvalidArgument(format!("invalid duration {}", seconds)))?;
    let options = VideoOptions {
        resolution,
        file_name: name,
        file_path: directory,
        duration: Some(duration),
    };
    let reply = driver.start_video(&options).await?;
    print_reply(&reply, output)?;

    if driver.is_recording() {
        info!("Recording until Ctrl-C");
        wait_for_interrupt().await?;
        let reply = driver.stop_video().await?;
        print_reply(&reply, output)?;
    }
    Ok(())
}

pub async fn stream(
    driver: &mut CameraDriver,
    resolution: Resolution,
    ip_out: Option<String>,
    output: Output,
) -> ClientResult<()> {
    let reply = driver.start_stream(resolution, ip_out).await?;
    print_reply(&reply, output)?;
    if reply.is_warning() {
        return Ok(());
    }

    info!("Streaming until Ctrl-C");
    wait_for_interrupt().await?;
    let reply = driver.stop_stream().await?;
    print_reply(&reply, output)
}

pub async fn barcode(driver: &mut CameraDriver, output: Output) -> ClientResult<()> {
    let reply = driver.read_barcode().await?;
    print_reply(&reply, output)
}

pub async fn qrcode(driver: &mut CameraDriver, output: Output) -> ClientResult<()> {
    let reply = driver.read_qrcode().await?;
    print_reply(&reply, output)
}

async fn wait_for_interrupt() -> ClientResult<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn print_reply(reply: &ResponseEnvelope, output: Output) -> ClientResult<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(reply)?),
        Output::Text => print!("{}", render_text(reply)),
    }
    Ok(())
}

fn render_text(reply: &ResponseEnvelope) -> String {
    let mut text = format!("{}\n", reply.status);
    for (key, value) in &reply.details {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        text.push_str(&format!("  {}: {}\n", key, value));
    }
    text
}
