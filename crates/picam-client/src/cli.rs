//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use picam_core::{ImageFormat, Resolution};

/// picam - drive a remote camera
#[derive(Debug, Parser)]
#[command(name = "picam")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "PICAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Camera server host
    #[arg(long, env = "PICAM_HOST")]
    pub host: Option<String>,

    /// Command channel port
    #[arg(long)]
    pub command_port: Option<u16>,

    /// Data channel port
    #[arg(long)]
    pub data_port: Option<u16>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    #[command(flatten)]
    Camera(CameraCommand),

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Commands that talk to the camera server.
#[derive(Debug, Subcommand)]
pub enum CameraCommand {
    /// Round-trip a number through the server
    Template {
        #[arg(default_value_t = 0)]
        test_int: i64,
    },

    /// Capture a still picture and save it
    Capture {
        /// jpeg, png, bmp or gif
        #[arg(long, default_value = "jpeg", value_parser = parse_format)]
        format: ImageFormat,

        /// WIDTHxHEIGHT
        #[arg(long, default_value = "4608x2592", value_parser = parse_resolution)]
        resolution: Resolution,

        /// Use a fixed lens position instead of autofocus
        #[arg(long)]
        focus: Option<f64>,

        /// File name without extension (defaults to the server's name)
        #[arg(long)]
        name: Option<String>,

        /// Output directory
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Record an H.264 video
    Video {
        /// WIDTHxHEIGHT
        #[arg(long, default_value = "1280x720", value_parser = parse_resolution)]
        resolution: Resolution,

        /// Seconds to record; 0 records until Ctrl-C
        #[arg(long, default_value_t = 5.0)]
        duration: f64,

        /// File name without extension (defaults to the server's name)
        #[arg(long)]
        name: Option<String>,

        /// Output directory
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Stream MPEG-TS over UDP until Ctrl-C
    Stream {
        /// WIDTHxHEIGHT
        #[arg(long, default_value = "1280x720", value_parser = parse_resolution)]
        resolution: Resolution,

        /// Send the stream to this host instead of back to this machine
        #[arg(long = "ip-out")]
        ip_out: Option<String>,
    },

    /// Read a barcode
    Barcode,

    /// Read a QR code
    Qrcode,
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Show configuration file path
    Path,
}

fn parse_format(s: &str) -> Result<ImageFormat, String> {
    s.parse().map_err(|e: picam_core::MediaError| e.to_string())
}

/// Parses `WIDTHxHEIGHT`.
pub fn parse_resolution(s: &str) -> Result<Resolution, String> {
    let (width, height) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
    let width = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width '{}'", width))?;
    let height = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height '{}'", height))?;
    Ok(Resolution::new(width, height))
}
