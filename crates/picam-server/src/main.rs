//! picam-server entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};

use picam_core::{TracingConfig, TracingOutputFormat, init_tracing};
use picam_server::{CameraServer, ServerConfig, ServerResult, Shutdown, SimulatedCamera};

/// Remote camera server: command channel, data channel and UDP streaming.
#[derive(Debug, Parser)]
#[command(name = "picam-server", version, about)]
struct Args {
    /// Path to server.toml (defaults to the user config directory).
    #[arg(long, env = "PICAM_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind the command and data listeners to.
    #[arg(long)]
    bind: Option<String>,

    /// Command channel port.
    #[arg(long)]
    command_port: Option<u16>,

    /// Data channel port.
    #[arg(long)]
    data_port: Option<u16>,

    /// UDP port on the client that live streams are sent to.
    #[arg(long)]
    stream_port: Option<u16>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut tracing = TracingConfig::server().with_debug(args.debug);
    if args.json_logs {
        tracing = tracing.with_format(TracingOutputFormat::Json);
    }
    if let Err(e) = init_tracing(tracing) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> ServerResult<()> {
    let mut config = match args.config {
        Some(ref path) => ServerConfig::load_from(path)?,
        None => ServerConfig::load()?,
    };
    if let Some(bind) = args.bind {
        config.bind_host = bind;
    }
    if let Some(port) = args.command_port {
        config.command_port = port;
    }
    if let Some(port) = args.data_port {
        config.data_port = port;
    }
    if let Some(port) = args.stream_port {
        config.stream_port = port;
    }

    warn!("No hardware camera backend compiled in; serving the simulated camera");
    let server = CameraServer::bind(config, SimulatedCamera::new()).await?;
    info!(
        camera = server.device().camera_name(),
        command = %server.command_addr()?,
        data = %server.data_addr()?,
        "Camera server ready"
    );

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();
    server.run_until_shutdown(shutdown.wait()).await?;

    info!("Server stopped");
    Ok(())
}
