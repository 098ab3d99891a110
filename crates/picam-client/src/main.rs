//! picam CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use picam_client::cli::{Cli, Command, ConfigAction};
use picam_client::commands::camera::{self, Output};
use picam_client::config::ClientConfig;
use picam_client::driver::CameraDriver;
use picam_client::error::ClientResult;
use picam_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(TracingConfig::client().with_debug(cli.debug)) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let mut config = match cli.config {
        Some(ref path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };
    if cli.debug {
        config.debug = true;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.command_port {
        config.server.command_port = port;
    }
    if let Some(port) = cli.data_port {
        config.server.data_port = port;
    }

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Dump => picam_client::commands::config::dump(&config),
            ConfigAction::Path => picam_client::commands::config::path(),
        },
        Command::Camera(command) => {
            let output = if cli.json { Output::Json } else { Output::Text };
            let directory = config.output.directory.clone();
            let mut driver = CameraDriver::connect(&config).await?;
            let result = camera::run(&mut driver, command, directory, output).await;
            driver.close();
            result
        }
    }
}
