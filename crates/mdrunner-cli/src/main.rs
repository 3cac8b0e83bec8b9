mod cli;
mod commands;
mod config;
mod error;
mod logging;
mod ui;

use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};
use crate::ui::ProgressDisplay;
use clap::Parser;
use tokio::task;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    match run_app().await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            eprintln!("\n❌ Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run_app() -> Result<i32> {
    let (display, ui_sender, shutdown_sender) = ProgressDisplay::new();
    let ui_handle = task::spawn(display.run());

    let cli = Cli::parse();
    logging::setup_logging(cli.verbose, cli.quiet, cli.log_file.as_deref())?;

    let (panic_hook, eyre_hook) = color_eyre::config::HookBuilder::default().into_hooks();
    eyre_hook.install().map_err(|e| CliError::Other(e.into()))?;
    std::panic::set_hook(Box::new(move |pi| {
        error!("{}", panic_hook.panic_report(pi));
    }));

    let command_result = async move {
        info!("🚀 mdrunner CLI v{} starting up.", env!("CARGO_PKG_VERSION"));
        debug!("Full CLI arguments parsed: {:?}", &cli);

        match cli.command {
            Commands::Run(args) => {
                info!("Dispatching to 'run' command.");
                commands::run::run(args, cli.threads, ui_sender).await
            }
            Commands::Prepare(args) => {
                info!("Dispatching to 'prepare' command.");
                commands::prepare::run(args, ui_sender).await.map(|_| 0)
            }
            Commands::Dump(args) => {
                info!("Dispatching to 'dump' command.");
                commands::dump::run(args).await.map(|_| 0)
            }
        }
    }
    .await;

    match &command_result {
        Ok(0) => info!("✅ Command completed successfully."),
        Ok(code) => warn!(code, "Command finished early."),
        Err(e) => error!("❌ Command failed: {}", e),
    }

    if shutdown_sender.send(true).is_err() {
        warn!("UI manager may have already exited before shutdown signal.");
    }

    ui_handle
        .await
        .map_err(|e| CliError::Other(anyhow::anyhow!("UI manager task failed: {}", e)))?;

    command_result
}
