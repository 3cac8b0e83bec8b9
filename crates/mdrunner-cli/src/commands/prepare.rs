use crate::cli::PrepareArgs;
use crate::error::Result;
use crate::ui::{CliProgressHandler, UiEvent};
use mdrunner::engine::progress::ProgressReporter;
use mdrunner::workflows;
use tokio::sync::mpsc;
use tracing::info;

pub async fn run(args: PrepareArgs, ui_sender: mpsc::Sender<UiEvent>) -> Result<()> {
    let progress_handler = CliProgressHandler::new(ui_sender);
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    info!("Building the run input from {:?}", &args.description);
    let prepared = tokio::task::block_in_place(|| {
        workflows::prepare::run(&args.description, &args.output, &reporter)
    })?;

    println!(
        "✓ Wrote '{}' ({} particles, integrator {}, volume {:.3} nm³) to: {}",
        prepared.name,
        prepared.particles,
        prepared.integrator,
        prepared.volume,
        prepared.path.display()
    );
    Ok(())
}
