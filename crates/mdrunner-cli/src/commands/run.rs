use crate::cli::RunArgs;
use crate::config::PartialRunConfig;
use crate::error::{CliError, Result};
use crate::ui::{CliProgressHandler, UiEvent};
use mdrunner::core::hardware::SystemProbe;
use mdrunner::core::physics::ReferencePhysics;
use mdrunner::engine::context::{SharedRunContext, StopCondition};
use mdrunner::engine::progress::ProgressReporter;
use mdrunner::workflows;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{info, warn};

/// Runs the simulation and returns the process exit code.
pub async fn run(
    args: RunArgs,
    threads: Option<usize>,
    ui_sender: mpsc::Sender<UiEvent>,
) -> Result<i32> {
    let partial_config = match &args.config {
        Some(path) => PartialRunConfig::from_file(path)?,
        None => PartialRunConfig::default(),
    };
    info!("Merging configuration from file and CLI arguments...");
    let request = partial_config.merge_with_cli(&args, threads)?;

    let shared = Arc::new(SharedRunContext::new());
    let interrupts = task::spawn(escalate_on_interrupt(shared.clone(), ui_sender.clone()));

    let progress_handler = CliProgressHandler::new(ui_sender);
    println!("Starting the run of {}...", request.input_path.display());
    info!("Invoking the core mdrun workflow...");
    let outcome = task::spawn_blocking(move || {
        let reporter = ProgressReporter::with_callback(progress_handler.get_callback());
        workflows::mdrun::run(
            &request,
            &SystemProbe::default(),
            &ReferencePhysics,
            &shared,
            &reporter,
        )
    })
    .await
    .map_err(|e| CliError::Other(anyhow::anyhow!("The run task failed: {}", e)))?;
    interrupts.abort();
    let summary = outcome?;

    let accounting = &summary.accounting;
    match summary.stop {
        StopCondition::None => println!(
            "✓ Run finished at step {} on {} rank(s).",
            summary.final_step,
            summary.ranks.len()
        ),
        condition => println!("Run stopped at step {} ({}).", summary.final_step, condition),
    }
    println!(
        "  Wall time {:.2} s for {} step(s)",
        accounting.wall.as_secs_f64(),
        accounting.steps
    );
    if let Some(ns_per_day) = accounting.ns_per_day {
        println!("  Performance {:.3} ns/day", ns_per_day);
    }
    Ok(summary.exit_code())
}

/// Each Ctrl-C makes the stop request more urgent: next list update, next step, abort.
async fn escalate_on_interrupt(
    shared: Arc<SharedRunContext>,
    ui_sender: mpsc::Sender<UiEvent>,
) {
    while tokio::signal::ctrl_c().await.is_ok() {
        let condition = shared.stop.escalate();
        warn!(condition = %condition, "Received an interrupt.");
        let _ = ui_sender.try_send(UiEvent::Log(format!(
            "Interrupt received: {}. Press Ctrl-C again to stop sooner.",
            condition
        )));
        if condition == StopCondition::Abort {
            break;
        }
    }
}
