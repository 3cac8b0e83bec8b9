use crate::core::hardware::HardwareProbe;
use crate::core::physics::PhysicsFactory;
use crate::engine::accounting::AccountingSummary;
use crate::engine::bootstrap::{self, RankEnvironment, RankOutcome};
use crate::engine::comm::RankComm;
use crate::engine::config::RunRequest;
use crate::engine::context::{SharedRunContext, StopCondition};
use crate::engine::error::EngineError;
use crate::engine::progress::ProgressReporter;
use crate::engine::run_config::RunConfig;
use tracing::{info, instrument};

/// The result of a run as seen from the coordinating rank.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stop: StopCondition,
    pub final_step: i64,
    pub config: RunConfig,
    pub accounting: AccountingSummary,
    /// Every rank's outcome, in rank order.
    pub ranks: Vec<RankOutcome>,
}

impl RunSummary {
    /// 0 after a clean finish, otherwise the code of the stop condition.
    pub fn exit_code(&self) -> i32 {
        self.stop.exit_code()
    }
}

/// Runs a simulation, spawning the ranks it needs as threads of this process.
///
/// `shared` outlives the run so that the caller can raise the stop signal while the
/// ranks are working.
#[instrument(skip_all, name = "mdrun_workflow")]
pub fn run(
    request: &RunRequest,
    probe: &dyn HardwareProbe,
    physics: &dyn PhysicsFactory,
    shared: &SharedRunContext,
    reporter: &ProgressReporter,
) -> Result<RunSummary, EngineError> {
    info!(input = %request.input_path.display(), "Starting the run.");
    let env = RankEnvironment {
        probe,
        physics,
        shared,
    };
    let outcomes = bootstrap::launch(request, &env, reporter)?;
    let summary = summarize(outcomes)?;
    info!(
        step = summary.final_step,
        condition = %summary.stop,
        ranks = summary.ranks.len(),
        "Run complete."
    );
    Ok(summary)
}

/// Runs one rank of a rank set provided by an external launcher. Every rank of the set
/// calls this with its own endpoint; nothing is spawned.
#[instrument(skip_all, name = "mdrun_external", fields(rank = comm.rank()))]
pub fn run_external(
    comm: &RankComm,
    request: &RunRequest,
    probe: &dyn HardwareProbe,
    physics: &dyn PhysicsFactory,
    shared: &SharedRunContext,
    reporter: &ProgressReporter,
) -> Result<RankOutcome, EngineError> {
    let env = RankEnvironment {
        probe,
        physics,
        shared,
    };
    bootstrap::launch_rank(comm, request, &env, reporter, None)
}

fn summarize(mut outcomes: Vec<RankOutcome>) -> Result<RunSummary, EngineError> {
    outcomes.sort_by_key(|o| o.rank);
    let coordinator = outcomes
        .first()
        .filter(|o| o.rank == 0)
        .ok_or_else(|| EngineError::Internal("the coordinator reported no outcome".to_string()))?;
    Ok(RunSummary {
        stop: coordinator.stop,
        final_step: coordinator.final_step,
        config: coordinator.config.clone(),
        accounting: coordinator.accounting.clone(),
        ranks: outcomes,
    })
}
