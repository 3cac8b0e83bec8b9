//! # Long-Running Algorithms
//!
//! Exactly one algorithm runs on a rank once its lifecycle reaches `Running`. It is
//! selected from the integrator of the run input and driven through the
//! [`LongRunningAlgorithm`] trait.
//!
//! ## Architecture
//!
//! - **Force Evaluation** ([`forces`]) - Pair-list maintenance, the short-range and mesh
//!   contributions, and the exchange that gives every spatial rank the full force set
//! - **Dynamics** ([`dynamics`]) - Time stepping with the leap-frog, velocity Verlet,
//!   stochastic and Brownian schemes, checkpointing and trajectory output
//! - **Minimization** ([`minimize`]) - Steepest descent, conjugate gradients and L-BFGS
//! - **Normal Modes** ([`normal_modes`]) - Finite-difference Hessian and its spectrum
//! - **Particle Insertion** ([`insertion`]) - Widom test-particle insertion
//! - **Long-Range Service** ([`long_range`]) - The loop run by dedicated long-range ranks

pub(crate) mod dynamics;
pub(crate) mod forces;
pub(crate) mod insertion;
pub(crate) mod long_range;
pub(crate) mod minimize;
pub(crate) mod normal_modes;
pub(crate) mod replay;
pub(crate) mod sampling;

use super::accounting::{Accounting, Stage};
use super::comm::{Group, RankComm};
use super::config::RunRequest;
use super::context::{SharedRunContext, StopCondition};
use super::duty::RankAssignment;
use super::error::EngineError;
use super::progress::ProgressReporter;
use super::resources::ComputePool;
use super::restart;
use super::run_config::RunConfig;
use crate::core::io::checkpoint::Checkpoint;
use crate::core::io::run_input::RunInput;
use crate::core::models::history::{EnergyHistory, ObservablesHistory};
use crate::core::models::parameters::IntegratorKind;
use crate::core::models::state::RunState;
use crate::core::physics::PhysicsFactory;
use std::cell::RefCell;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub use dynamics::Dynamics;
pub use insertion::InsertionSampler;
pub use minimize::Minimizer;
pub use normal_modes::NormalModes;

/// Everything a rank needs while it runs its algorithm.
pub struct RunContext<'a> {
    pub comm: &'a RankComm,
    /// The spatial ranks, rooted at the coordinator. `None` on long-range-only ranks.
    pub spatial: Option<&'a Group>,
    pub assignment: &'a RankAssignment,
    pub config: &'a RunConfig,
    pub input: &'a RunInput,
    pub request: &'a RunRequest,
    pub shared: &'a SharedRunContext,
    pub pool: &'a ComputePool,
    pub physics: &'a dyn PhysicsFactory,
    /// Events are only delivered on the coordinator.
    pub reporter: &'a ProgressReporter<'a>,
    pub accounting: RefCell<Accounting>,
    /// Whether the run continues from a checkpoint.
    pub resumed: bool,
}

impl RunContext<'_> {
    pub fn is_coordinator(&self) -> bool {
        self.comm.is_coordinator()
    }

    pub(crate) fn spatial_group(&self) -> Result<&Group, EngineError> {
        self.spatial.ok_or_else(|| {
            EngineError::Internal(format!(
                "rank {} has no spatial duty but runs a spatial algorithm",
                self.comm.rank()
            ))
        })
    }

    /// Writes a checkpoint of `state` from the coordinator.
    pub(crate) fn write_checkpoint(
        &self,
        state: &RunState,
        history: &ObservablesHistory,
    ) -> Result<(), EngineError> {
        if !self.is_coordinator() {
            return Ok(());
        }
        let start = Instant::now();
        let checkpoint = Checkpoint {
            program_version: env!("CARGO_PKG_VERSION").to_string(),
            integrator: self.config.integrator,
            step: state.step,
            time: state.time,
            decomposition: restart::hints_for(&self.config.ranks),
            box_matrix: state.box_matrix,
            positions: state.positions.clone(),
            velocities: state.velocities.clone(),
            thermostat_xi: state.thermostat_xi,
            history: history.clone(),
        };
        checkpoint.write(&self.request.checkpoint_output)?;
        self.accounting
            .borrow_mut()
            .add(Stage::Output, start.elapsed());
        Ok(())
    }
}

/// An algorithm that owns the rank between `Running` and `Finalizing`.
pub trait LongRunningAlgorithm {
    fn name(&self) -> &'static str;

    fn run(
        &mut self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        history: &mut ObservablesHistory,
    ) -> Result<StopCondition, EngineError>;
}

/// The algorithm selected by the run input.
#[derive(Debug)]
pub enum Integrator {
    Dynamics(Dynamics),
    Minimizer(Minimizer),
    NormalModes(NormalModes),
    InsertionSampler(InsertionSampler),
}

impl Integrator {
    pub fn select(kind: IntegratorKind) -> Self {
        match kind {
            IntegratorKind::Md
            | IntegratorKind::MdVv
            | IntegratorKind::MdVvAvek
            | IntegratorKind::Sd
            | IntegratorKind::Bd => Self::Dynamics(Dynamics::new(kind)),
            IntegratorKind::Steep => Self::Minimizer(Minimizer::Steepest),
            IntegratorKind::Cg => Self::Minimizer(Minimizer::ConjugateGradient),
            IntegratorKind::LBfgs => Self::Minimizer(Minimizer::Lbfgs),
            IntegratorKind::Nm => Self::NormalModes(NormalModes),
            IntegratorKind::Tpi => Self::InsertionSampler(InsertionSampler::new(false)),
            IntegratorKind::Tpic => Self::InsertionSampler(InsertionSampler::new(true)),
        }
    }
}

impl LongRunningAlgorithm for Integrator {
    fn name(&self) -> &'static str {
        match self {
            Self::Dynamics(a) => a.name(),
            Self::Minimizer(a) => a.name(),
            Self::NormalModes(a) => a.name(),
            Self::InsertionSampler(a) => a.name(),
        }
    }

    fn run(
        &mut self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        history: &mut ObservablesHistory,
    ) -> Result<StopCondition, EngineError> {
        match self {
            Self::Dynamics(a) => a.run(ctx, state, history),
            Self::Minimizer(a) => a.run(ctx, state, history),
            Self::NormalModes(a) => a.run(ctx, state, history),
            Self::InsertionSampler(a) => a.run(ctx, state, history),
        }
    }
}

/// Starts the energy history over when it holds other terms than `terms`.
pub(crate) fn prepare_history(history: &mut ObservablesHistory, terms: &[&str]) {
    if history.energy.term_names != terms {
        if history.energy.samples > 0 {
            warn!(
                terms = ?history.energy.term_names,
                "The energy history holds other terms; starting new averages."
            );
        }
        history.energy = EnergyHistory::with_terms(terms);
    }
}

/// Decisions the coordinator takes between steps and shares with all spatial ranks, so
/// that every rank acts on the same step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepSignals {
    pub stop: StopCondition,
    pub checkpoint: bool,
    pub reset_counters: bool,
}

impl StepSignals {
    /// Broadcasts the coordinator's signals over the spatial group.
    pub(crate) fn exchange(
        ctx: &RunContext<'_>,
        local: Option<StepSignals>,
    ) -> Result<StepSignals, EngineError> {
        let group = ctx.spatial_group()?;
        let start = Instant::now();
        let local = if ctx.comm.rank() == group.root() {
            Some(local.unwrap_or_default())
        } else {
            None
        };
        let signals = ctx.comm.broadcast(group, local)?;
        ctx.accounting
            .borrow_mut()
            .add(Stage::Communication, start.elapsed());
        Ok(signals)
    }
}

/// Samples the stop signal, the wall-time budget and the checkpoint timer on the
/// coordinator.
#[derive(Debug)]
pub(crate) struct Signaller {
    started: Instant,
    last_checkpoint: Instant,
    max_runtime: Option<Duration>,
    checkpoint_period: Option<Duration>,
    reset_at: Option<i64>,
    budget_exhausted: bool,
}

/// Fraction of the wall-time budget after which the run stops.
const MAX_HOURS_FRACTION: f64 = 0.99;

impl Signaller {
    pub(crate) fn new(request: &RunRequest) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_checkpoint: now,
            max_runtime: request
                .max_hours
                .map(|h| Duration::from_secs_f64(h * 3600.0 * MAX_HOURS_FRACTION)),
            checkpoint_period: (request.checkpoint_period_minutes >= 0.0)
                .then(|| Duration::from_secs_f64(request.checkpoint_period_minutes * 60.0)),
            reset_at: request.reset_counters_at,
            budget_exhausted: false,
        }
    }

    /// Signals for `step`. A stop at the next list update only takes effect on a list
    /// step, as do periodic checkpoints.
    pub(crate) fn poll(
        &mut self,
        ctx: &RunContext<'_>,
        step: i64,
        list_step: bool,
    ) -> StepSignals {
        if let Some(limit) = self.max_runtime {
            if !self.budget_exhausted && self.started.elapsed() >= limit {
                self.budget_exhausted = true;
                warn!(
                    step,
                    max_hours = ctx.request.max_hours.unwrap_or_default(),
                    "Reached the wall-time budget; stopping at the next list update."
                );
                ctx.shared.stop.request(StopCondition::NextListUpdate);
            }
        }
        let stop = match ctx.shared.stop.current() {
            StopCondition::NextListUpdate if !list_step => StopCondition::None,
            other => other,
        };
        let checkpoint = list_step
            && self
                .checkpoint_period
                .is_some_and(|period| self.last_checkpoint.elapsed() >= period);
        if checkpoint {
            self.last_checkpoint = Instant::now();
        }
        if stop != StopCondition::None {
            info!(step, condition = %stop, "Stopping the run.");
        }
        StepSignals {
            stop,
            checkpoint,
            reset_counters: self.reset_at == Some(step),
        }
    }
}
