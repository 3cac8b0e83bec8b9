use super::forces::{Distribution, Evaluation, ForceEvaluator};
use super::{LongRunningAlgorithm, RunContext, Signaller, StepSignals, prepare_history};
use crate::core::models::history::ObservablesHistory;
use crate::core::models::state::RunState;
use crate::engine::context::StopCondition;
use crate::engine::error::EngineError;
use crate::engine::progress::Progress;
use nalgebra::Vector3;
use std::collections::VecDeque;
use tracing::{debug, info, instrument, warn};

const MINIMIZATION_TERMS: [&str; 2] = ["Potential", "Max Force"];

/// Displacements below this are treated as no progress (nm).
const MIN_STEP: f64 = 1e-12;
const MAX_BACKTRACKS: usize = 20;
const LBFGS_MEMORY: usize = 5;
const STEP_GROWTH: f64 = 1.2;

/// Energy minimization schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Minimizer {
    Steepest,
    ConjugateGradient,
    Lbfgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Converged,
    StepLimit,
    NoProgress,
    Stopped(StopCondition),
}

impl LongRunningAlgorithm for Minimizer {
    fn name(&self) -> &'static str {
        "minimization"
    }

    #[instrument(skip_all, name = "minimization", fields(scheme = ?self))]
    fn run(
        &mut self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        history: &mut ObservablesHistory,
    ) -> Result<StopCondition, EngineError> {
        prepare_history(history, &MINIMIZATION_TERMS);
        let params = &ctx.input.params;
        info!(
            emtol = params.emtol,
            emstep = params.emstep,
            last_step = ?ctx.config.last_step,
            "Starting energy minimization."
        );
        ctx.reporter.report(Progress::TaskStart {
            total_steps: ctx
                .config
                .last_step
                .map(|last| (last - state.step).max(0) as u64)
                .unwrap_or(0),
        });

        let mut descent = Descent::start(ctx, state)?;
        let outcome = match self {
            Self::Steepest => steepest_descent(ctx, state, history, &mut descent)?,
            Self::ConjugateGradient => conjugate_gradient(ctx, state, history, &mut descent)?,
            Self::Lbfgs => lbfgs(ctx, state, history, &mut descent)?,
        };
        descent.forces.finish(ctx)?;
        ctx.reporter.report(Progress::TaskFinish);

        let (fmax, at) = descent.current.max_force();
        match outcome {
            Outcome::Converged => info!(
                steps = state.step - ctx.config.start_step,
                evaluations = descent.evaluations,
                potential = descent.current.potential,
                fmax,
                particle = at,
                "Converged to Fmax < {}.",
                params.emtol
            ),
            Outcome::StepLimit => warn!(
                potential = descent.current.potential,
                fmax,
                particle = at,
                "Reached the step limit before converging to Fmax < {}.",
                params.emtol
            ),
            Outcome::NoProgress => warn!(
                potential = descent.current.potential,
                fmax,
                particle = at,
                "Stopped: the energy no longer decreases at machine precision before reaching Fmax < {}.",
                params.emtol
            ),
            Outcome::Stopped(condition) => info!(
                condition = %condition,
                potential = descent.current.potential,
                fmax,
                "Minimization stopped on request."
            ),
        }

        let stop = match outcome {
            Outcome::Stopped(condition) => condition,
            _ => StopCondition::None,
        };
        if stop != StopCondition::Abort {
            ctx.write_checkpoint(state, history)?;
        }
        Ok(stop)
    }
}

/// The current point of a minimization and the machinery to evaluate trial points.
struct Descent {
    forces: ForceEvaluator,
    signaller: Option<Signaller>,
    current: Evaluation,
    evaluations: u64,
}

impl Descent {
    fn start(ctx: &RunContext<'_>, state: &RunState) -> Result<Self, EngineError> {
        let mut forces = ForceEvaluator::new(ctx, Distribution::Collective)?;
        let current =
            forces.evaluate(ctx, &state.box_matrix, &state.positions, state.step, true)?;
        Ok(Self {
            forces,
            signaller: ctx.is_coordinator().then(|| Signaller::new(ctx.request)),
            current,
            evaluations: 1,
        })
    }

    fn trial(
        &mut self,
        ctx: &RunContext<'_>,
        state: &RunState,
        positions: &[Vector3<f64>],
    ) -> Result<Evaluation, EngineError> {
        self.evaluations += 1;
        self.forces
            .evaluate(ctx, &state.box_matrix, positions, state.step, true)
    }

    /// Records the current point and decides whether another step is taken.
    fn check(
        &mut self,
        ctx: &RunContext<'_>,
        state: &RunState,
        history: &mut ObservablesHistory,
    ) -> Result<Option<Outcome>, EngineError> {
        let (fmax, _) = self.current.max_force();
        history.energy.accumulate(&[self.current.potential, fmax]);
        debug!(step = state.step, potential = self.current.potential, fmax, "Minimization step.");
        if fmax < ctx.input.params.emtol || fmax == 0.0 {
            return Ok(Some(Outcome::Converged));
        }
        if ctx.config.last_step.is_some_and(|last| state.step >= last) {
            return Ok(Some(Outcome::StepLimit));
        }
        let local = self.signaller.as_mut().map(|s| s.poll(ctx, state.step, true));
        let signals = StepSignals::exchange(ctx, local)?;
        if signals.reset_counters {
            ctx.accounting.borrow_mut().reset(state.step);
        }
        if signals.stop != StopCondition::None {
            return Ok(Some(Outcome::Stopped(signals.stop)));
        }
        if signals.checkpoint {
            ctx.write_checkpoint(state, history)?;
        }
        Ok(None)
    }

    fn advance(&self, ctx: &RunContext<'_>, state: &mut RunState) {
        state.step += 1;
        ctx.accounting.borrow_mut().count_step();
        ctx.reporter.report(Progress::TaskIncrement { steps: 1 });
    }

    /// Moves along `direction`, halving the step until the energy decreases. Returns the
    /// accepted positions, their evaluation and the scale that was used.
    fn line_search(
        &mut self,
        ctx: &RunContext<'_>,
        state: &RunState,
        direction: &[Vector3<f64>],
        mut scale: f64,
    ) -> Result<Option<(Vec<Vector3<f64>>, Evaluation, f64)>, EngineError> {
        let longest = max_norm(direction);
        for _ in 0..MAX_BACKTRACKS {
            if scale * longest < MIN_STEP {
                break;
            }
            let positions = displaced(&state.positions, direction, scale);
            let trial = self.trial(ctx, state, &positions)?;
            if trial.potential < self.current.potential {
                return Ok(Some((positions, trial, scale)));
            }
            scale *= 0.5;
        }
        Ok(None)
    }
}

fn steepest_descent(
    ctx: &RunContext<'_>,
    state: &mut RunState,
    history: &mut ObservablesHistory,
    descent: &mut Descent,
) -> Result<Outcome, EngineError> {
    let mut ustep = ctx.input.params.emstep;
    loop {
        if let Some(outcome) = descent.check(ctx, state, history)? {
            return Ok(outcome);
        }
        let (fmax, _) = descent.current.max_force();
        let positions = displaced(&state.positions, &descent.current.forces, ustep / fmax);
        let trial = descent.trial(ctx, state, &positions)?;
        if trial.potential < descent.current.potential {
            state.positions = positions;
            descent.current = trial;
            ustep *= STEP_GROWTH;
        } else {
            ustep *= 0.5;
        }
        descent.advance(ctx, state);
        if ustep < MIN_STEP {
            return Ok(Outcome::NoProgress);
        }
    }
}

fn conjugate_gradient(
    ctx: &RunContext<'_>,
    state: &mut RunState,
    history: &mut ObservablesHistory,
    descent: &mut Descent,
) -> Result<Outcome, EngineError> {
    let mut ustep = ctx.input.params.emstep;
    let mut direction = descent.current.forces.clone();
    loop {
        if let Some(outcome) = descent.check(ctx, state, history)? {
            return Ok(outcome);
        }
        if dot(&direction, &descent.current.forces) <= 0.0 {
            direction = descent.current.forces.clone();
        }
        let longest = max_norm(&direction);
        let accepted = descent.line_search(ctx, state, &direction, ustep / longest)?;
        descent.advance(ctx, state);
        let Some((positions, trial, scale)) = accepted else {
            return Ok(Outcome::NoProgress);
        };
        let beta = polak_ribiere(&trial.forces, &descent.current.forces);
        direction = trial
            .forces
            .iter()
            .zip(&direction)
            .map(|(f, d)| f + d * beta)
            .collect();
        ustep = scale * longest * STEP_GROWTH;
        state.positions = positions;
        descent.current = trial;
    }
}

/// Curvature pairs of the limited-memory update: displacement, gradient change and
/// their inverse product.
type CurvaturePair = (Vec<Vector3<f64>>, Vec<Vector3<f64>>, f64);

fn lbfgs(
    ctx: &RunContext<'_>,
    state: &mut RunState,
    history: &mut ObservablesHistory,
    descent: &mut Descent,
) -> Result<Outcome, EngineError> {
    let emstep = ctx.input.params.emstep;
    let mut memory: VecDeque<CurvaturePair> = VecDeque::with_capacity(LBFGS_MEMORY);
    loop {
        if let Some(outcome) = descent.check(ctx, state, history)? {
            return Ok(outcome);
        }
        let mut direction = two_loop(&memory, &descent.current.forces);
        if dot(&direction, &descent.current.forces) <= 0.0 {
            memory.clear();
            direction = descent.current.forces.clone();
        }
        let longest = max_norm(&direction);
        let scale = if longest > emstep { emstep / longest } else { 1.0 };
        let accepted = descent.line_search(ctx, state, &direction, scale)?;
        descent.advance(ctx, state);
        let Some((positions, trial, _)) = accepted else {
            if memory.is_empty() {
                return Ok(Outcome::NoProgress);
            }
            debug!(step = state.step, "Line search failed; resetting the curvature memory.");
            memory.clear();
            continue;
        };
        let s: Vec<Vector3<f64>> = positions
            .iter()
            .zip(&state.positions)
            .map(|(new, old)| new - old)
            .collect();
        // Gradients are negative forces.
        let y: Vec<Vector3<f64>> = descent
            .current
            .forces
            .iter()
            .zip(&trial.forces)
            .map(|(old, new)| old - new)
            .collect();
        let sy = dot(&s, &y);
        if sy > f64::EPSILON {
            if memory.len() == LBFGS_MEMORY {
                memory.pop_front();
            }
            memory.push_back((s, y, 1.0 / sy));
        }
        state.positions = positions;
        descent.current = trial;
    }
}

/// Applies the inverse Hessian estimate to the forces with the two-loop recursion,
/// giving a descent direction.
fn two_loop(memory: &VecDeque<CurvaturePair>, forces: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
    let mut q: Vec<Vector3<f64>> = forces.iter().map(|f| -f).collect();
    let mut alphas = Vec::with_capacity(memory.len());
    for (s, y, rho) in memory.iter().rev() {
        let alpha = rho * dot(s, &q);
        for (qi, yi) in q.iter_mut().zip(y) {
            *qi -= yi * alpha;
        }
        alphas.push(alpha);
    }
    if let Some((s, y, _)) = memory.back() {
        let gamma = dot(s, y) / dot(y, y);
        for qi in q.iter_mut() {
            *qi *= gamma;
        }
    }
    for ((s, y, rho), alpha) in memory.iter().zip(alphas.into_iter().rev()) {
        let beta = rho * dot(y, &q);
        for (qi, si) in q.iter_mut().zip(s) {
            *qi += si * (alpha - beta);
        }
    }
    q.iter().map(|r| -r).collect()
}

fn polak_ribiere(new: &[Vector3<f64>], old: &[Vector3<f64>]) -> f64 {
    let denominator = dot(old, old);
    if denominator == 0.0 {
        return 0.0;
    }
    let numerator: f64 = new.iter().zip(old).map(|(n, o)| n.dot(&(n - o))).sum();
    (numerator / denominator).max(0.0)
}

fn displaced(positions: &[Vector3<f64>], direction: &[Vector3<f64>], scale: f64) -> Vec<Vector3<f64>> {
    positions
        .iter()
        .zip(direction)
        .map(|(x, d)| x + d * scale)
        .collect()
}

fn dot(a: &[Vector3<f64>], b: &[Vector3<f64>]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x.dot(y)).sum()
}

fn max_norm(vectors: &[Vector3<f64>]) -> f64 {
    vectors.iter().map(|v| v.norm()).fold(0.0, f64::max)
}
