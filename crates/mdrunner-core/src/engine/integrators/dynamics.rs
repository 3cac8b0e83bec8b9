use super::forces::{Distribution, Evaluation, ForceEvaluator};
use super::replay::FrameSource;
use super::sampling;
use super::{LongRunningAlgorithm, RunContext, Signaller, StepSignals, prepare_history};
use crate::core::io::trajectory::{Frame, TrajectoryWriter};
use crate::core::models::history::ObservablesHistory;
use crate::core::models::parameters::{InputParameters, IntegratorKind, Thermostat};
use crate::core::models::state::{BOLTZ, RunState};
use crate::engine::accounting::Stage;
use crate::engine::context::StopCondition;
use crate::engine::error::EngineError;
use crate::engine::progress::Progress;
use nalgebra::{Matrix3, Vector3};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument};

pub(crate) const ENERGY_TERMS: [&str; 4] = ["Potential", "Kinetic", "Total", "Temperature"];

const DEFAULT_TRAJECTORY: &str = "traj.trr";

/// Random stream of the stochastic integrators.
const STREAM_LANGEVIN: u64 = 1;
/// Random stream of the stochastic velocity rescaling thermostat.
const STREAM_THERMOSTAT: u64 = 2;

/// Time stepping for the dynamical integrators.
#[derive(Debug)]
pub struct Dynamics {
    kind: IntegratorKind,
    /// Velocity Verlet owes the particles the second half kick with the new forces.
    half_kick_pending: bool,
}

impl Dynamics {
    pub fn new(kind: IntegratorKind) -> Self {
        Self {
            kind,
            half_kick_pending: false,
        }
    }
}

impl LongRunningAlgorithm for Dynamics {
    fn name(&self) -> &'static str {
        "dynamics"
    }

    #[instrument(skip_all, name = "dynamics", fields(integrator = %self.kind))]
    fn run(
        &mut self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        history: &mut ObservablesHistory,
    ) -> Result<StopCondition, EngineError> {
        prepare_history(history, &ENERGY_TERMS);
        match &ctx.request.rerun {
            Some(path) => self.rerun(ctx, state, history, path),
            None => self.simulate(ctx, state, history),
        }
    }
}

impl Dynamics {
    fn simulate(
        &mut self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        history: &mut ObservablesHistory,
    ) -> Result<StopCondition, EngineError> {
        let params = &ctx.input.params;
        let masses = masses(ctx);
        let ndf = ctx.input.topology.degrees_of_freedom();
        let mut forces = ForceEvaluator::new(ctx, Distribution::Collective)?;
        let mut trajectory = open_trajectory(ctx)?;
        let mut signaller = ctx.is_coordinator().then(|| Signaller::new(ctx.request));

        let first_step = state.step;
        let total_steps = ctx
            .config
            .last_step
            .map(|last| (last - first_step).max(0) as u64)
            .unwrap_or(0);
        info!(
            first_step,
            last_step = ?ctx.config.last_step,
            nstlist = ctx.config.nstlist,
            rlist = ctx.config.rlist,
            dt = params.dt,
            "Starting dynamics."
        );
        ctx.reporter.report(Progress::TaskStart { total_steps });

        let mut stop = StopCondition::None;
        loop {
            let step = state.step;
            let list_step = ctx.config.is_list_step(step);
            if params.has_deform() {
                deform_box(ctx, state)?;
            }
            let evaluation =
                forces.evaluate(ctx, &state.box_matrix, &state.positions, step, list_step)?;

            if self.half_kick_pending {
                let start = Instant::now();
                kick(state, &evaluation.forces, &masses, 0.5 * params.dt);
                self.half_kick_pending = false;
                self.apply_thermostat(params, state, &masses, ndf);
                ctx.accounting.borrow_mut().add(Stage::Update, start.elapsed());
            }

            let is_last = ctx.config.last_step == Some(step);
            if is_last || is_multiple(step, params.nstcalcenergy) {
                record_energies(ctx, state, &evaluation, history, &masses, ndf);
            }
            if let Some(writer) = trajectory.as_mut() {
                if is_multiple(step, params.nstxout) {
                    let start = Instant::now();
                    writer.write_frame(&Frame {
                        step,
                        time: state.time,
                        box_matrix: state.box_matrix,
                        positions: state.positions.clone(),
                    })?;
                    ctx.accounting.borrow_mut().add(Stage::Output, start.elapsed());
                }
            }

            let local = signaller.as_mut().map(|s| s.poll(ctx, step, list_step));
            let signals = StepSignals::exchange(ctx, local)?;
            if signals.reset_counters {
                ctx.accounting.borrow_mut().reset(step);
            }
            if is_last {
                break;
            }
            if signals.stop != StopCondition::None {
                stop = signals.stop;
                break;
            }
            if signals.checkpoint && step > ctx.config.init_step {
                ctx.write_checkpoint(state, history)?;
            }

            let start = Instant::now();
            self.integrate(params, state, &evaluation, &masses, ndf);
            ctx.accounting.borrow_mut().add(Stage::Update, start.elapsed());
            ctx.accounting.borrow_mut().count_step();
            ctx.reporter.report(Progress::TaskIncrement { steps: 1 });
        }
        forces.finish(ctx)?;

        if let Some(writer) = trajectory {
            info!(frames = writer.frames_written(), "Closing trajectory.");
            writer.close()?;
        }
        ctx.reporter.report(Progress::TaskFinish);

        let final_checkpoint = stop != StopCondition::Abort
            && ctx.request.checkpoint_period_minutes >= 0.0
            && state.step > ctx.config.init_step;
        if final_checkpoint {
            ctx.write_checkpoint(state, history)?;
        }
        log_averages(ctx, history);
        info!(step = state.step, condition = %stop, "Dynamics finished.");
        Ok(stop)
    }

    /// Evaluates the energies of every frame of a trajectory without integrating.
    fn rerun(
        &mut self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        history: &mut ObservablesHistory,
        path: &Path,
    ) -> Result<StopCondition, EngineError> {
        let masses = masses(ctx);
        let ndf = ctx.input.topology.degrees_of_freedom();
        let mut forces = ForceEvaluator::new(ctx, Distribution::Collective)?;
        let mut source = FrameSource::open(ctx, path)?;
        info!(path = %path.display(), "Rerunning trajectory.");
        ctx.reporter.report(Progress::TaskStart { total_steps: 0 });

        let mut frames = 0u64;
        let mut stop = StopCondition::None;
        while let Some(frame) = source.next(ctx)? {
            state.step = frame.step;
            state.time = frame.time;
            state.box_matrix = frame.box_matrix;
            state.positions = frame.positions;

            let evaluation =
                forces.evaluate(ctx, &state.box_matrix, &state.positions, state.step, true)?;
            record_energies(ctx, state, &evaluation, history, &masses, ndf);
            frames += 1;
            ctx.accounting.borrow_mut().count_step();
            ctx.reporter.report(Progress::TaskIncrement { steps: 1 });

            let local = ctx
                .is_coordinator()
                .then(|| StepSignals {
                    stop: ctx.shared.stop.current(),
                    ..Default::default()
                });
            let signals = StepSignals::exchange(ctx, local)?;
            if signals.stop != StopCondition::None {
                stop = signals.stop;
                break;
            }
        }
        forces.finish(ctx)?;
        ctx.reporter.report(Progress::TaskFinish);
        log_averages(ctx, history);
        info!(frames, "Rerun finished.");
        Ok(stop)
    }

    fn integrate(
        &mut self,
        params: &InputParameters,
        state: &mut RunState,
        evaluation: &Evaluation,
        masses: &[f64],
        ndf: f64,
    ) {
        let dt = params.dt;
        let forces = &evaluation.forces;
        match self.kind {
            IntegratorKind::MdVv | IntegratorKind::MdVvAvek => {
                kick(state, forces, masses, 0.5 * dt);
                drift(state, dt);
                self.half_kick_pending = true;
            }
            IntegratorKind::Sd => {
                let mut rng = sampling::step_rng(params.seed, state.step, STREAM_LANGEVIN);
                let kt = BOLTZ * params.ref_t.max(0.0);
                let c = if params.tau_t > 0.0 { (-dt / params.tau_t).exp() } else { 0.0 };
                kick(state, forces, masses, dt);
                for (v, &m) in state.velocities.iter_mut().zip(masses) {
                    let sigma = ((1.0 - c * c) * kt / m).sqrt();
                    let noise = Vector3::new(
                        sampling::gaussian(&mut rng),
                        sampling::gaussian(&mut rng),
                        sampling::gaussian(&mut rng),
                    );
                    *v = *v * c + noise * sigma;
                }
                drift(state, dt);
            }
            IntegratorKind::Bd => {
                let mut rng = sampling::step_rng(params.seed, state.step, STREAM_LANGEVIN);
                let kt = BOLTZ * params.ref_t.max(0.0);
                let gamma = if params.tau_t > 0.0 { 1.0 / params.tau_t } else { 1.0 };
                for i in 0..state.positions.len() {
                    let friction = gamma * masses[i];
                    let sigma = (2.0 * kt * dt / friction).sqrt();
                    let noise = Vector3::new(
                        sampling::gaussian(&mut rng),
                        sampling::gaussian(&mut rng),
                        sampling::gaussian(&mut rng),
                    );
                    let dx = forces[i] * (dt / friction) + noise * sigma;
                    state.positions[i] += dx;
                    state.velocities[i] = dx / dt;
                }
            }
            _ => {
                kick(state, forces, masses, dt);
                self.apply_thermostat(params, state, masses, ndf);
                drift(state, dt);
            }
        }
        state.step += 1;
        state.time += dt;
    }

    /// Scales the velocities towards the reference temperature.
    fn apply_thermostat(
        &mut self,
        params: &InputParameters,
        state: &mut RunState,
        masses: &[f64],
        ndf: f64,
    ) {
        if params.thermostat == Thermostat::None || params.ref_t <= 0.0 {
            return;
        }
        let kinetic = state.kinetic_energy(|i| masses[i]);
        if kinetic <= 0.0 {
            return;
        }
        let dt = params.dt;
        let tau = params.tau_t;
        let temperature = 2.0 * kinetic / (ndf * BOLTZ);
        let lambda = match params.thermostat {
            Thermostat::None => 1.0,
            Thermostat::Berendsen => {
                let ratio = if tau > 0.0 { dt / tau } else { 1.0 };
                (1.0 + ratio * (params.ref_t / temperature - 1.0)).max(0.0).sqrt()
            }
            Thermostat::VRescale => {
                let mut rng = sampling::step_rng(params.seed, state.step, STREAM_THERMOSTAT);
                let target = 0.5 * ndf * BOLTZ * params.ref_t;
                let factor = if tau > 0.0 { (-dt / tau).exp() } else { 0.0 };
                let r1 = sampling::gaussian(&mut rng);
                let rest = sampling::chi_squared((ndf as usize).saturating_sub(1), &mut rng);
                let new_kinetic = kinetic
                    + (1.0 - factor) * (target * (r1 * r1 + rest) / ndf - kinetic)
                    + 2.0 * r1 * (kinetic * target / ndf * (1.0 - factor) * factor).sqrt();
                (new_kinetic.max(0.0) / kinetic).sqrt()
            }
            Thermostat::NoseHoover => {
                let tau2 = if tau > 0.0 { tau * tau } else { 1.0 };
                state.thermostat_xi += dt * (temperature / params.ref_t - 1.0) / tau2;
                (-state.thermostat_xi * dt).exp()
            }
        };
        for v in state.velocities.iter_mut() {
            *v *= lambda;
        }
    }
}

fn masses(ctx: &RunContext<'_>) -> Vec<f64> {
    let topology = &ctx.input.topology;
    (0..topology.particle_count()).map(|i| topology.mass(i)).collect()
}

fn is_multiple(step: i64, interval: i32) -> bool {
    interval > 0 && step % interval as i64 == 0
}

fn kick(state: &mut RunState, forces: &[Vector3<f64>], masses: &[f64], dt: f64) {
    for ((v, f), &m) in state.velocities.iter_mut().zip(forces).zip(masses) {
        *v += f * (dt / m);
    }
}

fn drift(state: &mut RunState, dt: f64) {
    for (x, v) in state.positions.iter_mut().zip(&state.velocities) {
        *x += v * dt;
    }
}

/// Sets the box for the current step from the deform reference and scales the
/// positions with it.
fn deform_box(ctx: &RunContext<'_>, state: &mut RunState) -> Result<(), EngineError> {
    let reference = ctx.shared.deform_reference().ok_or_else(|| {
        EngineError::Internal("the deform reference box was never recorded".to_string())
    })?;
    let d = &ctx.input.params.deform;
    let rate = Matrix3::new(
        d[0][0], d[0][1], d[0][2], d[1][0], d[1][1], d[1][2], d[2][0], d[2][1], d[2][2],
    );
    let elapsed = (state.step - reference.init_step) as f64 * ctx.input.params.dt;
    let new_box = reference.box_matrix + rate * elapsed;
    if new_box == state.box_matrix {
        return Ok(());
    }
    let inverse = state.box_matrix.try_inverse().ok_or_else(|| {
        EngineError::Configuration("the box became singular during deformation".to_string())
    })?;
    // Positions are rows in box coordinates: x' = x B^-1 B'.
    let scaling = (inverse * new_box).transpose();
    for x in state.positions.iter_mut() {
        *x = scaling * *x;
    }
    state.box_matrix = new_box;
    Ok(())
}

fn record_energies(
    ctx: &RunContext<'_>,
    state: &RunState,
    evaluation: &Evaluation,
    history: &mut ObservablesHistory,
    masses: &[f64],
    ndf: f64,
) {
    let kinetic = state.kinetic_energy(|i| masses[i]);
    let temperature = 2.0 * kinetic / (ndf * BOLTZ);
    let total = evaluation.potential + kinetic;
    history
        .energy
        .accumulate(&[evaluation.potential, kinetic, total, temperature]);
    if ctx.is_coordinator() {
        debug!(
            step = state.step,
            potential = evaluation.potential,
            kinetic,
            total,
            temperature,
            "Energies."
        );
    }
}

fn log_averages(ctx: &RunContext<'_>, history: &ObservablesHistory) {
    if !ctx.is_coordinator() {
        return;
    }
    let energy = &history.energy;
    for (i, name) in energy.term_names.iter().enumerate() {
        if let (Some(average), Some(fluctuation)) = (energy.average(i), energy.fluctuation(i)) {
            info!(
                term = %name,
                average,
                fluctuation,
                samples = energy.samples,
                "Energy average."
            );
        }
    }
}

fn open_trajectory(ctx: &RunContext<'_>) -> Result<Option<TrajectoryWriter>, EngineError> {
    if !ctx.is_coordinator() || ctx.input.params.nstxout <= 0 {
        return Ok(None);
    }
    let path = ctx
        .request
        .trajectory_output
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TRAJECTORY));
    let append = ctx.request.append && ctx.resumed;
    let writer = TrajectoryWriter::create(&path, ctx.input.precision, append)?;
    info!(path = %path.display(), append, "Writing trajectory.");
    Ok(Some(writer))
}
