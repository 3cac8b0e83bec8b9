use super::forces::{Distribution, ForceEvaluator};
use super::replay::FrameSource;
use super::{LongRunningAlgorithm, RunContext, Signaller, StepSignals, prepare_history, sampling};
use crate::core::io::trajectory::Frame;
use crate::core::models::history::ObservablesHistory;
use crate::core::models::parameters::InputParameters;
use crate::core::models::state::{BOLTZ, RunState};
use crate::core::physics::ForceProvider;
use crate::engine::accounting::Stage;
use crate::engine::context::StopCondition;
use crate::engine::error::EngineError;
use crate::engine::progress::Progress;
use nalgebra::{Matrix3, Vector3};
use rand::Rng;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::time::Instant;
use tracing::{debug, info, instrument};

const INSERTION_TERMS: [&str; 2] = ["Volume", "Insertion Weight"];

/// Streams below this are left to the dynamical integrators.
const STREAM_OFFSET: u64 = 1 << 32;

/// Widom test-particle insertion.
///
/// The last particle of the run input is the test particle. It is placed at random
/// points of every frame and its Boltzmann-weighted interaction energy is averaged
/// into the excess chemical potential. Insertions are spread round-robin over the
/// spatial ranks and reduced per frame.
#[derive(Debug, Clone, Copy)]
pub struct InsertionSampler {
    /// Insert within `rtpi` of the box center instead of the whole box.
    centered: bool,
}

/// Sums over all frames and insertions so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct InsertionTotals {
    weighted: f64,
    volume: f64,
    insertions: f64,
}

impl InsertionTotals {
    fn excess_chemical_potential(&self, temperature: f64) -> Option<f64> {
        (self.volume > 0.0 && self.weighted > 0.0)
            .then(|| -BOLTZ * temperature * (self.weighted / self.volume).ln())
    }
}

impl InsertionSampler {
    pub fn new(centered: bool) -> Self {
        Self { centered }
    }

    /// A random test position inside the insertion region.
    fn trial_position(&self, box_matrix: &Matrix3<f64>, radius: f64, rng: &mut impl Rng) -> Vector3<f64> {
        let half = Vector3::new(0.5, 0.5, 0.5);
        if self.centered && radius > 0.0 {
            let center = box_matrix.transpose() * half;
            loop {
                let offset = Vector3::new(
                    rng.r#gen::<f64>() * 2.0 - 1.0,
                    rng.r#gen::<f64>() * 2.0 - 1.0,
                    rng.r#gen::<f64>() * 2.0 - 1.0,
                );
                if offset.norm_squared() <= 1.0 {
                    return center + offset * radius;
                }
            }
        }
        let fractional = Vector3::new(rng.r#gen::<f64>(), rng.r#gen::<f64>(), rng.r#gen::<f64>());
        box_matrix.transpose() * fractional
    }

    /// Boltzmann-factor sum of this rank's share of the insertions into `frame`.
    fn sample_frame(
        &self,
        params: &InputParameters,
        provider: &dyn ForceProvider,
        frame: &Frame,
        (index, ranks): (usize, usize),
    ) -> (f64, usize) {
        let beta = 1.0 / (BOLTZ * params.ref_t);
        let test = frame.positions.len() - 1;
        let insertions: Vec<usize> = (index..params.insertions_per_frame).step_by(ranks).collect();
        let weight = |&insertion: &usize| {
            let mut rng =
                sampling::step_rng(params.seed, frame.step, STREAM_OFFSET + insertion as u64);
            let mut positions = frame.positions.clone();
            positions[test] = self.trial_position(&frame.box_matrix, params.rtpi, &mut rng);
            (-beta * provider.particle_energy(&frame.box_matrix, &positions, test)).exp()
        };
        #[cfg(feature = "parallel")]
        let weights: Vec<f64> = insertions.par_iter().map(weight).collect();
        #[cfg(not(feature = "parallel"))]
        let weights: Vec<f64> = insertions.iter().map(weight).collect();
        (weights.iter().sum(), weights.len())
    }
}

impl LongRunningAlgorithm for InsertionSampler {
    fn name(&self) -> &'static str {
        "test-particle-insertion"
    }

    #[instrument(skip_all, name = "insertion", fields(centered = self.centered))]
    fn run(
        &mut self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        history: &mut ObservablesHistory,
    ) -> Result<StopCondition, EngineError> {
        let params = &ctx.input.params;
        if params.ref_t <= 0.0 {
            return Err(EngineError::Configuration(
                "particle insertion needs a positive reference temperature".to_string(),
            ));
        }
        if state.particle_count() < 2 {
            return Err(EngineError::Configuration(
                "particle insertion needs a system and a test particle".to_string(),
            ));
        }
        prepare_history(history, &INSERTION_TERMS);
        let group = ctx.spatial_group()?;
        let index = group
            .members()
            .iter()
            .position(|&r| r == ctx.comm.rank())
            .ok_or_else(|| {
                EngineError::Internal(format!(
                    "rank {} is not a member of the spatial group",
                    ctx.comm.rank()
                ))
            })?;
        let forces = ForceEvaluator::new(ctx, Distribution::Local)?;
        let provider = forces.provider();
        let mut source = match &ctx.request.rerun {
            Some(path) => Some(FrameSource::open(ctx, path)?),
            None => None,
        };
        let mut signaller = ctx.is_coordinator().then(|| Signaller::new(ctx.request));
        info!(
            insertions_per_frame = params.insertions_per_frame,
            rtpi = params.rtpi,
            ranks = group.size(),
            "Starting test-particle insertion."
        );
        ctx.reporter.report(Progress::TaskStart { total_steps: 0 });

        let mut totals = InsertionTotals::default();
        let mut pending = Some(Frame {
            step: state.step,
            time: state.time,
            box_matrix: state.box_matrix,
            positions: state.positions.clone(),
        });
        let mut stop = StopCondition::None;
        loop {
            let frame = match source.as_mut() {
                Some(source) => source.next(ctx)?,
                None => pending.take(),
            };
            let Some(frame) = frame else { break };

            let start = Instant::now();
            let share = (index, group.size());
            let sampler = &*self;
            let (sum, count) = ctx
                .pool
                .install(|| sampler.sample_frame(params, provider, &frame, share));
            ctx.accounting.borrow_mut().add(Stage::Force, start.elapsed());

            let start = Instant::now();
            let mut reduced = [sum, count as f64];
            ctx.comm.all_reduce_sum(group, &mut reduced)?;
            ctx.accounting
                .borrow_mut()
                .add(Stage::Communication, start.elapsed());
            let volume = frame.box_matrix.determinant().abs();
            let mean_weight = if reduced[1] > 0.0 { reduced[0] / reduced[1] } else { 0.0 };
            totals.weighted += volume * mean_weight;
            totals.volume += volume;
            totals.insertions += reduced[1];
            history.energy.accumulate(&[volume, mean_weight]);
            debug!(step = frame.step, mean_weight, "Frame sampled.");

            state.step = frame.step;
            state.time = frame.time;
            ctx.accounting.borrow_mut().count_step();
            ctx.reporter.report(Progress::TaskIncrement { steps: 1 });

            let local = signaller.as_mut().map(|s| s.poll(ctx, frame.step, true));
            let signals = StepSignals::exchange(ctx, local)?;
            if signals.stop != StopCondition::None {
                stop = signals.stop;
                break;
            }
        }
        forces.finish(ctx)?;
        ctx.reporter.report(Progress::TaskFinish);

        match totals.excess_chemical_potential(params.ref_t) {
            Some(mu) => info!(
                insertions = totals.insertions,
                mu,
                "Excess chemical potential (kJ/mol)."
            ),
            None => info!(
                insertions = totals.insertions,
                "Every insertion overlapped; the excess chemical potential is infinite."
            ),
        }
        Ok(stop)
    }
}
