use super::config::{RunRequest, StepOverride};
use super::context::{DeformReference, SharedRunContext};
use super::duty::RankTopology;
use super::error::EngineError;
use crate::core::io::checkpoint::{Checkpoint, DecompositionHints};
use crate::core::io::run_input::RunInput;
use crate::core::models::history::ObservablesHistory;
use crate::core::models::state::RunState;
use std::path::PathBuf;
use tracing::{info, warn};

/// The state every rank starts the algorithm from.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredRun {
    pub state: RunState,
    pub history: ObservablesHistory,
    /// First step of the whole run, across restarts.
    pub init_step: i64,
    /// Last step to run; `None` runs until stopped.
    pub last_step: Option<i64>,
    pub resumed_from: Option<PathBuf>,
}

impl RestoredRun {
    pub fn is_continuation(&self) -> bool {
        self.resumed_from.is_some()
    }
}

/// Records the box that deformation is measured from. Must happen before a checkpoint
/// replaces the input box.
pub fn record_deform_reference(input: &RunInput, shared: &SharedRunContext) {
    if input.params.has_deform() {
        let recorded = shared.record_deform_reference(DeformReference {
            init_step: input.params.init_step,
            box_matrix: input.state.box_matrix,
        });
        if recorded {
            info!(init_step = input.params.init_step, "Recorded the deform reference box.");
        }
    }
}

/// Reads the checkpoint named by the request. A missing file starts the run from the
/// beginning.
pub fn load_checkpoint(request: &RunRequest) -> Result<Option<Checkpoint>, EngineError> {
    let Some(path) = &request.checkpoint_input else {
        return Ok(None);
    };
    if !path.exists() {
        info!(
            path = %path.display(),
            "Checkpoint file not found; starting from the beginning of the run."
        );
        return Ok(None);
    }
    let checkpoint = Checkpoint::read(path)?;
    info!(
        path = %path.display(),
        step = checkpoint.step,
        written_by = %checkpoint.program_version,
        "Loaded checkpoint."
    );
    Ok(Some(checkpoint))
}

/// Merges the run input, an optional checkpoint and the request overrides.
///
/// The checkpoint wins for the simulation state, the request wins for the number of
/// steps. Any incompatibility is fatal.
pub fn reconcile(
    request: &RunRequest,
    input: &RunInput,
    checkpoint: Option<Checkpoint>,
    ranks: &RankTopology,
) -> Result<RestoredRun, EngineError> {
    let params = &input.params;
    let nsteps = match request.nsteps {
        StepOverride::None => params.nsteps,
        StepOverride::Infinite => -1,
        StepOverride::Steps(n) => {
            info!(from = params.nsteps, to = n, "Overriding nsteps with the command-line value.");
            n
        }
    };
    let last_step = (nsteps >= 0).then(|| params.init_step + nsteps);

    let Some(checkpoint) = checkpoint else {
        return Ok(RestoredRun {
            state: input.state.clone(),
            history: ObservablesHistory::default(),
            init_step: params.init_step,
            last_step,
            resumed_from: None,
        });
    };

    let natoms = input.particle_count();
    if checkpoint.particle_count() != natoms {
        return Err(EngineError::RestartMismatch(format!(
            "the checkpoint has {} particles, the run input has {}",
            checkpoint.particle_count(),
            natoms
        )));
    }
    if checkpoint.integrator.class() != params.integrator.class() {
        return Err(EngineError::RestartMismatch(format!(
            "the checkpoint was written by integrator '{}', which cannot be continued by '{}'",
            checkpoint.integrator, params.integrator
        )));
    }
    if checkpoint.integrator != params.integrator {
        warn!(
            checkpoint = %checkpoint.integrator,
            input = %params.integrator,
            "Continuing with a different integrator of the same kind."
        );
    }

    let current = hints_for(ranks);
    if request.reproducible && checkpoint.decomposition != current {
        warn!(
            checkpoint_ranks = checkpoint.decomposition.ranks,
            ranks = current.ranks,
            checkpoint_grid = ?checkpoint.decomposition.grid,
            grid = ?current.grid,
            "The decomposition differs from the checkpoint; results will not be binary identical."
        );
    }
    if let Some(last) = last_step {
        if checkpoint.step > last {
            warn!(
                step = checkpoint.step,
                last_step = last,
                "The checkpoint is already past the last step of the run."
            );
        }
    }

    let path = request.checkpoint_input.clone();
    Ok(RestoredRun {
        state: RunState {
            step: checkpoint.step,
            time: checkpoint.time,
            box_matrix: checkpoint.box_matrix,
            positions: checkpoint.positions,
            velocities: checkpoint.velocities,
            thermostat_xi: checkpoint.thermostat_xi,
        },
        history: checkpoint.history,
        init_step: params.init_step,
        last_step,
        resumed_from: path,
    })
}

/// The decomposition hints a checkpoint written by this run carries.
pub fn hints_for(ranks: &RankTopology) -> DecompositionHints {
    let grid = ranks.grid().cells;
    DecompositionHints {
        grid: [grid[0] as i32, grid[1] as i32, grid[2] as i32],
        ranks: ranks.size() as i32,
        long_range_ranks: ranks.long_range_ranks().len() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hardware::HardwareInventory;
    use crate::core::io::fio::Precision;
    use crate::core::models::parameters::{InputParameters, IntegratorKind};
    use crate::core::models::topology::{ParticleType, Topology};
    use crate::engine::config::RunRequestBuilder;
    use crate::engine::duty;
    use crate::engine::planner::{GpuDecision, ResourcePlan};
    use nalgebra::{Matrix3, Vector3};
    use tempfile::tempdir;

    fn sample_input(natoms: usize) -> RunInput {
        let mut topology = Topology::new("test");
        let t = topology.add_type(ParticleType {
            mass: 12.0,
            charge: 0.0,
            c6: 2.5e-3,
            c12: 3.5e-6,
        });
        topology.add_particles(t, natoms);
        let positions = (0..natoms)
            .map(|i| Vector3::new(0.3 * i as f64, 0.5, 0.5))
            .collect();
        RunInput {
            params: InputParameters {
                integrator: IntegratorKind::Sd,
                nsteps: 500,
                init_step: 100,
                ..Default::default()
            },
            topology,
            state: RunState::new(Matrix3::from_diagonal_element(4.0), positions),
            precision: Precision::Double,
        }
    }

    fn single_rank(input: &RunInput, request: &RunRequest) -> RankTopology {
        let plan = ResourcePlan {
            gpu: GpuDecision::Disabled,
            ranks: 1,
            threads_per_rank: 1,
            long_range_threads: 1,
            particles: input.state.positions.len(),
            spawned: true,
        };
        duty::assign_duties(
            request,
            &input.params,
            &input.state.box_matrix,
            1.0,
            &plan,
            &HardwareInventory::default(),
        )
        .unwrap()
    }

    fn checkpoint_for(input: &RunInput, step: i64) -> Checkpoint {
        Checkpoint {
            program_version: "test".to_string(),
            integrator: input.params.integrator,
            step,
            time: step as f64 * input.params.dt,
            decomposition: DecompositionHints {
                grid: [1, 1, 1],
                ranks: 1,
                long_range_ranks: 0,
            },
            box_matrix: Matrix3::from_diagonal_element(4.1),
            positions: input.state.positions.clone(),
            velocities: vec![Vector3::new(0.1, 0.0, 0.0); input.particle_count()],
            thermostat_xi: 0.25,
            history: ObservablesHistory::default(),
        }
    }

    fn request() -> RunRequestBuilder {
        RunRequestBuilder::new().input_path("run.tpr".into())
    }

    #[test]
    fn fresh_start_runs_from_the_input() {
        let input = sample_input(10);
        let req = request().build().unwrap();
        let restored = reconcile(&req, &input, None, &single_rank(&input, &req)).unwrap();
        assert_eq!(restored.state, input.state);
        assert_eq!(restored.last_step, Some(600));
        assert!(!restored.is_continuation());
    }

    #[test]
    fn checkpoint_state_wins_and_step_override_applies() {
        let input = sample_input(10);
        let req = request()
            .checkpoint_input("state.cpt".into())
            .nsteps(StepOverride::Steps(1000))
            .build()
            .unwrap();
        let checkpoint = checkpoint_for(&input, 350);
        let restored =
            reconcile(&req, &input, Some(checkpoint.clone()), &single_rank(&input, &req))
                .unwrap();
        assert_eq!(restored.state.step, 350);
        assert_eq!(restored.state.box_matrix, checkpoint.box_matrix);
        assert_eq!(restored.state.velocities, checkpoint.velocities);
        assert_eq!(restored.state.thermostat_xi, 0.25);
        assert_eq!(restored.last_step, Some(1100));
        assert!(restored.is_continuation());
    }

    #[test]
    fn infinite_override_has_no_last_step() {
        let input = sample_input(4);
        let req = request().nsteps(StepOverride::Infinite).build().unwrap();
        let restored = reconcile(&req, &input, None, &single_rank(&input, &req)).unwrap();
        assert_eq!(restored.last_step, None);
    }

    #[test]
    fn particle_count_mismatch_is_fatal() {
        let input = sample_input(10);
        let other = sample_input(12);
        let req = request().build().unwrap();
        let result = reconcile(
            &req,
            &input,
            Some(checkpoint_for(&other, 200)),
            &single_rank(&input, &req),
        );
        assert!(matches!(result, Err(EngineError::RestartMismatch(_))));
    }

    #[test]
    fn integrator_class_mismatch_is_fatal() {
        let input = sample_input(10);
        let mut checkpoint = checkpoint_for(&input, 200);
        checkpoint.integrator = IntegratorKind::Steep;
        let req = request().build().unwrap();
        let result = reconcile(&req, &input, Some(checkpoint), &single_rank(&input, &req));
        assert!(matches!(result, Err(EngineError::RestartMismatch(_))));
    }

    #[test]
    fn missing_checkpoint_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let req = request()
            .checkpoint_input(dir.path().join("absent.cpt"))
            .build()
            .unwrap();
        assert!(load_checkpoint(&req).unwrap().is_none());
    }

    #[test]
    fn deform_reference_comes_from_the_input_box() {
        let mut input = sample_input(4);
        let shared = SharedRunContext::new();
        record_deform_reference(&input, &shared);
        assert!(shared.deform_reference().is_none());

        input.params.deform[0][0] = 0.01;
        record_deform_reference(&input, &shared);
        let reference = shared.deform_reference().unwrap();
        assert_eq!(reference.init_step, 100);
        assert_eq!(reference.box_matrix, input.state.box_matrix);
    }
}
