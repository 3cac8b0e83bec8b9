use super::config::TuningConstants;
use super::domain::CellGrid;
use super::error::EngineError;
use crate::core::geometry;
use crate::core::hardware::SimdTier;
use crate::core::models::parameters::{CutoffScheme, InputParameters};
use crate::core::neighbor::ListBufferModel;
use nalgebra::Matrix3;
use tracing::{debug, info, warn};

/// The kind of hardware the pair-list kernels run on, which sets the acceptable cost
/// increase of a larger list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareClass {
    Cpu,
    WideSimdCpu,
    Gpu,
}

impl HardwareClass {
    pub fn detect(use_gpu: bool, simd: SimdTier) -> Self {
        if use_gpu {
            Self::Gpu
        } else if simd.is_wide() {
            Self::WideSimdCpu
        } else {
            Self::Cpu
        }
    }

    /// Acceptable and maximum cost ratios.
    fn cost_ratios(self, constants: &TuningConstants) -> (f64, f64) {
        match self {
            Self::Cpu => (constants.cpu_ok, constants.cpu_max),
            Self::WideSimdCpu => (constants.wide_simd_ok, constants.wide_simd_max),
            Self::Gpu => (constants.gpu_ok, constants.gpu_max),
        }
    }
}

/// The pair-list interval and radius a run uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListSettings {
    pub nstlist: i32,
    pub rlist: f64,
}

/// The search state: the last accepted candidate and the two radius boundaries.
#[derive(Debug, Clone, Copy)]
struct TuningState {
    nstlist: i32,
    rlist: f64,
    rlist_ok: f64,
    rlist_max: f64,
}

/// Everything the tuner reads besides the parameters.
pub struct TuningInputs<'a> {
    pub nstlist_override: Option<i32>,
    pub hardware: HardwareClass,
    pub constants: &'a TuningConstants,
    pub model: &'a dyn ListBufferModel,
    pub box_matrix: &'a Matrix3<f64>,
    pub grid: CellGrid,
}

/// Decides the final list interval and radius for the run.
///
/// With the Verlet scheme and dynamics the radius is first recomputed for the input
/// interval, then a larger interval is searched for, or an override applied.
pub fn resolve_list_settings(
    params: &InputParameters,
    inputs: &TuningInputs<'_>,
) -> Result<ListSettings, EngineError> {
    let current = ListSettings {
        nstlist: params.nstlist,
        rlist: params.rlist,
    };
    if params.cutoff_scheme == CutoffScheme::Group {
        if inputs.nstlist_override.is_some() {
            return Err(EngineError::Configuration(
                "Can not set nstlist with the group cut-off scheme".to_string(),
            ));
        }
        return Ok(current);
    }

    let prepared = prepare_list_scheme(params, inputs)?;
    if !params.integrator.is_dynamics() {
        return Ok(prepared);
    }
    increase_nstlist(params, prepared, inputs)
}

/// Recomputes the list radius for the input interval and checks that an override
/// can be honored.
pub fn prepare_list_scheme(
    params: &InputParameters,
    inputs: &TuningInputs<'_>,
) -> Result<ListSettings, EngineError> {
    let tolerance = params.verlet_buffer_tolerance;
    let mut settings = ListSettings {
        nstlist: params.nstlist,
        rlist: params.rlist,
    };

    if params.integrator.is_dynamics() && tolerance > 0.0 && !params.is_nve() {
        let rlist = inputs.model.list_radius(params.nstlist);
        if rlist != settings.rlist {
            info!(
                from = settings.rlist,
                to = rlist,
                "Changing rlist for the pair-list buffer tolerance."
            );
            settings.rlist = rlist;
        }
    }

    if inputs.nstlist_override.is_some() && (!params.integrator.is_dynamics() || tolerance <= 0.0) {
        return Err(EngineError::Configuration(format!(
            "Can not set nstlist without {}",
            if !params.integrator.is_dynamics() {
                "dynamics"
            } else {
                "verlet-buffer-tolerance"
            }
        )));
    }
    Ok(settings)
}

/// Searches the candidate intervals for the largest one whose list radius keeps the
/// extra pair cost within the envelope of the hardware class.
pub fn increase_nstlist(
    params: &InputParameters,
    prepared: ListSettings,
    inputs: &TuningInputs<'_>,
) -> Result<ListSettings, EngineError> {
    let candidates = &inputs.constants.candidates;
    let mut next_candidate = 0;

    if inputs.nstlist_override.is_none() {
        if prepared.nstlist == 1 {
            debug!("nstlist is 1 in the input; keeping it.");
            return Ok(prepared);
        }
        if inputs.hardware == HardwareClass::Gpu && prepared.nstlist < candidates[0] {
            info!(
                nstlist = prepared.nstlist,
                "For optimal performance with a GPU nstlist should be larger."
            );
        }
        next_candidate = candidates
            .iter()
            .take_while(|&&c| prepared.nstlist >= c)
            .count();
        if next_candidate == candidates.len() {
            return Ok(prepared);
        }
    }

    if params.is_nve() {
        info!("Can not increase nstlist because an NVE ensemble is used.");
        return Ok(prepared);
    }
    let tolerance = params.verlet_buffer_tolerance;
    if tolerance == 0.0 && inputs.hardware == HardwareClass::Gpu {
        return Err(EngineError::Configuration(
            "A zero pair-list buffer tolerance cannot be used with a GPU; regenerate the run input"
                .to_string(),
        ));
    }
    if tolerance < 0.0 {
        info!("Can not increase nstlist because verlet-buffer-tolerance is not set or used.");
        return Ok(prepared);
    }

    let (ok, max) = inputs.hardware.cost_ratios(inputs.constants);
    let reference = inputs.model.list_radius(inputs.constants.reference_nstlist);
    let increment = inputs.model.effective_increment();
    let mut state = TuningState {
        nstlist: prepared.nstlist,
        rlist: prepared.rlist,
        rlist_ok: (reference + increment) * ok.cbrt() - increment,
        rlist_max: (reference + increment) * max.cbrt() - increment,
    };
    debug!(
        reference,
        increment,
        rlist_ok = state.rlist_ok,
        rlist_max = state.rlist_max,
        "Pair-list radius boundaries."
    );

    let max_cutoff2 = geometry::max_cutoff2(params.pbc, inputs.box_matrix);
    let fits = |rlist: f64| -> (bool, bool) {
        let in_box = rlist * rlist < max_cutoff2;
        let in_grid = !in_box
            || !inputs.grid.is_decomposed()
            || inputs.grid.supports_radius(inputs.box_matrix, rlist);
        (in_box, in_grid)
    };

    if let Some(nstlist) = inputs.nstlist_override {
        info!(nstlist, "Getting nstlist from the command line.");
        let rlist = inputs.model.list_radius(nstlist);
        let (in_box, in_grid) = fits(rlist);
        if !in_box || !in_grid {
            warn!(
                "Can not increase nstlist because {}",
                if !in_box {
                    "the box is too small"
                } else {
                    "of decomposition limitations"
                }
            );
            return Ok(prepared);
        }
        state.nstlist = nstlist;
        state.rlist = rlist;
    } else {
        loop {
            let nstlist = candidates[next_candidate];
            let rlist = inputs.model.list_radius(nstlist);
            let (in_box, in_grid) = fits(rlist);
            debug!(nstlist, rlist, in_box, in_grid, "Trying list interval.");
            if !(in_box && in_grid && rlist <= state.rlist_max) {
                break;
            }
            state.nstlist = nstlist;
            state.rlist = rlist;
            next_candidate += 1;
            if next_candidate == candidates.len() || rlist >= state.rlist_ok {
                break;
            }
        }
    }

    let tuned = ListSettings {
        nstlist: state.nstlist,
        rlist: state.rlist,
    };
    if tuned != prepared {
        info!(
            nstlist_from = prepared.nstlist,
            nstlist_to = tuned.nstlist,
            rlist_from = prepared.rlist,
            rlist_to = tuned.rlist,
            "Changing nstlist and rlist."
        );
    }
    Ok(tuned)
}
