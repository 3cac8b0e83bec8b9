use super::config::{GpuPolicy, LongRangeRanks, RunRequest};
use super::error::EngineError;
use crate::core::hardware::HardwareInventory;
use crate::core::models::parameters::{
    CoulombType, CutoffScheme, InputParameters, IntegratorKind, LjPmeCombination, VdwType,
};
use std::fmt;
use tracing::{info, warn};

/// Fewest particles worth giving a CPU rank.
pub const MIN_ATOMS_PER_RANK: usize = 90;
/// Fewest particles worth giving a rank with an accelerator.
pub const MIN_ATOMS_PER_GPU: usize = 900;

/// How accelerator use was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuDecision {
    /// Requested explicitly and available.
    Forced,
    /// Used because it was allowed and available.
    Attempted,
    Disabled,
}

impl GpuDecision {
    pub fn is_active(self) -> bool {
        self != Self::Disabled
    }
}

impl fmt::Display for GpuDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Forced => "forced",
            Self::Attempted => "attempted",
            Self::Disabled => "disabled",
        })
    }
}

/// Output of the resource planner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePlan {
    pub gpu: GpuDecision,
    pub ranks: usize,
    pub threads_per_rank: usize,
    pub long_range_threads: usize,
    /// Particles in the system the plan was made for.
    pub particles: usize,
    /// True when the ranks are spawned by us rather than provided by an external launcher.
    pub spawned: bool,
}

/// Algorithms whose inner loops have no parallel implementation.
fn requires_single_rank(params: &InputParameters) -> Option<&'static str> {
    if params.integrator == IntegratorKind::LBfgs {
        Some("the L-BFGS minimizer")
    } else if params.coulomb_type == CoulombType::Ewald {
        Some("plain Ewald electrostatics")
    } else {
        None
    }
}

/// Algorithms that run on a single rank unless asked otherwise.
fn prefers_single_rank(params: &InputParameters) -> bool {
    params.integrator == IntegratorKind::Nm || params.integrator.is_insertion()
}

/// Decides whether an accelerator is used.
pub fn decide_gpu(
    request: &RunRequest,
    params: &InputParameters,
    inventory: &HardwareInventory,
) -> Result<GpuDecision, EngineError> {
    let policy = request.gpu_policy;
    if policy == GpuPolicy::Disabled {
        return Ok(GpuDecision::Disabled);
    }

    if params.cutoff_scheme == CutoffScheme::Group {
        if policy == GpuPolicy::Forced {
            return Err(EngineError::Configuration(
                "GPU requested, but can't be used without cutoff-scheme=verlet".to_string(),
            ));
        }
        if inventory.compatible_gpu_count() > 0 {
            warn!(
                gpus = inventory.compatible_gpu_count(),
                "Compatible GPUs are present, but the group cutoff scheme cannot use them."
            );
        }
        return Ok(GpuDecision::Disabled);
    }

    let ljpme_lb = params.vdw_type == VdwType::Pme
        && params.ljpme_combination == LjPmeCombination::LorentzBerthelot;
    let rerun_groups = request.rerun.is_some() && params.energy_groups > 1;
    if ljpme_lb || rerun_groups {
        let reason = if ljpme_lb {
            "LJ-PME with Lorentz-Berthelot combination"
        } else {
            "reruns with multiple energy groups"
        };
        if policy == GpuPolicy::Forced {
            return Err(EngineError::Configuration(format!(
                "GPU acceleration requested, but not supported with the given input settings ({})",
                reason
            )));
        }
        warn!(reason, "GPU acceleration is not supported with these settings; using the CPU.");
        return Ok(GpuDecision::Disabled);
    }

    if inventory.compatible_gpu_count() > 0 || inventory.gpu_emulation {
        return Ok(match policy {
            GpuPolicy::Forced => GpuDecision::Forced,
            _ => GpuDecision::Attempted,
        });
    }

    if policy == GpuPolicy::Forced {
        return Err(EngineError::Configuration(
            "GPU acceleration requested, but no compatible GPU was detected".to_string(),
        ));
    }
    if !inventory.gpus.is_empty() {
        warn!(
            gpus = inventory.gpus.len(),
            "No detected GPU is compatible; falling back to CPU-only execution."
        );
    }
    Ok(GpuDecision::Disabled)
}

/// Decides the accelerator use, the number of ranks and their thread counts.
///
/// `external_ranks` is the size of a rank set that already exists; no ranks are spawned
/// in that case.
pub fn plan_resources(
    request: &RunRequest,
    params: &InputParameters,
    natoms: usize,
    inventory: &HardwareInventory,
    external_ranks: Option<usize>,
) -> Result<ResourcePlan, EngineError> {
    let gpu = decide_gpu(request, params, inventory)?;
    let ranks = match external_ranks {
        Some(n) => {
            if request.requested_ranks.is_some_and(|r| r != n) {
                return Err(EngineError::Configuration(format!(
                    "{} ranks were requested, but the launcher provides {}",
                    request.requested_ranks.unwrap_or(n),
                    n
                )));
            }
            n
        }
        None => thread_rank_count(request, params, natoms, inventory, gpu)?,
    };
    if let Some(what) = requires_single_rank(params) {
        if ranks > 1 {
            return Err(EngineError::Configuration(format!(
                "{} can only run on a single rank, but {} ranks are in use",
                what, ranks
            )));
        }
    }

    let total_threads = request
        .total_threads
        .unwrap_or(inventory.hardware_threads)
        .max(1);
    let threads_per_rank = request
        .threads_per_rank
        .unwrap_or_else(|| (total_threads / ranks).max(1));
    if let (Some(total), Some(per_rank)) = (request.total_threads, request.threads_per_rank) {
        if per_rank * ranks > total {
            return Err(EngineError::Configuration(format!(
                "{} ranks with {} threads each need {} threads, but only {} were requested",
                ranks,
                per_rank,
                per_rank * ranks,
                total
            )));
        }
    }
    let long_range_threads = request.long_range_threads.unwrap_or(threads_per_rank);
    if threads_per_rank * ranks > inventory.hardware_threads {
        warn!(
            ranks,
            threads_per_rank,
            hardware_threads = inventory.hardware_threads,
            "Oversubscribing the available hardware threads."
        );
    }

    let plan = ResourcePlan {
        gpu,
        ranks,
        threads_per_rank,
        long_range_threads,
        particles: natoms,
        spawned: external_ranks.is_none(),
    };
    info!(
        ranks = plan.ranks,
        threads_per_rank = plan.threads_per_rank,
        long_range_threads = plan.long_range_threads,
        gpu = %plan.gpu,
        "Planned resources."
    );
    Ok(plan)
}

fn thread_rank_count(
    request: &RunRequest,
    params: &InputParameters,
    natoms: usize,
    inventory: &HardwareInventory,
    gpu: GpuDecision,
) -> Result<usize, EngineError> {
    if let LongRangeRanks::Count(n) = request.long_range_ranks {
        if n > 0 && request.requested_ranks.is_none() {
            return Err(EngineError::Configuration(
                "The number of ranks must be set explicitly when using separate long-range ranks"
                    .to_string(),
            ));
        }
    }
    if let Some(n) = request.requested_ranks {
        return Ok(n);
    }
    if requires_single_rank(params).is_some() || prefers_single_rank(params) {
        return Ok(1);
    }

    let (base, min_atoms) = if gpu.is_active() {
        (inventory.compatible_gpu_count().max(1), MIN_ATOMS_PER_GPU)
    } else {
        let threads = request
            .total_threads
            .unwrap_or(inventory.hardware_threads)
            .max(1);
        let per_rank = request.threads_per_rank.unwrap_or(1);
        ((threads / per_rank).max(1), MIN_ATOMS_PER_RANK)
    };
    let limit = (natoms / min_atoms).max(1);
    if base > limit {
        info!(
            natoms,
            reduced_from = base,
            ranks = limit,
            "Reducing the number of ranks so every rank has enough particles."
        );
    }
    Ok(base.min(limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hardware::gpu::parse_device_list;
    use crate::engine::config::RunRequestBuilder;

    fn request() -> RunRequestBuilder {
        RunRequestBuilder::new().input_path("run.tpr".into())
    }

    fn cpu_only(threads: usize) -> HardwareInventory {
        HardwareInventory {
            hardware_threads: threads,
            ..Default::default()
        }
    }

    fn with_gpus(threads: usize, gpus: &str) -> HardwareInventory {
        HardwareInventory {
            gpus: parse_device_list(gpus),
            ..cpu_only(threads)
        }
    }

    #[test]
    fn auto_policy_without_device_falls_back_to_cpu() {
        let plan = plan_resources(
            &request().requested_ranks(4).build().unwrap(),
            &InputParameters::default(),
            10_000,
            &cpu_only(8),
            None,
        )
        .unwrap();
        assert_eq!(plan.gpu, GpuDecision::Disabled);
        assert_eq!(plan.ranks, 4);
        assert_eq!(plan.threads_per_rank, 2);
    }

    #[test]
    fn forced_gpu_without_device_is_fatal() {
        let result = decide_gpu(
            &request().gpu_policy(GpuPolicy::Forced).build().unwrap(),
            &InputParameters::default(),
            &cpu_only(8),
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn group_scheme_rejects_forced_gpu_and_ignores_devices() {
        let params = InputParameters {
            cutoff_scheme: CutoffScheme::Group,
            ..Default::default()
        };
        let forced = request().gpu_policy(GpuPolicy::Forced).build().unwrap();
        assert!(decide_gpu(&forced, &params, &with_gpus(8, "a")).is_err());
        let auto = request().build().unwrap();
        assert_eq!(
            decide_gpu(&auto, &params, &with_gpus(8, "a")).unwrap(),
            GpuDecision::Disabled
        );
    }

    #[test]
    fn lorentz_berthelot_ljpme_disables_gpu() {
        let params = InputParameters {
            vdw_type: VdwType::Pme,
            ljpme_combination: LjPmeCombination::LorentzBerthelot,
            ..Default::default()
        };
        let auto = request().build().unwrap();
        assert_eq!(
            decide_gpu(&auto, &params, &with_gpus(8, "a")).unwrap(),
            GpuDecision::Disabled
        );
        let forced = request().gpu_policy(GpuPolicy::Forced).build().unwrap();
        assert!(decide_gpu(&forced, &params, &with_gpus(8, "a")).is_err());
    }

    #[test]
    fn emulation_allows_gpu_path_without_device() {
        let inventory = HardwareInventory {
            gpu_emulation: true,
            ..cpu_only(4)
        };
        assert_eq!(
            decide_gpu(&request().build().unwrap(), &InputParameters::default(), &inventory)
                .unwrap(),
            GpuDecision::Attempted
        );
    }

    #[test]
    fn auto_rank_count_respects_particle_minimum() {
        let plan = plan_resources(
            &request().build().unwrap(),
            &InputParameters::default(),
            400,
            &cpu_only(16),
            None,
        )
        .unwrap();
        assert_eq!(plan.ranks, 4);

        let plan = plan_resources(
            &request().build().unwrap(),
            &InputParameters::default(),
            2000,
            &with_gpus(16, "a,b,c"),
            None,
        )
        .unwrap();
        assert_eq!(plan.gpu, GpuDecision::Attempted);
        assert_eq!(plan.ranks, 2);
    }

    #[test]
    fn separate_long_range_ranks_need_explicit_rank_count() {
        let req = request()
            .long_range_ranks(LongRangeRanks::Count(1))
            .build()
            .unwrap();
        assert!(matches!(
            plan_resources(&req, &InputParameters::default(), 10_000, &cpu_only(8), None),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn serial_only_algorithms_refuse_multiple_ranks() {
        let params = InputParameters {
            integrator: IntegratorKind::LBfgs,
            ..Default::default()
        };
        let auto = plan_resources(&request().build().unwrap(), &params, 10_000, &cpu_only(8), None)
            .unwrap();
        assert_eq!(auto.ranks, 1);
        let explicit = request().requested_ranks(2).build().unwrap();
        assert!(plan_resources(&explicit, &params, 10_000, &cpu_only(8), None).is_err());
    }

    #[test]
    fn external_rank_count_is_taken_as_given() {
        let plan = plan_resources(
            &request().build().unwrap(),
            &InputParameters::default(),
            100,
            &cpu_only(8),
            Some(3),
        )
        .unwrap();
        assert_eq!(plan.ranks, 3);
        assert!(!plan.spawned);
        let mismatched = request().requested_ranks(2).build().unwrap();
        assert!(
            plan_resources(&mismatched, &InputParameters::default(), 100, &cpu_only(8), Some(3))
                .is_err()
        );
    }

    #[test]
    fn explicit_thread_counts_must_fit() {
        let req = request()
            .requested_ranks(4)
            .total_threads(4)
            .threads_per_rank(2)
            .build()
            .unwrap();
        assert!(plan_resources(&req, &InputParameters::default(), 10_000, &cpu_only(8), None)
            .is_err());
    }
}
