use super::config::{LongRangeRanks, RankOrder, RunRequest};
use super::domain::{self, CellGrid};
use super::error::EngineError;
use super::planner::ResourcePlan;
use crate::core::hardware::HardwareInventory;
use crate::core::models::parameters::{
    CoulombType, IntegratorClass, InputParameters, PbcType, VdwType,
};
use nalgebra::Matrix3;
use std::f64::consts::PI;
use std::fmt;
use tracing::info;

/// Below this many ranks no long-range ranks are split off automatically.
const MIN_RANKS_FOR_AUTO_SPLIT: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Duty {
    /// Short-range interactions of one decomposition cell.
    Spatial,
    /// Only the mesh part of the long-range interactions.
    LongRange,
    /// Both, when no separate long-range ranks exist.
    Both,
}

impl Duty {
    pub fn has_spatial(self) -> bool {
        matches!(self, Self::Spatial | Self::Both)
    }

    pub fn has_long_range(self) -> bool {
        matches!(self, Self::LongRange | Self::Both)
    }
}

impl fmt::Display for Duty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Spatial => "spatial",
            Self::LongRange => "long-range",
            Self::Both => "spatial+long-range",
        })
    }
}

/// What one rank does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RankAssignment {
    pub rank: usize,
    pub duty: Duty,
    /// Position among the spatial ranks, which is also the decomposition cell index.
    pub spatial_index: Option<usize>,
    pub long_range_index: Option<usize>,
    pub gpu: Option<usize>,
    pub threads: usize,
    /// The long-range rank serving this spatial rank.
    pub long_range_peer: Option<usize>,
}

/// The resolved role of every rank. Built once and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RankTopology {
    assignments: Vec<RankAssignment>,
    grid: CellGrid,
    spatial: Vec<usize>,
    long_range: Vec<usize>,
}

impl RankTopology {
    pub fn size(&self) -> usize {
        self.assignments.len()
    }

    pub fn assignment(&self, rank: usize) -> Option<&RankAssignment> {
        self.assignments.get(rank)
    }

    pub fn assignments(&self) -> &[RankAssignment] {
        &self.assignments
    }

    pub fn grid(&self) -> CellGrid {
        self.grid
    }

    /// Spatial ranks in cell order.
    pub fn spatial_ranks(&self) -> &[usize] {
        &self.spatial
    }

    /// Dedicated long-range ranks in index order; empty when every rank has both duties.
    pub fn long_range_ranks(&self) -> &[usize] {
        &self.long_range
    }

    pub fn has_separate_long_range(&self) -> bool {
        !self.long_range.is_empty()
    }

    /// Spatial ranks served by the long-range rank `rank`, in cell order.
    pub fn served_by(&self, rank: usize) -> Vec<usize> {
        self.spatial
            .iter()
            .copied()
            .filter(|&s| self.assignments[s].long_range_peer == Some(rank))
            .collect()
    }
}

/// Relative cost of one pair interaction with an Ewald-type real-space term.
const EWALD_PAIR_COST: f64 = 4.2;
/// Relative cost of one plain Lennard-Jones pair interaction.
const LJ_PAIR_COST: f64 = 2.5;
/// Relative cost of spreading or gathering one particle on one mesh point.
const SPREAD_COST: f64 = 1.5;
/// Relative cost per point and log2 of the mesh size of one 3D FFT.
const FFT_COST: f64 = 0.2;
/// Relative cost of solving for one mesh point in reciprocal space.
const SOLVE_COST: f64 = 0.5;

/// Estimated share of the per-step force work spent on the long-range mesh.
///
/// Pair work counts every pair within the largest cutoff at the mean density; mesh work
/// counts spreading and gathering, a forward and backward FFT and the reciprocal-space
/// solve, once for each interaction that uses a mesh.
pub(crate) fn mesh_load_fraction(
    params: &InputParameters,
    particles: usize,
    box_matrix: &Matrix3<f64>,
) -> f64 {
    let meshes = usize::from(params.coulomb_type == CoulombType::Pme)
        + usize::from(params.vdw_type == VdwType::Pme);
    let volume = box_matrix.determinant().abs();
    if meshes == 0 || particles == 0 || volume <= 0.0 || params.fourier_spacing <= 0.0 {
        return 0.0;
    }
    let n = particles as f64;
    let cutoff = params.max_cutoff();
    let pairs = 0.5 * n * (n / volume) * 4.0 / 3.0 * PI * cutoff.powi(3);
    let pair_cost = if matches!(params.coulomb_type, CoulombType::Ewald | CoulombType::Pme) {
        EWALD_PAIR_COST
    } else {
        LJ_PAIR_COST
    };

    let points: f64 = (0..3)
        .map(|d| (box_matrix.row(d).norm() / params.fourier_spacing).ceil().max(1.0))
        .product();
    let stencil = (params.pme_order as f64).powi(3);
    let per_mesh = 2.0 * n * stencil * SPREAD_COST
        + 2.0 * points * points.log2().max(1.0) * FFT_COST
        + points * SOLVE_COST;
    let mesh = meshes as f64 * per_mesh;
    mesh / (pairs * pair_cost + mesh)
}

/// Long-range rank count whose spatial remainder divides evenly, closest to the
/// estimated mesh share of the work.
fn auto_long_range_count(ranks: usize, mesh_fraction: f64) -> usize {
    let target = ranks as f64 * mesh_fraction;
    if target < 0.5 {
        return 0;
    }
    (1..=ranks / 2)
        .filter(|&k| (ranks - k) % k == 0)
        .min_by(|&a, &b| {
            let da = (a as f64 - target).abs();
            let db = (b as f64 - target).abs();
            da.total_cmp(&db).then(a.cmp(&b))
        })
        .unwrap_or(0)
}

fn validate_request(
    request: &RunRequest,
    params: &InputParameters,
    ranks: usize,
) -> Result<(), EngineError> {
    let explicit_grid = request
        .decomposition_grid
        .is_some_and(|g| g.iter().product::<usize>() > 1);
    let explicit_long_range = request.long_range_ranks.requested() > 0;

    if ranks == 1 && (explicit_grid || explicit_long_range) {
        return Err(EngineError::Configuration(
            "A decomposition grid or long-range ranks were requested, but the run uses a single rank"
                .to_string(),
        ));
    }
    if request.rerun.is_some()
        && matches!(
            params.integrator.class(),
            IntegratorClass::Minimization | IntegratorClass::NormalModes
        )
    {
        return Err(EngineError::Configuration(format!(
            "Integrator '{}' cannot be used to rerun a trajectory",
            params.integrator
        )));
    }
    if explicit_long_range && !params.uses_mesh_long_range() {
        return Err(EngineError::Configuration(
            "Long-range ranks are requested, but the system does not use a mesh method for electrostatics or Lennard-Jones"
                .to_string(),
        ));
    }
    let single_domain = matches!(
        params.integrator.class(),
        IntegratorClass::NormalModes | IntegratorClass::Insertion
    );
    if single_domain && (explicit_grid || explicit_long_range) {
        return Err(EngineError::Configuration(format!(
            "Integrator '{}' does not support a decomposition grid or long-range ranks",
            params.integrator
        )));
    }
    Ok(())
}

/// Splits the ranks of `plan` into duties, picks the decomposition grid and hands out
/// accelerators.
///
/// `list_radius` is the current pair-list radius; together with the interaction cutoff
/// it sets the minimum cell width.
pub fn assign_duties(
    request: &RunRequest,
    params: &InputParameters,
    box_matrix: &Matrix3<f64>,
    list_radius: f64,
    plan: &ResourcePlan,
    inventory: &HardwareInventory,
) -> Result<RankTopology, EngineError> {
    let n = plan.ranks;
    validate_request(request, params, n)?;

    let single_domain = matches!(
        params.integrator.class(),
        IntegratorClass::NormalModes | IntegratorClass::Insertion
    );
    let long_range_count = if single_domain || !params.uses_mesh_long_range() {
        0
    } else {
        match request.long_range_ranks {
            LongRangeRanks::Count(k) => k,
            LongRangeRanks::Auto if n < MIN_RANKS_FOR_AUTO_SPLIT || plan.gpu.is_active() => 0,
            LongRangeRanks::Auto => {
                let fraction = mesh_load_fraction(params, plan.particles, box_matrix);
                let count = auto_long_range_count(n, fraction);
                info!(
                    mesh_fraction = format!("{:.2}", fraction),
                    long_range_ranks = count,
                    "Estimated the long-range mesh load."
                );
                count
            }
        }
    };
    if long_range_count >= n || long_range_count > n - long_range_count {
        return Err(EngineError::Configuration(format!(
            "{} long-range ranks cannot be used with {} ranks in total; at least as many spatial ranks are needed",
            long_range_count, n
        )));
    }
    let spatial_count = n - long_range_count;

    let grid = if single_domain {
        CellGrid::SINGLE
    } else {
        let min_width = list_radius.max(params.max_cutoff());
        domain::choose_grid(
            spatial_count,
            request.decomposition_grid,
            params.pbc,
            box_matrix,
            min_width,
        )?
    };
    if params.pbc == PbcType::Screw && !grid.is_decomposed() {
        return Err(EngineError::Configuration(
            "Screw periodic boundaries are only supported with a decomposition over multiple ranks"
                .to_string(),
        ));
    }

    let is_long_range: Vec<bool> = match request.rank_order {
        _ if long_range_count == 0 => vec![false; n],
        RankOrder::Interleave => {
            let mut flags = vec![false; n];
            for j in 0..long_range_count {
                flags[(j + 1) * n / long_range_count - 1] = true;
            }
            flags
        }
        RankOrder::PpFirst => (0..n).map(|r| r >= spatial_count).collect(),
    };
    let spatial: Vec<usize> = (0..n).filter(|&r| !is_long_range[r]).collect();
    let long_range: Vec<usize> = (0..n).filter(|&r| is_long_range[r]).collect();

    let gpus = assign_gpus(request, plan, inventory, spatial.len())?;

    let mut assignments: Vec<RankAssignment> = (0..n)
        .map(|rank| RankAssignment {
            rank,
            duty: Duty::LongRange,
            spatial_index: None,
            long_range_index: None,
            gpu: None,
            threads: plan.long_range_threads,
            long_range_peer: None,
        })
        .collect();
    for (j, &rank) in spatial.iter().enumerate() {
        let a = &mut assignments[rank];
        a.duty = if long_range.is_empty() {
            Duty::Both
        } else {
            Duty::Spatial
        };
        a.spatial_index = Some(j);
        a.gpu = gpus.get(j).copied().flatten();
        a.threads = plan.threads_per_rank;
        a.long_range_peer = (!long_range.is_empty())
            .then(|| long_range[j * long_range.len() / spatial.len()]);
    }
    for (j, &rank) in long_range.iter().enumerate() {
        assignments[rank].long_range_index = Some(j);
    }

    info!(
        spatial = spatial.len(),
        long_range = long_range.len(),
        grid = ?grid.cells,
        order = %request.rank_order,
        "Assigned rank duties."
    );
    Ok(RankTopology {
        assignments,
        grid,
        spatial,
        long_range,
    })
}

/// Accelerator for every spatial rank, in spatial order.
fn assign_gpus(
    request: &RunRequest,
    plan: &ResourcePlan,
    inventory: &HardwareInventory,
    spatial_count: usize,
) -> Result<Vec<Option<usize>>, EngineError> {
    if !plan.gpu.is_active() {
        return Ok(vec![None; spatial_count]);
    }
    if let Some(ids) = &request.gpu_ids {
        if ids.len() != spatial_count {
            return Err(EngineError::Resource(format!(
                "{} GPU ids were given for {} spatial ranks",
                ids.len(),
                spatial_count
            )));
        }
        for &id in ids {
            match inventory.gpus.iter().find(|g| g.id == id) {
                Some(g) if g.compatible => {}
                Some(g) => {
                    return Err(EngineError::Resource(format!(
                        "GPU #{} ({}) is not compatible",
                        id, g.name
                    )));
                }
                None if inventory.gpu_emulation => {}
                None => {
                    return Err(EngineError::Resource(format!("GPU #{} was not detected", id)));
                }
            }
        }
        return Ok(ids.iter().copied().map(Some).collect());
    }

    let devices: Vec<usize> = inventory.compatible_gpus().map(|g| g.id).collect();
    if devices.is_empty() {
        // Emulated accelerators share one virtual device.
        return Ok(vec![Some(0); spatial_count]);
    }
    Ok((0..spatial_count)
        .map(|j| Some(devices[j % devices.len()]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hardware::gpu::parse_device_list;
    use crate::core::models::parameters::IntegratorKind;
    use crate::engine::config::{GpuPolicy, RunRequestBuilder};
    use crate::engine::planner::{self, GpuDecision};

    fn pme() -> InputParameters {
        InputParameters {
            coulomb_type: CoulombType::Pme,
            ..Default::default()
        }
    }

    fn plan(ranks: usize, gpu: GpuDecision) -> ResourcePlan {
        ResourcePlan {
            gpu,
            ranks,
            threads_per_rank: 2,
            long_range_threads: 1,
            particles: 172_800,
            spawned: true,
        }
    }

    fn big_box() -> Matrix3<f64> {
        Matrix3::from_diagonal_element(12.0)
    }

    fn request() -> RunRequestBuilder {
        RunRequestBuilder::new().input_path("run.tpr".into())
    }

    fn check_invariants(topology: &RankTopology) {
        assert_eq!(topology.size(), topology.assignments().len());
        for (rank, a) in topology.assignments().iter().enumerate() {
            assert_eq!(a.rank, rank);
            assert_eq!(a.duty.has_spatial(), a.spatial_index.is_some());
            assert_eq!(a.duty == Duty::LongRange, a.long_range_index.is_some());
        }
        assert!(topology.long_range_ranks().len() <= topology.spatial_ranks().len());
        assert_eq!(topology.grid().count(), topology.spatial_ranks().len().max(1));
    }

    #[test]
    fn auto_split_picks_the_even_division_nearest_the_mesh_share() {
        assert_eq!(auto_long_range_count(12, 0.25), 3);
        assert_eq!(auto_long_range_count(16, 0.25), 4);
        assert_eq!(auto_long_range_count(14, 0.25), 2);
        assert_eq!(auto_long_range_count(13, 0.25), 1);
        assert_eq!(auto_long_range_count(24, 0.36), 8);
        assert_eq!(auto_long_range_count(16, 0.01), 0);
    }

    #[test]
    fn mesh_heavier_inputs_get_more_long_range_ranks() {
        let light = InputParameters {
            rlist: 1.4,
            rcoulomb: 1.4,
            rvdw: 1.4,
            fourier_spacing: 0.16,
            ..pme()
        };
        let heavy = InputParameters {
            rlist: 0.9,
            rcoulomb: 0.9,
            rvdw: 0.9,
            fourier_spacing: 0.08,
            ..pme()
        };
        let light_share = mesh_load_fraction(&light, 172_800, &big_box());
        let heavy_share = mesh_load_fraction(&heavy, 172_800, &big_box());
        assert!(light_share > 0.0 && light_share < heavy_share && heavy_share < 1.0);

        let req = request().build().unwrap();
        let split = |params: &InputParameters| {
            let topology = assign_duties(
                &req,
                params,
                &big_box(),
                params.rlist,
                &plan(20, GpuDecision::Disabled),
                &HardwareInventory::default(),
            )
            .unwrap();
            check_invariants(&topology);
            topology.long_range_ranks().len()
        };
        let light_ranks = split(&light);
        let heavy_ranks = split(&heavy);
        assert!(light_ranks >= 1);
        assert!(heavy_ranks > light_ranks);
        assert_eq!((20 - heavy_ranks) % heavy_ranks, 0);
    }

    #[test]
    fn no_mesh_means_no_mesh_load() {
        let params = InputParameters {
            coulomb_type: CoulombType::ReactionField,
            ..Default::default()
        };
        assert_eq!(mesh_load_fraction(&params, 1000, &big_box()), 0.0);
        assert_eq!(mesh_load_fraction(&pme(), 0, &big_box()), 0.0);
    }

    #[test]
    fn no_auto_split_for_small_runs_or_without_mesh() {
        let req = request().build().unwrap();
        let topology = assign_duties(
            &req,
            &pme(),
            &big_box(),
            1.1,
            &plan(8, GpuDecision::Disabled),
            &HardwareInventory::default(),
        )
        .unwrap();
        assert!(!topology.has_separate_long_range());
        assert!(topology.assignments().iter().all(|a| a.duty == Duty::Both));

        let topology = assign_duties(
            &req,
            &InputParameters::default(),
            &big_box(),
            1.1,
            &plan(16, GpuDecision::Disabled),
            &HardwareInventory::default(),
        )
        .unwrap();
        assert!(!topology.has_separate_long_range());
        check_invariants(&topology);
    }

    #[test]
    fn interleaved_order_places_long_range_ranks_after_their_groups() {
        let req = request()
            .long_range_ranks(LongRangeRanks::Count(3))
            .build()
            .unwrap();
        let topology = assign_duties(
            &req,
            &pme(),
            &big_box(),
            1.1,
            &plan(12, GpuDecision::Disabled),
            &HardwareInventory::default(),
        )
        .unwrap();
        assert_eq!(topology.long_range_ranks(), &[3, 7, 11]);
        assert_eq!(topology.served_by(3), vec![0, 1, 2]);
        assert_eq!(topology.served_by(11), vec![8, 9, 10]);
        assert_eq!(topology.assignment(3).unwrap().threads, 1);
        assert_eq!(topology.assignment(0).unwrap().threads, 2);
        check_invariants(&topology);
    }

    #[test]
    fn pp_first_order_puts_long_range_ranks_last() {
        let req = request()
            .long_range_ranks(LongRangeRanks::Count(2))
            .rank_order(RankOrder::PpFirst)
            .build()
            .unwrap();
        let topology = assign_duties(
            &req,
            &pme(),
            &big_box(),
            1.1,
            &plan(6, GpuDecision::Disabled),
            &HardwareInventory::default(),
        )
        .unwrap();
        assert_eq!(topology.spatial_ranks(), &[0, 1, 2, 3]);
        assert_eq!(topology.long_range_ranks(), &[4, 5]);
        assert_eq!(topology.assignment(1).unwrap().long_range_peer, Some(4));
        assert_eq!(topology.assignment(2).unwrap().long_range_peer, Some(5));
        check_invariants(&topology);
    }

    #[test]
    fn long_range_ranks_without_mesh_are_fatal() {
        let req = request()
            .long_range_ranks(LongRangeRanks::Count(1))
            .build()
            .unwrap();
        let result = assign_duties(
            &req,
            &InputParameters::default(),
            &big_box(),
            1.1,
            &plan(4, GpuDecision::Disabled),
            &HardwareInventory::default(),
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn too_many_long_range_ranks_are_fatal() {
        let req = request()
            .long_range_ranks(LongRangeRanks::Count(3))
            .build()
            .unwrap();
        assert!(
            assign_duties(
                &req,
                &pme(),
                &big_box(),
                1.1,
                &plan(5, GpuDecision::Disabled),
                &HardwareInventory::default(),
            )
            .is_err()
        );
    }

    #[test]
    fn four_ranks_one_long_range_without_gpu_runs_on_cpu() {
        let req = request()
            .requested_ranks(4)
            .long_range_ranks(LongRangeRanks::Count(1))
            .gpu_policy(GpuPolicy::Auto)
            .build()
            .unwrap();
        let inventory = HardwareInventory {
            hardware_threads: 8,
            ..Default::default()
        };
        let params = pme();
        let plan = planner::plan_resources(&req, &params, 5000, &inventory, None).unwrap();
        assert_eq!(plan.gpu, GpuDecision::Disabled);
        let topology =
            assign_duties(&req, &params, &big_box(), 1.1, &plan, &inventory).unwrap();
        assert_eq!(topology.long_range_ranks().len(), 1);
        assert_eq!(topology.spatial_ranks().len(), 3);
        assert!(topology.assignments().iter().all(|a| a.gpu.is_none()));
        check_invariants(&topology);
    }

    #[test]
    fn single_domain_algorithms_reject_decomposition() {
        let params = InputParameters {
            integrator: IntegratorKind::Nm,
            ..pme()
        };
        let req = request().decomposition_grid([2, 1, 1]).build().unwrap();
        assert!(
            assign_duties(
                &req,
                &params,
                &big_box(),
                1.1,
                &plan(2, GpuDecision::Disabled),
                &HardwareInventory::default(),
            )
            .is_err()
        );

        let topology = assign_duties(
            &request().build().unwrap(),
            &params,
            &big_box(),
            1.1,
            &plan(3, GpuDecision::Disabled),
            &HardwareInventory::default(),
        )
        .unwrap();
        assert!(!topology.grid().is_decomposed());
        assert!(topology.assignments().iter().all(|a| a.duty == Duty::Both));
    }

    #[test]
    fn single_rank_rejects_decomposition_requests_and_screw_pbc() {
        let req = request().decomposition_grid([2, 1, 1]).build().unwrap();
        assert!(
            assign_duties(
                &req,
                &pme(),
                &big_box(),
                1.1,
                &plan(1, GpuDecision::Disabled),
                &HardwareInventory::default(),
            )
            .is_err()
        );
        let screw = InputParameters {
            pbc: PbcType::Screw,
            ..Default::default()
        };
        assert!(
            assign_duties(
                &request().build().unwrap(),
                &screw,
                &big_box(),
                1.1,
                &plan(1, GpuDecision::Disabled),
                &HardwareInventory::default(),
            )
            .is_err()
        );
    }

    #[test]
    fn rerun_with_minimizer_is_fatal() {
        let params = InputParameters {
            integrator: IntegratorKind::Steep,
            ..Default::default()
        };
        let req = request().rerun("traj.trr".into()).build().unwrap();
        assert!(
            assign_duties(
                &req,
                &params,
                &big_box(),
                1.1,
                &plan(1, GpuDecision::Disabled),
                &HardwareInventory::default(),
            )
            .is_err()
        );
    }

    #[test]
    fn gpus_are_assigned_round_robin_or_from_the_explicit_list() {
        let inventory = HardwareInventory {
            hardware_threads: 8,
            gpus: parse_device_list("a,b"),
            ..Default::default()
        };
        let topology = assign_duties(
            &request().build().unwrap(),
            &InputParameters::default(),
            &big_box(),
            1.1,
            &plan(3, GpuDecision::Attempted),
            &inventory,
        )
        .unwrap();
        let gpus: Vec<_> = topology.assignments().iter().map(|a| a.gpu).collect();
        assert_eq!(gpus, vec![Some(0), Some(1), Some(0)]);

        let short = request().gpu_ids(vec![1]).build().unwrap();
        let result = assign_duties(
            &short,
            &InputParameters::default(),
            &big_box(),
            1.1,
            &plan(3, GpuDecision::Attempted),
            &inventory,
        );
        assert!(matches!(result, Err(EngineError::Resource(_))));
    }
}
