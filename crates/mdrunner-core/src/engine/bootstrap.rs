use super::accounting::{Accounting, AccountingSummary};
use super::comm::{Group, RankComm, build_fabric};
use super::config::RunRequest;
use super::context::{DeformReference, SharedRunContext, StopCondition};
use super::duty::{self, Duty, RankTopology};
use super::error::{EngineError, SharedFailure};
use super::integrators::{Integrator, LongRunningAlgorithm, RunContext, long_range};
use super::lifecycle::{Lifecycle, LifecycleState};
use super::planner::{self, ResourcePlan};
use super::progress::{Progress, ProgressReporter};
use super::resources::ComputePool;
use super::restart::{self, RestoredRun};
use super::run_config::{RunConfig, verify_consistency};
use super::tuner::{self, HardwareClass, ListSettings, TuningInputs};
use crate::core::hardware::{HardwareInventory, HardwareProbe};
use crate::core::io::run_input::RunInput;
use crate::core::neighbor::buffer::{ListSetup, VerletBufferModel};
use crate::core::physics::PhysicsFactory;
use std::cell::RefCell;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Group id of the spatial ranks.
const SPATIAL_GROUP: u32 = 1;

/// What the coordinator decides before any rank exists.
#[derive(Debug)]
pub struct Planning {
    pub input: RunInput,
    pub inventory: HardwareInventory,
    pub plan: ResourcePlan,
}

/// How many ranks the run uses and how many of them this process must spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyPlan {
    pub ranks: usize,
    pub spawn: usize,
}

/// Process-wide collaborators shared by every rank.
#[derive(Clone, Copy)]
pub struct RankEnvironment<'a> {
    pub probe: &'a dyn HardwareProbe,
    pub physics: &'a dyn PhysicsFactory,
    pub shared: &'a SharedRunContext,
}

/// What a rank reports once it has terminated.
#[derive(Debug, Clone)]
pub struct RankOutcome {
    pub rank: usize,
    pub duty: Duty,
    pub stop: StopCondition,
    pub final_step: i64,
    pub config: RunConfig,
    pub accounting: AccountingSummary,
    pub lifecycle: Vec<(LifecycleState, Duration)>,
}

/// Reads the run input, probes the hardware and plans the resources.
///
/// `external_ranks` is the size of a rank set provided by an external launcher.
#[instrument(skip_all, name = "planning")]
pub fn plan(
    request: &RunRequest,
    probe: &dyn HardwareProbe,
    external_ranks: Option<usize>,
) -> Result<Planning, EngineError> {
    let input = RunInput::read(&request.input_path)?;
    info!(
        path = %request.input_path.display(),
        particles = input.particle_count(),
        integrator = %input.params.integrator,
        precision = ?input.precision,
        "Read the run input."
    );
    let inventory = probe.probe()?;
    inventory.log_summary();
    let plan = planner::plan_resources(
        request,
        &input.params,
        input.particle_count(),
        &inventory,
        external_ranks,
    )?;
    Ok(Planning {
        input,
        inventory,
        plan,
    })
}

/// Number of ranks to spawn in-process. Nothing is spawned when the ranks come from an
/// external launcher.
pub fn plan_topology(plan: &ResourcePlan, external_ranks: Option<usize>) -> TopologyPlan {
    match external_ranks {
        Some(ranks) => TopologyPlan { ranks, spawn: 0 },
        None if plan.spawned => TopologyPlan {
            ranks: plan.ranks,
            spawn: plan.ranks.saturating_sub(1),
        },
        None => TopologyPlan {
            ranks: plan.ranks,
            spawn: 0,
        },
    }
}

/// Plans the run, spawns the missing ranks as named threads and runs every rank to
/// completion. Returns the outcomes in rank order.
#[instrument(skip_all, name = "launch")]
pub fn launch(
    request: &RunRequest,
    env: &RankEnvironment<'_>,
    reporter: &ProgressReporter<'_>,
) -> Result<Vec<RankOutcome>, EngineError> {
    let planning = Arc::new(plan(request, env.probe, None)?);
    let topology = plan_topology(&planning.plan, None);
    let mut fabric = build_fabric(topology.ranks).into_iter();
    let coordinator = fabric
        .next()
        .ok_or_else(|| EngineError::Internal("the rank fabric is empty".to_string()))?;

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(topology.spawn);
        for comm in fabric {
            let rank = comm.rank();
            let spawned_request = request.for_spawned_rank();
            let spawned = thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn_scoped(scope, move || {
                    let reporter = ProgressReporter::new();
                    launch_rank(&comm, &spawned_request, env, &reporter, None)
                });
            match spawned {
                Ok(handle) => handles.push((rank, handle)),
                Err(e) => {
                    coordinator.abort();
                    for (_, handle) in handles {
                        let _ = handle.join();
                    }
                    return Err(EngineError::Resource(format!(
                        "could not start rank {}: {}",
                        rank, e
                    )));
                }
            }
        }
        if !handles.is_empty() {
            info!(ranks = topology.ranks, spawned = handles.len(), "Started rank threads.");
        }

        let mut outcomes = Vec::with_capacity(topology.ranks);
        let mut failure = None;
        let results = std::iter::once((0, Ok(launch_rank(
            &coordinator,
            request,
            env,
            reporter,
            Some(planning),
        ))))
        .chain(handles.into_iter().map(|(rank, handle)| (rank, handle.join())));
        for (rank, joined) in results {
            let result = joined.unwrap_or_else(|_| {
                coordinator.abort();
                Err(EngineError::Internal(format!("rank {} panicked", rank)))
            });
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => failure = Some(root_cause(failure, e)),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    })
}

/// Keeps the first failure that is not a consequence of another rank aborting.
fn root_cause(current: Option<EngineError>, next: EngineError) -> EngineError {
    match current {
        Some(current) if !current.is_abort() || next.is_abort() => current,
        _ => next,
    }
}

/// The whole life of one rank. Every rank runs it, the coordinator included; a failure
/// aborts the fabric so that no peer stays blocked.
///
/// The coordinator may bring a finished `planning`; otherwise it plans for the ranks
/// of `comm`.
#[instrument(skip_all, name = "rank", fields(rank = comm.rank()))]
pub fn launch_rank(
    comm: &RankComm,
    request: &RunRequest,
    env: &RankEnvironment<'_>,
    reporter: &ProgressReporter<'_>,
    planning: Option<Arc<Planning>>,
) -> Result<RankOutcome, EngineError> {
    let result = run_rank(comm, request, env, reporter, planning);
    if let Err(e) = &result {
        if e.is_abort() {
            warn!("Stopping: another rank failed.");
        } else {
            error!(error = %e, "Rank failed; aborting the run.");
        }
        comm.abort();
    }
    result
}

fn run_rank(
    comm: &RankComm,
    request: &RunRequest,
    env: &RankEnvironment<'_>,
    reporter: &ProgressReporter<'_>,
    planning: Option<Arc<Planning>>,
) -> Result<RankOutcome, EngineError> {
    let rank = comm.rank();
    let world = comm.world();
    let mut lifecycle = Lifecycle::new(rank);

    // === Phase 1: Planning ===
    reporter.report(Progress::PhaseStart { name: "Planning" });
    let planning = agree(comm, &world, || match planning {
        Some(planning) => Ok(planning),
        None => plan(request, env.probe, Some(comm.size())).map(Arc::new),
    })?;
    let input = &planning.input;
    let params = &input.params;
    lifecycle.advance(LifecycleState::Bootstrapped)?;
    reporter.report(Progress::PhaseFinish);

    // === Phase 2: Duty assignment ===
    reporter.report(Progress::PhaseStart { name: "Assigning Duties" });
    let ranks = agree(comm, &world, || {
        duty::assign_duties(
            request,
            params,
            &input.state.box_matrix,
            params.rlist,
            &planning.plan,
            &planning.inventory,
        )
    })?;
    let assignment = ranks
        .assignment(rank)
        .cloned()
        .ok_or_else(|| EngineError::Internal(format!("rank {} has no assignment", rank)))?;
    lifecycle.advance(LifecycleState::Configured)?;
    reporter.report(Progress::PhaseFinish);

    // === Phase 3: List tuning ===
    reporter.report(Progress::PhaseStart { name: "Tuning Pair List" });
    lifecycle.advance(LifecycleState::Tuning)?;
    let list = agree(comm, &world, || tune(request, &planning, &ranks))?;
    reporter.report(Progress::PhaseFinish);

    // === Phase 4: Restart reconciliation ===
    if request.checkpoint_input.is_some() {
        reporter.report(Progress::PhaseStart { name: "Restoring Checkpoint" });
        lifecycle.advance(LifecycleState::Restoring)?;
    }
    let (restored, deform) = agree(comm, &world, || restore(request, input, &ranks, env.shared))?;
    if let Some(reference) = deform {
        env.shared.record_deform_reference(reference);
    }
    if request.checkpoint_input.is_some() {
        reporter.report(Progress::PhaseFinish);
    }

    let config = RunConfig::new(
        params.integrator,
        params.max_cutoff(),
        &planning.plan,
        ranks,
        list,
        &restored,
    );
    verify_consistency(comm, &world, &config)?;

    // === Phase 5: Commit resources and run ===
    let pool = ComputePool::new(rank, assignment.threads)?;
    let lease = assignment
        .gpu
        .map(|device| env.shared.devices.acquire(device, rank));
    let spatial = if assignment.duty.has_spatial() {
        Some(comm.group(SPATIAL_GROUP, config.ranks.spatial_ranks().to_vec())?)
    } else {
        None
    };
    lifecycle.advance(LifecycleState::Running)?;
    reporter.report(Progress::PhaseStart { name: "Running" });

    let mut state = restored.state.clone();
    let mut history = restored.history.clone();
    let dt = if params.integrator.is_dynamics() { params.dt } else { 0.0 };
    let ctx = RunContext {
        comm,
        spatial: spatial.as_ref(),
        assignment: &assignment,
        config: &config,
        input,
        request,
        shared: env.shared,
        pool: &pool,
        physics: env.physics,
        reporter,
        accounting: RefCell::new(Accounting::new(dt)),
        resumed: restored.is_continuation(),
    };
    let stop = if assignment.duty == Duty::LongRange {
        long_range::serve(&ctx)?
    } else {
        let mut algorithm = Integrator::select(params.integrator);
        info!(algorithm = algorithm.name(), duty = %assignment.duty, "Entering the run loop.");
        algorithm.run(&ctx, &mut state, &mut history)?
    };
    reporter.report(Progress::PhaseFinish);

    // === Phase 6: Teardown ===
    lifecycle.advance(LifecycleState::Finalizing)?;
    let accounting = ctx.accounting.into_inner();
    if let Some(lease) = lease {
        info!(device = lease.device(), "Releasing accelerator.");
    }
    if comm.is_coordinator() {
        accounting.log_summary();
        if let Some(path) = &request.accounting_csv {
            accounting.write_csv(path)?;
            info!(path = %path.display(), "Wrote the accounting table.");
        }
    }
    comm.barrier(&world)?;
    lifecycle.advance(LifecycleState::Terminated)?;

    Ok(RankOutcome {
        rank,
        duty: assignment.duty,
        stop,
        final_step: state.step,
        config,
        accounting: accounting.summary(),
        lifecycle: lifecycle.durations().to_vec(),
    })
}

/// Runs `decide` on the coordinator and hands its result to every rank of `group`.
/// Every rank fails in the same way when the coordinator's decision fails.
fn agree<T: Clone + Send + 'static>(
    comm: &RankComm,
    group: &Group,
    decide: impl FnOnce() -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    if comm.rank() != group.root() {
        return comm
            .broadcast::<Result<T, SharedFailure>>(group, None)?
            .map_err(EngineError::from);
    }
    let decided = decide();
    let shared = match &decided {
        Ok(value) => Ok(value.clone()),
        Err(e) => Err(e.to_shared()),
    };
    comm.broadcast(group, Some(shared))?;
    decided
}

fn tune(
    request: &RunRequest,
    planning: &Planning,
    ranks: &RankTopology,
) -> Result<ListSettings, EngineError> {
    let input = &planning.input;
    let use_gpu = planning.plan.gpu.is_active();
    let model = VerletBufferModel::new(
        &input.params,
        &input.topology,
        input.state.volume(),
        ListSetup::for_gpu(use_gpu),
    );
    let inputs = TuningInputs {
        nstlist_override: request.nstlist_override,
        hardware: HardwareClass::detect(use_gpu, planning.inventory.simd),
        constants: &request.tuning,
        model: &model,
        box_matrix: &input.state.box_matrix,
        grid: ranks.grid(),
    };
    let list = tuner::resolve_list_settings(&input.params, &inputs)?;
    info!(nstlist = list.nstlist, rlist = list.rlist, "Pair-list settings.");
    Ok(list)
}

/// Records the deform reference from the input box, then merges the checkpoint.
fn restore(
    request: &RunRequest,
    input: &RunInput,
    ranks: &RankTopology,
    shared: &SharedRunContext,
) -> Result<(RestoredRun, Option<DeformReference>), EngineError> {
    restart::record_deform_reference(input, shared);
    let checkpoint = restart::load_checkpoint(request)?;
    let restored = restart::reconcile(request, input, checkpoint, ranks)?;
    Ok((restored, shared.deform_reference().copied()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::comm::CommError;
    use crate::engine::planner::GpuDecision;

    fn resource_plan(ranks: usize, spawned: bool) -> ResourcePlan {
        ResourcePlan {
            gpu: GpuDecision::Disabled,
            ranks,
            threads_per_rank: 1,
            long_range_threads: 1,
            particles: 1000,
            spawned,
        }
    }

    #[test]
    fn spawned_plans_start_all_but_the_coordinator() {
        assert_eq!(
            plan_topology(&resource_plan(4, true), None),
            TopologyPlan { ranks: 4, spawn: 3 }
        );
        assert_eq!(
            plan_topology(&resource_plan(1, true), None),
            TopologyPlan { ranks: 1, spawn: 0 }
        );
    }

    #[test]
    fn external_ranks_are_never_spawned() {
        assert_eq!(
            plan_topology(&resource_plan(4, false), Some(4)),
            TopologyPlan { ranks: 4, spawn: 0 }
        );
        assert_eq!(
            plan_topology(&resource_plan(2, false), None),
            TopologyPlan { ranks: 2, spawn: 0 }
        );
    }

    #[test]
    fn coordinator_failures_reach_every_rank() {
        let handles: Vec<_> = build_fabric(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    agree::<u32>(&comm, &comm.world(), || {
                        Err(EngineError::RestartMismatch("particle count".to_string()))
                    })
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.join().unwrap(),
                Err(EngineError::RestartMismatch(_))
            ));
        }
    }

    #[test]
    fn coordinator_decisions_are_shared() {
        let handles: Vec<_> = build_fabric(3)
            .into_iter()
            .map(|comm| {
                let rank = comm.rank();
                thread::spawn(move || agree(&comm, &comm.world(), || Ok(rank * 10 + 7)))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 7);
        }
    }

    #[test]
    fn abort_consequences_do_not_mask_the_root_cause() {
        let aborted = || EngineError::from(CommError::Aborted);
        let cause = root_cause(Some(aborted()), EngineError::Resource("gpu".to_string()));
        assert!(matches!(cause, EngineError::Resource(_)));
        let cause = root_cause(Some(EngineError::Io("disk".to_string())), aborted());
        assert!(matches!(cause, EngineError::Io(_)));
        let cause = root_cause(None, aborted());
        assert!(cause.is_abort());
    }
}
