use super::comm::{Group, RankComm};
use super::duty::RankTopology;
use super::error::EngineError;
use super::planner::{GpuDecision, ResourcePlan};
use super::restart::RestoredRun;
use super::tuner::ListSettings;
use crate::core::models::parameters::IntegratorKind;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// The finalized runtime parameters. Every rank holds an identical copy.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub integrator: IntegratorKind,
    pub nstlist: i32,
    pub rlist: f64,
    pub cutoff: f64,
    pub gpu: GpuDecision,
    pub threads_per_rank: usize,
    pub long_range_threads: usize,
    pub ranks: RankTopology,
    pub init_step: i64,
    pub start_step: i64,
    pub last_step: Option<i64>,
}

impl RunConfig {
    pub fn new(
        integrator: IntegratorKind,
        cutoff: f64,
        plan: &ResourcePlan,
        ranks: RankTopology,
        list: ListSettings,
        restored: &RestoredRun,
    ) -> Self {
        Self {
            integrator,
            nstlist: list.nstlist,
            rlist: list.rlist,
            cutoff,
            gpu: plan.gpu,
            threads_per_rank: plan.threads_per_rank,
            long_range_threads: plan.long_range_threads,
            ranks,
            init_step: restored.init_step,
            start_step: restored.state.step,
            last_step: restored.last_step,
        }
    }

    /// A digest of every field; reals are hashed by their bit patterns.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.integrator.hash(&mut hasher);
        self.nstlist.hash(&mut hasher);
        self.rlist.to_bits().hash(&mut hasher);
        self.cutoff.to_bits().hash(&mut hasher);
        self.gpu.hash(&mut hasher);
        self.threads_per_rank.hash(&mut hasher);
        self.long_range_threads.hash(&mut hasher);
        self.ranks.hash(&mut hasher);
        self.init_step.hash(&mut hasher);
        self.start_step.hash(&mut hasher);
        self.last_step.hash(&mut hasher);
        hasher.finish()
    }

    /// Whether `step` rebuilds the pair list.
    pub fn is_list_step(&self, step: i64) -> bool {
        self.nstlist <= 1 || (step - self.init_step) % self.nstlist as i64 == 0
    }
}

/// Gathers the fingerprints of all ranks and fails unless they agree.
pub fn verify_consistency(
    comm: &RankComm,
    group: &Group,
    config: &RunConfig,
) -> Result<(), EngineError> {
    let local = config.fingerprint();
    let all = comm.all_gather(group, local)?;
    if let Some((rank, other)) = all
        .iter()
        .enumerate()
        .find(|(_, fingerprint)| **fingerprint != all[0])
    {
        return Err(EngineError::Internal(format!(
            "the run configuration differs between ranks ({:016x} on rank {}, {:016x} on rank {})",
            all[0],
            group.members()[0],
            other,
            group.members()[rank]
        )));
    }
    debug!(fingerprint = format!("{:016x}", local), "Run configuration is consistent.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hardware::HardwareInventory;
    use crate::core::models::parameters::InputParameters;
    use crate::core::models::state::RunState;
    use crate::engine::comm::build_fabric;
    use crate::engine::config::RunRequestBuilder;
    use crate::engine::duty;
    use nalgebra::Matrix3;
    use std::thread;

    fn config(rlist: f64) -> RunConfig {
        let plan = ResourcePlan {
            gpu: GpuDecision::Disabled,
            ranks: 2,
            threads_per_rank: 1,
            long_range_threads: 1,
            particles: 1000,
            spawned: true,
        };
        let request = RunRequestBuilder::new()
            .input_path("run.tpr".into())
            .build()
            .unwrap();
        let params = InputParameters::default();
        let box_matrix = Matrix3::from_diagonal_element(5.0);
        let ranks = duty::assign_duties(
            &request,
            &params,
            &box_matrix,
            1.0,
            &plan,
            &HardwareInventory::default(),
        )
        .unwrap();
        let restored = RestoredRun {
            state: RunState::new(box_matrix, Vec::new()),
            history: Default::default(),
            init_step: 0,
            last_step: Some(100),
            resumed_from: None,
        };
        RunConfig::new(
            params.integrator,
            1.0,
            &plan,
            ranks,
            ListSettings { nstlist: 10, rlist },
            &restored,
        )
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        assert_eq!(config(1.1).fingerprint(), config(1.1).fingerprint());
        assert_ne!(config(1.1).fingerprint(), config(1.1 + 1e-12).fingerprint());
    }

    #[test]
    fn list_steps_follow_the_interval() {
        let c = config(1.1);
        assert!(c.is_list_step(0));
        assert!(!c.is_list_step(5));
        assert!(c.is_list_step(20));
    }

    #[test]
    fn differing_configurations_are_detected() {
        let handles: Vec<_> = build_fabric(2)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rlist = if comm.rank() == 0 { 1.1 } else { 1.2 };
                    verify_consistency(&comm, &comm.world(), &config(rlist))
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.join().unwrap(),
                Err(EngineError::Internal(_))
            ));
        }
    }
}
