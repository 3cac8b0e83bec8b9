use super::RunContext;
use crate::core::models::parameters::PbcType;
use crate::core::neighbor::PairList;
use crate::core::physics::{ForceOutput, ForceProvider, MeshSolver};
use crate::engine::accounting::Stage;
use crate::engine::error::EngineError;
use nalgebra::{Matrix3, Vector3};
use std::time::Instant;

/// Message tag of requests sent to a long-range rank.
pub(crate) const MESH_REQUEST_TAG: u32 = 100;
/// Message tag of the replies of a long-range rank.
pub(crate) const MESH_REPLY_TAG: u32 = 101;

#[derive(Debug, Clone)]
pub(crate) enum MeshMessage {
    Compute {
        step: i64,
        box_matrix: Matrix3<f64>,
        positions: Vec<Vector3<f64>>,
        home: Vec<usize>,
    },
    /// The sending spatial rank needs no more long-range work.
    Finish,
}

/// How the force computation is split between ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Distribution {
    /// Each spatial rank computes the forces on the particles of its cell; the results
    /// are exchanged so that every rank holds all forces.
    Collective,
    /// Each rank computes all forces on its own.
    Local,
}

enum MeshAccess {
    Local(Box<dyn MeshSolver>),
    Remote { peer: usize },
}

/// Forces, energy and virial of the whole system.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Evaluation {
    pub forces: Vec<Vector3<f64>>,
    pub potential: f64,
    pub virial: Matrix3<f64>,
}

impl Evaluation {
    /// Largest force norm and the particle it acts on.
    pub fn max_force(&self) -> (f64, usize) {
        self.forces
            .iter()
            .enumerate()
            .map(|(i, f)| (f.norm(), i))
            .fold((0.0, 0), |best, cur| if cur.0 > best.0 { cur } else { best })
    }
}

type HomeContribution = (Vec<usize>, Vec<Vector3<f64>>, f64, Matrix3<f64>);

/// Evaluates forces for one rank, keeping the pair list between rebuilds.
pub(crate) struct ForceEvaluator {
    provider: Box<dyn ForceProvider>,
    mesh: MeshAccess,
    distribution: Distribution,
    pbc: PbcType,
    list: Option<PairList>,
}

impl ForceEvaluator {
    pub fn new(ctx: &RunContext<'_>, distribution: Distribution) -> Result<Self, EngineError> {
        let params = &ctx.input.params;
        let topology = &ctx.input.topology;
        if distribution == Distribution::Collective {
            let spatial = ctx.config.ranks.spatial_ranks().len();
            if ctx.config.ranks.grid().count() != spatial {
                return Err(EngineError::Internal(format!(
                    "{} decomposition cells for {} spatial ranks",
                    ctx.config.ranks.grid().count(),
                    spatial
                )));
            }
        }
        let mesh = match (distribution, ctx.assignment.long_range_peer) {
            (Distribution::Collective, Some(peer)) => MeshAccess::Remote { peer },
            _ => MeshAccess::Local(ctx.physics.mesh_solver(params, topology)),
        };
        Ok(Self {
            provider: ctx.physics.force_provider(params, topology),
            mesh,
            distribution,
            pbc: params.pbc,
            list: None,
        })
    }

    pub fn provider(&self) -> &dyn ForceProvider {
        self.provider.as_ref()
    }

    /// Evaluates the forces at `positions`, rebuilding the pair list first when `rebuild`
    /// is set or no list exists. Collective on the spatial group in collective mode.
    pub fn evaluate(
        &mut self,
        ctx: &RunContext<'_>,
        box_matrix: &Matrix3<f64>,
        positions: &[Vector3<f64>],
        step: i64,
        rebuild: bool,
    ) -> Result<Evaluation, EngineError> {
        if rebuild || self.list.is_none() {
            self.rebuild(ctx, box_matrix, positions, step)?;
        }
        let list = self.list.as_ref().ok_or_else(|| {
            EngineError::Internal("the pair list is missing after a rebuild".to_string())
        })?;

        if let MeshAccess::Remote { peer } = self.mesh {
            let start = Instant::now();
            ctx.comm.send(
                peer,
                MESH_REQUEST_TAG,
                MeshMessage::Compute {
                    step,
                    box_matrix: *box_matrix,
                    positions: positions.to_vec(),
                    home: list.home.clone(),
                },
            )?;
            ctx.accounting
                .borrow_mut()
                .add(Stage::Communication, start.elapsed());
        }

        let start = Instant::now();
        let provider = self.provider.as_ref();
        let short_range = ctx
            .pool
            .install(|| provider.compute(box_matrix, positions, list));
        ctx.accounting.borrow_mut().add(Stage::Force, start.elapsed());

        let start = Instant::now();
        let long_range = match &self.mesh {
            MeshAccess::Local(solver) => {
                let mut output = solver.compute(box_matrix, positions, &list.home);
                let counts_energy = self.distribution == Distribution::Local
                    || ctx.assignment.spatial_index == Some(0);
                if !counts_energy {
                    output.potential = 0.0;
                    output.virial = Matrix3::zeros();
                }
                ctx.accounting.borrow_mut().add(Stage::Mesh, start.elapsed());
                output
            }
            MeshAccess::Remote { peer } => {
                let reply: ForceOutput = ctx.comm.recv(*peer, MESH_REPLY_TAG)?;
                ctx.accounting
                    .borrow_mut()
                    .add(Stage::Communication, start.elapsed());
                reply
            }
        };
        if long_range.forces.len() != list.home.len() {
            return Err(EngineError::Internal(format!(
                "the long-range part returned {} forces for {} home particles",
                long_range.forces.len(),
                list.home.len()
            )));
        }

        let home_forces: Vec<Vector3<f64>> = short_range
            .forces
            .iter()
            .zip(&long_range.forces)
            .map(|(a, b)| a + b)
            .collect();
        let local: HomeContribution = (
            list.home.clone(),
            home_forces,
            short_range.potential + long_range.potential,
            short_range.virial + long_range.virial,
        );

        match self.distribution {
            Distribution::Local => Ok(assemble(positions.len(), vec![local])),
            Distribution::Collective => {
                let start = Instant::now();
                let group = ctx.spatial_group()?;
                let all = ctx.comm.all_gather(group, local)?;
                ctx.accounting
                    .borrow_mut()
                    .add(Stage::Communication, start.elapsed());
                Ok(assemble(positions.len(), all))
            }
        }
    }

    fn rebuild(
        &mut self,
        ctx: &RunContext<'_>,
        box_matrix: &Matrix3<f64>,
        positions: &[Vector3<f64>],
        step: i64,
    ) -> Result<(), EngineError> {
        let start = Instant::now();
        let home = match self.distribution {
            Distribution::Local => (0..positions.len()).collect(),
            Distribution::Collective => {
                let cell = ctx.assignment.spatial_index.ok_or_else(|| {
                    EngineError::Internal(format!(
                        "rank {} has no decomposition cell",
                        ctx.comm.rank()
                    ))
                })?;
                ctx.config
                    .ranks
                    .grid()
                    .home_particles(cell, self.pbc, box_matrix, positions)
            }
        };
        let pbc = self.pbc;
        let radius = ctx.config.rlist;
        let list = ctx
            .pool
            .install(|| PairList::build(pbc, box_matrix, positions, &home, radius, step));
        self.list = Some(list);
        ctx.accounting
            .borrow_mut()
            .add(Stage::Neighbor, start.elapsed());
        Ok(())
    }

    /// Tells the long-range peer, if any, that no more requests follow.
    pub fn finish(&self, ctx: &RunContext<'_>) -> Result<(), EngineError> {
        if let MeshAccess::Remote { peer } = self.mesh {
            ctx.comm.send(peer, MESH_REQUEST_TAG, MeshMessage::Finish)?;
        }
        Ok(())
    }
}

/// Places the home forces of every contribution and sums energies in member order.
fn assemble(particles: usize, contributions: Vec<HomeContribution>) -> Evaluation {
    let mut evaluation = Evaluation {
        forces: vec![Vector3::zeros(); particles],
        potential: 0.0,
        virial: Matrix3::zeros(),
    };
    for (home, forces, potential, virial) in contributions {
        for (i, f) in home.into_iter().zip(forces) {
            evaluation.forces[i] = f;
        }
        evaluation.potential += potential;
        evaluation.virial += virial;
    }
    evaluation
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contributions_are_placed_by_home_index() {
        let a = (vec![0, 2], vec![Vector3::x(), Vector3::y()], 1.5, Matrix3::identity());
        let b = (vec![1], vec![Vector3::z()], -0.5, Matrix3::identity());
        let evaluation = assemble(3, vec![a, b]);
        assert_eq!(evaluation.forces, vec![Vector3::x(), Vector3::z(), Vector3::y()]);
        assert_eq!(evaluation.potential, 1.0);
        assert_eq!(evaluation.virial, Matrix3::identity() * 2.0);
        assert_eq!(evaluation.max_force(), (1.0, 0));
    }
}
