use super::mesh::{DispersionCorrection, MeshSolver, NullMesh};
use super::potentials;
use crate::core::geometry;
use crate::core::models::parameters::{InputParameters, PbcType, VdwType};
use crate::core::models::topology::Topology;
use crate::core::neighbor::PairList;
use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Forces on the home particles of a rank, in the order of its home set, with the
/// energy and virial those particles account for.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceOutput {
    pub forces: Vec<Vector3<f64>>,
    pub potential: f64,
    pub virial: Matrix3<f64>,
}

impl ForceOutput {
    pub fn zeros(home: usize) -> Self {
        Self {
            forces: vec![Vector3::zeros(); home],
            potential: 0.0,
            virial: Matrix3::zeros(),
        }
    }
}

/// Short-range interactions evaluated over a pair list.
pub trait ForceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Each pair contributes half its energy and virial per home particle involved, so
    /// summing the outputs of all ranks counts every pair once.
    fn compute(
        &self,
        box_matrix: &Matrix3<f64>,
        positions: &[Vector3<f64>],
        list: &PairList,
    ) -> ForceOutput;

    /// Interaction energy of particle `index` with every other particle.
    fn particle_energy(
        &self,
        box_matrix: &Matrix3<f64>,
        positions: &[Vector3<f64>],
        index: usize,
    ) -> f64;
}

/// Builds the physics collaborators of a rank when it starts running.
pub trait PhysicsFactory: Send + Sync {
    fn force_provider(&self, params: &InputParameters, topology: &Topology)
    -> Box<dyn ForceProvider>;

    fn mesh_solver(&self, params: &InputParameters, topology: &Topology) -> Box<dyn MeshSolver>;
}

/// Pairwise Lennard-Jones and plain Coulomb interactions with the mesh stand-ins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferencePhysics;

impl PhysicsFactory for ReferencePhysics {
    fn force_provider(
        &self,
        params: &InputParameters,
        topology: &Topology,
    ) -> Box<dyn ForceProvider> {
        Box::new(LennardJonesFluid::new(params, topology))
    }

    fn mesh_solver(&self, params: &InputParameters, topology: &Topology) -> Box<dyn MeshSolver> {
        match params.vdw_type {
            VdwType::Pme => Box::new(DispersionCorrection::new(topology, params.rvdw)),
            VdwType::Cutoff => Box::new(NullMesh),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LennardJonesFluid {
    pbc: PbcType,
    rvdw2: f64,
    rcoulomb2: f64,
    topology: Topology,
}

impl LennardJonesFluid {
    pub fn new(params: &InputParameters, topology: &Topology) -> Self {
        Self {
            pbc: params.pbc,
            rvdw2: params.rvdw * params.rvdw,
            rcoulomb2: params.rcoulomb * params.rcoulomb,
            topology: topology.clone(),
        }
    }

    /// Energy and scalar force over distance of one pair at squared distance `r2`.
    #[inline]
    fn pair(&self, i: usize, j: usize, r2: f64) -> (f64, f64) {
        let mut energy = 0.0;
        let mut force = 0.0;
        if r2 < self.rvdw2 {
            let (c6, c12) = self
                .topology
                .pair_lj(self.topology.particle_types[i], self.topology.particle_types[j]);
            let (e, f) = potentials::lennard_jones(r2, c6, c12);
            energy += e;
            force += f;
        }
        if r2 < self.rcoulomb2 {
            let qi = self.topology.particle(i).charge;
            let qj = self.topology.particle(j).charge;
            if qi != 0.0 && qj != 0.0 {
                let (e, f) = potentials::coulomb(r2, qi, qj);
                energy += e;
                force += f;
            }
        }
        (energy, force)
    }

    fn home_entry(
        &self,
        box_matrix: &Matrix3<f64>,
        positions: &[Vector3<f64>],
        i: usize,
        neighbors: &[usize],
    ) -> (Vector3<f64>, f64, Matrix3<f64>) {
        let mut force = Vector3::zeros();
        let mut energy = 0.0;
        let mut virial = Matrix3::zeros();
        for &j in neighbors {
            let dx = geometry::minimum_image(self.pbc, box_matrix, positions[i] - positions[j]);
            let r2 = dx.norm_squared();
            if r2 <= 0.0 {
                continue;
            }
            let (e, f) = self.pair(i, j, r2);
            let fij = dx * f;
            force += fij;
            energy += 0.5 * e;
            virial -= 0.25 * dx * fij.transpose();
        }
        (force, energy, virial)
    }
}

impl ForceProvider for LennardJonesFluid {
    fn name(&self) -> &'static str {
        "lennard-jones"
    }

    fn compute(
        &self,
        box_matrix: &Matrix3<f64>,
        positions: &[Vector3<f64>],
        list: &PairList,
    ) -> ForceOutput {
        let entry = |(i, neighbors): (usize, &[usize])| {
            self.home_entry(box_matrix, positions, i, neighbors)
        };

        #[cfg(feature = "parallel")]
        let entries: Vec<_> = list
            .home
            .par_iter()
            .zip(list.neighbors.par_iter())
            .map(|(&i, n)| entry((i, n.as_slice())))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let entries: Vec<_> = list.iter().map(entry).collect();

        // Summed in home order so the result does not depend on the thread count.
        let mut output = ForceOutput::zeros(0);
        output.forces.reserve(entries.len());
        for (force, energy, virial) in entries {
            output.forces.push(force);
            output.potential += energy;
            output.virial += virial;
        }
        output
    }

    fn particle_energy(
        &self,
        box_matrix: &Matrix3<f64>,
        positions: &[Vector3<f64>],
        index: usize,
    ) -> f64 {
        let cutoff2 = self.rvdw2.max(self.rcoulomb2);
        (0..positions.len())
            .filter(|&j| j != index)
            .filter_map(|j| {
                let r2 = geometry::distance2(self.pbc, box_matrix, &positions[index], &positions[j]);
                (r2 > 0.0 && r2 < cutoff2).then(|| self.pair(index, j, r2).0)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::topology::ParticleType;

    fn dimer_system() -> (InputParameters, Topology, Vec<Vector3<f64>>) {
        let mut topology = Topology::new("dimer");
        let t = topology.add_type(ParticleType::from_sigma_epsilon(39.948, 0.0, 0.34, 0.996));
        topology.add_particles(t, 3);
        let params = InputParameters {
            rvdw: 0.9,
            rcoulomb: 0.9,
            ..Default::default()
        };
        let positions = vec![
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(1.38, 1.0, 1.0),
            Vector3::new(3.0, 3.0, 3.0),
        ];
        (params, topology, positions)
    }

    #[test]
    fn split_home_sets_add_up_to_the_full_system() {
        let (params, topology, x) = dimer_system();
        let b = Matrix3::from_diagonal_element(5.0);
        let provider = ReferencePhysics.force_provider(&params, &topology);

        let all = PairList::build(params.pbc, &b, &x, &[0, 1, 2], 1.0, 0);
        let full = provider.compute(&b, &x, &all);

        let first = provider.compute(&b, &x, &PairList::build(params.pbc, &b, &x, &[0], 1.0, 0));
        let rest = provider.compute(&b, &x, &PairList::build(params.pbc, &b, &x, &[1, 2], 1.0, 0));

        assert!((first.potential + rest.potential - full.potential).abs() < 1e-12);
        assert_eq!(first.forces[0], full.forces[0]);
        assert!((full.forces[0] + full.forces[1]).norm() < 1e-9);
        assert_eq!(full.forces[2], Vector3::zeros());
    }

    #[test]
    fn pair_energy_is_counted_once() {
        let (params, topology, x) = dimer_system();
        let b = Matrix3::from_diagonal_element(5.0);
        let provider = LennardJonesFluid::new(&params, &topology);
        let list = PairList::build(params.pbc, &b, &x, &[0, 1, 2], 1.0, 0);
        let output = provider.compute(&b, &x, &list);
        let p = topology.particle(0);
        let (expected, _) = potentials::lennard_jones(0.38 * 0.38, p.c6, p.c12);
        assert!((output.potential - expected).abs() < 1e-12);
        assert!((provider.particle_energy(&b, &x, 0) - expected).abs() < 1e-12);
        assert_eq!(provider.particle_energy(&b, &x, 2), 0.0);
    }

    #[test]
    fn dispersion_mesh_is_selected_for_lj_pme() {
        let (mut params, topology, _) = dimer_system();
        assert_eq!(ReferencePhysics.mesh_solver(&params, &topology).name(), "none");
        params.vdw_type = VdwType::Pme;
        assert_eq!(
            ReferencePhysics.mesh_solver(&params, &topology).name(),
            "dispersion-correction"
        );
    }
}
