use super::provider::ForceOutput;
use crate::core::models::topology::Topology;
use nalgebra::{Matrix3, Vector3};
use std::f64::consts::PI;

/// The long-range contribution that can be moved onto dedicated ranks.
///
/// `potential` and `virial` of the output describe the whole system; forces are for the
/// requested home particles only.
pub trait MeshSolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn compute(
        &self,
        box_matrix: &Matrix3<f64>,
        positions: &[Vector3<f64>],
        home: &[usize],
    ) -> ForceOutput;
}

/// No long-range contribution.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMesh;

impl MeshSolver for NullMesh {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compute(&self, _: &Matrix3<f64>, _: &[Vector3<f64>], home: &[usize]) -> ForceOutput {
        ForceOutput::zeros(home.len())
    }
}

/// Dispersion beyond the cutoff for a homogeneous fluid.
///
/// Adds `-2/3 pi N rho <C6> / rc^3` to the energy and `-E` to each diagonal virial
/// element; the forces of a homogeneous fluid cancel.
#[derive(Debug, Clone)]
pub struct DispersionCorrection {
    particles: usize,
    average_c6: f64,
    cutoff: f64,
}

impl DispersionCorrection {
    pub fn new(topology: &Topology, cutoff: f64) -> Self {
        let counts = topology.type_counts();
        let n = topology.particle_count();
        let mut sum = 0.0;
        for (&ti, &ni) in &counts {
            for (&tj, &nj) in &counts {
                sum += (ni * nj) as f64 * topology.pair_lj(ti, tj).0;
            }
        }
        let average_c6 = if n > 0 { sum / (n * n) as f64 } else { 0.0 };
        Self {
            particles: n,
            average_c6,
            cutoff,
        }
    }

    pub fn energy(&self, volume: f64) -> f64 {
        if volume <= 0.0 || self.cutoff <= 0.0 {
            return 0.0;
        }
        let n = self.particles as f64;
        -2.0 / 3.0 * PI * n * (n / volume) * self.average_c6 / self.cutoff.powi(3)
    }
}

impl MeshSolver for DispersionCorrection {
    fn name(&self) -> &'static str {
        "dispersion-correction"
    }

    fn compute(
        &self,
        box_matrix: &Matrix3<f64>,
        _: &[Vector3<f64>],
        home: &[usize],
    ) -> ForceOutput {
        let energy = self.energy(box_matrix.determinant().abs());
        ForceOutput {
            forces: vec![Vector3::zeros(); home.len()],
            potential: energy,
            virial: Matrix3::from_diagonal_element(-energy),
        }
    }
}
