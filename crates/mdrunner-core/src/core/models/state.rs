use nalgebra::{Matrix3, Vector3};

/// Boltzmann constant in kJ/(mol K).
pub const BOLTZ: f64 = 0.008_314_462_618;

/// Coulomb's constant in kJ mol^-1 nm e^-2.
pub const ONE_4PI_EPS0: f64 = 138.935_458;

/// The evolving part of a simulation.
///
/// The box is stored with one box vector per row, as `box.row(0)` = a, and so on.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub step: i64,
    pub time: f64,
    pub box_matrix: Matrix3<f64>,
    pub positions: Vec<Vector3<f64>>,
    pub velocities: Vec<Vector3<f64>>,
    /// Friction variable of the Nose-Hoover thermostat.
    pub thermostat_xi: f64,
}

impl RunState {
    pub fn new(box_matrix: Matrix3<f64>, positions: Vec<Vector3<f64>>) -> Self {
        let velocities = vec![Vector3::zeros(); positions.len()];
        Self {
            step: 0,
            time: 0.0,
            box_matrix,
            positions,
            velocities,
            thermostat_xi: 0.0,
        }
    }

    pub fn particle_count(&self) -> usize {
        self.positions.len()
    }

    pub fn volume(&self) -> f64 {
        self.box_matrix.determinant().abs()
    }

    /// Kinetic energy given per-particle masses.
    pub fn kinetic_energy(&self, masses: impl Fn(usize) -> f64) -> f64 {
        self.velocities
            .iter()
            .enumerate()
            .map(|(i, v)| 0.5 * masses(i) * v.norm_squared())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_at_rest() {
        let state = RunState::new(
            Matrix3::from_diagonal_element(2.0),
            vec![Vector3::new(0.1, 0.2, 0.3); 4],
        );
        assert_eq!(state.velocities.len(), 4);
        assert_eq!(state.kinetic_energy(|_| 1.0), 0.0);
        assert!((state.volume() - 8.0).abs() < 1e-12);
    }
}
