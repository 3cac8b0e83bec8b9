use super::fio::Precision;
use super::run_input::RunInput;
use crate::core::models::parameters::InputParameters;
use crate::core::models::state::{BOLTZ, RunState};
use crate::core::models::topology::{ParticleType, Topology};
use nalgebra::{Matrix3, Vector3};
use rand::prelude::*;
use serde::Deserialize;
use std::f64::consts::PI;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("TOML parsing error for '{path}': {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid system description: {0}")]
    Invalid(String),
}

/// One particle species, given in the usual sigma/epsilon form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Species {
    pub mass: f64,
    #[serde(default)]
    pub charge: f64,
    /// nm
    pub sigma: f64,
    /// kJ/mol
    pub epsilon: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Lattice {
    /// Number of lattice cells along x, y and z; one particle per cell.
    pub cells: [usize; 3],
    /// Lattice constant in nm.
    pub spacing: f64,
}

/// A simple simulation system: a cubic lattice filled with the listed species in turn.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SystemDescription {
    pub name: String,
    #[serde(default)]
    pub parameters: InputParameters,
    pub lattice: Lattice,
    pub species: Vec<Species>,
    /// Temperature for the initial velocities in K; zero starts at rest.
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub single_precision: bool,
}

impl SystemDescription {
    pub fn load(path: &Path) -> Result<Self, DescriptionError> {
        let content = std::fs::read_to_string(path).map_err(|e| DescriptionError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| DescriptionError::Toml {
            path: path.to_string_lossy().to_string(),
            source: e,
        })
    }

    fn validate(&self) -> Result<(), DescriptionError> {
        if self.species.is_empty() {
            return Err(DescriptionError::Invalid(
                "at least one species is required".to_string(),
            ));
        }
        if self.lattice.cells.iter().any(|&n| n == 0) || self.lattice.spacing <= 0.0 {
            return Err(DescriptionError::Invalid(
                "lattice cells and spacing must be positive".to_string(),
            ));
        }
        if let Some(s) = self.species.iter().find(|s| s.mass <= 0.0) {
            return Err(DescriptionError::Invalid(format!(
                "species mass must be positive, found {}",
                s.mass
            )));
        }
        if self.temperature < 0.0 {
            return Err(DescriptionError::Invalid(
                "temperature cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the run input: lattice positions, species assigned cyclically and
    /// Maxwell-Boltzmann velocities drawn from the parameter seed.
    pub fn build(&self) -> Result<RunInput, DescriptionError> {
        self.validate()?;

        let mut topology = Topology::new(self.name.clone());
        for s in &self.species {
            topology.add_type(ParticleType::from_sigma_epsilon(
                s.mass, s.charge, s.sigma, s.epsilon,
            ));
        }

        let [nx, ny, nz] = self.lattice.cells;
        let a = self.lattice.spacing;
        let mut positions = Vec::with_capacity(nx * ny * nz);
        for i in 0..nx {
            for j in 0..ny {
                for k in 0..nz {
                    let t = positions.len() % self.species.len();
                    topology.particle_types.push(t);
                    positions.push(Vector3::new(
                        (i as f64 + 0.5) * a,
                        (j as f64 + 0.5) * a,
                        (k as f64 + 0.5) * a,
                    ));
                }
            }
        }

        let box_matrix = Matrix3::from_diagonal(&Vector3::new(
            nx as f64 * a,
            ny as f64 * a,
            nz as f64 * a,
        ));
        let mut state = RunState::new(box_matrix, positions);
        state.step = self.parameters.init_step;
        state.time = self.parameters.init_step as f64 * self.parameters.dt;
        if self.temperature > 0.0 {
            state.velocities =
                maxwell_boltzmann(&topology, self.temperature, self.parameters.seed);
        }

        Ok(RunInput {
            params: self.parameters.clone(),
            topology,
            state,
            precision: if self.single_precision {
                Precision::Single
            } else {
                Precision::Double
            },
        })
    }
}

/// Draws velocities for temperature `t` and removes the center-of-mass motion.
pub fn maxwell_boltzmann(topology: &Topology, t: f64, seed: u64) -> Vec<Vector3<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut gaussian = move || {
        let u1: f64 = rng.r#gen::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = rng.r#gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    };

    let n = topology.particle_count();
    let mut velocities: Vec<Vector3<f64>> = (0..n)
        .map(|i| {
            let sd = (BOLTZ * t / topology.mass(i)).sqrt();
            Vector3::new(gaussian() * sd, gaussian() * sd, gaussian() * sd)
        })
        .collect();

    let total_mass: f64 = (0..n).map(|i| topology.mass(i)).sum();
    if total_mass > 0.0 {
        let com = velocities
            .iter()
            .enumerate()
            .fold(Vector3::zeros(), |acc, (i, v)| acc + v * topology.mass(i))
            / total_mass;
        for v in &mut velocities {
            *v -= com;
        }
    }
    velocities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::parameters::IntegratorKind;
    use tempfile::tempdir;

    const DESCRIPTION: &str = r#"
name = "argon neon mix"
temperature = 120.0

[parameters]
integrator = "sd"
nsteps = 1000
ref-t = 120.0
thermostat = "v-rescale"
seed = 4

[lattice]
cells = [4, 4, 4]
spacing = 0.4

[[species]]
mass = 39.948
sigma = 0.34
epsilon = 0.996

[[species]]
mass = 20.18
sigma = 0.28
epsilon = 0.3
"#;

    #[test]
    fn description_builds_a_lattice_run_input() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system.toml");
        std::fs::write(&path, DESCRIPTION).unwrap();

        let description = SystemDescription::load(&path).unwrap();
        let input = description.build().unwrap();
        assert_eq!(input.params.integrator, IntegratorKind::Sd);
        assert_eq!(input.params.nsteps, 1000);
        assert_eq!(input.particle_count(), 64);
        assert_eq!(input.topology.type_counts()[&0], 32);
        assert!((input.state.volume() - 1.6_f64.powi(3)).abs() < 1e-12);

        let momentum = input
            .state
            .velocities
            .iter()
            .enumerate()
            .fold(Vector3::zeros(), |acc, (i, v)| acc + v * input.topology.mass(i));
        assert!(momentum.norm() < 1e-9);
    }

    #[test]
    fn velocities_depend_only_on_seed() {
        let description: SystemDescription = toml::from_str(DESCRIPTION).unwrap();
        let a = description.build().unwrap();
        let b = description.build().unwrap();
        assert_eq!(a.state.velocities, b.state.velocities);

        let mut other = description.clone();
        other.parameters.seed = 5;
        assert_ne!(other.build().unwrap().state.velocities, a.state.velocities);
    }

    #[test]
    fn unknown_keys_and_empty_species_are_rejected() {
        assert!(toml::from_str::<SystemDescription>("name = \"x\"\nbogus = 1\n").is_err());
        let mut description: SystemDescription = toml::from_str(DESCRIPTION).unwrap();
        description.species.clear();
        assert!(matches!(
            description.build(),
            Err(DescriptionError::Invalid(_))
        ));
    }
}
