use serde::Deserialize;
use std::collections::BTreeMap;

/// Interaction parameters of one particle type.
///
/// Lennard-Jones parameters are stored in their `C6`/`C12` form; pair parameters
/// are obtained by geometric combination.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ParticleType {
    pub mass: f64,
    #[serde(default)]
    pub charge: f64,
    pub c6: f64,
    pub c12: f64,
}

impl ParticleType {
    pub fn from_sigma_epsilon(mass: f64, charge: f64, sigma: f64, epsilon: f64) -> Self {
        let s6 = sigma.powi(6);
        Self {
            mass,
            charge,
            c6: 4.0 * epsilon * s6,
            c12: 4.0 * epsilon * s6 * s6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Topology {
    pub name: String,
    pub types: Vec<ParticleType>,
    /// Type index of every particle.
    pub particle_types: Vec<usize>,
}

impl Topology {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_type(&mut self, particle_type: ParticleType) -> usize {
        self.types.push(particle_type);
        self.types.len() - 1
    }

    pub fn add_particles(&mut self, type_index: usize, count: usize) {
        self.particle_types
            .extend(std::iter::repeat(type_index).take(count));
    }

    pub fn particle_count(&self) -> usize {
        self.particle_types.len()
    }

    #[inline]
    pub fn particle(&self, index: usize) -> &ParticleType {
        &self.types[self.particle_types[index]]
    }

    pub fn mass(&self, index: usize) -> f64 {
        self.particle(index).mass
    }

    pub fn total_charge(&self) -> f64 {
        self.particle_types
            .iter()
            .map(|&t| self.types[t].charge)
            .sum()
    }

    /// Geometric combination of the Lennard-Jones parameters of two types.
    #[inline]
    pub fn pair_lj(&self, type_a: usize, type_b: usize) -> (f64, f64) {
        let a = &self.types[type_a];
        let b = &self.types[type_b];
        ((a.c6 * b.c6).sqrt(), (a.c12 * b.c12).sqrt())
    }

    /// Number of particles of each type, in type order, skipping unused types.
    pub fn type_counts(&self) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for &t in &self.particle_types {
            *counts.entry(t).or_insert(0) += 1;
        }
        counts
    }

    /// Degrees of freedom used for the kinetic temperature.
    pub fn degrees_of_freedom(&self) -> f64 {
        let n = self.particle_count() as f64;
        (3.0 * n - 3.0).max(1.0)
    }
}
