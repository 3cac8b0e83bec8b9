use crate::core::models::parameters::InputParameters;
use crate::core::models::state::{BOLTZ, ONE_4PI_EPS0};
use crate::core::models::topology::Topology;
use std::f64::consts::{PI, SQRT_2};

/// Buffer radii are rounded up to this resolution in nm.
const RLIST_RESOLUTION: f64 = 1e-3;

/// Upper bound for the buffer search in nm.
const MAX_BUFFER: f64 = 2.0;

/// Cluster sizes of the cluster-pair list, which decide how many pairs beyond the
/// list radius are included for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListSetup {
    pub cluster_i: usize,
    pub cluster_j: usize,
}

impl ListSetup {
    pub const CPU: Self = Self {
        cluster_i: 4,
        cluster_j: 4,
    };
    pub const GPU: Self = Self {
        cluster_i: 8,
        cluster_j: 4,
    };

    pub fn for_gpu(use_gpu: bool) -> Self {
        if use_gpu { Self::GPU } else { Self::CPU }
    }

    /// Average distance by which the cluster pairs extend beyond the list radius.
    pub fn effective_increment(self, density: f64) -> f64 {
        if density <= 0.0 {
            return 0.0;
        }
        let volume_i = (self.cluster_i as f64 - 1.0) / density;
        let volume_j = (self.cluster_j as f64 - 1.0) / density;
        0.25 * (volume_i + volume_j).cbrt()
    }
}

/// Maps a list refresh interval to the list radius it requires.
pub trait ListBufferModel: Send + Sync {
    /// Smallest list radius that keeps the drift within the tolerance when the list
    /// is rebuilt every `nstlist` steps.
    fn list_radius(&self, nstlist: i32) -> f64;

    /// Effective increment of the list radius due to the cluster setup.
    fn effective_increment(&self) -> f64;
}

struct PairClass {
    /// Fraction of the particles belonging to the i type times the density of the j type.
    weight: f64,
    /// Magnitude of the potential derivative at the cutoff.
    derivative: f64,
    /// Relative displacement variance per ps^2.
    variance_rate: f64,
}

/// Energy-drift estimate from Gaussian particle displacements over the list lifetime.
///
/// A pair that starts outside the list radius but drifts inside the cutoff before the
/// next rebuild is missed; its energy error is linear in the penetration depth.
pub struct VerletBufferModel {
    classes: Vec<PairClass>,
    cutoff: f64,
    dt: f64,
    tolerance: f64,
    increment: f64,
}

impl VerletBufferModel {
    pub fn new(
        params: &InputParameters,
        topology: &Topology,
        volume: f64,
        setup: ListSetup,
    ) -> Self {
        let natoms = topology.particle_count().max(1) as f64;
        let kt = BOLTZ * params.ref_t.max(0.0);
        let cutoff = params.max_cutoff();
        let counts = topology.type_counts();

        let mut classes = Vec::new();
        for (&ti, &ni) in &counts {
            for (&tj, &nj) in &counts {
                let a = &topology.types[ti];
                let b = &topology.types[tj];
                let (c6, c12) = topology.pair_lj(ti, tj);
                let lj = (12.0 * c12 / params.rvdw.powi(13) - 6.0 * c6 / params.rvdw.powi(7)).abs();
                let coulomb = (ONE_4PI_EPS0 * a.charge * b.charge / params.rcoulomb.powi(2)).abs();
                classes.push(PairClass {
                    weight: (ni as f64 / natoms) * (nj as f64 / volume),
                    derivative: lj + coulomb,
                    variance_rate: kt * (1.0 / a.mass + 1.0 / b.mass),
                });
            }
        }

        let density = natoms / volume;
        Self {
            classes,
            cutoff,
            dt: params.dt,
            tolerance: params.verlet_buffer_tolerance,
            increment: setup.effective_increment(density),
        }
    }

    /// Expected energy error per particle over one list lifetime with buffer `rb`.
    pub fn drift(&self, nstlist: i32, buffer: f64) -> f64 {
        let lifetime = (nstlist - 1).max(0) as f64 * self.dt;
        let area = 4.0 * PI * self.cutoff * self.cutoff;
        self.classes
            .iter()
            .map(|c| {
                let variance = c.variance_rate * lifetime * lifetime;
                if variance <= 0.0 {
                    return 0.0;
                }
                let sigma = variance.sqrt();
                0.5 * c.weight * area * c.derivative * variance * penetration(buffer / sigma)
            })
            .sum()
    }
}

impl ListBufferModel for VerletBufferModel {
    fn list_radius(&self, nstlist: i32) -> f64 {
        let target = self.tolerance * nstlist.max(1) as f64 * self.dt;
        let buffer = if self.drift(nstlist, 0.0) <= target {
            0.0
        } else {
            let mut lo = 0.0;
            let mut hi = MAX_BUFFER;
            for _ in 0..60 {
                let mid = 0.5 * (lo + hi);
                if self.drift(nstlist, mid) > target {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            hi
        };
        round_up(self.cutoff + buffer)
    }

    fn effective_increment(&self) -> f64 {
        self.increment
    }
}

fn round_up(r: f64) -> f64 {
    (r / RLIST_RESOLUTION - 1e-9).ceil() * RLIST_RESOLUTION
}

/// Second moment of the part of a standard normal distribution beyond `x`, halved.
fn penetration(x: f64) -> f64 {
    let density = (-0.5 * x * x).exp() / (2.0 * PI).sqrt();
    let tail = 0.5 * erfc(x / SQRT_2);
    (0.5 * ((1.0 + x * x) * tail - x * density)).max(0.0)
}

/// Complementary error function with a fractional error below 1.2e-7.
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87
                                    + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let r = t * poly.exp();
    if x >= 0.0 { r } else { 2.0 - r }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::parameters::Thermostat;
    use crate::core::models::topology::ParticleType;

    fn argon(n: usize) -> Topology {
        let mut topology = Topology::new("argon");
        let t = topology.add_type(ParticleType::from_sigma_epsilon(39.948, 0.0, 0.34, 0.996));
        topology.add_particles(t, n);
        topology
    }

    fn params() -> InputParameters {
        InputParameters {
            thermostat: Thermostat::VRescale,
            ref_t: 120.0,
            verlet_buffer_tolerance: 1e-5,
            rvdw: 1.0,
            rcoulomb: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn erfc_matches_known_values() {
        assert!((erfc(0.0) - 1.0).abs() < 1e-6);
        assert!((erfc(1.0) - 0.157_299_207).abs() < 1e-6);
        assert!((erfc(-1.0) - 1.842_700_793).abs() < 1e-6);
    }

    #[test]
    fn drift_falls_with_buffer_and_rises_with_interval() {
        let model = VerletBufferModel::new(&params(), &argon(1000), 50.0, ListSetup::CPU);
        assert!(model.drift(10, 0.0) > model.drift(10, 0.05));
        assert!(model.drift(40, 0.05) > model.drift(10, 0.05));
        assert_eq!(model.drift(1, 0.0), 0.0);
    }

    #[test]
    fn list_radius_grows_monotonically_with_interval() {
        let model = VerletBufferModel::new(&params(), &argon(1000), 50.0, ListSetup::CPU);
        let radii: Vec<f64> = [10, 20, 25, 40].iter().map(|&n| model.list_radius(n)).collect();
        assert!(radii[0] >= 1.0);
        assert!(radii.windows(2).all(|w| w[0] <= w[1]));
        assert!(radii[3] > radii[0]);
    }

    #[test]
    fn radius_is_rounded_to_the_resolution() {
        assert!((round_up(1.0) - 1.0).abs() < 1e-12);
        assert!((round_up(1.0004) - 1.001).abs() < 1e-12);
    }

    #[test]
    fn gpu_clusters_extend_further() {
        let density = 20.0;
        assert!(
            ListSetup::GPU.effective_increment(density)
                > ListSetup::CPU.effective_increment(density)
        );
        assert_eq!(ListSetup::CPU.effective_increment(0.0), 0.0);
    }
}
