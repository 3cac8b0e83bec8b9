use crate::core::models::state::ONE_4PI_EPS0;

/// Lennard-Jones energy and scalar force divided by distance, from `C6`/`C12`.
#[inline]
pub fn lennard_jones(r2: f64, c6: f64, c12: f64) -> (f64, f64) {
    let rinv2 = 1.0 / r2;
    let rinv6 = rinv2 * rinv2 * rinv2;
    let repulsion = c12 * rinv6 * rinv6;
    let dispersion = c6 * rinv6;
    (repulsion - dispersion, (12.0 * repulsion - 6.0 * dispersion) * rinv2)
}

/// Plain Coulomb energy and scalar force divided by distance.
#[inline]
pub fn coulomb(r2: f64, qi: f64, qj: f64) -> (f64, f64) {
    let rinv = r2.sqrt().recip();
    let energy = ONE_4PI_EPS0 * qi * qj * rinv;
    (energy, energy * rinv * rinv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lennard_jones_force_vanishes_at_the_minimum() {
        let (c6, c12) = (2.0e-3, 1.0e-6);
        let r_min2 = (2.0_f64 * c12 / c6).powf(1.0 / 3.0);
        let (energy, force) = lennard_jones(r_min2, c6, c12);
        assert!(force.abs() < 1e-9);
        assert!((energy + c6 * c6 / (4.0 * c12)).abs() < 1e-12);
    }

    #[test]
    fn like_charges_repel() {
        let (energy, force) = coulomb(0.25, 1.0, 1.0);
        assert!((energy - 2.0 * ONE_4PI_EPS0).abs() < 1e-9);
        assert!(force > 0.0);
    }
}
