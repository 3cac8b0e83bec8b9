use crate::core::models::parameters::PbcType;
use nalgebra::{Matrix3, Vector3};

/// Square of the largest cutoff that the periodic box supports.
///
/// Half the shortest box vector limits the cutoff through the minimum-image
/// convention, and the shortest perpendicular extent limits it through the grid
/// search. Only the bounded dimensions count.
pub fn max_cutoff2(pbc: PbcType, box_matrix: &Matrix3<f64>) -> f64 {
    let a = box_matrix.row(0);
    let b = box_matrix.row(1);
    let c = box_matrix.row(2);

    let mut min_hv2 = 0.25 * a.norm_squared().min(b.norm_squared());
    if pbc != PbcType::Xy {
        min_hv2 = min_hv2.min(0.25 * c.norm_squared());
    }

    let min_ss = if pbc == PbcType::Xy {
        box_matrix[(0, 0)].min(box_matrix[(1, 1)])
    } else {
        box_matrix[(0, 0)]
            .min(box_matrix[(1, 1)] - box_matrix[(2, 1)].abs())
            .min(box_matrix[(2, 2)])
    };

    min_hv2.min(min_ss * min_ss)
}

/// Shifts `dx` to its minimum image in a lower-triangular box.
///
/// Screw boundaries are treated as fully periodic here.
pub fn minimum_image(pbc: PbcType, box_matrix: &Matrix3<f64>, mut dx: Vector3<f64>) -> Vector3<f64> {
    let dims = pbc.bounded_dims();
    for d in (0..dims).rev() {
        let shift = box_matrix.row(d).transpose();
        let length = box_matrix[(d, d)];
        if length <= 0.0 {
            continue;
        }
        while dx[d] > 0.5 * length {
            dx -= shift;
        }
        while dx[d] < -0.5 * length {
            dx += shift;
        }
    }
    dx
}

pub fn distance2(
    pbc: PbcType,
    box_matrix: &Matrix3<f64>,
    a: &Vector3<f64>,
    b: &Vector3<f64>,
) -> f64 {
    minimum_image(pbc, box_matrix, a - b).norm_squared()
}

/// Puts a position inside the unit cell along every bounded dimension.
pub fn put_in_box(pbc: PbcType, box_matrix: &Matrix3<f64>, mut x: Vector3<f64>) -> Vector3<f64> {
    let dims = pbc.bounded_dims();
    for d in (0..dims).rev() {
        let shift = box_matrix.row(d).transpose();
        let length = box_matrix[(d, d)];
        if length <= 0.0 {
            continue;
        }
        while x[d] < 0.0 {
            x += shift;
        }
        while x[d] >= length {
            x -= shift;
        }
    }
    x
}

/// Fractional coordinate of `x` along box vector `d`, in `[0, 1)` for a wrapped position.
pub fn fractional(box_matrix: &Matrix3<f64>, x: &Vector3<f64>, d: usize) -> f64 {
    let mut remaining = *x;
    for e in ((d + 1)..3).rev() {
        let length = box_matrix[(e, e)];
        if length > 0.0 {
            remaining -= box_matrix.row(e).transpose() * (remaining[e] / length);
        }
    }
    let length = box_matrix[(d, d)];
    if length > 0.0 { remaining[d] / length } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cubic_box_allows_half_its_edge() {
        let b = Matrix3::from_diagonal_element(4.0);
        assert!((max_cutoff2(PbcType::Xyz, &b) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn xy_pbc_ignores_the_z_vector() {
        let b = Matrix3::from_diagonal(&Vector3::new(4.0, 5.0, 1.0));
        assert!((max_cutoff2(PbcType::Xy, &b) - 4.0).abs() < 1e-12);
        assert!((max_cutoff2(PbcType::Xyz, &b) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn triclinic_tilt_reduces_the_limit() {
        let b = Matrix3::new(4.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 2.5, 4.0);
        let limit = max_cutoff2(PbcType::Xyz, &b);
        assert!((limit - 1.5 * 1.5).abs() < 1e-12);
    }

    #[test]
    fn minimum_image_and_wrapping_are_consistent() {
        let b = Matrix3::from_diagonal_element(3.0);
        let dx = minimum_image(PbcType::Xyz, &b, Vector3::new(2.5, -2.0, 0.5));
        assert!((dx - Vector3::new(-0.5, 1.0, 0.5)).norm() < 1e-12);

        let wrapped = put_in_box(PbcType::Xyz, &b, Vector3::new(-0.5, 3.5, 7.0));
        assert!((wrapped - Vector3::new(2.5, 0.5, 1.0)).norm() < 1e-12);
        assert!((fractional(&b, &wrapped, 0) - 2.5 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn xy_pbc_leaves_z_alone() {
        let b = Matrix3::from_diagonal_element(3.0);
        let dx = minimum_image(PbcType::Xy, &b, Vector3::new(0.0, 0.0, 2.9));
        assert_eq!(dx.z, 2.9);
    }
}
