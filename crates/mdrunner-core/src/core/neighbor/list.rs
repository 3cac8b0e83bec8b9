use crate::core::geometry;
use crate::core::models::parameters::PbcType;
use nalgebra::{Matrix3, Vector3};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// A buffered pair list for the home particles of one rank.
///
/// Every home particle carries the full list of its neighbors, so each pair appears
/// once per home particle involved. Forces on home particles then never need to be
/// communicated back.
#[derive(Debug, Clone, Default)]
pub struct PairList {
    pub radius: f64,
    pub home: Vec<usize>,
    pub neighbors: Vec<Vec<usize>>,
    /// Step the list was built at.
    pub built_at: i64,
}

impl PairList {
    pub fn build(
        pbc: PbcType,
        box_matrix: &Matrix3<f64>,
        positions: &[Vector3<f64>],
        home: &[usize],
        radius: f64,
        step: i64,
    ) -> Self {
        let radius2 = radius * radius;
        let neighbors_of = |&i: &usize| -> Vec<usize> {
            let xi = positions[i];
            (0..positions.len())
                .filter(|&j| j != i && geometry::distance2(pbc, box_matrix, &xi, &positions[j]) < radius2)
                .collect()
        };

        #[cfg(feature = "parallel")]
        let neighbors = home.par_iter().map(neighbors_of).collect();
        #[cfg(not(feature = "parallel"))]
        let neighbors = home.iter().map(neighbors_of).collect();

        Self {
            radius,
            home: home.to_vec(),
            neighbors,
            built_at: step,
        }
    }

    pub fn pair_count(&self) -> usize {
        self.neighbors.iter().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[usize])> {
        self.home
            .iter()
            .copied()
            .zip(self.neighbors.iter().map(Vec::as_slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbors_are_found_across_the_boundary() {
        let b = Matrix3::from_diagonal_element(3.0);
        let x = vec![
            Vector3::new(0.1, 1.5, 1.5),
            Vector3::new(2.9, 1.5, 1.5),
            Vector3::new(1.5, 1.5, 1.5),
        ];
        let list = PairList::build(PbcType::Xyz, &b, &x, &[0, 1, 2], 0.5, 0);
        assert_eq!(list.neighbors[0], vec![1]);
        assert_eq!(list.neighbors[1], vec![0]);
        assert!(list.neighbors[2].is_empty());
        assert_eq!(list.pair_count(), 2);
    }

    #[test]
    fn only_home_particles_get_lists() {
        let b = Matrix3::from_diagonal_element(3.0);
        let x = vec![Vector3::new(1.0, 1.0, 1.0), Vector3::new(1.2, 1.0, 1.0)];
        let list = PairList::build(PbcType::None, &b, &x, &[1], 0.5, 20);
        let entries: Vec<_> = list.iter().collect();
        assert_eq!(entries, vec![(1, &[0usize][..])]);
        assert_eq!(list.built_at, 20);
    }
}
