use super::error::EngineError;
use crate::core::geometry;
use crate::core::models::parameters::PbcType;
use nalgebra::{Matrix3, Vector3};

/// A regular grid of decomposition cells, one per spatial rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellGrid {
    pub cells: [usize; 3],
}

impl CellGrid {
    pub const SINGLE: Self = Self { cells: [1, 1, 1] };

    pub fn count(&self) -> usize {
        self.cells.iter().product()
    }

    pub fn is_decomposed(&self) -> bool {
        self.count() > 1
    }

    /// Width of the cells along every decomposed dimension.
    fn cell_widths(&self, box_matrix: &Matrix3<f64>) -> impl Iterator<Item = f64> + '_ {
        let diagonal = [box_matrix[(0, 0)], box_matrix[(1, 1)], box_matrix[(2, 2)]];
        (0..3)
            .filter(|&d| self.cells[d] > 1)
            .map(move |d| diagonal[d] / self.cells[d] as f64)
    }

    /// Whether every cell is at least `radius` wide, so that only neighboring cells
    /// interact.
    pub fn supports_radius(&self, box_matrix: &Matrix3<f64>, radius: f64) -> bool {
        self.cell_widths(box_matrix).all(|w| w >= radius)
    }

    /// Volume of the halo a cell imports for interactions up to `radius`, relative to
    /// the cell volume.
    fn halo_cost(&self, box_matrix: &Matrix3<f64>, radius: f64) -> f64 {
        self.cell_widths(box_matrix)
            .map(|w| 1.0 + radius / w)
            .product::<f64>()
            - 1.0
    }

    /// Index of the cell containing `x`, numbered with z fastest.
    pub fn cell_of(&self, pbc: PbcType, box_matrix: &Matrix3<f64>, x: &Vector3<f64>) -> usize {
        let wrapped = geometry::put_in_box(pbc, box_matrix, *x);
        let mut index = 0;
        for d in 0..3 {
            let n = self.cells[d];
            let c = if n > 1 {
                let f = geometry::fractional(box_matrix, &wrapped, d);
                ((f * n as f64).floor().max(0.0) as usize).min(n - 1)
            } else {
                0
            };
            index = index * n + c;
        }
        index
    }

    /// Particles whose cell is `cell`, in ascending order.
    pub fn home_particles(
        &self,
        cell: usize,
        pbc: PbcType,
        box_matrix: &Matrix3<f64>,
        positions: &[Vector3<f64>],
    ) -> Vec<usize> {
        if !self.is_decomposed() {
            return (0..positions.len()).collect();
        }
        positions
            .iter()
            .enumerate()
            .filter(|(_, x)| self.cell_of(pbc, box_matrix, x) == cell)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Picks the grid for `ranks` cells.
///
/// An explicit grid must match the rank count and leave cells at least `min_width`
/// wide. Otherwise the factorization with the smallest halo volume is used; among equal
/// costs the one that splits x most, then y, wins.
pub fn choose_grid(
    ranks: usize,
    explicit: Option<[usize; 3]>,
    pbc: PbcType,
    box_matrix: &Matrix3<f64>,
    min_width: f64,
) -> Result<CellGrid, EngineError> {
    if let Some(cells) = explicit {
        let grid = CellGrid { cells };
        if grid.count() != ranks {
            return Err(EngineError::Configuration(format!(
                "The decomposition grid {}x{}x{} has {} cells, but there are {} spatial ranks",
                cells[0],
                cells[1],
                cells[2],
                grid.count(),
                ranks
            )));
        }
        if !grid.supports_radius(box_matrix, min_width) {
            return Err(EngineError::Configuration(format!(
                "The decomposition grid {}x{}x{} gives cells narrower than the minimum cell size {:.3} nm",
                cells[0], cells[1], cells[2], min_width
            )));
        }
        return Ok(grid);
    }
    if ranks <= 1 {
        return Ok(CellGrid::SINGLE);
    }

    let dims = pbc.bounded_dims();
    let mut best: Option<(f64, CellGrid)> = None;
    for nx in (1..=ranks).rev().filter(|n| ranks % n == 0) {
        let rest = ranks / nx;
        for ny in (1..=rest).rev().filter(|n| rest % n == 0) {
            let nz = rest / ny;
            let grid = CellGrid {
                cells: [nx, ny, nz],
            };
            if (dims < 3 && nz > 1) || (dims < 2 && ny > 1) || (dims < 1 && nx > 1) {
                continue;
            }
            if !grid.supports_radius(box_matrix, min_width) {
                continue;
            }
            let cost = grid.halo_cost(box_matrix, min_width);
            if best.is_none_or(|(c, _)| cost < c - 1e-12) {
                best = Some((cost, grid));
            }
        }
    }
    best.map(|(_, grid)| grid).ok_or_else(|| {
        EngineError::Configuration(format!(
            "There is no decomposition for {} ranks that is compatible with the given box and a minimum cell size of {:.3} nm",
            ranks, min_width
        ))
    })
}
