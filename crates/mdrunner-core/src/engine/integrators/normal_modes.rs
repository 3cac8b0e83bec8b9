use super::forces::{Distribution, ForceEvaluator};
use super::{LongRunningAlgorithm, RunContext};
use crate::core::io::matrix::write_matrix;
use crate::core::models::history::ObservablesHistory;
use crate::core::models::state::RunState;
use crate::engine::accounting::Stage;
use crate::engine::context::StopCondition;
use crate::engine::error::EngineError;
use crate::engine::progress::Progress;
use nalgebra::{DMatrix, SymmetricEigen};
use std::f64::consts::PI;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Finite-difference displacement in nm.
const DISPLACEMENT: f64 = 1e-4;
/// Speed of light in cm/ps.
const SPEED_OF_LIGHT: f64 = 0.029_979_245_8;
const LOGGED_MODES: usize = 12;

type HessianColumn = (usize, Vec<f64>);

/// Builds the Hessian by central differences of the forces and reports its spectrum.
///
/// Columns are spread round-robin over the spatial ranks and collected on the group
/// root, which writes the matrix.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalModes;

impl LongRunningAlgorithm for NormalModes {
    fn name(&self) -> &'static str {
        "normal-modes"
    }

    #[instrument(skip_all, name = "normal_modes")]
    fn run(
        &mut self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        _history: &mut ObservablesHistory,
    ) -> Result<StopCondition, EngineError> {
        let group = ctx.spatial_group()?;
        let index = group
            .members()
            .iter()
            .position(|&r| r == ctx.comm.rank())
            .ok_or_else(|| {
                EngineError::Internal(format!(
                    "rank {} is not a member of the spatial group",
                    ctx.comm.rank()
                ))
            })?;
        let mut forces = ForceEvaluator::new(ctx, Distribution::Local)?;
        let reference =
            forces.evaluate(ctx, &state.box_matrix, &state.positions, state.step, true)?;
        let (fmax, at) = reference.max_force();
        if fmax > ctx.input.params.emtol && ctx.is_coordinator() {
            warn!(
                fmax,
                particle = at,
                emtol = ctx.input.params.emtol,
                "The structure is not a minimum; the Hessian has spurious negative modes."
            );
        }

        let dimension = 3 * state.particle_count();
        let own: Vec<usize> = (index..dimension).step_by(group.size()).collect();
        info!(
            dimension,
            columns = own.len(),
            ranks = group.size(),
            "Building the Hessian by finite differences."
        );
        ctx.reporter.report(Progress::TaskStart {
            total_steps: own.len() as u64,
        });
        let mut columns: Vec<HessianColumn> = Vec::with_capacity(own.len());
        let mut positions = state.positions.clone();
        for &column in &own {
            let (particle, axis) = (column / 3, column % 3);
            let origin = positions[particle][axis];
            positions[particle][axis] = origin + DISPLACEMENT;
            let plus = forces.evaluate(ctx, &state.box_matrix, &positions, state.step, false)?;
            positions[particle][axis] = origin - DISPLACEMENT;
            let minus = forces.evaluate(ctx, &state.box_matrix, &positions, state.step, false)?;
            positions[particle][axis] = origin;

            let values = plus
                .forces
                .iter()
                .zip(&minus.forces)
                .flat_map(|(p, m)| {
                    let d = (m - p) / (2.0 * DISPLACEMENT);
                    [d.x, d.y, d.z]
                })
                .collect();
            columns.push((column, values));
            ctx.accounting.borrow_mut().count_step();
            ctx.reporter.report(Progress::TaskIncrement { steps: 1 });
        }
        forces.finish(ctx)?;
        ctx.reporter.report(Progress::TaskFinish);

        let start = Instant::now();
        let gathered = ctx.comm.gather(group, columns)?;
        ctx.accounting
            .borrow_mut()
            .add(Stage::Communication, start.elapsed());
        if let Some(parts) = gathered {
            let hessian = assemble_hessian(dimension, parts.into_iter().flatten())?;
            write_matrix(&ctx.request.matrix_output, &hessian)?;
            info!(path = %ctx.request.matrix_output.display(), "Wrote the Hessian.");

            let topology = &ctx.input.topology;
            let masses: Vec<f64> = (0..state.particle_count()).map(|i| topology.mass(i)).collect();
            let eigenvalues = mass_weighted_spectrum(&hessian, &masses);
            for (mode, &value) in eigenvalues.iter().take(LOGGED_MODES).enumerate() {
                debug!(mode, eigenvalue = value, "Mass-weighted eigenvalue.");
                info!(mode, wavenumber = wavenumber(value), "Normal mode (cm^-1).");
            }
        }
        Ok(StopCondition::None)
    }
}

/// Places the columns and symmetrizes the result.
fn assemble_hessian(
    dimension: usize,
    columns: impl IntoIterator<Item = HessianColumn>,
) -> Result<DMatrix<f64>, EngineError> {
    let mut hessian = DMatrix::zeros(dimension, dimension);
    let mut seen = vec![false; dimension];
    for (column, values) in columns {
        if column >= dimension || values.len() != dimension {
            return Err(EngineError::Internal(format!(
                "Hessian column {} with {} rows does not fit a {}x{} matrix",
                column,
                values.len(),
                dimension,
                dimension
            )));
        }
        hessian.set_column(column, &nalgebra::DVector::from_vec(values));
        seen[column] = true;
    }
    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(EngineError::Internal(format!(
            "Hessian column {} was never computed",
            missing
        )));
    }
    Ok((&hessian + hessian.transpose()) * 0.5)
}

/// Eigenvalues of the mass-weighted Hessian in ascending order (ps^-2).
fn mass_weighted_spectrum(hessian: &DMatrix<f64>, masses: &[f64]) -> Vec<f64> {
    let weighted = DMatrix::from_fn(hessian.nrows(), hessian.ncols(), |i, j| {
        hessian[(i, j)] / (masses[i / 3] * masses[j / 3]).sqrt()
    });
    let mut eigenvalues: Vec<f64> = SymmetricEigen::new(weighted).eigenvalues.iter().copied().collect();
    eigenvalues.sort_by(f64::total_cmp);
    eigenvalues
}

/// Wavenumber of a mode; negative for imaginary frequencies.
fn wavenumber(eigenvalue: f64) -> f64 {
    eigenvalue.signum() * eigenvalue.abs().sqrt() / (2.0 * PI * SPEED_OF_LIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_are_placed_and_symmetrized() {
        let columns = vec![(1, vec![2.0, 4.0]), (0, vec![4.0, 0.0])];
        let hessian = assemble_hessian(2, columns).unwrap();
        assert_eq!(hessian[(0, 0)], 4.0);
        assert_eq!(hessian[(0, 1)], 1.0);
        assert_eq!(hessian[(1, 0)], 1.0);
        assert_eq!(hessian[(1, 1)], 4.0);
    }

    #[test]
    fn missing_columns_are_an_error() {
        assert!(assemble_hessian(2, vec![(0, vec![1.0, 0.0])]).is_err());
        assert!(assemble_hessian(2, vec![(0, vec![1.0])]).is_err());
    }

    #[test]
    fn spectrum_is_mass_weighted_and_sorted() {
        let hessian = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![
            8.0, 8.0, 8.0, 1.0, 1.0, 1.0,
        ]));
        let spectrum = mass_weighted_spectrum(&hessian, &[2.0, 1.0]);
        let expected = [1.0, 1.0, 1.0, 4.0, 4.0, 4.0];
        for (value, want) in spectrum.iter().zip(expected) {
            assert!((value - want).abs() < 1e-10);
        }
    }

    #[test]
    fn imaginary_modes_have_negative_wavenumbers() {
        assert!(wavenumber(-4.0) < 0.0);
        assert!((wavenumber(4.0) + wavenumber(-4.0)).abs() < 1e-12);
    }
}
