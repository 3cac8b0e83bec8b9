use crate::core::io::checkpoint::{Checkpoint, DecompositionHints};
use crate::core::io::fio::{FileType, Precision};
use crate::core::io::matrix::read_matrix;
use crate::core::io::run_input::RunInput;
use crate::core::io::trajectory::TrajectoryReader;
use crate::core::models::parameters::{InputParameters, IntegratorKind};
use crate::engine::error::EngineError;
use nalgebra::Matrix3;
use std::fmt;
use std::path::Path;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq)]
pub struct RunInputSummary {
    pub name: String,
    pub particles: usize,
    pub particle_types: usize,
    pub total_charge: f64,
    pub precision: Precision,
    pub box_matrix: Matrix3<f64>,
    pub params: InputParameters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSummary {
    pub program_version: String,
    pub integrator: IntegratorKind,
    pub step: i64,
    pub time: f64,
    pub particles: usize,
    pub decomposition: DecompositionHints,
    pub box_matrix: Matrix3<f64>,
    /// Energy terms with their averages over the whole run.
    pub averages: Vec<(String, f64)>,
    pub energy_samples: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileSummary {
    RunInput(RunInputSummary),
    Checkpoint(CheckpointSummary),
    Trajectory {
        frames: usize,
        first_step: Option<i64>,
        last_step: Option<i64>,
        particles: usize,
    },
    Matrix {
        rows: usize,
        columns: usize,
    },
}

/// Reads any run file and summarizes its contents. The file type follows from the
/// extension.
#[instrument(skip_all, name = "inspect_workflow", fields(path = %path.display()))]
pub fn inspect(path: &Path) -> Result<FileSummary, EngineError> {
    let file_type = FileType::from_path(path).ok_or_else(|| {
        EngineError::Configuration(format!(
            "cannot tell the file type of '{}' from its extension",
            path.display()
        ))
    })?;
    match file_type {
        FileType::Tpr | FileType::Tpa | FileType::Tpb => {
            let input = RunInput::read(path)?;
            Ok(FileSummary::RunInput(RunInputSummary {
                name: input.topology.name.clone(),
                particles: input.particle_count(),
                particle_types: input.topology.types.len(),
                total_charge: input.topology.total_charge(),
                precision: input.precision,
                box_matrix: input.state.box_matrix,
                params: input.params,
            }))
        }
        FileType::Checkpoint => {
            let checkpoint = Checkpoint::read(path)?;
            let energy = &checkpoint.history.energy;
            let averages = energy
                .term_names
                .iter()
                .enumerate()
                .filter_map(|(i, name)| energy.average(i).map(|a| (name.clone(), a)))
                .collect();
            Ok(FileSummary::Checkpoint(CheckpointSummary {
                program_version: checkpoint.program_version.clone(),
                integrator: checkpoint.integrator,
                step: checkpoint.step,
                time: checkpoint.time,
                particles: checkpoint.particle_count(),
                decomposition: checkpoint.decomposition,
                box_matrix: checkpoint.box_matrix,
                averages,
                energy_samples: energy.samples,
            }))
        }
        FileType::Trr | FileType::Trj => {
            let mut reader = TrajectoryReader::open(path)?;
            let mut frames = 0;
            let mut first_step = None;
            let mut last_step = None;
            let mut particles = 0;
            while let Some(frame) = reader.next_frame()? {
                frames += 1;
                first_step.get_or_insert(frame.step);
                last_step = Some(frame.step);
                particles = frame.positions.len();
            }
            Ok(FileSummary::Trajectory {
                frames,
                first_step,
                last_step,
                particles,
            })
        }
        FileType::Mtx => {
            let matrix = read_matrix(path)?;
            Ok(FileSummary::Matrix {
                rows: matrix.nrows(),
                columns: matrix.ncols(),
            })
        }
    }
}

fn write_box(f: &mut fmt::Formatter<'_>, box_matrix: &Matrix3<f64>) -> fmt::Result {
    for row in 0..3 {
        writeln!(
            f,
            "  box[{}]            {:>10.5} {:>10.5} {:>10.5}",
            row,
            box_matrix[(row, 0)],
            box_matrix[(row, 1)],
            box_matrix[(row, 2)]
        )?;
    }
    Ok(())
}

impl fmt::Display for FileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunInput(s) => {
                writeln!(f, "Run input '{}'", s.name)?;
                writeln!(f, "  particles         {}", s.particles)?;
                writeln!(f, "  particle types    {}", s.particle_types)?;
                writeln!(f, "  total charge      {:.4}", s.total_charge)?;
                writeln!(f, "  precision         {:?}", s.precision)?;
                write_box(f, &s.box_matrix)?;
                let p = &s.params;
                writeln!(f, "  integrator        {}", p.integrator)?;
                writeln!(f, "  nsteps            {}", p.nsteps)?;
                writeln!(f, "  init-step         {}", p.init_step)?;
                writeln!(f, "  dt                {}", p.dt)?;
                writeln!(f, "  nstlist           {}", p.nstlist)?;
                writeln!(f, "  cutoff-scheme     {:?}", p.cutoff_scheme)?;
                writeln!(f, "  pbc               {:?}", p.pbc)?;
                writeln!(f, "  rlist             {}", p.rlist)?;
                writeln!(f, "  coulombtype       {:?} (rc {})", p.coulomb_type, p.rcoulomb)?;
                writeln!(f, "  vdwtype           {:?} (rc {})", p.vdw_type, p.rvdw)?;
                writeln!(f, "  verlet-buffer-tol {}", p.verlet_buffer_tolerance)?;
                write!(f, "  thermostat        {:?} (T {} K, tau {} ps)", p.thermostat, p.ref_t, p.tau_t)
            }
            Self::Checkpoint(s) => {
                writeln!(f, "Checkpoint written by version {}", s.program_version)?;
                writeln!(f, "  integrator        {}", s.integrator)?;
                writeln!(f, "  step              {}", s.step)?;
                writeln!(f, "  time              {} ps", s.time)?;
                writeln!(f, "  particles         {}", s.particles)?;
                writeln!(
                    f,
                    "  decomposition     {:?} on {} ranks ({} long-range)",
                    s.decomposition.grid, s.decomposition.ranks, s.decomposition.long_range_ranks
                )?;
                write_box(f, &s.box_matrix)?;
                write!(f, "  energy samples    {}", s.energy_samples)?;
                for (name, average) in &s.averages {
                    write!(f, "\n  <{}> {:>12.5}", name, average)?;
                }
                Ok(())
            }
            Self::Trajectory {
                frames,
                first_step,
                last_step,
                particles,
            } => {
                writeln!(f, "Trajectory")?;
                writeln!(f, "  frames            {}", frames)?;
                writeln!(f, "  particles         {}", particles)?;
                match (first_step, last_step) {
                    (Some(first), Some(last)) => write!(f, "  steps             {} to {}", first, last),
                    _ => write!(f, "  steps             none"),
                }
            }
            Self::Matrix { rows, columns } => write!(f, "Matrix {} x {}", rows, columns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::matrix::write_matrix;
    use crate::core::io::trajectory::{Frame, TrajectoryWriter};
    use nalgebra::{DMatrix, Vector3};
    use tempfile::tempdir;

    #[test]
    fn trajectories_are_summarized_by_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("traj.trr");
        let mut writer = TrajectoryWriter::create(&path, Precision::Double, false).unwrap();
        for step in [0, 10, 20] {
            writer
                .write_frame(&Frame {
                    step,
                    time: step as f64 * 0.002,
                    box_matrix: Matrix3::identity(),
                    positions: vec![Vector3::zeros(); 4],
                })
                .unwrap();
        }
        writer.close().unwrap();

        let summary = inspect(&path).unwrap();
        assert_eq!(
            summary,
            FileSummary::Trajectory {
                frames: 3,
                first_step: Some(0),
                last_step: Some(20),
                particles: 4,
            }
        );
        assert!(summary.to_string().contains("0 to 20"));
    }

    #[test]
    fn matrices_report_their_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hessian.mtx");
        write_matrix(&path, &DMatrix::identity(6, 6)).unwrap();
        assert_eq!(
            inspect(&path).unwrap(),
            FileSummary::Matrix {
                rows: 6,
                columns: 6
            }
        );
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        assert!(matches!(
            inspect(Path::new("notes.txt")),
            Err(EngineError::Configuration(_))
        ));
    }
}
