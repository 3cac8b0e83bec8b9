use super::fio::{FileType, FioError, OpenMode, Precision, RecordFile};
use super::run_input::{box_from_rows, box_rows};
use super::{read_step, write_step};
use crate::core::models::history::{EnergyHistory, ObservablesHistory, RestraintHistory};
use crate::core::models::parameters::{IntegratorClass, IntegratorKind};
use nalgebra::{Matrix3, Vector3};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const CHECKPOINT_MAGIC: &str = "mdrunner checkpoint";
const CHECKPOINT_VERSION: i32 = 2;
const END_MARKER: i32 = -1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Fio(#[from] FioError),
    #[error("'{}' is not a checkpoint file", .0.display())]
    NotACheckpoint(PathBuf),
    #[error("Unsupported checkpoint version {0}")]
    UnsupportedVersion(i32),
    #[error("Invalid code {code} for {field}")]
    InvalidCode { field: &'static str, code: i32 },
    #[error("Checkpoint is truncated or corrupt: missing end marker")]
    MissingEndMarker,
}

/// The decomposition a checkpoint was written with. Used only as a hint on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecompositionHints {
    pub grid: [i32; 3],
    pub ranks: i32,
    pub long_range_ranks: i32,
}

/// Everything needed to continue a run exactly where it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub program_version: String,
    pub integrator: IntegratorKind,
    pub step: i64,
    pub time: f64,
    pub decomposition: DecompositionHints,
    pub box_matrix: Matrix3<f64>,
    pub positions: Vec<Vector3<f64>>,
    pub velocities: Vec<Vector3<f64>>,
    pub thermostat_xi: f64,
    pub history: ObservablesHistory,
}

impl Checkpoint {
    pub fn particle_count(&self) -> usize {
        self.positions.len()
    }

    /// The name the previous checkpoint is kept under when a new one is written.
    pub fn previous_path(path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{}_prev.cpt", stem))
    }

    pub fn read(path: &Path) -> Result<Self, CheckpointError> {
        if FileType::from_path(path) != Some(FileType::Checkpoint) {
            return Err(CheckpointError::NotACheckpoint(path.to_path_buf()));
        }
        let mut file = RecordFile::open(path, OpenMode::Read)?;
        file.select_format();

        let magic = file.read_string()?;
        if magic != CHECKPOINT_MAGIC {
            return Err(CheckpointError::NotACheckpoint(path.to_path_buf()));
        }
        let version = file.read_int()?;
        if version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }
        let real_size = file.read_int()?;
        let precision =
            Precision::from_real_size(real_size).ok_or(CheckpointError::InvalidCode {
                field: "real size",
                code: real_size,
            })?;
        file.set_precision(precision);
        let program_version = file.read_string()?;

        let natoms = file.read_int()?;
        let natoms = usize::try_from(natoms).map_err(|_| CheckpointError::InvalidCode {
            field: "natoms",
            code: natoms,
        })?;
        let class_code = file.read_int()?;
        let class = IntegratorClass::from_code(class_code).ok_or(CheckpointError::InvalidCode {
            field: "integrator class",
            code: class_code,
        })?;
        let integrator_code = file.read_int()?;
        let integrator = IntegratorKind::from_code(integrator_code)
            .filter(|kind| kind.class() == class)
            .ok_or(CheckpointError::InvalidCode {
                field: "integrator",
                code: integrator_code,
            })?;
        let step = read_step(&mut file)?;
        let time = file.read_real()?;
        let decomposition = DecompositionHints {
            grid: file.read_ivec()?,
            ranks: file.read_int()?,
            long_range_ranks: file.read_int()?,
        };

        let box_matrix = box_from_rows(&file.read_rvecs(3)?);
        let positions = file.read_rvecs(natoms)?;
        let velocities = file.read_rvecs(natoms)?;
        let thermostat_xi = file.read_real()?;
        let history = read_history(&mut file)?;

        if file.read_int()? != END_MARKER {
            return Err(CheckpointError::MissingEndMarker);
        }

        debug!(path = %path.display(), step, natoms, "Read checkpoint.");
        Ok(Self {
            program_version,
            integrator,
            step,
            time,
            decomposition,
            box_matrix,
            positions,
            velocities,
            thermostat_xi,
            history,
        })
    }

    /// The name a new checkpoint is written under before it replaces the file at `path`.
    pub fn pending_path(path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{}_next.cpt", stem))
    }

    /// Writes the checkpoint, keeping an existing file at `path` as `<stem>_prev.cpt`.
    ///
    /// The new file is complete on disk before anything at `path` is moved, so a failed
    /// write leaves the existing checkpoint in place.
    pub fn write(&self, path: &Path) -> Result<(), CheckpointError> {
        if FileType::from_path(path) != Some(FileType::Checkpoint) {
            return Err(CheckpointError::NotACheckpoint(path.to_path_buf()));
        }
        let pending = Self::pending_path(path);
        if pending.exists() {
            fs::remove_file(&pending).map_err(|e| FioError::io(&pending, e))?;
        }
        if let Err(e) = self.write_records(&pending) {
            let _ = fs::remove_file(&pending);
            return Err(e);
        }

        if path.exists() {
            let previous = Self::previous_path(path);
            fs::rename(path, &previous).map_err(|e| FioError::io(path, e))?;
            debug!(previous = %previous.display(), "Kept previous checkpoint.");
        }
        fs::rename(&pending, path).map_err(|e| FioError::io(&pending, e))?;

        info!(path = %path.display(), step = self.step, "Wrote checkpoint.");
        Ok(())
    }

    fn write_records(&self, path: &Path) -> Result<(), CheckpointError> {
        let mut file = RecordFile::open(path, OpenMode::Write)?;
        file.select_format();
        file.set_precision(Precision::Double);

        file.write_string(CHECKPOINT_MAGIC)?;
        file.write_int(CHECKPOINT_VERSION)?;
        file.write_int(Precision::Double.real_size() as i32)?;
        file.write_string(&self.program_version)?;
        file.write_int(self.particle_count() as i32)?;
        file.write_int(self.integrator.class().code())?;
        file.write_int(self.integrator.code())?;
        write_step(&mut file, self.step)?;
        file.write_real(self.time)?;
        file.write_ivec(self.decomposition.grid)?;
        file.write_int(self.decomposition.ranks)?;
        file.write_int(self.decomposition.long_range_ranks)?;
        file.write_rvecs(&box_rows(&self.box_matrix))?;
        file.write_rvecs(&self.positions)?;
        file.write_rvecs(&self.velocities)?;
        file.write_real(self.thermostat_xi)?;
        write_history(&mut file, &self.history)?;
        file.write_int(END_MARKER)?;
        file.close()?;
        Ok(())
    }
}

fn write_history(file: &mut RecordFile, history: &ObservablesHistory) -> Result<(), FioError> {
    let energy = &history.energy;
    file.write_int(energy.term_names.len() as i32)?;
    for name in &energy.term_names {
        file.write_string(name)?;
    }
    write_step(file, energy.samples as i64)?;
    for (sum, square) in energy.sums.iter().zip(&energy.sums_of_squares) {
        file.write_real(*sum)?;
        file.write_real(*square)?;
    }
    for restraints in [&history.distance_restraints, &history.orientation_restraints] {
        file.write_real(restraints.tau)?;
        file.write_int(restraints.time_averages.len() as i32)?;
        for (average, current) in restraints
            .time_averages
            .iter()
            .zip(&restraints.instantaneous)
        {
            file.write_real(*average)?;
            file.write_real(*current)?;
        }
    }
    Ok(())
}

fn read_history(file: &mut RecordFile) -> Result<ObservablesHistory, CheckpointError> {
    let nterms = read_len(file, "energy term count")?;
    let mut energy = EnergyHistory::default();
    for _ in 0..nterms {
        energy.term_names.push(file.read_string()?);
    }
    energy.samples = read_step(file)? as u64;
    for _ in 0..nterms {
        energy.sums.push(file.read_real()?);
        energy.sums_of_squares.push(file.read_real()?);
    }

    let mut restraints = [RestraintHistory::default(), RestraintHistory::default()];
    for r in &mut restraints {
        r.tau = file.read_real()?;
        let n = read_len(file, "restraint count")?;
        for _ in 0..n {
            r.time_averages.push(file.read_real()?);
            r.instantaneous.push(file.read_real()?);
        }
    }
    let [distance_restraints, orientation_restraints] = restraints;
    Ok(ObservablesHistory {
        energy,
        distance_restraints,
        orientation_restraints,
    })
}

fn read_len(file: &mut RecordFile, field: &'static str) -> Result<usize, CheckpointError> {
    let n = file.read_int()?;
    usize::try_from(n).map_err(|_| CheckpointError::InvalidCode { field, code: n })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Checkpoint {
        let mut history = ObservablesHistory {
            energy: EnergyHistory::with_terms(&["potential", "kinetic"]),
            ..Default::default()
        };
        history.energy.accumulate(&[-12.5, 3.0]);
        history.energy.accumulate(&[-11.0, 3.5]);
        history.distance_restraints = RestraintHistory {
            tau: 10.0,
            time_averages: vec![0.31, 0.42],
            instantaneous: vec![0.3, 0.45],
        };
        Checkpoint {
            program_version: "0.1.0".to_string(),
            integrator: IntegratorKind::Sd,
            step: 4_294_967_301,
            time: 8.0,
            decomposition: DecompositionHints {
                grid: [2, 1, 1],
                ranks: 3,
                long_range_ranks: 1,
            },
            box_matrix: Matrix3::from_diagonal_element(2.5),
            positions: vec![Vector3::new(0.1, 0.2, 0.3), Vector3::new(1.0, 1.1, 1.2)],
            velocities: vec![Vector3::new(-0.5, 0.0, 0.5), Vector3::zeros()],
            thermostat_xi: -0.037_5,
            history,
        }
    }

    #[test]
    fn checkpoint_round_trips_with_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.cpt");
        let checkpoint = sample();
        checkpoint.write(&path).unwrap();
        assert_eq!(Checkpoint::read(&path).unwrap(), checkpoint);
    }

    #[test]
    fn rewriting_keeps_previous_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.cpt");
        let mut checkpoint = sample();
        checkpoint.write(&path).unwrap();
        checkpoint.step += 100;
        checkpoint.write(&path).unwrap();

        let previous = dir.path().join("state_prev.cpt");
        assert_eq!(Checkpoint::previous_path(&path), previous);
        assert_eq!(Checkpoint::read(&previous).unwrap().step, 4_294_967_301);
        assert_eq!(Checkpoint::read(&path).unwrap().step, 4_294_967_401);
    }

    #[test]
    fn failed_write_leaves_the_existing_checkpoint_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.cpt");
        let mut checkpoint = sample();
        checkpoint.write(&path).unwrap();

        let pending = Checkpoint::pending_path(&path);
        std::fs::create_dir(&pending).unwrap();
        checkpoint.step += 100;
        assert!(checkpoint.write(&path).is_err());

        assert_eq!(Checkpoint::read(&path).unwrap().step, 4_294_967_301);
        assert!(!Checkpoint::previous_path(&path).exists());
    }

    #[test]
    fn successful_write_leaves_no_pending_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.cpt");
        sample().write(&path).unwrap();
        sample().write(&path).unwrap();
        assert!(!Checkpoint::pending_path(&path).exists());
        assert!(Checkpoint::previous_path(&path).exists());
    }

    #[test]
    fn non_checkpoint_extension_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            sample().write(&dir.path().join("state.trr")),
            Err(CheckpointError::NotACheckpoint(_))
        ));
    }

    #[test]
    fn truncated_checkpoint_fails_to_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.cpt");
        sample().write(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(Checkpoint::read(&path).is_err());
    }
}
