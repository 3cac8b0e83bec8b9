use super::fio::{FieldKind, FileType, FioError, OpenMode, Precision, RecordFile};
use super::run_input::{box_from_rows, box_rows};
use super::{read_step, write_step};
use nalgebra::{Matrix3, Vector3};
use std::path::Path;

/// One coordinate frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub step: i64,
    pub time: f64,
    pub box_matrix: Matrix3<f64>,
    pub positions: Vec<Vector3<f64>>,
}

/// Appends frames to a trajectory file.
#[derive(Debug)]
pub struct TrajectoryWriter {
    file: RecordFile,
    frames: usize,
}

impl TrajectoryWriter {
    /// Creates a new trajectory, or appends to an existing one when `append` is set.
    pub fn create(path: &Path, precision: Precision, append: bool) -> Result<Self, FioError> {
        check_type(path)?;
        let mode = if append && path.exists() {
            OpenMode::Append
        } else {
            OpenMode::Write
        };
        let mut file = RecordFile::open(path, mode)?;
        file.select_format();
        file.set_precision(precision);
        Ok(Self { file, frames: 0 })
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), FioError> {
        self.file.write_int(frame.positions.len() as i32)?;
        self.file.write_int(self.file.precision().real_size() as i32)?;
        write_step(&mut self.file, frame.step)?;
        self.file.write_real(frame.time)?;
        self.file.write_rvecs(&box_rows(&frame.box_matrix))?;
        self.file.write_rvecs(&frame.positions)?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> usize {
        self.frames
    }

    pub fn flush(&mut self) -> Result<(), FioError> {
        self.file.flush()
    }

    pub fn close(self) -> Result<(), FioError> {
        self.file.close()
    }
}

/// Reads frames sequentially until the end of the file.
#[derive(Debug)]
pub struct TrajectoryReader {
    file: RecordFile,
}

impl TrajectoryReader {
    pub fn open(path: &Path) -> Result<Self, FioError> {
        check_type(path)?;
        let mut file = RecordFile::open(path, OpenMode::Read)?;
        file.select_format();
        Ok(Self { file })
    }

    /// Returns `Ok(None)` at a clean end of file, between frames.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FioError> {
        let natoms = match self.file.read_int() {
            Ok(n) => n,
            Err(FioError::UnexpectedEof(FieldKind::Int)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let natoms = usize::try_from(natoms)
            .map_err(|_| FioError::Format(format!("negative atom count {} in frame", natoms)))?;
        let real_size = self.file.read_int()?;
        let precision = Precision::from_real_size(real_size)
            .ok_or_else(|| FioError::Format(format!("invalid real size {}", real_size)))?;
        self.file.set_precision(precision);
        let step = read_step(&mut self.file)?;
        let time = self.file.read_real()?;
        let box_matrix = box_from_rows(&self.file.read_rvecs(3)?);
        let positions = self.file.read_rvecs(natoms)?;
        Ok(Some(Frame {
            step,
            time,
            box_matrix,
            positions,
        }))
    }
}

impl Iterator for TrajectoryReader {
    type Item = Result<Frame, FioError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

fn check_type(path: &Path) -> Result<(), FioError> {
    match FileType::from_path(path) {
        Some(t) if t.is_trajectory() => Ok(()),
        _ => Err(FioError::UnknownFileType(path.to_path_buf())),
    }
}
