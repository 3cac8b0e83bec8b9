use super::fio::{FileType, FioError, OpenMode, Precision, RecordFile};
use nalgebra::DMatrix;
use std::path::Path;

const MATRIX_MAGIC: &str = "mdrunner matrix";

/// Writes a square matrix, row by row, in double precision.
pub fn write_matrix(path: &Path, matrix: &DMatrix<f64>) -> Result<(), FioError> {
    check_type(path)?;
    if !matrix.is_square() {
        return Err(FioError::Format(format!(
            "only square matrices are stored, got {}x{}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    let mut file = RecordFile::open(path, OpenMode::Write)?;
    file.select_format();
    file.set_precision(Precision::Double);
    file.write_string(MATRIX_MAGIC)?;
    file.write_int(matrix.nrows() as i32)?;
    for row in matrix.row_iter() {
        for value in row.iter() {
            file.write_real(*value)?;
        }
    }
    file.close()
}

pub fn read_matrix(path: &Path) -> Result<DMatrix<f64>, FioError> {
    check_type(path)?;
    let mut file = RecordFile::open(path, OpenMode::Read)?;
    file.select_format();
    file.set_precision(Precision::Double);
    let magic = file.read_string()?;
    if magic != MATRIX_MAGIC {
        return Err(FioError::Format(format!("'{}' is not a matrix file", magic)));
    }
    let n = file.read_int()?;
    let n = usize::try_from(n)
        .map_err(|_| FioError::Format(format!("negative matrix size {}", n)))?;
    let mut values = Vec::with_capacity(n * n);
    for _ in 0..n * n {
        values.push(file.read_real()?);
    }
    Ok(DMatrix::from_row_slice(n, n, &values))
}

fn check_type(path: &Path) -> Result<(), FioError> {
    match FileType::from_path(path) {
        Some(FileType::Mtx) => Ok(()),
        _ => Err(FioError::UnknownFileType(path.to_path_buf())),
    }
}
