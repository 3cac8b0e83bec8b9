//! # File I/O
//!
//! A record-oriented file layer ([`fio`]) with three interchangeable backends
//! ([`codec`]): human-readable text, raw fixed-size binary and portable big-endian
//! binary. The backend is picked by the file type derived from the extension.
//!
//! The run files are built on top of it:
//!
//! - [`run_input`] - the prepared simulation: parameters, topology, box, coordinates
//! - [`checkpoint`] - the state needed to resume a run exactly
//! - [`trajectory`] - coordinate frames, written during dynamics and replayed by reruns
//! - [`matrix`] - the Hessian written by normal-mode analysis
//! - [`description`] - the TOML system description turned into a run input by `prepare`

pub mod checkpoint;
pub mod codec;
pub mod description;
pub mod fio;
pub mod matrix;
pub mod run_input;
pub mod trajectory;

use fio::{FioError, RecordFile};

/// Writes a 64-bit step counter as two 32-bit words, high word first.
pub(crate) fn write_step(file: &mut RecordFile, value: i64) -> Result<(), FioError> {
    file.write_int((value >> 32) as i32)?;
    file.write_int(value as u32 as i32)
}

pub(crate) fn read_step(file: &mut RecordFile) -> Result<i64, FioError> {
    let high = file.read_int()? as i64;
    let low = file.read_int()? as u32 as i64;
    Ok((high << 32) | low)
}
