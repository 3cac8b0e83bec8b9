use super::codec::{self, CodecOptions, FieldCodec};
use nalgebra::Vector3;
use phf::{Map, phf_map};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const MAX_BACKUPS: usize = 99;

#[derive(Debug, Error)]
pub enum FioError {
    #[error("I/O error on '{path}': {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Cannot determine the file type of '{}'", .0.display())]
    UnknownFileType(PathBuf),
    #[error("No record format selected for '{}'", .0.display())]
    FormatNotSelected(PathBuf),
    #[error("File '{path}' is not open for {operation}", path = path.display())]
    WrongMode {
        path: PathBuf,
        operation: &'static str,
    },
    #[error("Invalid item count {count} for {kind}; only NUCHAR and NRVEC accept counts other than 1")]
    InvalidCount { kind: FieldKind, count: usize },
    #[error("Expected a {expected} field but found {found}")]
    KindMismatch { expected: FieldKind, found: FieldKind },
    #[error("Cannot parse '{token}' as {kind}")]
    Parse { kind: FieldKind, token: String },
    #[error("Unexpected end of file while reading {0}")]
    UnexpectedEof(FieldKind),
    #[error("Malformed record: {0}")]
    Format(String),
    #[error("Could not back up '{}': all backup names are taken", .0.display())]
    BackupExhausted(PathBuf),
}

impl FioError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// On-disk encoding of the records of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Human-readable whitespace-separated tokens, one field per line.
    Text,
    /// Native fixed-size binary in little-endian byte order.
    Raw,
    /// Portable big-endian binary with negotiated real precision.
    Portable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Portable run input.
    Tpr,
    /// Text run input.
    Tpa,
    /// Raw binary run input.
    Tpb,
    Checkpoint,
    /// Portable trajectory.
    Trr,
    /// Raw binary trajectory.
    Trj,
    /// Portable matrix output.
    Mtx,
}

static FILE_TYPES: Map<&'static str, FileType> = phf_map! {
    "tpr" => FileType::Tpr,
    "tpa" => FileType::Tpa,
    "tpb" => FileType::Tpb,
    "cpt" => FileType::Checkpoint,
    "trr" => FileType::Trr,
    "trj" => FileType::Trj,
    "mtx" => FileType::Mtx,
};

impl FileType {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        FILE_TYPES.get(ext.as_str()).copied()
    }

    pub fn encoding(self) -> Encoding {
        match self {
            Self::Tpa => Encoding::Text,
            Self::Tpb | Self::Trj => Encoding::Raw,
            Self::Tpr | Self::Checkpoint | Self::Trr | Self::Mtx => Encoding::Portable,
        }
    }

    pub fn is_run_input(self) -> bool {
        matches!(self, Self::Tpr | Self::Tpa | Self::Tpb)
    }

    pub fn is_trajectory(self) -> bool {
        matches!(self, Self::Trr | Self::Trj)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    Single,
    #[default]
    Double,
}

impl Precision {
    pub fn real_size(self) -> usize {
        match self {
            Self::Single => 4,
            Self::Double => 8,
        }
    }

    pub fn from_real_size(size: i32) -> Option<Self> {
        match size {
            4 => Some(Self::Single),
            8 => Some(Self::Double),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Real,
    Int,
    UChars,
    UShort,
    RVec,
    NRVec,
    IVec,
    String,
}

impl FieldKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Real => "REAL",
            Self::Int => "INT",
            Self::UChars => "NUCHAR",
            Self::UShort => "USHORT",
            Self::RVec => "RVEC",
            Self::NRVec => "NRVEC",
            Self::IVec => "IVEC",
            Self::String => "STRING",
        }
    }

    pub fn check_count(self, count: usize) -> Result<(), FioError> {
        if count != 1 && !matches!(self, Self::UChars | Self::NRVec) {
            return Err(FioError::InvalidCount { kind: self, count });
        }
        Ok(())
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Real(f64),
    Int(i32),
    UChars(Vec<u8>),
    UShort(u16),
    RVec(Vector3<f64>),
    NRVec(Vec<Vector3<f64>>),
    IVec([i32; 3]),
    String(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Real(_) => FieldKind::Real,
            Self::Int(_) => FieldKind::Int,
            Self::UChars(_) => FieldKind::UChars,
            Self::UShort(_) => FieldKind::UShort,
            Self::RVec(_) => FieldKind::RVec,
            Self::NRVec(_) => FieldKind::NRVec,
            Self::IVec(_) => FieldKind::IVec,
            Self::String(_) => FieldKind::String,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            Self::UChars(bytes) => bytes.len(),
            Self::NRVec(vectors) => vectors.len(),
            _ => 1,
        }
    }
}

enum Stream {
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
}

/// A record-oriented file whose on-disk encoding is chosen by its file type.
///
/// Fields are read and written one at a time in a fixed order agreed on by the
/// producer and consumer of the file. Nothing can be transferred until
/// [`select_format`](Self::select_format) has installed the backend for the file type.
pub struct RecordFile {
    path: PathBuf,
    file_type: FileType,
    mode: OpenMode,
    precision: Precision,
    debug: bool,
    comment: Option<String>,
    codec: Option<Box<dyn FieldCodec>>,
    stream: Stream,
}

impl fmt::Debug for RecordFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordFile")
            .field("path", &self.path)
            .field("file_type", &self.file_type)
            .field("mode", &self.mode)
            .field("precision", &self.precision)
            .field("format_selected", &self.codec.is_some())
            .finish()
    }
}

impl RecordFile {
    /// Opens `path` in the given mode.
    ///
    /// Opening a portable file for writing first moves an existing file of the same
    /// name out of the way, so that it is never silently overwritten.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, FioError> {
        let path = path.as_ref().to_path_buf();
        let file_type =
            FileType::from_path(&path).ok_or_else(|| FioError::UnknownFileType(path.clone()))?;

        let stream = match mode {
            OpenMode::Read => {
                let file = File::open(&path).map_err(|e| FioError::io(&path, e))?;
                Stream::Reader(BufReader::new(file))
            }
            OpenMode::Write => {
                if file_type.encoding() == Encoding::Portable && path.exists() {
                    let backup = Self::backup(&path)?;
                    info!(
                        file = %path.display(),
                        backup = %backup.display(),
                        "Backed up existing file."
                    );
                }
                let file = File::create(&path).map_err(|e| FioError::io(&path, e))?;
                Stream::Writer(BufWriter::new(file))
            }
            OpenMode::Append => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(|e| FioError::io(&path, e))?;
                Stream::Writer(BufWriter::new(file))
            }
        };

        debug!(file = %path.display(), ?file_type, ?mode, "Opened record file.");
        Ok(Self {
            path,
            file_type,
            mode,
            precision: Precision::default(),
            debug: false,
            comment: None,
            codec: None,
            stream,
        })
    }

    /// Returns the path an existing file would be backed up to.
    pub fn backup_path(path: &Path) -> Result<PathBuf, FioError> {
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        (1..=MAX_BACKUPS)
            .map(|i| dir.join(format!("#{}.{}#", name, i)))
            .find(|candidate| !candidate.exists())
            .ok_or_else(|| FioError::BackupExhausted(path.to_path_buf()))
    }

    fn backup(path: &Path) -> Result<PathBuf, FioError> {
        let backup = Self::backup_path(path)?;
        fs::rename(path, &backup).map_err(|e| FioError::io(path, e))?;
        Ok(backup)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn encoding(&self) -> Encoding {
        self.file_type.encoding()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Installs the field backend matching the file type.
    pub fn select_format(&mut self) {
        self.codec = Some(codec::for_encoding(self.encoding()));
    }

    pub fn set_precision(&mut self, precision: Precision) {
        self.precision = precision;
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Annotates every text record with its kind and the current comment.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn set_comment(&mut self, comment: Option<&str>) {
        self.comment = comment.map(str::to_string);
    }

    pub fn write_field(&mut self, value: &FieldValue) -> Result<(), FioError> {
        value.kind().check_count(value.count())?;
        let options = CodecOptions {
            precision: self.precision,
            debug: self.debug,
            comment: self.comment.as_deref(),
        };
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| FioError::FormatNotSelected(self.path.clone()))?;
        let Stream::Writer(writer) = &mut self.stream else {
            return Err(FioError::WrongMode {
                path: self.path.clone(),
                operation: "writing",
            });
        };
        codec.write_field(writer, value, &options).map_err(|e| match e {
            FioError::Io { source, .. } => FioError::io(&self.path, source),
            other => other,
        })
    }

    pub fn read_field(&mut self, kind: FieldKind, count: usize) -> Result<FieldValue, FioError> {
        kind.check_count(count)?;
        let options = CodecOptions {
            precision: self.precision,
            debug: self.debug,
            comment: None,
        };
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| FioError::FormatNotSelected(self.path.clone()))?;
        let Stream::Reader(reader) = &mut self.stream else {
            return Err(FioError::WrongMode {
                path: self.path.clone(),
                operation: "reading",
            });
        };
        codec
            .read_field(reader, kind, count, &options)
            .map_err(|e| match e {
                FioError::Io { source, .. } => FioError::io(&self.path, source),
                other => other,
            })
    }

    pub fn write_real(&mut self, value: f64) -> Result<(), FioError> {
        self.write_field(&FieldValue::Real(value))
    }

    pub fn write_int(&mut self, value: i32) -> Result<(), FioError> {
        self.write_field(&FieldValue::Int(value))
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), FioError> {
        self.write_field(&FieldValue::String(value.to_string()))
    }

    pub fn write_rvec(&mut self, value: &Vector3<f64>) -> Result<(), FioError> {
        self.write_field(&FieldValue::RVec(*value))
    }

    pub fn write_rvecs(&mut self, values: &[Vector3<f64>]) -> Result<(), FioError> {
        self.write_field(&FieldValue::NRVec(values.to_vec()))
    }

    pub fn write_ivec(&mut self, value: [i32; 3]) -> Result<(), FioError> {
        self.write_field(&FieldValue::IVec(value))
    }

    pub fn read_real(&mut self) -> Result<f64, FioError> {
        match self.read_field(FieldKind::Real, 1)? {
            FieldValue::Real(v) => Ok(v),
            other => Err(mismatch(FieldKind::Real, &other)),
        }
    }

    pub fn read_int(&mut self) -> Result<i32, FioError> {
        match self.read_field(FieldKind::Int, 1)? {
            FieldValue::Int(v) => Ok(v),
            other => Err(mismatch(FieldKind::Int, &other)),
        }
    }

    pub fn read_ushort(&mut self) -> Result<u16, FioError> {
        match self.read_field(FieldKind::UShort, 1)? {
            FieldValue::UShort(v) => Ok(v),
            other => Err(mismatch(FieldKind::UShort, &other)),
        }
    }

    pub fn read_uchars(&mut self, count: usize) -> Result<Vec<u8>, FioError> {
        match self.read_field(FieldKind::UChars, count)? {
            FieldValue::UChars(v) => Ok(v),
            other => Err(mismatch(FieldKind::UChars, &other)),
        }
    }

    pub fn read_string(&mut self) -> Result<String, FioError> {
        match self.read_field(FieldKind::String, 1)? {
            FieldValue::String(v) => Ok(v),
            other => Err(mismatch(FieldKind::String, &other)),
        }
    }

    pub fn read_rvec(&mut self) -> Result<Vector3<f64>, FioError> {
        match self.read_field(FieldKind::RVec, 1)? {
            FieldValue::RVec(v) => Ok(v),
            other => Err(mismatch(FieldKind::RVec, &other)),
        }
    }

    pub fn read_rvecs(&mut self, count: usize) -> Result<Vec<Vector3<f64>>, FioError> {
        match self.read_field(FieldKind::NRVec, count)? {
            FieldValue::NRVec(v) => Ok(v),
            other => Err(mismatch(FieldKind::NRVec, &other)),
        }
    }

    pub fn read_ivec(&mut self) -> Result<[i32; 3], FioError> {
        match self.read_field(FieldKind::IVec, 1)? {
            FieldValue::IVec(v) => Ok(v),
            other => Err(mismatch(FieldKind::IVec, &other)),
        }
    }

    /// Returns to the start of the file, discarding any buffered text tokens.
    pub fn rewind(&mut self) -> Result<(), FioError> {
        self.seek(0)
    }

    pub fn flush(&mut self) -> Result<(), FioError> {
        if let Stream::Writer(writer) = &mut self.stream {
            writer.flush().map_err(|e| FioError::io(&self.path, e))?;
        }
        Ok(())
    }

    /// Current byte offset. Buffered text tokens that were read ahead are not accounted for.
    pub fn tell(&mut self) -> Result<u64, FioError> {
        let position = match &mut self.stream {
            Stream::Reader(reader) => reader.stream_position(),
            Stream::Writer(writer) => writer.stream_position(),
        };
        position.map_err(|e| FioError::io(&self.path, e))
    }

    pub fn seek(&mut self, offset: u64) -> Result<(), FioError> {
        let result = match &mut self.stream {
            Stream::Reader(reader) => reader.seek(SeekFrom::Start(offset)),
            Stream::Writer(writer) => writer.seek(SeekFrom::Start(offset)),
        };
        result.map_err(|e| FioError::io(&self.path, e))?;
        if let Some(codec) = self.codec.as_mut() {
            codec.reset();
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<(), FioError> {
        self.flush()
    }
}

fn mismatch(expected: FieldKind, found: &FieldValue) -> FioError {
    FioError::KindMismatch {
        expected,
        found: found.kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_sample(file: &mut RecordFile) {
        file.write_string("lj fluid").unwrap();
        file.write_int(-42).unwrap();
        file.write_real(1.25).unwrap();
        file.write_field(&FieldValue::UShort(65000)).unwrap();
        file.write_field(&FieldValue::UChars(vec![1, 2, 255])).unwrap();
        file.write_ivec([1, -2, 3]).unwrap();
        file.write_rvec(&Vector3::new(0.5, -1.5, 2.0)).unwrap();
        file.write_rvecs(&[Vector3::new(1.0, 2.0, 3.0), Vector3::new(-4.0, 5.0, -6.0)])
            .unwrap();
    }

    fn read_sample(file: &mut RecordFile) {
        assert_eq!(file.read_string().unwrap(), "lj fluid");
        assert_eq!(file.read_int().unwrap(), -42);
        assert_eq!(file.read_real().unwrap(), 1.25);
        assert_eq!(file.read_ushort().unwrap(), 65000);
        assert_eq!(file.read_uchars(3).unwrap(), vec![1, 2, 255]);
        assert_eq!(file.read_ivec().unwrap(), [1, -2, 3]);
        assert_eq!(file.read_rvec().unwrap(), Vector3::new(0.5, -1.5, 2.0));
        assert_eq!(
            file.read_rvecs(2).unwrap(),
            vec![Vector3::new(1.0, 2.0, 3.0), Vector3::new(-4.0, 5.0, -6.0)]
        );
    }

    #[test]
    fn every_backend_reads_back_what_it_wrote() {
        let dir = tempdir().unwrap();
        for name in ["sample.tpa", "sample.tpb", "sample.tpr"] {
            let path = dir.path().join(name);
            let mut writer = RecordFile::open(&path, OpenMode::Write).unwrap();
            writer.select_format();
            write_sample(&mut writer);
            writer.close().unwrap();

            let mut reader = RecordFile::open(&path, OpenMode::Read).unwrap();
            reader.select_format();
            read_sample(&mut reader);
        }
    }

    #[test]
    fn file_types_map_to_expected_encodings() {
        let ty = |p: &str| FileType::from_path(Path::new(p)).unwrap();
        assert_eq!(ty("run.tpr").encoding(), Encoding::Portable);
        assert_eq!(ty("state.cpt").encoding(), Encoding::Portable);
        assert_eq!(ty("run.TPA").encoding(), Encoding::Text);
        assert_eq!(ty("run.tpb").encoding(), Encoding::Raw);
        assert_eq!(ty("traj.trj").encoding(), Encoding::Raw);
        assert!(FileType::from_path(Path::new("notes.txt")).is_none());
    }

    #[test]
    fn transfer_before_select_format_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("early.tpb");
        let mut file = RecordFile::open(&path, OpenMode::Write).unwrap();
        assert!(matches!(
            file.write_int(1),
            Err(FioError::FormatNotSelected(_))
        ));
    }

    #[test]
    fn counts_other_than_one_only_for_lists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.tpr");
        RecordFile::open(&path, OpenMode::Write)
            .unwrap()
            .close()
            .unwrap();
        let mut file = RecordFile::open(&path, OpenMode::Read).unwrap();
        file.select_format();
        assert!(matches!(
            file.read_field(FieldKind::Int, 2),
            Err(FioError::InvalidCount { count: 2, .. })
        ));
    }

    #[test]
    fn reading_a_write_only_file_is_a_mode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mode.tpa");
        let mut file = RecordFile::open(&path, OpenMode::Write).unwrap();
        file.select_format();
        assert!(matches!(
            file.read_int(),
            Err(FioError::WrongMode { operation: "reading", .. })
        ));
    }

    #[test]
    fn writing_portable_file_backs_up_existing_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.tpr");
        fs::write(&path, b"old").unwrap();

        let mut file = RecordFile::open(&path, OpenMode::Write).unwrap();
        file.select_format();
        file.write_int(7).unwrap();
        file.close().unwrap();

        let backup = dir.path().join("#run.tpr.1#");
        assert_eq!(fs::read(&backup).unwrap(), b"old");
        assert_eq!(
            RecordFile::backup_path(&path).unwrap(),
            dir.path().join("#run.tpr.2#")
        );
    }

    #[test]
    fn single_precision_portable_reals_take_four_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("single.tpr");
        let mut file = RecordFile::open(&path, OpenMode::Write).unwrap();
        file.select_format();
        file.set_precision(Precision::Single);
        file.write_real(0.5).unwrap();
        file.write_rvec(&Vector3::new(1.0, 2.0, 3.0)).unwrap();
        file.close().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 16);

        let mut file = RecordFile::open(&path, OpenMode::Read).unwrap();
        file.select_format();
        file.set_precision(Precision::Single);
        assert_eq!(file.read_real().unwrap(), 0.5);
    }

    #[test]
    fn rewind_and_seek_restart_reading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seek.tpa");
        let mut file = RecordFile::open(&path, OpenMode::Write).unwrap();
        file.select_format();
        file.write_int(1).unwrap();
        file.write_int(2).unwrap();
        file.close().unwrap();

        let mut file = RecordFile::open(&path, OpenMode::Read).unwrap();
        file.select_format();
        assert_eq!(file.read_int().unwrap(), 1);
        file.rewind().unwrap();
        assert_eq!(file.read_int().unwrap(), 1);
        assert_eq!(file.read_int().unwrap(), 2);
        assert!(matches!(
            file.read_int(),
            Err(FioError::UnexpectedEof(FieldKind::Int))
        ));
    }

    #[test]
    fn append_mode_extends_raw_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frames.trj");
        let mut file = RecordFile::open(&path, OpenMode::Write).unwrap();
        file.select_format();
        file.write_int(1).unwrap();
        file.close().unwrap();

        let mut file = RecordFile::open(&path, OpenMode::Append).unwrap();
        file.select_format();
        file.write_int(2).unwrap();
        assert_eq!(file.tell().unwrap(), 8);
        file.close().unwrap();

        let mut file = RecordFile::open(&path, OpenMode::Read).unwrap();
        file.select_format();
        assert_eq!(file.read_int().unwrap(), 1);
        assert_eq!(file.read_int().unwrap(), 2);
    }
}
