use thiserror::Error;

use super::comm::CommError;
use super::config::ConfigError;
use crate::core::hardware::HardwareError;
use crate::core::io::checkpoint::CheckpointError;
use crate::core::io::description::DescriptionError;
use crate::core::io::fio::FioError;
use crate::core::io::run_input::RunInputError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Insufficient resources: {0}")]
    Resource(String),

    #[error("Checkpoint does not match the run: {0}")]
    RestartMismatch(String),

    #[error("Collective operation failed: {source}")]
    Collective {
        #[from]
        source: CommError,
    },

    #[error("File I/O failed: {0}")]
    Io(String),

    #[error("Internal logic error: {0}")]
    Internal(String),
}

/// Category of an [`EngineError`], shared between ranks together with its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Configuration,
    Resource,
    RestartMismatch,
    Collective,
    Io,
    Internal,
}

/// A cloneable copy of an error, broadcast by the coordinator so that every rank fails
/// the same way at a decision point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Resource(_) => FailureKind::Resource,
            Self::RestartMismatch(_) => FailureKind::RestartMismatch,
            Self::Collective { .. } => FailureKind::Collective,
            Self::Io(_) => FailureKind::Io,
            Self::Internal(_) => FailureKind::Internal,
        }
    }

    pub fn to_shared(&self) -> SharedFailure {
        let message = match self {
            Self::Configuration(m)
            | Self::Resource(m)
            | Self::RestartMismatch(m)
            | Self::Io(m)
            | Self::Internal(m) => m.clone(),
            Self::Collective { source } => source.to_string(),
        };
        SharedFailure {
            kind: self.kind(),
            message,
        }
    }

    /// Errors caused by the input or the request rather than by the environment.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::RestartMismatch(_))
    }

    /// True when this rank only failed because another rank aborted the run.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::Collective {
                source: CommError::Aborted
            }
        )
    }

    /// Process exit code for a run that ended in this error.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl From<SharedFailure> for EngineError {
    fn from(failure: SharedFailure) -> Self {
        let m = failure.message;
        match failure.kind {
            FailureKind::Configuration => Self::Configuration(m),
            FailureKind::Resource => Self::Resource(m),
            FailureKind::RestartMismatch => Self::RestartMismatch(m),
            FailureKind::Collective => Self::Collective {
                source: CommError::Remote(m),
            },
            FailureKind::Io => Self::Io(m),
            FailureKind::Internal => Self::Internal(m),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<HardwareError> for EngineError {
    fn from(e: HardwareError) -> Self {
        Self::Resource(e.to_string())
    }
}

impl From<FioError> for EngineError {
    fn from(e: FioError) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<RunInputError> for EngineError {
    fn from(e: RunInputError) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<CheckpointError> for EngineError {
    fn from(e: CheckpointError) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<DescriptionError> for EngineError {
    fn from(e: DescriptionError) -> Self {
        match e {
            DescriptionError::Invalid(m) => Self::Configuration(m),
            other => Self::Io(other.to_string()),
        }
    }
}

impl From<csv::Error> for EngineError {
    fn from(e: csv::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_failure_keeps_category_and_message() {
        let original = EngineError::RestartMismatch("particle count differs".into());
        let shared = original.to_shared();
        let restored = EngineError::from(shared.clone());
        assert_eq!(restored.kind(), FailureKind::RestartMismatch);
        assert_eq!(restored.to_string(), original.to_string());
        assert!(restored.is_fatal_configuration());
    }

    #[test]
    fn abort_is_recognized() {
        let e = EngineError::from(CommError::Aborted);
        assert!(e.is_abort());
        assert!(!EngineError::Internal("x".into()).is_abort());
        assert_eq!(e.exit_code(), 1);
    }
}
