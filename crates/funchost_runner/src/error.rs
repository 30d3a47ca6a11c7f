//! Error types for the runner module.

use std::path::PathBuf;

use funchost_core::{CompatibilityError, CoreError, ErrorClass};
use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur while starting or supervising a host process.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to start host process {}: {source}", .program.display())]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Host process did not provide a {0} pipe")]
    MissingPipe(&'static str),

    #[error("{0}")]
    Compatibility(#[from] CompatibilityError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Classify the error for exit code selection.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SpawnFailed { .. } | Self::MissingPipe(_) => ErrorClass::Runtime,
            Self::Compatibility(_) => ErrorClass::Validation,
            Self::Core(e) => e.class(),
            Self::Io(_) => ErrorClass::General,
        }
    }
}
