use crate::OptionDifference;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_RUNTIME_ERROR: i32 = 1;
pub const EXIT_STAGE_FAILURE: i32 = 2;
pub const EXIT_CORRUPT_CHECKPOINT: i32 = 3;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("checkpoint '{path}' is corrupt: {reason}")]
    CorruptCheckpoint { path: PathBuf, reason: String },
    #[error("failed persisting checkpoint '{path}': {reason}")]
    CheckpointIo { path: PathBuf, reason: String },
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
    #[error("version control error: {0}")]
    Vcs(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CorruptCheckpoint { .. } => EXIT_CORRUPT_CHECKPOINT,
            _ => EXIT_RUNTIME_ERROR,
        }
    }
}

/// Error raised by a stage. The orchestrator only needs its message; the
/// source is kept for callers that want to inspect the chain.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn from_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: String,
    pub message: String,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage '{}' failed: {}", self.stage, self.message)
    }
}

/// Why a well-formed checkpoint was not trusted for this run.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckpointRejection {
    HeadChanged { expected: String, actual: String },
    HeadUnavailable(String),
    OptionsChanged(Vec<OptionDifference>),
}

impl fmt::Display for CheckpointRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeadChanged { expected, actual } => write!(
                f,
                "repository head moved from '{expected}' to '{actual}'"
            ),
            Self::HeadUnavailable(reason) => {
                write!(f, "repository head could not be read: {reason}")
            }
            Self::OptionsChanged(differences) => {
                let paths: Vec<&str> = differences.iter().map(|d| d.path.as_str()).collect();
                write!(f, "checkpoint-relevant options changed: {}", paths.join(", "))
            }
        }
    }
}
