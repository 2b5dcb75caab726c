use std::path::PathBuf;

use crate::job::Stage;

/// All errors that can occur in srtgen.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("output files already exist: {}", display_paths(.paths))]
    Conflict { paths: Vec<PathBuf> },

    #[error("transcription error: {0}")]
    Transcription(String),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("refinement error: {0}")]
    Refinement(String),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("job was cancelled")]
    Cancelled,

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("cannot encode subtitle {index}: end {end_ms}ms is not after start {start_ms}ms")]
    Encoding {
        index: usize,
        start_ms: u64,
        end_ms: u64,
    },

    #[error("malformed subtitle block {block}: {reason}")]
    Parse { block: usize, reason: String },

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error("job {id} is {status}, expected {expected}")]
    InvalidState {
        id: u64,
        status: String,
        expected: &'static str,
    },

    #[error("settings error: {0}")]
    Settings(String),

    #[error("model not found: {path}")]
    ModelNotFound { path: PathBuf },

    #[error("model download failed: {0}")]
    ModelDownload(String),

    #[error("audio decoding error: {0}")]
    AudioDecode(String),

    #[error("audio file not found: {path}")]
    AudioNotFound { path: PathBuf },

    #[cfg(feature = "whisper")]
    #[error("whisper error: {0}")]
    Whisper(#[from] whisper_rs::WhisperError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error ends a job as `cancelled` rather than `failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// A pipeline error tagged with the stage that raised it.
#[derive(Debug, thiserror::Error)]
#[error("{stage}: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl StageFailure {
    pub fn new(stage: Stage, error: Error) -> Self {
        Self { stage, error }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
