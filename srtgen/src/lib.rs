//! Subtitle generation service: video in, transcribed and translated SRT files out.
//!
//! **srtgen** runs a background job queue over a multi-stage pipeline:
//! audio extraction (via ffmpeg), transcription with an English pass (via
//! whisper.cpp), batch translation into a target language (via an NLLB
//! translation server) and an optional rephrasing pass (via an
//! Ollama-compatible chat endpoint).
//!
//! # Quick start
//!
//! ```rust,no_run
//! # #[tokio::main]
//! # async fn main() -> srtgen::Result<()> {
//! use srtgen::{JobRequest, Method};
//!
//! let (queue, scheduler) = srtgen::start_service("/var/lib/srtgen")?;
//! let id = queue.enqueue(JobRequest {
//!     path: "/media/movie.mkv".into(),
//!     language: "nl".into(),
//!     method: Method::Lexical,
//!     ..JobRequest::default()
//! })?;
//! println!("queued job {id}");
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! For input `movie.mkv` a job writes up to three siblings: `movie.<source>.srt`,
//! `movie.en.srt` and `movie.<target>.srt`.

pub(crate) mod audio;
pub mod config;
pub mod engines;
pub mod error;
pub mod guard;
pub mod history;
pub mod job;
pub mod language;
pub mod lexical;
pub mod model;
pub(crate) mod nllb;
pub(crate) mod ollama;
pub mod pipeline;
pub mod queue;
pub mod refine;
pub mod settings;
pub mod srt;
pub mod transcribe;
pub mod types;
#[cfg(feature = "whisper")]
pub(crate) mod whisper;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{default_data_dir, Method, Model, SpeechOptions};
pub use engines::{Engines, ModelFamily};
pub use error::{Error, Result, StageFailure};
pub use guard::ResourceGuard;
pub use history::History;
pub use job::{Job, JobId, JobRequest, JobSpec, JobStatus, Stage};
pub use language::Language;
pub use pipeline::{Pipeline, Reporter, RunOutcome};
pub use queue::{BatchOutcome, JobQueue, Scheduler};
pub use settings::{Settings, SettingsStore, SettingsUpdate};
pub use srt::Cue;
pub use types::{Segment, Transcript, Word};

use std::path::Path;
use std::sync::Arc;

pub const SETTINGS_FILE: &str = "settings.json";
pub const HISTORY_FILE: &str = "history.jsonl";

/// Load settings and history from `data_dir` and build a pipeline over the
/// production engines.
pub fn open_pipeline(data_dir: impl AsRef<Path>) -> Result<(Pipeline, Arc<SettingsStore>)> {
    let settings = Arc::new(SettingsStore::load(data_dir.as_ref().join(SETTINGS_FILE))?);
    let guard = ResourceGuard::new(Arc::clone(&settings));
    let pipeline = Pipeline::new(Engines::production(), guard, Arc::clone(&settings));
    Ok((pipeline, settings))
}

/// Open the queue stored under `data_dir` and start dispatching jobs.
pub fn start_service(data_dir: impl AsRef<Path>) -> Result<(JobQueue, Scheduler)> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;

    let (pipeline, settings) = open_pipeline(data_dir)?;
    let history = History::open(data_dir.join(HISTORY_FILE))?;
    let queue = JobQueue::new(pipeline, history, settings);
    let scheduler = Scheduler::spawn(queue.clone());
    Ok((queue, scheduler))
}
