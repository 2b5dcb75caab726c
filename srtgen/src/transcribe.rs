//! Transcribe stage: speech model passes over decoded audio.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SpeechOptions;
use crate::engines::{Engines, ModelFamily, ProgressFn};
use crate::error::{Error, Result};
use crate::guard::ResourceGuard;
use crate::srt::{cues_from_transcript, Cue};
use crate::types::Transcript;

#[derive(Debug, Clone)]
pub struct TranscribeParams {
    pub model_path: PathBuf,
    pub gpu: bool,
    /// Also run the model's translate-to-English pass when the audio is not English.
    pub english_pass: bool,
}

#[derive(Debug, Clone)]
pub struct TranscribeOutput {
    pub source: Vec<Cue>,
    pub detected_language: String,
    /// Set when an English pass ran.
    pub english: Option<Vec<Cue>>,
}

/// Run the source-language pass and, if requested, the English pass.
///
/// Both passes run under one speech lease. `progress` receives the fraction
/// of the whole stage completed.
pub async fn transcribe(
    engines: &Engines,
    guard: &ResourceGuard,
    samples: Arc<Vec<f32>>,
    params: &TranscribeParams,
    progress: ProgressFn,
    cancel: &CancellationToken,
) -> Result<TranscribeOutput> {
    let _lease = guard.acquire(ModelFamily::Speech, engines).await;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let source_share = if params.english_pass { 0.6 } else { 1.0 };
    let options = SpeechOptions::new().gpu(params.gpu);

    let source = run_pass(
        engines,
        Arc::clone(&samples),
        params,
        options.clone(),
        scaled(&progress, 0.0, source_share),
    )
    .await?;
    let detected_language = source.language.clone();
    info!(language = %detected_language, segments = source.segments.len(), "source pass complete");

    let needs_english = params.english_pass && !detected_language.eq_ignore_ascii_case("en");
    let english = if needs_english {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let english = run_pass(
            engines,
            samples,
            params,
            options
                .language(Some(detected_language.clone()))
                .translate(true),
            scaled(&progress, source_share, 1.0),
        )
        .await?;
        debug!(segments = english.segments.len(), "english pass complete");
        Some(cues_from_transcript(&english))
    } else {
        None
    };
    progress(1.0);

    Ok(TranscribeOutput {
        source: cues_from_transcript(&source),
        detected_language,
        english,
    })
}

async fn run_pass(
    engines: &Engines,
    samples: Arc<Vec<f32>>,
    params: &TranscribeParams,
    options: SpeechOptions,
    progress: ProgressFn,
) -> Result<Transcript> {
    let speech = Arc::clone(&engines.speech);
    let model_path = params.model_path.clone();

    tokio::task::spawn_blocking(move || speech.transcribe(&model_path, &samples, &options, progress))
        .await
        .map_err(|e| Error::Transcription(format!("speech worker failed: {e}")))?
        .map_err(as_transcription_error)
}

/// Speech-model failures are fatal for the job and reported uniformly.
pub(crate) fn as_transcription_error(e: Error) -> Error {
    match e {
        Error::Transcription(_) | Error::Cancelled => e,
        other => Error::Transcription(other.to_string()),
    }
}

fn scaled(progress: &ProgressFn, from: f32, to: f32) -> ProgressFn {
    let progress = Arc::clone(progress);
    Arc::new(move |f: f32| progress(from + (to - from) * f.clamp(0.0, 1.0)))
}
