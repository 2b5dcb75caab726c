//! Narrow interfaces to the external collaborators: audio extraction, the
//! speech model, the translation model and the refinement endpoint.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audio::FfmpegAudio;
use crate::config::SpeechOptions;
use crate::error::Result;
use crate::guard::Reclaim;
use crate::language::Language;
use crate::nllb::NllbTranslator;
use crate::ollama::OllamaRefiner;
use crate::types::Transcript;

/// Heavyweight model groups that compete for device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Speech,
    Translation,
    Refinement,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 3] = [
        ModelFamily::Speech,
        ModelFamily::Translation,
        ModelFamily::Refinement,
    ];
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelFamily::Speech => "speech",
            ModelFamily::Translation => "translation",
            ModelFamily::Refinement => "refinement",
        })
    }
}

/// Progress callback taking the completed fraction in `[0.0, 1.0]`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

pub trait AudioLoader: Send + Sync {
    /// Decode the audio track of a media file to 16kHz mono samples.
    fn load(&self, path: &Path) -> Result<Vec<f32>>;
}

/// Blocking speech-to-text model. Called from a blocking thread.
pub trait SpeechModel: Send + Sync {
    fn transcribe(
        &self,
        model_path: &Path,
        samples: &[f32],
        options: &SpeechOptions,
        progress: ProgressFn,
    ) -> Result<Transcript>;

    /// Release any loaded weights.
    fn unload(&self);
}

pub struct TranslationRequest<'a> {
    pub endpoint: &'a str,
    pub model: &'a str,
    pub source: &'a Language,
    pub target: &'a Language,
    pub texts: &'a [String],
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate each text; the result has one entry per input, in order.
    async fn translate(&self, request: &TranslationRequest<'_>) -> Result<Vec<String>>;

    async fn unload(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RefineRequest {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub system: String,
    pub prompt: String,
    pub timeout: Duration,
}

#[async_trait]
pub trait Refiner: Send + Sync {
    /// One chat completion. Connection failures map to `Error::Unreachable`.
    async fn complete(&self, request: &RefineRequest) -> Result<String>;

    async fn unload(&self) -> Result<()> {
        Ok(())
    }
}

/// The set of engines a pipeline drives.
#[derive(Clone)]
pub struct Engines {
    pub audio: Arc<dyn AudioLoader>,
    pub speech: Arc<dyn SpeechModel>,
    pub translator: Arc<dyn Translator>,
    pub refiner: Arc<dyn Refiner>,
}

impl Engines {
    /// ffmpeg + whisper.cpp + NLLB server + Ollama.
    pub fn production() -> Self {
        Self {
            audio: Arc::new(FfmpegAudio),
            speech: default_speech_model(),
            translator: Arc::new(NllbTranslator::new()),
            refiner: Arc::new(OllamaRefiner::new()),
        }
    }
}

#[cfg(feature = "whisper")]
fn default_speech_model() -> Arc<dyn SpeechModel> {
    Arc::new(crate::whisper::WhisperSpeech::new())
}

#[cfg(not(feature = "whisper"))]
fn default_speech_model() -> Arc<dyn SpeechModel> {
    Arc::new(Unavailable)
}

#[cfg(not(feature = "whisper"))]
struct Unavailable;

#[cfg(not(feature = "whisper"))]
impl SpeechModel for Unavailable {
    fn transcribe(
        &self,
        _model_path: &Path,
        _samples: &[f32],
        _options: &SpeechOptions,
        _progress: ProgressFn,
    ) -> Result<Transcript> {
        Err(crate::Error::Transcription(
            "srtgen was built without the `whisper` feature".into(),
        ))
    }

    fn unload(&self) {}
}

#[async_trait]
impl Reclaim for Engines {
    async fn reclaim(&self, family: ModelFamily) {
        debug!(%family, "unloading model family");
        let result = match family {
            ModelFamily::Speech => {
                self.speech.unload();
                Ok(())
            }
            ModelFamily::Translation => self.translator.unload().await,
            ModelFamily::Refinement => self.refiner.unload().await,
        };
        if let Err(e) = result {
            warn!(%family, error = %e, "model unload failed");
        }
    }
}
