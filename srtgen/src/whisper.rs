use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::audio::SAMPLE_RATE;
use crate::config::SpeechOptions;
use crate::engines::{ProgressFn, SpeechModel};
use crate::error::{Error, Result};
use crate::types::{Segment, Transcript, Word};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ContextKey {
    path: PathBuf,
    gpu: bool,
    gpu_device: u32,
}

/// whisper.cpp speech model. Keeps the last loaded context resident until
/// [`SpeechModel::unload`] is called.
#[derive(Default)]
pub struct WhisperSpeech {
    loaded: Mutex<Option<(ContextKey, Arc<WhisperContext>)>>,
}

impl WhisperSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<(ContextKey, Arc<WhisperContext>)>> {
        match self.loaded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn context(&self, model_path: &Path, options: &SpeechOptions) -> Result<Arc<WhisperContext>> {
        let key = ContextKey {
            path: model_path.to_path_buf(),
            gpu: options.gpu,
            gpu_device: options.gpu_device,
        };

        let mut slot = self.slot();
        if let Some((loaded_key, ctx)) = slot.as_ref() {
            if *loaded_key == key {
                return Ok(Arc::clone(ctx));
            }
        }
        // Drop the previous context before loading the next one.
        *slot = None;

        info!(model = %model_path.display(), gpu = options.gpu, "loading whisper model");
        let mut ctx_params = WhisperContextParameters::new();
        ctx_params.use_gpu(options.gpu);
        ctx_params.gpu_device(options.gpu_device as i32);

        let ctx = Arc::new(WhisperContext::new_with_params(
            model_path
                .to_str()
                .ok_or_else(|| Error::Transcription("model path contains invalid UTF-8".into()))?,
            ctx_params,
        )?);
        *slot = Some((key, Arc::clone(&ctx)));
        Ok(ctx)
    }
}

/// Language passed to whisper.cpp. Unset means "auto", which detects the
/// language and then transcribes; `detect_language` alone would stop after
/// detection with no segments.
fn language_param(options: &SpeechOptions) -> &str {
    options.language.as_deref().unwrap_or("auto")
}

impl SpeechModel for WhisperSpeech {
    fn transcribe(
        &self,
        model_path: &Path,
        samples: &[f32],
        options: &SpeechOptions,
        progress: ProgressFn,
    ) -> Result<Transcript> {
        let ctx = self.context(model_path, options)?;
        let mut state = ctx.create_state()?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 5 });
        params.set_language(Some(language_param(options)));
        params.set_translate(options.translate);
        params.set_token_timestamps(true);
        params.set_temperature(options.temperature);

        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_progress_callback_safe(move |percent: i32| {
            progress(percent.clamp(0, 100) as f32 / 100.0);
        });

        info!(
            samples = samples.len(),
            translate = options.translate,
            "running transcription"
        );
        state.full(params, samples)?;

        let num_segments = state.full_n_segments();
        debug!(num_segments, "transcription complete");

        let mut segments = Vec::with_capacity(num_segments.max(0) as usize);
        for i in 0..num_segments {
            let segment = state
                .get_segment(i)
                .ok_or_else(|| Error::Transcription(format!("segment {i} not found")))?;

            let text = segment
                .to_str_lossy()
                .map_err(|e| Error::Transcription(format!("segment text error: {e}")))?
                .into_owned();

            let words = {
                let mut word_list = Vec::new();
                for t in 0..segment.n_tokens() {
                    let Some(token) = segment.get_token(t) else {
                        continue;
                    };
                    let Ok(token_text) = token.to_str_lossy() else {
                        continue;
                    };

                    // Special tokens start with '[' or '<'
                    let trimmed = token_text.trim();
                    if trimmed.is_empty() || trimmed.starts_with('[') || trimmed.starts_with('<') {
                        continue;
                    }

                    let data = token.token_data();
                    word_list.push(Word {
                        text: token_text.into_owned(),
                        start: data.t0 as f64 / 100.0,
                        end: data.t1 as f64 / 100.0,
                        probability: data.p,
                    });
                }
                Some(word_list)
            };

            segments.push(Segment {
                start: segment.start_timestamp() as f64 / 100.0,
                end: segment.end_timestamp() as f64 / 100.0,
                text,
                no_speech_probability: segment.no_speech_probability(),
                words,
            });
        }

        let language = if options.translate {
            "en".to_string()
        } else {
            whisper_rs::get_lang_str(state.full_lang_id_from_state())
                .unwrap_or("unknown")
                .to_string()
        };

        Ok(Transcript {
            segments,
            language,
            duration: samples.len() as f64 / SAMPLE_RATE as f64,
            model: model_path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
        })
    }

    fn unload(&self) {
        if let Some((key, ctx)) = self.slot().take() {
            let others = Arc::strong_count(&ctx) - 1;
            drop(ctx);
            if others > 0 {
                tracing::warn!(
                    model = %key.path.display(),
                    others,
                    "whisper context still referenced after unload"
                );
            } else {
                info!(model = %key.path.display(), "whisper model unloaded");
            }
        }
    }
}
