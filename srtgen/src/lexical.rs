//! Lexical translation stage.
//!
//! Cues are sent to the translation model in small batches joined with a
//! separator, so each line is translated with its neighbours as context.
//! Timestamps come from the input cues; a cue whose translation is much
//! longer than its source gets extra display time.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engines::{Engines, ModelFamily, ProgressFn, TranslationRequest};
use crate::error::{Error, Result};
use crate::guard::ResourceGuard;
use crate::language::Language;
use crate::settings::LexicalTuning;
use crate::srt::{renumber, Cue};

const SEPARATOR: &str = " | ";

pub struct LexicalParams<'a> {
    pub endpoint: &'a str,
    pub model: &'a str,
    pub source: &'a Language,
    pub target: &'a Language,
    pub tuning: &'a LexicalTuning,
}

/// Translate `cues` into the target language, one output cue per input cue.
pub async fn translate_lexical(
    engines: &Engines,
    guard: &ResourceGuard,
    cues: &[Cue],
    params: &LexicalParams<'_>,
    progress: ProgressFn,
    cancel: &CancellationToken,
) -> Result<Vec<Cue>> {
    if cues.is_empty() {
        progress(1.0);
        return Ok(Vec::new());
    }

    let _lease = guard.acquire(ModelFamily::Translation, engines).await;
    let batch_size = params.tuning.batch_size.max(1);
    let total = cues.len().div_ceil(batch_size);

    let mut translated = Vec::with_capacity(cues.len());
    for (n, batch) in cues.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let texts = translate_batch(engines, params, batch).await?;
        for (cue, text) in batch.iter().zip(texts) {
            let text = if text.trim().is_empty() {
                debug!(index = cue.index, "empty translation, keeping source text");
                cue.text.clone()
            } else {
                text.trim().to_string()
            };
            translated.push(Cue::new(cue.index, cue.start_ms, cue.end_ms, text));
        }
        progress((n + 1) as f32 / total as f32);
    }

    extend_timing(cues, &mut translated, params.tuning);
    renumber(&mut translated);
    Ok(translated)
}

async fn translate_batch(
    engines: &Engines,
    params: &LexicalParams<'_>,
    batch: &[Cue],
) -> Result<Vec<String>> {
    let texts: Vec<String> = batch.iter().map(|c| c.text.replace('\n', " ")).collect();

    if texts.len() > 1 {
        let joined = [texts.join(SEPARATOR)];
        let out = request(engines, params, &joined).await?;
        if let Some(first) = out.first() {
            let parts: Vec<String> = first.split('|').map(|p| p.trim().to_string()).collect();
            if parts.len() == texts.len() {
                return Ok(parts);
            }
            warn!(
                expected = texts.len(),
                got = parts.len(),
                "batch split mismatch, translating cues individually"
            );
        }
    }

    request(engines, params, &texts).await
}

async fn request(engines: &Engines, params: &LexicalParams<'_>, texts: &[String]) -> Result<Vec<String>> {
    let out = engines
        .translator
        .translate(&TranslationRequest {
            endpoint: params.endpoint,
            model: params.model,
            source: params.source,
            target: params.target,
            texts,
        })
        .await
        .map_err(|e| match e {
            Error::Translation(_) => e,
            other => Error::Translation(other.to_string()),
        })?;

    if out.len() != texts.len() {
        return Err(Error::Translation(format!(
            "expected {} translations, got {}",
            texts.len(),
            out.len()
        )));
    }
    Ok(out)
}

/// Give longer translations more display time, without running into the next cue.
fn extend_timing(source: &[Cue], translated: &mut [Cue], tuning: &LexicalTuning) {
    for i in 0..translated.len() {
        let source_len = source[i].text.chars().count().max(1) as f64;
        let target_len = translated[i].text.chars().count() as f64;
        let ratio = (target_len / source_len).min(tuning.max_length_ratio);
        if ratio <= tuning.extend_threshold {
            continue;
        }

        let extension = ((ratio - 1.0) * tuning.extension_ms_per_ratio as f64).round() as u64;
        let end = translated[i].end_ms;
        let new_end = match translated.get(i + 1) {
            Some(next) if next.start_ms <= end => continue,
            Some(next) => (end + extension).min(next.start_ms),
            None => end + extension,
        };
        translated[i].end_ms = new_end;
    }
}
