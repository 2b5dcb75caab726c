//! Refinement stage: a language model rephrases lexical translations.
//!
//! Refinement never fails a job. Any cue whose reply is missing or
//! implausible keeps its lexical text.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engines::{Engines, ModelFamily, ProgressFn, RefineRequest};
use crate::error::{Error, Result};
use crate::guard::ResourceGuard;
use crate::language::Language;
use crate::settings::RefineTuning;
use crate::srt::Cue;

pub struct RefineParams<'a> {
    pub endpoint: &'a str,
    pub model: &'a str,
    pub temperature: f32,
    pub target: &'a Language,
    pub tuning: &'a RefineTuning,
}

#[derive(Debug, Clone)]
pub struct RefineOutcome {
    pub cues: Vec<Cue>,
    /// Cues that kept their lexical text.
    pub fallbacks: usize,
    /// The endpoint could not be reached at some point.
    pub unreachable: bool,
}

/// Refine every cue. Only cancellation is returned as an error.
pub async fn refine(
    engines: &Engines,
    guard: &ResourceGuard,
    cues: &[Cue],
    params: &RefineParams<'_>,
    progress: ProgressFn,
    cancel: &CancellationToken,
) -> Result<RefineOutcome> {
    let _lease = guard.acquire(ModelFamily::Refinement, engines).await;

    let system = system_prompt(params.target);
    let mut refined = Vec::with_capacity(cues.len());
    let mut fallbacks = 0;
    let mut unreachable = false;

    for (i, cue) in cues.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let text = if unreachable {
            None
        } else {
            let request = RefineRequest {
                endpoint: params.endpoint.to_string(),
                model: params.model.to_string(),
                temperature: params.temperature,
                system: system.clone(),
                prompt: user_prompt(cues, i, params.tuning.context_cues),
                timeout: Duration::from_secs(params.tuning.timeout_secs),
            };
            match engines.refiner.complete(&request).await {
                Ok(reply) => {
                    let accepted = plausible(&reply, &cue.text, params.tuning);
                    if accepted.is_none() {
                        debug!(index = cue.index, reply = %reply, "implausible refinement");
                    }
                    accepted
                }
                Err(Error::Unreachable(reason)) => {
                    warn!(%reason, "refinement endpoint unreachable, keeping lexical text");
                    unreachable = true;
                    None
                }
                Err(e) => {
                    warn!(index = cue.index, error = %e, "refinement failed for cue");
                    None
                }
            }
        };

        let text = text.unwrap_or_else(|| {
            fallbacks += 1;
            cue.text.clone()
        });
        refined.push(Cue::new(cue.index, cue.start_ms, cue.end_ms, text));
        progress((i + 1) as f32 / cues.len() as f32);
    }

    info!(cues = cues.len(), fallbacks, "refinement complete");
    Ok(RefineOutcome {
        cues: refined,
        fallbacks,
        unreachable,
    })
}

fn system_prompt(target: &Language) -> String {
    format!(
        "You are a professional subtitle editor. You receive one {lang} subtitle line \
         produced by machine translation, with neighbouring lines for context. Rewrite \
         only that line so it reads naturally in {lang}, keeping its meaning and keeping \
         it about as short as the original. Reply with the rewritten line and nothing else.",
        lang = target.name()
    )
}

fn user_prompt(cues: &[Cue], i: usize, context: usize) -> String {
    let mut prompt = String::new();
    for cue in &cues[i.saturating_sub(context)..i] {
        prompt.push_str(&format!("Previous: {}\n", cue.text));
    }
    prompt.push_str(&format!("Line: {}\n", cues[i].text));
    for cue in cues.iter().skip(i + 1).take(context) {
        prompt.push_str(&format!("Next: {}\n", cue.text));
    }
    prompt
}

/// Clean up a reply and accept it only if its length is close to the lexical text.
fn plausible(reply: &str, lexical: &str, tuning: &RefineTuning) -> Option<String> {
    let mut text = reply.trim();
    for (open, close) in [('"', '"'), ('\u{201c}', '\u{201d}'), ('\'', '\'')] {
        if text.len() > 1 && text.starts_with(open) && text.ends_with(close) {
            text = text[open.len_utf8()..text.len() - close.len_utf8()].trim();
        }
    }

    let len = text.chars().count();
    if len < tuning.min_chars {
        return None;
    }
    let ratio = len as f64 / lexical.chars().count().max(1) as f64;
    (tuning.min_length_ratio..=tuning.max_length_ratio)
        .contains(&ratio)
        .then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::settings::{Settings, SettingsStore};
    use crate::testing::{FakeRefiner, TestEngines};

    fn cues() -> Vec<Cue> {
        vec![
            Cue::new(1, 0, 1_000, "Goedendag allemaal"),
            Cue::new(2, 1_000, 2_000, "Hoe gaat het met jullie"),
            Cue::new(3, 2_000, 3_000, "Prima dank je"),
        ]
    }

    async fn run(t: &TestEngines, input: &[Cue]) -> RefineOutcome {
        let nl = Language::new("nl").unwrap();
        let guard = ResourceGuard::new(Arc::new(SettingsStore::in_memory(Settings::default())));
        refine(
            &t.engines(),
            &guard,
            input,
            &RefineParams {
                endpoint: "http://ollama",
                model: "llama",
                temperature: 0.3,
                target: &nl,
                tuning: &RefineTuning::default(),
            },
            Arc::new(|_: f32| {}),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_plausible_replies_replace_text() {
        let t = TestEngines::new().refiner(FakeRefiner::with(|req| {
            let line = req.prompt.lines().find_map(|l| l.strip_prefix("Line: ")).unwrap_or("");
            Ok(format!("\"{}!\"", line))
        }));
        let out = run(&t, &cues()).await;
        assert_eq!(out.fallbacks, 0);
        assert_eq!(out.cues[0].text, "Goedendag allemaal!");
        assert_eq!(out.cues[2].start_ms, 2_000);
        assert_eq!(t.refiner.calls(), 3);
    }

    #[tokio::test]
    async fn test_implausible_replies_fall_back() {
        let t = TestEngines::new().refiner(FakeRefiner::with(|req| {
            if req.prompt.contains("Line: Prima") {
                Ok("x".into())
            } else {
                Ok("Dit is een veel te lang antwoord dat niets met de regel te maken heeft".into())
            }
        }));
        let out = run(&t, &cues()).await;
        assert_eq!(out.fallbacks, 3);
        assert_eq!(out.cues, cues());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_stops_requests() {
        let t = TestEngines::new().refiner(FakeRefiner::unreachable());
        let out = run(&t, &cues()).await;
        assert!(out.unreachable);
        assert_eq!(out.fallbacks, 3);
        assert_eq!(out.cues, cues());
        assert_eq!(t.refiner.calls(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_are_per_cue() {
        let t = TestEngines::new().refiner(FakeRefiner::with(|req| {
            if req.prompt.contains("Line: Hoe") {
                Err(Error::Refinement("500".into()))
            } else {
                let line = req.prompt.lines().find_map(|l| l.strip_prefix("Line: ")).unwrap_or("");
                Ok(line.to_string())
            }
        }));
        let out = run(&t, &cues()).await;
        assert_eq!(out.fallbacks, 1);
        assert!(!out.unreachable);
        assert_eq!(t.refiner.calls(), 3);
    }

    #[test]
    fn test_prompt_includes_context() {
        let prompt = user_prompt(&cues(), 1, 1);
        assert_eq!(
            prompt,
            "Previous: Goedendag allemaal\nLine: Hoe gaat het met jullie\nNext: Prima dank je\n"
        );
        assert!(user_prompt(&cues(), 0, 1).starts_with("Line: "));
    }

    #[test]
    fn test_plausible_bounds() {
        let tuning = RefineTuning::default();
        assert_eq!(plausible("  'Hallo daar' ", "Hallo daar", &tuning).as_deref(), Some("Hallo daar"));
        assert!(plausible("", "Hallo", &tuning).is_none());
        assert!(plausible("a", "a", &tuning).is_none());
        assert!(plausible("Hoi", "Hallo daar allemaal", &tuning).is_none());
    }
}
