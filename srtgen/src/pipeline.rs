//! Per-job state machine driving the stage runners.
//!
//! `extract-audio → transcribe → [translate-english] → [translate-target] →
//! [refine] → write-outputs`. Cancellation is checked before every stage and
//! before every file write; files already written stay on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Method, Model};
use crate::engines::{Engines, ProgressFn};
use crate::error::{Error, Result, StageFailure};
use crate::guard::ResourceGuard;
use crate::job::{JobSpec, Stage};
use crate::language::Language;
use crate::lexical::{translate_lexical, LexicalParams};
use crate::model::{ensure_model, ModelSource};
use crate::refine::{refine, RefineParams};
use crate::settings::{Settings, SettingsStore};
use crate::srt::{self, Cue};
use crate::transcribe::{as_transcription_error, transcribe, TranscribeParams};

/// Receives job state changes while a pipeline runs.
pub trait Reporter: Send + Sync {
    /// A stage started; progress moves to the start of its span.
    fn stage(&self, stage: Stage, message: String);
    /// Progress within the current stage, as an overall percentage.
    fn progress(&self, percent: u8);
    /// Replace the status message without moving progress.
    fn message(&self, message: String);
    fn detected_language(&self, code: &str);
}

/// Where a job's subtitle files go: `dir/stem.<lang>.srt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPlan {
    dir: PathBuf,
    stem: String,
    /// Language of a timed-text input, `None` for media.
    subtitle_language: Option<Language>,
}

impl OutputPlan {
    pub fn for_input(input: &Path) -> Self {
        let dir = input.parent().map(Path::to_path_buf).unwrap_or_default();
        let file_stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !is_subtitle_file(input) {
            return Self {
                dir,
                stem: file_stem,
                subtitle_language: None,
            };
        }

        // `movie.nl.srt` is Dutch, `movie.srt` is assumed English.
        let (stem, language) = match file_stem.rsplit_once('.') {
            Some((stem, suffix)) if suffix.len() == 2 => match Language::new(suffix) {
                Ok(lang) => (stem.to_string(), lang),
                Err(_) => (file_stem.clone(), Language::english()),
            },
            _ => (file_stem.clone(), Language::english()),
        };
        Self {
            dir,
            stem,
            subtitle_language: Some(language),
        }
    }

    pub fn path_for(&self, code: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.srt", self.stem, code.to_lowercase()))
    }

    pub fn subtitle_language(&self) -> Option<&Language> {
        self.subtitle_language.as_ref()
    }
}

pub fn is_subtitle_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("srt"))
}

/// Files that a job would overwrite. Side-effect free.
pub fn find_conflicts(spec: &JobSpec) -> Vec<PathBuf> {
    if spec.overwrite {
        return Vec::new();
    }
    let target = OutputPlan::for_input(&spec.input).path_for(spec.target_language.code());
    if target.exists() {
        vec![target]
    } else {
        Vec::new()
    }
}

/// How a pipeline run ended.
#[derive(Debug)]
pub struct RunOutcome {
    /// Files written, in order. Kept even when the run was cancelled or failed.
    pub written: Vec<PathBuf>,
    pub result: std::result::Result<(), StageFailure>,
}

#[derive(Clone)]
pub struct Pipeline {
    engines: Engines,
    guard: ResourceGuard,
    settings: Arc<SettingsStore>,
}

/// Mutable bookkeeping for one run.
struct Run<'a> {
    spec: &'a JobSpec,
    plan: OutputPlan,
    settings: Settings,
    reporter: Arc<dyn Reporter>,
    cancel: &'a CancellationToken,
    written: Vec<PathBuf>,
}

impl Run<'_> {
    fn enter(&self, stage: Stage, message: impl Into<String>) -> std::result::Result<(), StageFailure> {
        if self.cancel.is_cancelled() {
            return Err(StageFailure::new(stage, Error::Cancelled));
        }
        debug!(%stage, "entering stage");
        self.reporter.stage(stage, message.into());
        Ok(())
    }

    fn progress_fn(&self, stage: Stage) -> ProgressFn {
        let reporter = Arc::clone(&self.reporter);
        Arc::new(move |fraction: f32| reporter.progress(stage.progress_at(fraction)))
    }

    /// Write `cues` to `path` unless it is a sibling file that already exists.
    fn write(&mut self, path: &Path, cues: &[Cue], target: bool) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !target && !self.spec.overwrite && path.exists() {
            info!(path = %path.display(), "keeping existing subtitle file");
            return Ok(());
        }
        write_srt(path, cues)?;
        info!(path = %path.display(), cues = cues.len(), "subtitles written");
        if !self.written.iter().any(|p| p == path) {
            self.written.push(path.to_path_buf());
        }
        Ok(())
    }
}

/// Encode and atomically replace `path`.
fn write_srt(path: &Path, cues: &[Cue]) -> Result<()> {
    let body = srt::encode(cues)?;
    let tmp = path.with_extension("srt.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// An existing, parseable, non-empty subtitle file.
fn read_valid(path: &Path) -> Option<Vec<Cue>> {
    let raw = std::fs::read_to_string(path).ok()?;
    match srt::decode(&raw) {
        Ok(cues) if !cues.is_empty() => Some(cues),
        Ok(_) => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable subtitle file");
            None
        }
    }
}

fn at(stage: Stage) -> impl FnOnce(Error) -> StageFailure {
    move |error| StageFailure::new(stage, error)
}

impl Pipeline {
    pub fn new(engines: Engines, guard: ResourceGuard, settings: Arc<SettingsStore>) -> Self {
        Self {
            engines,
            guard,
            settings,
        }
    }

    pub async fn run(
        &self,
        spec: &JobSpec,
        reporter: Arc<dyn Reporter>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut run = Run {
            spec,
            plan: OutputPlan::for_input(&spec.input),
            settings: self.settings.get(),
            reporter,
            cancel,
            written: Vec::new(),
        };

        let result = self.execute(&mut run).await;
        match &result {
            Ok(()) => info!(input = %spec.input.display(), files = run.written.len(), "pipeline complete"),
            Err(f) if f.error.is_cancellation() => info!(stage = %f.stage, "pipeline cancelled"),
            Err(f) => warn!(stage = %f.stage, error = %f.error, "pipeline failed"),
        }
        RunOutcome {
            written: run.written,
            result,
        }
    }

    async fn execute(&self, run: &mut Run<'_>) -> std::result::Result<(), StageFailure> {
        let conflicts = find_conflicts(run.spec);
        if !conflicts.is_empty() {
            return Err(StageFailure::new(
                Stage::ExtractAudio,
                Error::Conflict { paths: conflicts },
            ));
        }

        let (source_lang, english) = match run.plan.subtitle_language().cloned() {
            Some(lang) => (lang, self.load_subtitles(run)?),
            None => match self.media_english(run).await? {
                Some(cues) => (Language::english(), cues),
                // Source-only, or the target is already on disk.
                None => return self.finish(run),
            },
        };

        let target = run.spec.target_language.clone();
        run.enter(Stage::TranslateTarget, format!("Translating to {}", target.name()))?;
        let settings = &run.settings;
        let mut cues = translate_lexical(
            &self.engines,
            &self.guard,
            &english,
            &LexicalParams {
                endpoint: &settings.translation_endpoint,
                model: &run.spec.models.translation_model,
                source: &source_lang,
                target: &target,
                tuning: &settings.lexical,
            },
            run.progress_fn(Stage::TranslateTarget),
            run.cancel,
        )
        .await
        .map_err(at(Stage::TranslateTarget))?;

        if run.spec.method.refines() {
            run.enter(Stage::Refine, "Refining translation")?;
            let models = &run.spec.models;
            let outcome = refine(
                &self.engines,
                &self.guard,
                &cues,
                &RefineParams {
                    endpoint: &models.refine_endpoint,
                    model: &models.refine_model,
                    temperature: models.refine_temperature,
                    target: &target,
                    tuning: &run.settings.refine,
                },
                run.progress_fn(Stage::Refine),
                run.cancel,
            )
            .await
            .map_err(at(Stage::Refine))?;
            if outcome.fallbacks > 0 {
                run.reporter.message(format!(
                    "Refinement kept lexical text for {} of {} lines",
                    outcome.fallbacks,
                    cues.len()
                ));
            }
            cues = outcome.cues;
        }

        run.enter(Stage::WriteOutputs, "Writing subtitles")?;
        let path = run.plan.path_for(target.code());
        run.write(&path, &cues, true).map_err(at(Stage::WriteOutputs))?;
        self.finish(run)
    }

    fn finish(&self, run: &mut Run<'_>) -> std::result::Result<(), StageFailure> {
        run.reporter.progress(100);
        Ok(())
    }

    /// Cues of a timed-text input.
    fn load_subtitles(&self, run: &mut Run<'_>) -> std::result::Result<Vec<Cue>, StageFailure> {
        run.enter(Stage::TranslateEnglish, "Reading subtitles")?;
        let raw = std::fs::read_to_string(&run.spec.input)
            .map_err(|e| StageFailure::new(Stage::TranslateEnglish, e.into()))?;
        let cues = srt::decode(&raw).map_err(at(Stage::TranslateEnglish))?;
        if let Some(lang) = run.plan.subtitle_language() {
            run.reporter.detected_language(lang.code());
        }
        Ok(cues)
    }

    /// Produce the source-language and English files for a media input.
    ///
    /// Returns the English cues to translate from, or `None` when no
    /// translation is needed.
    async fn media_english(
        &self,
        run: &mut Run<'_>,
    ) -> std::result::Result<Option<Vec<Cue>>, StageFailure> {
        let spec = run.spec;
        let target = &spec.target_language;
        let english_path = run.plan.path_for("en");

        let reusable = match spec.method {
            Method::LexicalReuse => read_valid(&english_path),
            Method::Lexical | Method::LexicalRefine if !spec.overwrite => read_valid(&english_path),
            _ => None,
        };

        if spec.method == Method::LexicalReuse {
            if let Some(english) = reusable {
                info!(path = %english_path.display(), cues = english.len(), "reusing english subtitles");
                run.enter(Stage::TranslateEnglish, "Reusing existing English subtitles")?;
                if target.is_english() {
                    run.written.push(english_path);
                    return Ok(None);
                }
                return Ok(Some(english));
            }
        }

        run.enter(Stage::ExtractAudio, "Extracting audio")?;
        let audio = Arc::clone(&self.engines.audio);
        let input = spec.input.clone();
        let samples = tokio::task::spawn_blocking(move || audio.load(&input))
            .await
            .map_err(|e| Error::Transcription(format!("audio worker failed: {e}")))
            .and_then(|r| r.map_err(as_transcription_error))
            .map_err(at(Stage::ExtractAudio))?;

        run.enter(Stage::Transcribe, "Transcribing audio")?;
        let model_path = self
            .model_path(&spec.models.whisper_model, &run.settings)
            .await
            .map_err(at(Stage::Transcribe))?;
        let output = transcribe(
            &self.engines,
            &self.guard,
            Arc::new(samples),
            &TranscribeParams {
                model_path,
                gpu: run.settings.gpu,
                english_pass: spec.method.translates() && reusable.is_none(),
            },
            run.progress_fn(Stage::Transcribe),
            run.cancel,
        )
        .await
        .map_err(at(Stage::Transcribe))?;

        let detected = output.detected_language.to_lowercase();
        run.reporter.detected_language(&detected);
        let source_path = run.plan.path_for(&detected);
        let source_is_target = target.matches(&detected);
        let source_only = !spec.method.translates();
        // A source-only job's one output is only known once the language is.
        if source_only && !spec.overwrite && source_path.exists() {
            return Err(StageFailure::new(
                Stage::Transcribe,
                Error::Conflict {
                    paths: vec![source_path],
                },
            ));
        }
        run.write(&source_path, &output.source, source_is_target || source_only)
            .map_err(at(Stage::Transcribe))?;

        if source_only || source_is_target {
            return Ok(None);
        }

        run.enter(Stage::TranslateEnglish, "Preparing English subtitles")?;
        let english = match (reusable, output.english) {
            (Some(cues), _) => {
                info!(path = %english_path.display(), "reusing english subtitles");
                cues
            }
            (None, Some(cues)) => {
                run.write(&english_path, &cues, target.is_english())
                    .map_err(at(Stage::TranslateEnglish))?;
                cues
            }
            // English audio: the source file is the English file.
            (None, None) => output.source,
        };

        if target.is_english() {
            if !run.written.contains(&english_path) {
                run.written.push(english_path);
            }
            return Ok(None);
        }
        Ok(Some(english))
    }

    async fn model_path(&self, name: &str, settings: &Settings) -> Result<PathBuf> {
        let model = Model::resolve(name)?;
        let source = ModelSource {
            cache_dir: settings.cache_dir(),
            bandwidth_limit: settings.bandwidth_limit(),
        };
        ensure_model(&model, &source, &ProgressBar::hidden()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::Method;
    use crate::testing::{job_spec_for, FakeRefiner, FakeSpeech, TestEngines, Workspace};

    #[derive(Default)]
    struct Recorder {
        stages: Mutex<Vec<Stage>>,
        progress: Mutex<Vec<u8>>,
        language: Mutex<Option<String>>,
    }

    impl Reporter for Recorder {
        fn stage(&self, stage: Stage, _message: String) {
            self.stages.lock().unwrap().push(stage);
        }
        fn progress(&self, percent: u8) {
            self.progress.lock().unwrap().push(percent);
        }
        fn message(&self, _message: String) {}
        fn detected_language(&self, code: &str) {
            *self.language.lock().unwrap() = Some(code.to_string());
        }
    }

    async fn run(t: &TestEngines, ws: &Workspace, spec: &JobSpec) -> (RunOutcome, Arc<Recorder>) {
        let pipeline = t.pipeline(ws);
        let recorder = Arc::new(Recorder::default());
        let outcome = pipeline
            .run(spec, recorder.clone(), &CancellationToken::new())
            .await;
        (outcome, recorder)
    }

    #[test]
    fn test_output_plan_paths() {
        let plan = OutputPlan::for_input(Path::new("/media/show/movie.mkv"));
        assert_eq!(plan.path_for("nl"), PathBuf::from("/media/show/movie.nl.srt"));
        assert!(plan.subtitle_language().is_none());

        let plan = OutputPlan::for_input(Path::new("/media/movie.de.srt"));
        assert_eq!(plan.subtitle_language().unwrap().code(), "de");
        assert_eq!(plan.path_for("nl"), PathBuf::from("/media/movie.nl.srt"));

        let plan = OutputPlan::for_input(Path::new("/media/movie.final.srt"));
        assert!(plan.subtitle_language().unwrap().is_english());
        assert_eq!(plan.path_for("nl"), PathBuf::from("/media/movie.final.nl.srt"));
    }

    #[test]
    fn test_find_conflicts_is_side_effect_free() {
        let ws = Workspace::new();
        let input = ws.file("movie.mkv", "");
        let mut spec = job_spec_for(&input, "nl", Method::Lexical);
        assert!(find_conflicts(&spec).is_empty());

        let existing = ws.file("movie.nl.srt", "1\n00:00:00,000 --> 00:00:01,000\nHoi\n");
        assert_eq!(find_conflicts(&spec), vec![existing.clone()]);
        assert_eq!(find_conflicts(&spec), vec![existing.clone()]);
        assert!(existing.exists());

        spec.overwrite = true;
        assert!(find_conflicts(&spec).is_empty());
    }

    #[tokio::test]
    async fn test_lexical_writes_three_files() {
        let ws = Workspace::new();
        let t = TestEngines::new().speech(FakeSpeech::new("de"));
        let input = ws.file("movie.mkv", "");
        let spec = t.spec(&ws, &input, "nl", Method::Lexical);

        let (outcome, rec) = run(&t, &ws, &spec).await;
        outcome.result.unwrap();
        assert_eq!(
            outcome.written,
            vec![ws.path("movie.de.srt"), ws.path("movie.en.srt"), ws.path("movie.nl.srt")]
        );

        let nl = srt::decode(&std::fs::read_to_string(ws.path("movie.nl.srt")).unwrap()).unwrap();
        assert_eq!(nl[0].text, "GOOD DAY EVERYONE");
        assert_eq!(rec.language.lock().unwrap().as_deref(), Some("de"));
        assert_eq!(
            *rec.stages.lock().unwrap(),
            vec![
                Stage::ExtractAudio,
                Stage::Transcribe,
                Stage::TranslateEnglish,
                Stage::TranslateTarget,
                Stage::WriteOutputs
            ]
        );
        let progress = rec.progress.lock().unwrap();
        assert_eq!(*progress.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_source_only_stops_after_transcribe() {
        let ws = Workspace::new();
        let t = TestEngines::new().speech(FakeSpeech::new("de"));
        let input = ws.file("movie.mkv", "");
        let spec = t.spec(&ws, &input, "nl", Method::SourceOnly);

        let (outcome, _) = run(&t, &ws, &spec).await;
        outcome.result.unwrap();
        assert_eq!(outcome.written, vec![ws.path("movie.de.srt")]);
        assert_eq!(t.speech.calls(), 1);
        assert!(t.translator.requests().is_empty());
    }

    #[tokio::test]
    async fn test_source_only_reports_existing_source_file() {
        let ws = Workspace::new();
        let t = TestEngines::new().speech(FakeSpeech::new("de"));
        let input = ws.file("movie.mkv", "");
        let existing = ws.file("movie.de.srt", "1\n00:00:01,000 --> 00:00:02,000\nAlt\n");
        let mut spec = t.spec(&ws, &input, "nl", Method::SourceOnly);

        let (outcome, _) = run(&t, &ws, &spec).await;
        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.stage, Stage::Transcribe);
        assert!(matches!(&failure.error, Error::Conflict { paths } if *paths == vec![existing.clone()]));
        assert!(outcome.written.is_empty());
        assert!(std::fs::read_to_string(&existing).unwrap().contains("Alt"));

        spec.overwrite = true;
        let (outcome, _) = run(&t, &ws, &spec).await;
        outcome.result.unwrap();
        assert_eq!(outcome.written, vec![existing.clone()]);
        assert!(!std::fs::read_to_string(&existing).unwrap().contains("Alt"));
    }

    #[tokio::test]
    async fn test_reuse_existing_english_skips_transcription() {
        let ws = Workspace::new();
        let t = TestEngines::new();
        let input = ws.file("movie.mkv", "");
        ws.file(
            "movie.en.srt",
            "1\n00:00:01,000 --> 00:00:02,000\nHello\n\n2\n00:00:03,000 --> 00:00:04,000\nGoodbye\n\n3\n00:00:05,000 --> 00:00:06,500\nSee you\n",
        );
        let spec = t.spec(&ws, &input, "nl", Method::LexicalReuse);

        let (outcome, _) = run(&t, &ws, &spec).await;
        outcome.result.unwrap();
        assert_eq!(t.speech.calls(), 0);
        assert_eq!(t.audio.calls(), 0);

        let nl = srt::decode(&std::fs::read_to_string(ws.path("movie.nl.srt")).unwrap()).unwrap();
        assert_eq!(nl.len(), 3);
        assert_eq!(nl[2].text, "SEE YOU");
        assert_eq!(outcome.written, vec![ws.path("movie.nl.srt")]);
    }

    #[tokio::test]
    async fn test_lexical_reuses_english_but_still_transcribes_source() {
        let ws = Workspace::new();
        let t = TestEngines::new().speech(FakeSpeech::new("de"));
        let input = ws.file("movie.mkv", "");
        ws.file("movie.en.srt", "1\n00:00:01,000 --> 00:00:02,000\nHello\n");
        let spec = t.spec(&ws, &input, "nl", Method::Lexical);

        let (outcome, _) = run(&t, &ws, &spec).await;
        outcome.result.unwrap();
        // Source pass only; the English file came from disk.
        assert_eq!(t.speech.calls(), 1);
        assert_eq!(outcome.written, vec![ws.path("movie.de.srt"), ws.path("movie.nl.srt")]);
        let nl = srt::decode(&std::fs::read_to_string(ws.path("movie.nl.srt")).unwrap()).unwrap();
        assert_eq!(nl.len(), 1);
    }

    #[tokio::test]
    async fn test_target_matching_source_needs_no_translation() {
        let ws = Workspace::new();
        let t = TestEngines::new().speech(FakeSpeech::new("de"));
        let input = ws.file("movie.mkv", "");
        let spec = t.spec(&ws, &input, "de", Method::Lexical);

        let (outcome, _) = run(&t, &ws, &spec).await;
        outcome.result.unwrap();
        assert_eq!(outcome.written, vec![ws.path("movie.de.srt")]);
        assert!(t.translator.requests().is_empty());
    }

    #[tokio::test]
    async fn test_english_target_uses_english_pass() {
        let ws = Workspace::new();
        let t = TestEngines::new().speech(FakeSpeech::new("de"));
        let input = ws.file("movie.mkv", "");
        let spec = t.spec(&ws, &input, "en", Method::Lexical);

        let (outcome, _) = run(&t, &ws, &spec).await;
        outcome.result.unwrap();
        assert_eq!(outcome.written, vec![ws.path("movie.de.srt"), ws.path("movie.en.srt")]);
        assert!(t.translator.requests().is_empty());
    }

    #[tokio::test]
    async fn test_subtitle_input_translates_directly() {
        let ws = Workspace::new();
        let t = TestEngines::new();
        let input = ws.file("movie.en.srt", "1\n00:00:01,000 --> 00:00:02,000\nHello\n");
        let spec = t.spec(&ws, &input, "nl", Method::Lexical);

        let (outcome, _) = run(&t, &ws, &spec).await;
        outcome.result.unwrap();
        assert_eq!(outcome.written, vec![ws.path("movie.nl.srt")]);
        assert_eq!(t.audio.calls(), 0);
        assert_eq!(t.speech.calls(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_refiner_still_completes() {
        let ws = Workspace::new();
        let t = TestEngines::new().refiner(FakeRefiner::unreachable());
        let input = ws.file(
            "movie.srt",
            "1\n00:00:01,000 --> 00:00:02,000\nHello\n\n2\n00:00:03,000 --> 00:00:04,000\nGoodbye\n",
        );
        let spec = t.spec(&ws, &input, "nl", Method::LexicalRefine);

        let (outcome, rec) = run(&t, &ws, &spec).await;
        outcome.result.unwrap();
        let nl = srt::decode(&std::fs::read_to_string(ws.path("movie.nl.srt")).unwrap()).unwrap();
        assert_eq!(
            nl.iter().map(|c| c.text.as_str()).collect::<Vec<_>>(),
            vec!["HELLO", "GOODBYE"]
        );
        assert!(rec.stages.lock().unwrap().contains(&Stage::Refine));
        assert_eq!(t.refiner.calls(), 1);
    }

    #[tokio::test]
    async fn test_transcription_failure_names_stage() {
        let ws = Workspace::new();
        let t = TestEngines::new().speech(FakeSpeech::failing());
        let input = ws.file("movie.mkv", "");
        let spec = t.spec(&ws, &input, "nl", Method::Lexical);

        let (outcome, _) = run(&t, &ws, &spec).await;
        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.stage, Stage::Transcribe);
        assert!(matches!(failure.error, Error::Transcription(_)));
        assert!(outcome.written.is_empty());
    }

    #[tokio::test]
    async fn test_existing_sibling_is_not_clobbered() {
        let ws = Workspace::new();
        let t = TestEngines::new().speech(FakeSpeech::new("de"));
        let input = ws.file("movie.mkv", "");
        let original = "1\n00:00:01,000 --> 00:00:02,000\nHandgemacht\n";
        ws.file("movie.de.srt", original);
        let spec = t.spec(&ws, &input, "nl", Method::Lexical);

        let (outcome, _) = run(&t, &ws, &spec).await;
        outcome.result.unwrap();
        assert_eq!(std::fs::read_to_string(ws.path("movie.de.srt")).unwrap(), original);
        assert!(!outcome.written.contains(&ws.path("movie.de.srt")));
    }

    #[tokio::test]
    async fn test_cancelled_run_writes_nothing() {
        let ws = Workspace::new();
        let t = TestEngines::new().speech(FakeSpeech::new("de"));
        let input = ws.file("movie.mkv", "");
        let spec = t.spec(&ws, &input, "nl", Method::Lexical);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = t
            .pipeline(&ws)
            .run(&spec, Arc::new(Recorder::default()), &cancel)
            .await;
        let failure = outcome.result.unwrap_err();
        assert!(failure.error.is_cancellation());
        assert_eq!(failure.stage, Stage::ExtractAudio);
        assert!(outcome.written.is_empty());
        assert!(!ws.path("movie.de.srt").exists());
    }
}
