//! In-process stand-ins for the external engines, plus scratch workspaces.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::config::{Method, SpeechOptions};
use crate::engines::{AudioLoader, Engines, ProgressFn, RefineRequest, Refiner, SpeechModel, TranslationRequest, Translator};
use crate::error::{Error, Result};
use crate::guard::ResourceGuard;
use crate::history::History;
use crate::job::{JobRequest, JobSpec, ModelSelection};
use crate::language::Language;
use crate::pipeline::Pipeline;
use crate::queue::JobQueue;
use crate::settings::{Settings, SettingsStore};
use crate::types::{Segment, Transcript};

pub fn job_spec() -> JobSpec {
    job_spec_for(Path::new("/media/movie.mkv"), "nl", Method::Lexical)
}

pub fn job_spec_for(input: &Path, language: &str, method: Method) -> JobSpec {
    JobSpec {
        input: input.to_path_buf(),
        target_language: Language::new(language).unwrap(),
        method,
        overwrite: false,
        models: ModelSelection {
            whisper_model: "base".into(),
            translation_model: "nllb".into(),
            refine_endpoint: "http://localhost:11434".into(),
            refine_model: "llama".into(),
            refine_temperature: 0.3,
        },
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A temporary media folder.
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// A stand-in speech model file, so model resolution never downloads.
    pub fn model(&self) -> PathBuf {
        let path = self.path("ggml-test.bin");
        if !path.exists() {
            std::fs::write(&path, b"weights").unwrap();
        }
        path
    }
}

#[derive(Default)]
pub struct FakeAudio {
    calls: AtomicUsize,
}

impl FakeAudio {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AudioLoader for FakeAudio {
    fn load(&self, _path: &Path) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0.0; 16_000 * 5])
    }
}

/// Speech model that "hears" two fixed lines in its language.
pub struct FakeSpeech {
    language: String,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeSpeech {
    pub fn new(language: &str) -> Self {
        Self {
            language: language.into(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("en")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SpeechModel for FakeSpeech {
    fn transcribe(
        &self,
        _model_path: &Path,
        samples: &[f32],
        options: &SpeechOptions,
        progress: ProgressFn,
    ) -> Result<Transcript> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::AudioDecode("corrupt audio stream".into()));
        }

        let english = options.translate || self.language == "en";
        let lines: [&str; 2] = if english {
            ["Good day everyone", "How are you all"]
        } else {
            ["Guten Tag zusammen", "Wie geht es euch"]
        };
        progress(0.5);

        let segments = lines
            .iter()
            .enumerate()
            .map(|(i, text)| Segment {
                start: 1.0 + 2.0 * i as f64,
                end: 2.5 + 2.0 * i as f64,
                text: format!(" {text}"),
                no_speech_probability: 0.01,
                words: None,
            })
            .collect();
        progress(1.0);

        Ok(Transcript {
            segments,
            language: if options.translate { "en".into() } else { self.language.clone() },
            duration: samples.len() as f64 / 16_000.0,
            model: "fake".into(),
        })
    }

    fn unload(&self) {}
}

type TranslateFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Translator applying a text function to every item. Uppercases by default.
pub struct FakeTranslator {
    map: TranslateFn,
    fail: bool,
    gate: Option<Semaphore>,
    requests: Mutex<Vec<Vec<String>>>,
}

impl FakeTranslator {
    pub fn with(map: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            map: Box::new(map),
            fail: false,
            gate: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Each request waits for a permit from [`FakeTranslator::release`].
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for FakeTranslator {
    fn default() -> Self {
        Self::with(str::to_uppercase)
    }
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(&self, request: &TranslationRequest<'_>) -> Result<Vec<String>> {
        self.requests.lock().unwrap().push(request.texts.to_vec());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail {
            return Err(Error::Translation("server returned 503".into()));
        }
        Ok(request.texts.iter().map(|t| (self.map)(t)).collect())
    }
}

type RefineFn = Box<dyn Fn(&RefineRequest) -> Result<String> + Send + Sync>;

/// Refiner answering through a closure. Echoes the line by default.
pub struct FakeRefiner {
    reply: RefineFn,
    calls: AtomicUsize,
}

impl FakeRefiner {
    pub fn with(reply: impl Fn(&RefineRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            reply: Box::new(reply),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self::with(|req| Err(Error::Unreachable(format!("{}: connection refused", req.endpoint))))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for FakeRefiner {
    fn default() -> Self {
        Self::with(|req| {
            Ok(req
                .prompt
                .lines()
                .find_map(|l| l.strip_prefix("Line: "))
                .unwrap_or_default()
                .to_string())
        })
    }
}

#[async_trait]
impl Refiner for FakeRefiner {
    async fn complete(&self, request: &RefineRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.reply)(request)
    }
}

/// A full set of fakes, with handles kept for assertions.
pub struct TestEngines {
    pub audio: Arc<FakeAudio>,
    pub speech: Arc<FakeSpeech>,
    pub translator: Arc<FakeTranslator>,
    pub refiner: Arc<FakeRefiner>,
}

impl TestEngines {
    pub fn new() -> Self {
        Self {
            audio: Arc::new(FakeAudio::default()),
            speech: Arc::new(FakeSpeech::new("en")),
            translator: Arc::new(FakeTranslator::default()),
            refiner: Arc::new(FakeRefiner::default()),
        }
    }

    pub fn speech(mut self, speech: FakeSpeech) -> Self {
        self.speech = Arc::new(speech);
        self
    }

    pub fn translator(mut self, translator: FakeTranslator) -> Self {
        self.translator = Arc::new(translator);
        self
    }

    pub fn refiner(mut self, refiner: FakeRefiner) -> Self {
        self.refiner = Arc::new(refiner);
        self
    }

    pub fn engines(&self) -> Engines {
        Engines {
            audio: self.audio.clone(),
            speech: self.speech.clone(),
            translator: self.translator.clone(),
            refiner: self.refiner.clone(),
        }
    }

    pub fn settings(&self, ws: &Workspace, max_concurrent_jobs: usize) -> Arc<SettingsStore> {
        Arc::new(SettingsStore::in_memory(Settings {
            max_concurrent_jobs,
            gpu: false,
            model_cache_dir: Some(ws.path("models")),
            ..Settings::default()
        }))
    }

    pub fn pipeline(&self, ws: &Workspace) -> Pipeline {
        self.pipeline_with(self.settings(ws, 1))
    }

    fn pipeline_with(&self, settings: Arc<SettingsStore>) -> Pipeline {
        let guard = ResourceGuard::new(Arc::clone(&settings));
        Pipeline::new(self.engines(), guard, settings)
    }

    pub fn queue(&self, ws: &Workspace, max_concurrent_jobs: usize) -> JobQueue {
        let settings = self.settings(ws, max_concurrent_jobs);
        JobQueue::new(self.pipeline_with(Arc::clone(&settings)), History::in_memory(), settings)
    }

    pub fn spec(&self, ws: &Workspace, input: &Path, language: &str, method: Method) -> JobSpec {
        let mut spec = job_spec_for(input, language, method);
        spec.models.whisper_model = ws.model().to_string_lossy().into_owned();
        spec
    }

    pub fn request(&self, ws: &Workspace, input: &Path, language: &str, method: Method) -> JobRequest {
        JobRequest {
            path: input.to_path_buf(),
            language: language.into(),
            method,
            whisper_model: Some(ws.model().to_string_lossy().into_owned()),
            ..JobRequest::default()
        }
    }
}
