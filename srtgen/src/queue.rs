//! Job queue, dispatcher and workers.
//!
//! [`JobQueue`] is the single owner of job state. Request handlers and
//! workers only touch jobs through its methods, which hold the state lock
//! for short, non-blocking critical sections. The [`Scheduler`] dispatcher
//! starts pending jobs while fewer than `max_concurrent_jobs` workers are
//! busy, re-reading the limit from settings every time it looks.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Method, Model};
use crate::error::{Error, Result, StageFailure};
use crate::history::History;
use crate::job::{Job, JobId, JobRequest, JobSpec, JobStatus, ModelSelection, Stage};
use crate::language::Language;
use crate::pipeline::{is_subtitle_file, find_conflicts, OutputPlan, Pipeline, Reporter, RunOutcome};
use crate::settings::{validate_temperature, Settings, SettingsStore};

/// Media containers accepted as job input, besides `.srt`.
pub const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "mov", "webm", "m4v"];

/// Check a request against the current settings and fill in model defaults.
pub fn validate(request: JobRequest, settings: &Settings) -> Result<JobSpec> {
    let input = request.path;
    if !input.is_file() {
        return Err(Error::Validation(format!("file not found: {}", input.display())));
    }

    let subtitles = is_subtitle_file(&input);
    let known_video = input.extension().is_some_and(|ext| {
        let ext = ext.to_string_lossy().to_lowercase();
        VIDEO_EXTENSIONS.contains(&ext.as_str())
    });
    if !subtitles && !known_video {
        return Err(Error::Validation(format!(
            "unsupported file type: {}",
            input.display()
        )));
    }

    let target_language = Language::new(&request.language)?;

    if subtitles {
        if request.method == Method::SourceOnly {
            return Err(Error::Validation(
                "source-only needs a video input, not subtitles".into(),
            ));
        }
        let plan = OutputPlan::for_input(&input);
        if plan.subtitle_language() == Some(&target_language) {
            return Err(Error::Validation(format!(
                "subtitles are already in {}",
                target_language.name()
            )));
        }
    }

    let whisper_model = request
        .whisper_model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| settings.whisper_model.clone());
    let model = Model::resolve(&whisper_model)?;
    if !subtitles && model.is_english_only() {
        return Err(Error::Validation(format!(
            "{whisper_model} is English-only and cannot detect the spoken language; use a multilingual model"
        )));
    }

    let refine_temperature = request.refine_temperature.unwrap_or(settings.refine_temperature);
    validate_temperature(refine_temperature)?;

    let pick = |value: Option<String>, default: &str| {
        value
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    };

    Ok(JobSpec {
        input,
        target_language,
        method: request.method,
        overwrite: request.overwrite,
        models: ModelSelection {
            whisper_model,
            translation_model: pick(request.translation_model, &settings.translation_model),
            refine_endpoint: pick(request.refine_endpoint, &settings.refine_endpoint),
            refine_model: pick(request.refine_model, &settings.refine_model),
            refine_temperature,
        },
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchConflict {
    pub path: PathBuf,
    pub existing_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchError {
    pub path: PathBuf,
    pub error: String,
}

/// Per-file results of a batch enqueue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub queued: Vec<QueuedJob>,
    /// Files skipped because they were already queued or running.
    pub skipped: usize,
    pub conflicts: Vec<BatchConflict>,
    pub errors: Vec<BatchError>,
}

#[derive(Default)]
struct State {
    /// Every job that has not been recorded in history yet.
    jobs: HashMap<JobId, Job>,
    pending: VecDeque<JobId>,
    /// Running jobs, in start order.
    running: Vec<JobId>,
    tokens: HashMap<JobId, CancellationToken>,
    /// Workers still executing, including cancelled jobs not yet wound down.
    busy: usize,
    next_id: JobId,
}

impl State {
    fn is_queued(&self, spec: &JobSpec) -> bool {
        self.jobs.values().any(|job| {
            !job.status.is_terminal()
                && job.spec.input == spec.input
                && job.spec.target_language == spec.target_language
        })
    }
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    history: History,
    settings: Arc<SettingsStore>,
    pipeline: Pipeline,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, job: &Job) {
        if let Err(e) = self.history.append(job) {
            error!(job_id = job.id, error = %e, "failed to record job history");
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl JobQueue {
    pub fn new(pipeline: Pipeline, history: History, settings: Arc<SettingsStore>) -> Self {
        let next_id = history.max_id().map_or(1, |id| id + 1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_id,
                    ..State::default()
                }),
                wake: Notify::new(),
                history,
                settings,
                pipeline,
            }),
        }
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.shared.settings
    }

    /// Validate, check for conflicts and queue one job.
    pub fn enqueue(&self, request: JobRequest) -> Result<JobId> {
        let spec = validate(request, &self.shared.settings.get())?;
        let conflicts = find_conflicts(&spec);
        if !conflicts.is_empty() {
            return Err(Error::Conflict { paths: conflicts });
        }

        let mut state = self.shared.state();
        if state.is_queued(&spec) {
            return Err(Error::Validation(format!(
                "{} is already queued for {}",
                spec.input.display(),
                spec.target_language
            )));
        }
        let id = self.insert(&mut state, spec);
        drop(state);

        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Queue one job per path with shared options. Failures are reported per file.
    pub fn enqueue_batch(&self, paths: Vec<PathBuf>, options: &JobRequest) -> BatchOutcome {
        let settings = self.shared.settings.get();
        let mut outcome = BatchOutcome::default();

        for path in paths {
            let request = JobRequest {
                path: path.clone(),
                ..options.clone()
            };
            let spec = match validate(request, &settings) {
                Ok(spec) => spec,
                Err(e) => {
                    outcome.errors.push(BatchError {
                        path,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let mut state = self.shared.state();
            if state.is_queued(&spec) {
                outcome.skipped += 1;
                continue;
            }
            let conflicts = find_conflicts(&spec);
            if !conflicts.is_empty() {
                outcome.conflicts.push(BatchConflict {
                    path,
                    existing_files: conflicts,
                });
                continue;
            }
            let job_id = self.insert(&mut state, spec);
            outcome.queued.push(QueuedJob { job_id, path });
        }

        info!(
            queued = outcome.queued.len(),
            skipped = outcome.skipped,
            conflicts = outcome.conflicts.len(),
            errors = outcome.errors.len(),
            "batch enqueued"
        );
        if !outcome.queued.is_empty() {
            self.shared.wake.notify_one();
        }
        outcome
    }

    fn insert(&self, state: &mut State, spec: JobSpec) -> JobId {
        let id = state.next_id;
        state.next_id += 1;
        info!(
            job_id = id,
            input = %spec.input.display(),
            language = %spec.target_language,
            method = %spec.method,
            "job queued"
        );
        state.jobs.insert(id, Job::new(id, spec));
        state.pending.push_back(id);
        id
    }

    /// Cancel a pending or running job.
    ///
    /// A pending job goes straight to history. A running job leaves the
    /// active list at once; its worker records it once it stops.
    pub fn cancel(&self, id: JobId) -> Result<Job> {
        let mut state = self.shared.state();
        let status = match state.jobs.get(&id) {
            Some(job) => job.status,
            None => return Err(self.missing(id)),
        };

        match status {
            JobStatus::Pending => {
                state.pending.retain(|&p| p != id);
                let mut job = state
                    .jobs
                    .remove(&id)
                    .ok_or(Error::JobNotFound(id))?;
                job.cancel(Vec::new(), "Cancelled before start");
                // Recorded before the lock drops so `get` always finds the job.
                self.shared.record(&job);
                info!(job_id = id, "pending job cancelled");
                Ok(job)
            }
            JobStatus::Running => {
                if let Some(token) = state.tokens.get(&id) {
                    token.cancel();
                }
                let job = state.jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
                job.status = JobStatus::Cancelled;
                job.message = "Cancelling...".into();
                job.finished_at = Some(Utc::now());
                info!(job_id = id, "running job cancelled");
                Ok(job.clone())
            }
            other => Err(Error::InvalidState {
                id,
                status: other.to_string(),
                expected: "pending or running",
            }),
        }
    }

    /// Move a pending job to the front of the pending jobs.
    pub fn bump(&self, id: JobId) -> Result<()> {
        let mut state = self.shared.state();
        match state.jobs.get(&id).map(|job| job.status) {
            Some(JobStatus::Pending) => {}
            Some(other) => {
                return Err(Error::InvalidState {
                    id,
                    status: other.to_string(),
                    expected: "pending",
                })
            }
            None => return Err(self.missing(id)),
        }

        state.pending.retain(|&p| p != id);
        state.pending.push_front(id);
        info!(job_id = id, "job bumped");
        Ok(())
    }

    fn missing(&self, id: JobId) -> Error {
        match self.shared.history.get(id) {
            Some(job) => Error::InvalidState {
                id,
                status: job.status.to_string(),
                expected: "pending or running",
            },
            None => Error::JobNotFound(id),
        }
    }

    /// Running jobs in start order, then pending jobs in queue order.
    pub fn list_active(&self) -> Vec<Job> {
        let state = self.shared.state();
        state
            .running
            .iter()
            .chain(state.pending.iter())
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect()
    }

    /// A job by id, active or finished.
    pub fn get(&self, id: JobId) -> Option<Job> {
        let active = self.shared.state().jobs.get(&id).cloned();
        active.or_else(|| self.shared.history.get(id))
    }

    pub fn history(&self, statuses: Option<&[JobStatus]>) -> Vec<Job> {
        self.shared.history.list(statuses)
    }

    pub fn delete_history(&self, statuses: &[JobStatus]) -> Result<usize> {
        self.shared.history.delete(statuses)
    }

    pub fn clear_history(&self) -> Result<usize> {
        self.shared.history.clear()
    }

    /// Let the dispatcher re-check capacity, e.g. after a settings change.
    pub fn reschedule(&self) {
        self.shared.wake.notify_one();
    }

    fn next_dispatch(&self) -> Option<(JobId, JobSpec, CancellationToken)> {
        let limit = self.shared.settings.get().max_concurrent_jobs.max(1);
        let mut state = self.shared.state();
        if state.busy >= limit {
            return None;
        }

        let id = state.pending.pop_front()?;
        let token = CancellationToken::new();
        let spec = {
            let job = state.jobs.get_mut(&id)?;
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.message = "Starting".into();
            job.spec.clone()
        };
        state.busy += 1;
        state.running.push(id);
        state.tokens.insert(id, token.clone());
        Some((id, spec, token))
    }

    async fn work(self, id: JobId, spec: JobSpec, token: CancellationToken) {
        info!(job_id = id, input = %spec.input.display(), "job started");
        let reporter = Arc::new(JobReporter {
            shared: Arc::clone(&self.shared),
            id,
        });
        let run = self.shared.pipeline.run(&spec, reporter, &token);
        let outcome = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(job_id = id, panic = %message, "job worker panicked");
                let stage = self.shared.state().jobs.get(&id).and_then(|job| job.stage);
                RunOutcome {
                    written: Vec::new(),
                    result: Err(StageFailure::new(
                        stage.unwrap_or(Stage::ExtractAudio),
                        Error::Panicked(message),
                    )),
                }
            }
        };
        self.finish(id, outcome);
    }

    fn finish(&self, id: JobId, outcome: RunOutcome) {
        let mut state = self.shared.state();
        state.busy = state.busy.saturating_sub(1);
        state.running.retain(|&r| r != id);
        state.tokens.remove(&id);
        let Some(mut job) = state.jobs.remove(&id) else {
            warn!(job_id = id, "finished job missing from table");
            return;
        };

        let RunOutcome { written, result } = outcome;
        let cancelled = job.status == JobStatus::Cancelled;
        match result {
            _ if cancelled => job.cancel(written, "Cancelled"),
            Err(failure) if failure.error.is_cancellation() => job.cancel(written, "Cancelled"),
            Ok(()) => job.complete(written),
            Err(failure) => job.fail(failure.stage, failure.error.to_string()),
        }
        info!(job_id = id, status = %job.status, "job finished");

        self.shared.record(&job);
        drop(state);
        self.shared.wake.notify_one();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

/// Routes a worker's progress into the queue; ignored once the job is cancelled.
struct JobReporter {
    shared: Arc<Shared>,
    id: JobId,
}

impl JobReporter {
    fn update(&self, f: impl FnOnce(&mut Job)) {
        let mut state = self.shared.state();
        if let Some(job) = state.jobs.get_mut(&self.id) {
            if job.status == JobStatus::Running {
                f(job);
            }
        }
    }
}

impl Reporter for JobReporter {
    fn stage(&self, stage: Stage, message: String) {
        self.update(|job| {
            job.stage = Some(stage);
            job.advance(stage.span().0, Some(message));
        });
    }

    fn progress(&self, percent: u8) {
        self.update(|job| job.advance(percent, None));
    }

    fn message(&self, message: String) {
        self.update(|job| job.message = message);
    }

    fn detected_language(&self, code: &str) {
        self.update(|job| job.detected_language = Some(code.to_string()));
    }
}

/// Handle to the running dispatcher.
pub struct Scheduler {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn spawn(queue: JobQueue) -> Self {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(dispatch(queue, shutdown.clone()));
        Self { shutdown, handle }
    }

    /// Stop dispatching and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "scheduler task failed");
        }
    }
}

async fn dispatch(queue: JobQueue, shutdown: CancellationToken) {
    info!("scheduler started");
    let mut workers = JoinSet::new();

    loop {
        while let Some((id, spec, token)) = queue.next_dispatch() {
            workers.spawn(queue.clone().work(id, spec, token));
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = queue.shared.wake.notified() => {}
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "worker task failed");
                }
            }
        }
    }

    info!(in_flight = workers.len(), "scheduler stopping");
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker task failed");
        }
    }
}

/// Resolve a path given relative to `root`, rejecting anything outside it.
pub fn resolve_in_root(root: &Path, relative: &Path) -> Result<PathBuf> {
    let joined = root.join(relative.strip_prefix("/").unwrap_or(relative));
    let canonical_root = root
        .canonicalize()
        .map_err(|e| Error::Validation(format!("media root {}: {e}", root.display())))?;
    let canonical = joined
        .canonicalize()
        .map_err(|_| Error::Validation(format!("file not found: {}", relative.display())))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(Error::Validation(format!(
            "path escapes the media folder: {}",
            relative.display()
        )));
    }
    Ok(canonical)
}
