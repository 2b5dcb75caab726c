use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Method;
use crate::language::Language;

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(crate::Error::Validation(format!("unknown job status: {other:?}"))),
        }
    }
}

/// Pipeline states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    ExtractAudio,
    Transcribe,
    TranslateEnglish,
    TranslateTarget,
    Refine,
    WriteOutputs,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ExtractAudio => "extract-audio",
            Stage::Transcribe => "transcribe",
            Stage::TranslateEnglish => "translate-english",
            Stage::TranslateTarget => "translate-target",
            Stage::Refine => "refine",
            Stage::WriteOutputs => "write-outputs",
        }
    }

    /// Progress range `[start, end)` this stage covers, in percent.
    pub fn span(&self) -> (u8, u8) {
        match self {
            Stage::ExtractAudio => (0, 5),
            Stage::Transcribe => (5, 45),
            Stage::TranslateEnglish => (45, 60),
            Stage::TranslateTarget => (60, 80),
            Stage::Refine => (80, 97),
            Stage::WriteOutputs => (97, 100),
        }
    }

    /// Progress at `fraction` of the way through this stage.
    pub fn progress_at(&self, fraction: f32) -> u8 {
        let (start, end) = self.span();
        let fraction = fraction.clamp(0.0, 1.0);
        start + ((end - start) as f32 * fraction).floor() as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Models chosen for a job, fixed at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub whisper_model: String,
    pub translation_model: String,
    pub refine_endpoint: String,
    pub refine_model: String,
    pub refine_temperature: f32,
}

/// What a client asks for. Model fields left empty take the current settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub path: PathBuf,
    pub language: String,
    pub method: Method,
    pub overwrite: bool,
    pub whisper_model: Option<String>,
    pub translation_model: Option<String>,
    pub refine_endpoint: Option<String>,
    pub refine_model: Option<String>,
    pub refine_temperature: Option<f32>,
}

/// The validated, immutable part of a job the pipeline works from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Absolute path of the video or subtitle file.
    pub input: PathBuf,
    pub target_language: Language,
    pub method: Method,
    pub overwrite: bool,
    pub models: ModelSelection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub spec: JobSpec,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub stage: Option<Stage>,
    pub detected_language: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Files produced, once the job ends without error.
    pub result: Option<Vec<PathBuf>>,
    pub error: Option<JobError>,
}

impl Job {
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        Self {
            id,
            spec,
            status: JobStatus::Pending,
            progress: 0,
            message: "Waiting for available slot...".into(),
            stage: None,
            detected_language: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    /// Raise progress; it never goes backwards.
    pub fn advance(&mut self, progress: u8, message: Option<String>) {
        self.progress = self.progress.max(progress.min(100));
        if let Some(message) = message {
            self.message = message;
        }
    }

    pub fn complete(&mut self, files: Vec<PathBuf>) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.message = match files.len() {
            1 => "Generated 1 subtitle file".into(),
            n => format!("Generated {n} subtitle files"),
        };
        self.result = Some(files);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, stage: Stage, message: String) {
        self.status = JobStatus::Failed;
        self.message = format!("Failed during {stage}");
        self.error = Some(JobError { stage, message });
        self.result = None;
        self.finished_at = Some(Utc::now());
    }

    /// Mark cancelled, keeping the files already written as the result.
    pub fn cancel(&mut self, written: Vec<PathBuf>, message: &str) {
        self.status = JobStatus::Cancelled;
        self.message = message.into();
        self.result = Some(written);
        self.error = None;
        self.finished_at.get_or_insert_with(Utc::now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::job_spec as spec;

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new(1, spec());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.result.is_none() && job.error.is_none());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut job = Job::new(1, spec());
        job.advance(40, Some("Transcribing".into()));
        job.advance(20, None);
        assert_eq!(job.progress, 40);
        assert_eq!(job.message, "Transcribing");
        job.advance(250, None);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_terminal_outcomes_set_exactly_one_of_result_or_error() {
        let mut done = Job::new(1, spec());
        done.complete(vec![PathBuf::from("/media/movie.nl.srt")]);
        assert!(done.result.is_some() && done.error.is_none());
        assert!(done.finished_at.is_some());

        let mut failed = Job::new(2, spec());
        failed.fail(Stage::TranslateTarget, "server down".into());
        assert!(failed.result.is_none());
        assert_eq!(failed.error.as_ref().unwrap().stage, Stage::TranslateTarget);

        let mut cancelled = Job::new(3, spec());
        cancelled.cancel(Vec::new(), "Cancelled before start");
        assert_eq!(cancelled.result, Some(Vec::new()));
        assert!(cancelled.error.is_none());
        assert!(cancelled.status.is_terminal());
    }

    #[test]
    fn test_stage_progress_spans_are_ordered() {
        let stages = [
            Stage::ExtractAudio,
            Stage::Transcribe,
            Stage::TranslateEnglish,
            Stage::TranslateTarget,
            Stage::Refine,
            Stage::WriteOutputs,
        ];
        for pair in stages.windows(2) {
            assert_eq!(pair[0].span().1, pair[1].span().0);
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(Stage::Transcribe.progress_at(0.5), 25);
        assert_eq!(Stage::Transcribe.progress_at(7.0), 45);
    }

    #[test]
    fn test_status_parse_and_serde() {
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("done".parse::<JobStatus>().is_err());
        assert_eq!(serde_json::to_string(&JobStatus::Cancelled).unwrap(), "\"cancelled\"");
    }

    #[test]
    fn test_job_json_roundtrip() {
        let mut job = Job::new(9, spec());
        job.fail(Stage::Transcribe, "corrupt audio".into());
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"target_language\":\"nl\""));
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
