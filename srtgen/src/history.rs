//! Append-only record of finished jobs, stored as JSON Lines.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{info, warn};

use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};

pub struct History {
    path: Option<PathBuf>,
    entries: Mutex<Vec<Job>>,
}

impl History {
    /// Open the history file, creating it on first append.
    ///
    /// Lines that fail to parse are skipped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = Vec::new();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            for (n, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Job>(line) {
                    Ok(job) => entries.push(job),
                    Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping history entry"),
                }
            }
            info!(path = %path.display(), entries = entries.len(), "history loaded");
        }

        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Job>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a finished job. Non-terminal jobs are ignored.
    ///
    /// The entry is kept in memory even when writing the file fails; the
    /// write error is still returned.
    pub fn append(&self, job: &Job) -> Result<()> {
        if !job.status.is_terminal() {
            warn!(job_id = job.id, status = %job.status, "refusing to record unfinished job");
            return Ok(());
        }

        let mut entries = self.entries();
        entries.push(job.clone());
        match &self.path {
            Some(path) => write_line(path, job),
            None => Ok(()),
        }
    }

    /// Entries, newest first, optionally restricted to `statuses`.
    pub fn list(&self, statuses: Option<&[JobStatus]>) -> Vec<Job> {
        self.entries()
            .iter()
            .rev()
            .filter(|job| statuses.is_none_or(|s| s.contains(&job.status)))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.entries().iter().find(|job| job.id == id).cloned()
    }

    pub fn max_id(&self) -> Option<JobId> {
        self.entries().iter().map(|job| job.id).max()
    }

    /// Remove every entry whose status is in `statuses`. Returns the number removed.
    pub fn delete(&self, statuses: &[JobStatus]) -> Result<usize> {
        self.retain(|job| !statuses.contains(&job.status))
    }

    pub fn clear(&self) -> Result<usize> {
        self.retain(|_| false)
    }

    fn retain(&self, keep: impl Fn(&Job) -> bool) -> Result<usize> {
        let mut entries = self.entries();
        let kept: Vec<Job> = entries.iter().filter(|job| keep(job)).cloned().collect();
        let removed = entries.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        if let Some(path) = &self.path {
            rewrite(path, &kept)?;
        }
        *entries = kept;
        info!(removed, "history entries deleted");
        Ok(removed)
    }
}

fn write_line(path: &Path, job: &Job) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(job)?;
    line.push('\n');
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(line.as_bytes())?;
    Ok(())
}

fn rewrite(path: &Path, entries: &[Job]) -> Result<()> {
    let mut out = String::new();
    for job in entries {
        out.push_str(&serde_json::to_string(job)?);
        out.push('\n');
    }
    let tmp = path.with_extension("jsonl.tmp");
    std::fs::write(&tmp, out)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
