//! Process-wide runtime settings, persisted as JSON.
//!
//! Callers read through [`SettingsStore::get`] on every use; nothing keeps a
//! private copy across operations.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{default_cache_dir, Model};
use crate::error::{Error, Result};

pub const MAX_CONCURRENT_JOBS: usize = 16;
pub const TEMPERATURE_RANGE: (f32, f32) = (0.0, 2.0);

/// Tuning for the lexical translation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LexicalTuning {
    /// Cues translated together for context.
    pub batch_size: usize,
    /// Length ratio above which a cue's display time is extended.
    pub extend_threshold: f64,
    /// Ratio cap used when computing the extension.
    pub max_length_ratio: f64,
    /// Extra display time per unit of ratio above 1.0.
    pub extension_ms_per_ratio: u64,
}

impl Default for LexicalTuning {
    fn default() -> Self {
        Self {
            batch_size: 5,
            extend_threshold: 1.05,
            max_length_ratio: 2.0,
            extension_ms_per_ratio: 2_000,
        }
    }
}

/// Plausibility bounds for refined text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineTuning {
    pub min_chars: usize,
    pub min_length_ratio: f64,
    pub max_length_ratio: f64,
    /// Neighbouring cues included on each side as context.
    pub context_cues: usize,
    pub timeout_secs: u64,
}

impl Default for RefineTuning {
    fn default() -> Self {
        Self {
            min_chars: 2,
            min_length_ratio: 0.5,
            max_length_ratio: 1.8,
            context_cues: 1,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_concurrent_jobs: usize,
    /// Model leases that may be held at once across all workers.
    pub device_slots: usize,
    pub whisper_model: String,
    pub gpu: bool,
    pub model_cache_dir: Option<PathBuf>,
    pub translation_endpoint: String,
    pub translation_model: String,
    pub refine_endpoint: String,
    pub refine_model: String,
    pub refine_temperature: f32,
    /// Download cap in KiB/s, 0 for unlimited.
    pub bandwidth_limit_kib: u64,
    pub lexical: LexicalTuning,
    pub refine: RefineTuning,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            device_slots: 1,
            whisper_model: "medium".into(),
            gpu: true,
            model_cache_dir: None,
            translation_endpoint: "http://localhost:6060".into(),
            translation_model: "facebook/nllb-200-1.3B".into(),
            refine_endpoint: "http://localhost:11434".into(),
            refine_model: "llama3.1:8b".into(),
            refine_temperature: 0.3,
            bandwidth_limit_kib: 0,
            lexical: LexicalTuning::default(),
            refine: RefineTuning::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Settings(msg));

        if !(1..=MAX_CONCURRENT_JOBS).contains(&self.max_concurrent_jobs) {
            return invalid(format!(
                "max_concurrent_jobs must be between 1 and {MAX_CONCURRENT_JOBS}"
            ));
        }
        if self.device_slots == 0 {
            return invalid("device_slots must be at least 1".into());
        }
        validate_temperature(self.refine_temperature).map_err(|e| Error::Settings(e.to_string()))?;
        if Model::parse_name(&self.whisper_model).is_none()
            && !Path::new(&self.whisper_model).is_file()
        {
            return invalid(format!("unknown whisper model {:?}", self.whisper_model));
        }
        for (name, url) in [
            ("translation_endpoint", &self.translation_endpoint),
            ("refine_endpoint", &self.refine_endpoint),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return invalid(format!("{name} must be an http(s) URL"));
            }
        }
        if self.lexical.batch_size == 0 {
            return invalid("lexical.batch_size must be at least 1".into());
        }
        let ratios = [
            self.lexical.max_length_ratio,
            self.lexical.extend_threshold,
            self.refine.min_length_ratio,
            self.refine.max_length_ratio,
        ];
        if ratios.iter().any(|r| !r.is_finite()) {
            return invalid("length ratios must be finite numbers".into());
        }
        if self.lexical.max_length_ratio < 1.0 || self.lexical.extend_threshold < 1.0 {
            return invalid("lexical ratios must be at least 1.0".into());
        }
        if self.refine.min_length_ratio <= 0.0
            || self.refine.min_length_ratio >= self.refine.max_length_ratio
        {
            return invalid("refine length ratios must satisfy 0 < min < max".into());
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.model_cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    /// Download cap in bytes per second, if any.
    pub fn bandwidth_limit(&self) -> Option<u64> {
        (self.bandwidth_limit_kib > 0).then(|| self.bandwidth_limit_kib * 1024)
    }
}

pub fn validate_temperature(t: f32) -> Result<()> {
    let (lo, hi) = TEMPERATURE_RANGE;
    if (lo..=hi).contains(&t) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "temperature {t} outside [{lo}, {hi}]"
        )))
    }
}

/// A partial settings update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdate {
    pub max_concurrent_jobs: Option<usize>,
    pub device_slots: Option<usize>,
    pub whisper_model: Option<String>,
    pub gpu: Option<bool>,
    pub model_cache_dir: Option<PathBuf>,
    pub translation_endpoint: Option<String>,
    pub translation_model: Option<String>,
    pub refine_endpoint: Option<String>,
    pub refine_model: Option<String>,
    pub refine_temperature: Option<f32>,
    pub bandwidth_limit_kib: Option<u64>,
    pub lexical: Option<LexicalTuning>,
    pub refine: Option<RefineTuning>,
}

impl SettingsUpdate {
    fn apply(self, s: &mut Settings) {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { s.$field = v; })*
            };
        }
        set!(
            max_concurrent_jobs,
            device_slots,
            whisper_model,
            gpu,
            translation_endpoint,
            translation_model,
            refine_endpoint,
            refine_model,
            refine_temperature,
            bandwidth_limit_kib,
            lexical,
            refine
        );
        if let Some(dir) = self.model_cache_dir {
            s.model_cache_dir = Some(dir);
        }
    }
}

/// Owner of the live settings and their JSON file.
pub struct SettingsStore {
    path: Option<PathBuf>,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`, falling back to defaults when the file is
    /// missing. An unreadable or invalid file is an error, not a silent reset.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let settings: Settings = serde_json::from_str(&raw)?;
            settings.validate()?;
            info!(path = %path.display(), "settings loaded");
            settings
        } else {
            info!(path = %path.display(), "no settings file, using defaults");
            Settings::default()
        };

        Ok(Self {
            path: Some(path),
            current: RwLock::new(settings),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            current: RwLock::new(settings),
        }
    }

    pub fn get(&self) -> Settings {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply an update, validate, persist, then publish.
    ///
    /// On any failure the live settings are left unchanged.
    pub fn update(&self, update: SettingsUpdate) -> Result<Settings> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut next = guard.clone();
        update.apply(&mut next);
        next.validate()?;

        if let Some(path) = &self.path {
            persist(path, &next)?;
        }
        *guard = next.clone();
        info!("settings updated");
        Ok(next)
    }
}

fn persist(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(settings)?)?;
    std::fs::rename(&tmp, path).inspect_err(|e| {
        warn!(path = %path.display(), error = %e, "failed to replace settings file");
    })?;
    Ok(())
}
