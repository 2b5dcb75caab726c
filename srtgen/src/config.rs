use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Whisper model sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Model {
    Tiny,
    TinyEn,
    Base,
    BaseEn,
    Small,
    SmallEn,
    Medium,
    MediumEn,
    LargeV2,
    LargeV3,
    LargeV3Turbo,
    /// User-provided .ggml file path.
    Custom(PathBuf),
}

impl Model {
    /// All downloadable models with their approximate size on disk.
    pub const CATALOG: &'static [(&'static str, &'static str)] = &[
        ("tiny", "75 MB"),
        ("tiny.en", "75 MB"),
        ("base", "142 MB"),
        ("base.en", "142 MB"),
        ("small", "466 MB"),
        ("small.en", "466 MB"),
        ("medium", "1.5 GB"),
        ("medium.en", "1.5 GB"),
        ("large-v2", "2.9 GB"),
        ("large-v3", "2.9 GB"),
        ("large-v3-turbo", "~1.6 GB"),
    ];

    /// Model filename as used by HuggingFace / whisper.cpp.
    pub fn filename(&self) -> String {
        match self {
            Model::Custom(path) => path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "custom-model".into()),
            _ => format!("ggml-{}.bin", self.name()),
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        match self {
            Model::Tiny => "tiny",
            Model::TinyEn => "tiny.en",
            Model::Base => "base",
            Model::BaseEn => "base.en",
            Model::Small => "small",
            Model::SmallEn => "small.en",
            Model::Medium => "medium",
            Model::MediumEn => "medium.en",
            Model::LargeV2 => "large-v2",
            Model::LargeV3 => "large-v3",
            Model::LargeV3Turbo => "large-v3-turbo",
            Model::Custom(_) => "custom",
        }
    }

    /// Parse a catalog name (e.g. CLI argument or settings value).
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "tiny" => Some(Model::Tiny),
            "tiny.en" => Some(Model::TinyEn),
            "base" => Some(Model::Base),
            "base.en" => Some(Model::BaseEn),
            "small" => Some(Model::Small),
            "small.en" => Some(Model::SmallEn),
            "medium" => Some(Model::Medium),
            "medium.en" => Some(Model::MediumEn),
            "large-v2" => Some(Model::LargeV2),
            "large-v3" => Some(Model::LargeV3),
            "large-v3-turbo" => Some(Model::LargeV3Turbo),
            _ => None,
        }
    }

    /// Resolve a catalog name or an existing `.bin` path.
    pub fn resolve(s: &str) -> Result<Self> {
        if let Some(model) = Self::parse_name(s) {
            return Ok(model);
        }
        let path = PathBuf::from(s);
        if path.is_file() {
            Ok(Model::Custom(path))
        } else {
            Err(Error::Validation(format!("unknown speech model: {s:?}")))
        }
    }

    /// English-only models cannot detect a source language or translate.
    pub fn is_english_only(&self) -> bool {
        self.name().ends_with(".en")
    }
}

/// How a job turns a video into target-language subtitles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// Transcribe in the spoken language only.
    SourceOnly,
    /// English pass, then machine translation into the target.
    #[default]
    Lexical,
    /// Like `Lexical`, but always reuses an on-disk English file when valid.
    LexicalReuse,
    /// `Lexical` followed by a language-model rephrasing pass.
    LexicalRefine,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::SourceOnly => "source-only",
            Method::Lexical => "lexical",
            Method::LexicalReuse => "lexical-reuse",
            Method::LexicalRefine => "lexical-refine",
        }
    }

    pub fn translates(&self) -> bool {
        !matches!(self, Method::SourceOnly)
    }

    pub fn refines(&self) -> bool {
        matches!(self, Method::LexicalRefine)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "source-only" => Ok(Method::SourceOnly),
            "lexical" => Ok(Method::Lexical),
            "lexical-reuse" => Ok(Method::LexicalReuse),
            "lexical-refine" => Ok(Method::LexicalRefine),
            other => Err(Error::Validation(format!("unknown method: {other:?}"))),
        }
    }
}

/// Options for one speech-model pass.
#[derive(Debug, Clone)]
pub struct SpeechOptions {
    /// Force a language, or `None` to auto-detect.
    pub language: Option<String>,
    /// Ask the model to translate the speech to English.
    pub translate: bool,
    pub gpu: bool,
    pub gpu_device: u32,
    pub temperature: f32,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        Self {
            language: None,
            translate: false,
            gpu: true,
            gpu_device: 0,
            temperature: 0.0,
        }
    }
}

impl SpeechOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn language(mut self, lang: Option<String>) -> Self {
        self.language = lang;
        self
    }

    pub fn translate(mut self, translate: bool) -> Self {
        self.translate = translate;
        self
    }

    pub fn gpu(mut self, enabled: bool) -> Self {
        self.gpu = enabled;
        self
    }
}

/// Default model cache directory: `~/.cache/srtgen/models`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("srtgen")
        .join("models")
}

/// Default home of `settings.json` and `history.jsonl`: `~/.local/share/srtgen`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("srtgen")
}
