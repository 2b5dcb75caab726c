use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// (ISO 639-1 code, NLLB-200 code, English name)
const LANGUAGES: &[(&str, &str, &str)] = &[
    ("en", "eng_Latn", "English"),
    ("nl", "nld_Latn", "Dutch"),
    ("fr", "fra_Latn", "French"),
    ("de", "deu_Latn", "German"),
    ("es", "spa_Latn", "Spanish"),
    ("it", "ita_Latn", "Italian"),
    ("pt", "por_Latn", "Portuguese"),
    ("pl", "pol_Latn", "Polish"),
    ("ru", "rus_Cyrl", "Russian"),
    ("ja", "jpn_Jpan", "Japanese"),
    ("zh", "zho_Hans", "Chinese"),
    ("ko", "kor_Hang", "Korean"),
    ("ar", "arb_Arab", "Arabic"),
    ("tr", "tur_Latn", "Turkish"),
    ("sv", "swe_Latn", "Swedish"),
    ("da", "dan_Latn", "Danish"),
    ("no", "nob_Latn", "Norwegian"),
    ("fi", "fin_Latn", "Finnish"),
    ("cs", "ces_Latn", "Czech"),
    ("el", "ell_Grek", "Greek"),
    ("he", "heb_Hebr", "Hebrew"),
    ("hi", "hin_Deva", "Hindi"),
    ("th", "tha_Thai", "Thai"),
    ("vi", "vie_Latn", "Vietnamese"),
    ("id", "ind_Latn", "Indonesian"),
    ("ms", "zsm_Latn", "Malay"),
    ("uk", "ukr_Cyrl", "Ukrainian"),
    ("ro", "ron_Latn", "Romanian"),
    ("hu", "hun_Latn", "Hungarian"),
    ("bg", "bul_Cyrl", "Bulgarian"),
    ("hr", "hrv_Latn", "Croatian"),
    ("sk", "slk_Latn", "Slovak"),
];

/// A language the translation model can produce.
///
/// Accepts short codes ("nl") and regional tags ("nl-NL", "en_US"); the
/// region is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct Language {
    code: &'static str,
    nllb: &'static str,
    name: &'static str,
}

impl Language {
    pub fn new(lang: &str) -> Result<Self> {
        let base = lang
            .trim()
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_lowercase();

        LANGUAGES
            .iter()
            .find(|(code, _, _)| *code == base)
            .map(|&(code, nllb, name)| Language { code, nllb, name })
            .ok_or_else(|| Error::Validation(format!("unsupported language: {lang:?}")))
    }

    pub fn english() -> Self {
        let (code, nllb, name) = LANGUAGES[0];
        Language { code, nllb, name }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Code the NLLB translation model uses for this language.
    pub fn nllb_code(&self) -> &'static str {
        self.nllb
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_english(&self) -> bool {
        self.code == "en"
    }

    /// Whether a (possibly unsupported) detected language code names this language.
    pub fn matches(&self, code: &str) -> bool {
        code.eq_ignore_ascii_case(self.code)
    }

    /// All supported languages.
    pub fn supported() -> Vec<Language> {
        LANGUAGES
            .iter()
            .map(|&(code, nllb, name)| Language { code, nllb, name })
            .collect()
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code)
    }
}

// Deserialized by hand: the derive would tie `'de` to the `'static` table entries.
impl<'de> Deserialize<'de> for Language {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Language::new(&code).map_err(serde::de::Error::custom)
    }
}

impl From<Language> for String {
    fn from(lang: Language) -> String {
        lang.code.to_string()
    }
}
