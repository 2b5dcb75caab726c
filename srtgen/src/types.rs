use serde::{Deserialize, Serialize};

/// A single word with timing and confidence, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub probability: f32,
}

/// A segment as the speech model emits it, before it becomes a subtitle cue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub no_speech_probability: f32,
    pub words: Option<Vec<Word>>,
}

impl Segment {
    /// Segment bounds, narrowed to the first and last word when word timing is present.
    pub fn speech_bounds(&self) -> (f64, f64) {
        match self.words.as_deref() {
            Some([first, .., last]) => (first.start, last.end),
            Some([only]) => (only.start, only.end),
            _ => (self.start, self.end),
        }
    }
}

/// Output of one speech-model pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<Segment>,
    /// Detected (or forced) language code of the audio.
    pub language: String,
    /// Audio duration in seconds.
    pub duration: f64,
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, start: f64, end: f64) -> Word {
        Word {
            text: text.into(),
            start,
            end,
            probability: 0.9,
        }
    }

    fn segment(words: Option<Vec<Word>>) -> Segment {
        Segment {
            start: 1.0,
            end: 5.0,
            text: "hello there".into(),
            no_speech_probability: 0.0,
            words,
        }
    }

    #[test]
    fn test_speech_bounds_uses_word_timing() {
        let seg = segment(Some(vec![word("hello", 1.4, 1.8), word("there", 1.9, 2.6)]));
        assert_eq!(seg.speech_bounds(), (1.4, 2.6));
    }

    #[test]
    fn test_speech_bounds_single_word() {
        let seg = segment(Some(vec![word("hi", 2.0, 2.3)]));
        assert_eq!(seg.speech_bounds(), (2.0, 2.3));
    }

    #[test]
    fn test_speech_bounds_falls_back_to_segment() {
        assert_eq!(segment(None).speech_bounds(), (1.0, 5.0));
        assert_eq!(segment(Some(vec![])).speech_bounds(), (1.0, 5.0));
    }

    #[test]
    fn test_transcript_json_roundtrip() {
        let t = Transcript {
            segments: vec![segment(None)],
            language: "de".into(),
            duration: 12.5,
            model: "base".into(),
        };
        let json = serde_json::to_string(&t).unwrap();
        let back: Transcript = serde_json::from_str(&json).unwrap();
        assert_eq!(back.language, "de");
        assert_eq!(back.segments, t.segments);
    }
}
