//! SubRip (`.srt`) timed-text codec.
//!
//! Cues carry millisecond timestamps so that `decode(encode(cues)) == cues`
//! holds exactly for numbered, well-formed input.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Transcript;

/// Segments shorter than this (after trimming) are treated as noise.
const MIN_CUE_CHARS: usize = 3;

/// Parenthetical annotations whisper emits for non-speech audio.
const NOISE_MARKERS: &[&str] = &[
    "(MUSIC)",
    "(LAUGHTER)",
    "(APPLAUSE)",
    "(CHEERING)",
    "(SILENCE)",
    "(NOISE)",
    "(SOUND)",
    "(MUSIC PLAYING)",
    "(LAUGHING)",
    "(CLAPPING)",
    "(WHISTLING)",
];

/// One subtitle block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cue {
    /// 1-based position in the file.
    pub index: usize,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl Cue {
    pub fn new(index: usize, start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            index,
            start_ms,
            end_ms,
            text: text.into(),
        }
    }
}

/// Whether a cue's whole text is one non-speech annotation such as
/// `[Music]` or `(APPLAUSE)`. Speech around an annotation keeps the cue.
pub fn is_noise_marker(text: &str) -> bool {
    let text = text.trim();
    [('[', ']'), ('(', ')')].iter().any(|&(open, close)| {
        text.strip_prefix(open)
            .and_then(|rest| rest.strip_suffix(close))
            .is_some_and(|inner| !inner.trim().is_empty() && !inner.contains([open, close]))
    })
}

/// Looser filter for raw speech-model output, where any bracketed token or
/// known annotation marks the segment as non-speech.
fn has_noise(text: &str) -> bool {
    let upper = text.trim().to_uppercase();
    upper.contains('[') || NOISE_MARKERS.iter().any(|m| upper.contains(m))
}

/// Encode cues as an SRT document.
///
/// Noise markers are dropped and the survivors renumbered `1..N`. A cue whose
/// end is not after its start is an [`Error::Encoding`].
pub fn encode(cues: &[Cue]) -> Result<String> {
    let mut out = String::new();
    let mut index = 0;

    for cue in cues {
        if is_noise_marker(&cue.text) {
            continue;
        }
        if cue.end_ms <= cue.start_ms {
            return Err(Error::Encoding {
                index: cue.index,
                start_ms: cue.start_ms,
                end_ms: cue.end_ms,
            });
        }

        index += 1;
        // Writing to a String never fails.
        let _ = write!(
            out,
            "{index}\n{} --> {}\n{}\n\n",
            format_timestamp(cue.start_ms),
            format_timestamp(cue.end_ms),
            cue.text.trim()
        );
    }

    Ok(out)
}

/// Decode an SRT document.
pub fn decode(input: &str) -> Result<Vec<Cue>> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let mut cues = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    let mut block_no = 0;

    let lines = input.lines().map(|l| l.trim_end_matches('\r'));
    for line in lines.chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if !block.is_empty() {
                block_no += 1;
                cues.push(parse_block(&block, block_no)?);
                block.clear();
            }
        } else {
            block.push(line);
        }
    }

    Ok(cues)
}

fn parse_block(lines: &[&str], block_no: usize) -> Result<Cue> {
    let parse_err = |reason: String| Error::Parse {
        block: block_no,
        reason,
    };

    let index = lines[0]
        .trim()
        .parse::<usize>()
        .map_err(|_| parse_err(format!("invalid index line {:?}", lines[0])))?;

    let timing = lines
        .get(1)
        .ok_or_else(|| parse_err("missing timestamp line".into()))?;
    let (start, end) = timing
        .split_once("-->")
        .ok_or_else(|| parse_err(format!("invalid timestamp line {timing:?}")))?;
    let start_ms = parse_timestamp(start.trim())
        .ok_or_else(|| parse_err(format!("invalid start time {:?}", start.trim())))?;
    // Positioning hints may follow the end time; only the first token is a timestamp.
    let end = end.split_whitespace().next().unwrap_or_default();
    let end_ms = parse_timestamp(end)
        .ok_or_else(|| parse_err(format!("invalid end time {end:?}")))?;

    let text = lines[2..]
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");

    Ok(Cue {
        index,
        start_ms,
        end_ms,
        text,
    })
}

/// Format milliseconds as an SRT timestamp: `HH:MM:SS,mmm`.
pub fn format_timestamp(total_ms: u64) -> String {
    let h = total_ms / 3_600_000;
    let m = (total_ms % 3_600_000) / 60_000;
    let s = (total_ms % 60_000) / 1_000;
    let ms = total_ms % 1_000;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

/// Parse `HH:MM:SS,mmm` (a `.` separator is tolerated) into milliseconds.
pub fn parse_timestamp(s: &str) -> Option<u64> {
    let (hms, ms) = s.split_once([',', '.'])?;
    let mut parts = hms.split(':');
    let h: u64 = parts.next()?.trim().parse().ok()?;
    let m: u64 = parts.next()?.parse().ok()?;
    let sec: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || m >= 60 || sec >= 60 || ms.len() != 3 {
        return None;
    }
    let ms: u64 = ms.parse().ok()?;
    Some(((h * 60 + m) * 60 + sec) * 1_000 + ms)
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).round() as u64
}

/// Turn a speech-model transcript into numbered cues.
///
/// Word-level timing narrows each cue to the speech it contains. Empty,
/// very short, noise-only and zero-length segments are dropped.
pub fn cues_from_transcript(transcript: &Transcript) -> Vec<Cue> {
    let mut cues = Vec::with_capacity(transcript.segments.len());

    for segment in &transcript.segments {
        let text = segment.text.trim();
        if text.chars().count() < MIN_CUE_CHARS || has_noise(text) {
            continue;
        }

        let (start, end) = segment.speech_bounds();
        let (start_ms, end_ms) = (seconds_to_ms(start), seconds_to_ms(end));
        if end_ms <= start_ms {
            continue;
        }

        cues.push(Cue::new(cues.len() + 1, start_ms, end_ms, text));
    }

    cues
}

/// Renumber cues `1..N` in their current order.
pub fn renumber(cues: &mut [Cue]) {
    for (i, cue) in cues.iter_mut().enumerate() {
        cue.index = i + 1;
    }
}
