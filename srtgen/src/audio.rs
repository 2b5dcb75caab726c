use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

use crate::engines::AudioLoader;
use crate::error::{Error, Result};

/// Sample rate the speech model expects.
pub const SAMPLE_RATE: u32 = 16_000;

/// Maximum audio duration in seconds (8 hours).
/// 8 hours at 16kHz mono f32 = ~1.8 GB.
const MAX_AUDIO_DURATION_SECS: f64 = 8.0 * 3600.0;

/// Extracts the first audio track of a media file through an ffmpeg subprocess.
#[derive(Debug, Default, Clone)]
pub struct FfmpegAudio;

impl AudioLoader for FfmpegAudio {
    fn load(&self, path: &Path) -> Result<Vec<f32>> {
        load_audio(path)
    }
}

/// Decode the audio track of `path` into 16kHz mono f32 samples.
pub fn load_audio(path: &Path) -> Result<Vec<f32>> {
    info!(path = %path.display(), "extracting audio");

    if !path.exists() {
        return Err(Error::AudioNotFound {
            path: path.to_path_buf(),
        });
    }

    let output = Command::new("ffmpeg")
        .args(["-nostdin", "-threads", "0", "-i"])
        .arg(path)
        .args([
            "-vn",
            "-f",
            "s16le",
            "-ac",
            "1",
            "-acodec",
            "pcm_s16le",
            "-ar",
            &SAMPLE_RATE.to_string(),
            "-",
        ])
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::AudioDecode("ffmpeg not found, install it with: apt install ffmpeg".into())
            } else {
                Error::AudioDecode(format!("failed to run ffmpeg: {e}"))
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(Error::AudioDecode(format!("ffmpeg failed: {tail}")));
    }

    let samples = pcm_s16le_to_f32(&output.stdout);
    if samples.is_empty() {
        return Err(Error::AudioDecode("ffmpeg produced no audio".into()));
    }

    let duration = samples.len() as f64 / SAMPLE_RATE as f64;
    debug!(samples = samples.len(), "decoded audio");
    if duration > MAX_AUDIO_DURATION_SECS {
        return Err(Error::AudioDecode(format!(
            "audio too long ({duration:.0}s), maximum supported duration is {MAX_AUDIO_DURATION_SECS:.0}s"
        )));
    }

    info!(duration_secs = format!("{duration:.1}"), "audio ready");
    Ok(samples)
}

/// Convert raw s16le bytes to f32 samples in [-1.0, 1.0).
fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect()
}
