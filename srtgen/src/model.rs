use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::config::Model;
use crate::error::{Error, Result};

const HUGGINGFACE_BASE: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// Anything smaller is an error page, not a model.
const MIN_MODEL_BYTES: u64 = 1_000_000;

/// Where and how to fetch model weights.
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub cache_dir: PathBuf,
    /// Soft download cap in bytes per second.
    pub bandwidth_limit: Option<u64>,
}

/// Ensure a model is available locally, downloading if necessary.
/// Returns the path to the model file.
pub async fn ensure_model(model: &Model, source: &ModelSource, progress: &ProgressBar) -> Result<PathBuf> {
    match model {
        Model::Custom(path) => {
            if path.exists() {
                Ok(path.clone())
            } else {
                Err(Error::ModelNotFound { path: path.clone() })
            }
        }
        _ => {
            let filename = model.filename();
            let model_path = source.cache_dir.join(&filename);

            if model_path.exists() {
                debug!(path = %model_path.display(), "model already cached");
                return Ok(model_path);
            }

            std::fs::create_dir_all(&source.cache_dir).map_err(|e| {
                Error::ModelDownload(format!(
                    "failed to create cache dir {}: {e}",
                    source.cache_dir.display()
                ))
            })?;

            let url = format!("{HUGGINGFACE_BASE}/{filename}");
            info!(%url, limit = ?source.bandwidth_limit, "downloading model");
            download_model(&url, &model_path, source.bandwidth_limit, progress).await?;

            Ok(model_path)
        }
    }
}

/// Progress bar style for interactive downloads.
pub fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

async fn download_model(
    url: &str,
    dest: &Path,
    bandwidth_limit: Option<u64>,
    pb: &ProgressBar,
) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| Error::ModelDownload(format!("HTTP error: {e}")))?;

    let total_size = response.content_length().unwrap_or(0);
    pb.set_length(total_size);
    pb.set_message(format!(
        "Downloading {}",
        dest.file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));

    // Write to a temp file first, then rename
    let tmp_path = dest.with_extension("bin.part");
    let mut file = std::fs::File::create(&tmp_path)?;
    let mut stream = response.bytes_stream();
    let mut throttle = Throttle::new(bandwidth_limit);

    use std::io::Write;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)?;
        pb.inc(chunk.len() as u64);
        if let Some(pause) = throttle.record(chunk.len() as u64) {
            tokio::time::sleep(pause).await;
        }
    }

    file.flush()?;
    drop(file);

    let file_size = std::fs::metadata(&tmp_path)?.len();
    if file_size < MIN_MODEL_BYTES {
        std::fs::remove_file(&tmp_path).ok();
        return Err(Error::ModelDownload(format!(
            "downloaded file too small ({file_size} bytes), likely an error page"
        )));
    }

    std::fs::rename(&tmp_path, dest)?;
    pb.finish_with_message("Download complete");

    if total_size > 0 && file_size != total_size {
        warn!(
            expected = total_size,
            actual = file_size,
            "file size mismatch, model may be corrupt"
        );
    }

    info!(path = %dest.display(), size = file_size, "model saved");
    Ok(())
}

/// Soft rate limit: after each chunk, says how long to pause so the average
/// rate stays under the cap.
struct Throttle {
    limit: Option<u64>,
    started: Instant,
    transferred: u64,
}

impl Throttle {
    fn new(limit: Option<u64>) -> Self {
        Self {
            limit: limit.filter(|&l| l > 0),
            started: Instant::now(),
            transferred: 0,
        }
    }

    fn record(&mut self, bytes: u64) -> Option<Duration> {
        self.transferred += bytes;
        let limit = self.limit?;
        let due = Duration::from_secs_f64(self.transferred as f64 / limit as f64);
        due.checked_sub(self.started.elapsed())
            .filter(|pause| !pause.is_zero())
    }
}

/// List all cached models.
pub fn list_cached_models(cache_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(cache_dir) else {
        return Vec::new();
    };

    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "bin"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn source(dir: &Path) -> ModelSource {
        ModelSource {
            cache_dir: dir.to_path_buf(),
            bandwidth_limit: None,
        }
    }

    #[test]
    fn test_list_cached_models_nonexistent_dir() {
        assert!(list_cached_models(Path::new("/nonexistent/path")).is_empty());
    }

    #[test]
    fn test_list_cached_models_finds_bin_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("ggml-tiny.bin"), b"fake model").unwrap();
        fs::write(tmp.path().join("ggml-base.bin"), b"fake model").unwrap();
        fs::write(tmp.path().join("ggml-tiny.bin.part"), b"partial").unwrap();
        fs::write(tmp.path().join("readme.txt"), b"not a model").unwrap();

        let models = list_cached_models(tmp.path());
        assert_eq!(models.len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_model_custom_not_found() {
        let model = Model::Custom(PathBuf::from("/nonexistent/model.bin"));
        let result = ensure_model(&model, &source(Path::new("/unused")), &ProgressBar::hidden()).await;
        assert!(matches!(result.unwrap_err(), Error::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn test_ensure_model_uses_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let model_path = tmp.path().join("ggml-tiny.bin");
        fs::write(&model_path, b"fake cached model").unwrap();

        let result = ensure_model(&Model::Tiny, &source(tmp.path()), &ProgressBar::hidden()).await;
        assert_eq!(result.unwrap(), model_path);
    }

    #[test]
    fn test_throttle_unlimited_never_pauses() {
        let mut t = Throttle::new(None);
        assert!(t.record(u64::MAX / 2).is_none());
        let mut t = Throttle::new(Some(0));
        assert!(t.record(1 << 30).is_none());
    }

    #[test]
    fn test_throttle_pauses_when_ahead_of_budget() {
        let mut t = Throttle::new(Some(1024));
        // 10 KiB at 1 KiB/s is ~10s of budget, far ahead of the elapsed time.
        let pause = t.record(10 * 1024).unwrap();
        assert!(pause > Duration::from_secs(9));
        assert!(pause <= Duration::from_secs(10));
    }
}
