mod server;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use srtgen::model::{download_style, ensure_model, list_cached_models, ModelSource};
use srtgen::pipeline::find_conflicts;
use srtgen::{JobRequest, Language, Method, Model, Reporter, SettingsStore, Stage};

#[derive(Parser)]
#[command(name = "srtgen", about = "Generate translated subtitles for video files")]
struct Cli {
    /// Directory holding settings.json and history.jsonl.
    #[arg(long, global = true, env = "SRTGEN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP job server.
    Serve {
        /// Root folder that request paths are relative to.
        #[arg(long, env = "MEDIA_FOLDER")]
        media_folder: PathBuf,

        #[arg(long, env = "SRTGEN_HOST", default_value = "0.0.0.0")]
        host: String,

        #[arg(long, env = "SRTGEN_PORT", default_value = "8000")]
        port: u16,
    },

    /// Generate subtitles for one file and exit.
    Run {
        /// Video or .srt file.
        file: PathBuf,

        /// Target language code (e.g. "nl", "de").
        #[arg(short, long)]
        language: String,

        /// source-only, lexical, lexical-reuse or lexical-refine.
        #[arg(long, default_value = "lexical")]
        method: Method,

        /// Whisper model name or path to a .ggml file (default: from settings).
        #[arg(short, long)]
        model: Option<String>,

        /// Replace existing subtitle files.
        #[arg(long)]
        overwrite: bool,
    },

    /// List available whisper models and the ones already cached.
    ListModels,

    /// Download a whisper model into the cache.
    DownloadModel {
        name: String,

        /// Model cache directory (default: from settings).
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// List supported target languages.
    ListLanguages,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let data_dir = cli.data_dir.unwrap_or_else(srtgen::default_data_dir);

    match cli.command {
        Command::Serve {
            media_folder,
            host,
            port,
        } => serve(&data_dir, media_folder, &host, port).await,
        Command::Run {
            file,
            language,
            method,
            model,
            overwrite,
        } => {
            let request = JobRequest {
                path: file,
                language,
                method,
                overwrite,
                whisper_model: model,
                ..JobRequest::default()
            };
            run(&data_dir, request).await
        }
        Command::ListModels => list_models(&data_dir),
        Command::DownloadModel { name, cache_dir } => download_model(&data_dir, &name, cache_dir).await,
        Command::ListLanguages => {
            println!("{:<6} {}", "CODE", "LANGUAGE");
            println!("{:<6} {}", "----", "--------");
            for lang in Language::supported() {
                println!("{:<6} {}", lang.code(), lang.name());
            }
        }
    }
}

fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "srtgen=info".parse() {
        filter = filter.add_directive(directive);
    }
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn exit_with(e: impl std::fmt::Display) -> ! {
    eprintln!("Error: {e}");
    std::process::exit(1);
}

fn load_settings(data_dir: &Path) -> SettingsStore {
    SettingsStore::load(data_dir.join(srtgen::SETTINGS_FILE)).unwrap_or_else(|e| exit_with(e))
}

async fn serve(data_dir: &Path, media_folder: PathBuf, host: &str, port: u16) {
    let media_root = media_folder
        .canonicalize()
        .unwrap_or_else(|e| exit_with(format!("media folder {}: {e}", media_folder.display())));
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .unwrap_or_else(|e| exit_with(format!("invalid address {host}:{port}: {e}")));

    let (queue, scheduler) = srtgen::start_service(data_dir).unwrap_or_else(|e| exit_with(e));
    let app = server::router(server::AppState::new(queue, media_root.clone()));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(%addr, media = %media_root.display(), data = %data_dir.display(), "srtgen listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
    {
        error!(error = %e, "server error");
    }
    scheduler.shutdown().await;
}

/// Draws pipeline progress on stderr.
struct BarReporter {
    bar: ProgressBar,
}

impl Reporter for BarReporter {
    fn stage(&self, stage: Stage, message: String) {
        self.bar.set_position(u64::from(stage.span().0));
        self.bar.set_message(message);
    }

    fn progress(&self, percent: u8) {
        self.bar.set_position(u64::from(percent));
    }

    fn message(&self, message: String) {
        self.bar.set_message(message);
    }

    fn detected_language(&self, code: &str) {
        self.bar.println(format!("Detected language: {code}"));
    }
}

async fn run(data_dir: &Path, request: JobRequest) {
    let (pipeline, settings) = srtgen::open_pipeline(data_dir).unwrap_or_else(|e| exit_with(e));
    let spec = srtgen::queue::validate(request, &settings.get()).unwrap_or_else(|e| exit_with(e));

    let conflicts = find_conflicts(&spec);
    if !conflicts.is_empty() {
        eprintln!("Output files already exist:");
        for path in conflicts {
            eprintln!("  {}", path.display());
        }
        eprintln!("Use --overwrite to replace them");
        std::process::exit(1);
    }

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    let reporter = Arc::new(BarReporter { bar: bar.clone() });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let outcome = pipeline.run(&spec, reporter, &cancel).await;
    bar.finish_and_clear();

    for path in &outcome.written {
        println!("{}", path.display());
    }
    if let Err(failure) = outcome.result {
        eprintln!("Error during {}: {}", failure.stage, failure.error);
        std::process::exit(1);
    }
    eprintln!(
        "Done: {} file(s) written for {}",
        outcome.written.len(),
        spec.target_language.name()
    );
}

fn list_models(data_dir: &Path) {
    println!("{:<16} {}", "MODEL", "SIZE");
    println!("{:<16} {}", "-----", "----");
    for (name, size) in Model::CATALOG {
        println!("{name:<16} {size}");
    }

    let cache_dir = load_settings(data_dir).get().cache_dir();
    let cached = list_cached_models(&cache_dir);
    if !cached.is_empty() {
        println!("\nCached models in {}:", cache_dir.display());
        for path in cached {
            let size = std::fs::metadata(&path)
                .map(|m| format_bytes(m.len()))
                .unwrap_or_default();
            println!(
                "  {} ({})",
                path.file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size
            );
        }
    }
}

async fn download_model(data_dir: &Path, name: &str, cache_dir: Option<PathBuf>) {
    let Some(model) = Model::parse_name(name) else {
        eprintln!("Unknown model: {name}");
        eprintln!("Use list-models to see available models");
        std::process::exit(1);
    };

    let settings = load_settings(data_dir).get();
    let source = ModelSource {
        cache_dir: cache_dir.unwrap_or_else(|| settings.cache_dir()),
        bandwidth_limit: settings.bandwidth_limit(),
    };
    let bar = ProgressBar::new(0).with_style(download_style());
    bar.set_message(format!("Downloading {}", model.filename()));

    match ensure_model(&model, &source, &bar).await {
        Ok(path) => println!("Model ready: {}", path.display()),
        Err(e) => exit_with(e),
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.0} MB", bytes as f64 / 1_000_000.0)
    } else {
        format!("{:.0} KB", bytes as f64 / 1_000.0)
    }
}
