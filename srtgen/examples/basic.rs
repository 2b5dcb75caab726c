//! Queue one video for Dutch subtitles and wait for the job to finish.
//!
//! Usage: cargo run --example basic -- path/to/movie.mkv

use std::time::Duration;

use srtgen::{JobRequest, Method};

#[tokio::main]
async fn main() -> srtgen::Result<()> {
    let path = std::env::args()
        .nth(1)
        .expect("usage: basic <video-file>");

    let data_dir = std::env::temp_dir().join("srtgen-example");
    let (queue, scheduler) = srtgen::start_service(&data_dir)?;

    let id = queue.enqueue(JobRequest {
        path: path.into(),
        language: "nl".into(),
        method: Method::Lexical,
        ..JobRequest::default()
    })?;

    loop {
        let Some(job) = queue.get(id) else { break };
        eprintln!("[{:>3}%] {}", job.progress, job.message);
        if job.status.is_terminal() {
            println!("{}: {:?}", job.status, job.result.unwrap_or_default());
            if let Some(error) = job.error {
                println!("failed during {}: {}", error.stage, error.message);
            }
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    scheduler.shutdown().await;
    Ok(())
}
