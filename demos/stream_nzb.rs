//! Stream an NZB while it downloads
//!
//! Usage: `cargo run --example stream_nzb -- <file.nzb> <user:pass@host:port> [download_dir]`
//!
//! - Parses the NZB into a job under the download directory
//! - Starts the HTTP server (`/status`, `/video`, `/download`, `/shutdown`)
//! - Downloads archive volumes first so the player can start early
//! - Stops on Ctrl+C, `/shutdown`, or after five idle minutes

use nzb_stream::api;
use nzb_stream::config::{Config, ServerConfig};
use nzb_stream::{AppState, Event, Scheduler, ServerContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging (optional)
    // Uncomment if you add tracing-subscriber to your dependencies:
    // tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let (Some(nzb), Some(server)) = (args.next(), args.next()) else {
        eprintln!("usage: stream_nzb <file.nzb> <user:pass@host:port> [download_dir]");
        std::process::exit(2);
    };

    let mut config = Config::default();
    config.server = server.parse::<ServerConfig>()?;
    config.server.tls = config.server.port == 563;
    if let Some(dir) = args.next() {
        config.download.download_dir = PathBuf::from(dir);
    }
    config.api.idle_timeout = Some(Duration::from_secs(300));

    let scheduler = Arc::new(Scheduler::open(config.clone(), &PathBuf::from(nzb)).await?);
    println!(
        "Job {} -> {}",
        scheduler.manifest().name,
        scheduler.job_dir().display()
    );

    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::FileCompleted { name, size, .. } => {
                    println!("✓ {} ({} bytes)", name, size);
                }
                Event::FileFailed { name, error, .. } => {
                    println!("✗ {}: {}", name, error);
                }
                Event::JobComplete { completed_files, failed_files, .. } => {
                    println!("Done: {} written, {} failed", completed_files, failed_files);
                }
                _ => {}
            }
        }
    });

    let context = ServerContext::new();
    let state = AppState::for_scheduler(&scheduler, Arc::new(config.clone()), context.clone());
    let server = tokio::spawn(api::start_server(state));
    println!("Serving on http://{}/video", config.api.bind_address);

    let downloader = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    nzb_stream::run_until_shutdown(&scheduler, &context).await;

    downloader.await??;
    server.await??;
    Ok(())
}
