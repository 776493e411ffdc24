//! # nzb-stream
//!
//! Stream the video inside a multi-volume RAR release while it is still being
//! downloaded from Usenet.
//!
//! The crate has two halves that run side by side:
//! - a **download scheduler** that fetches the parts of an NZB job over a pool
//!   of NNTP connections, decodes them, and commits files to disk in an order
//!   that gets the first archive volume down as early as possible
//! - an **archive stream** that exposes the first entry of the archive as a
//!   seekable [`std::io::Read`], blocking while later volumes are still missing
//!
//! An axum server in [`api`] puts the stream on HTTP with Range support.
//!
//! ## Quick Start
//!
//! ```no_run
//! use nzb_stream::{Config, Scheduler, ServerConfig, ServerContext};
//! use nzb_stream::api::{self, AppState};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         server: "user:pass@news.example.com:563".parse::<ServerConfig>()?,
//!         ..Default::default()
//!     };
//!
//!     let scheduler = Arc::new(Scheduler::open(config.clone(), Path::new("Movie.nzb")).await?);
//!     let context = ServerContext::new();
//!     let state = AppState::for_scheduler(&scheduler, Arc::new(config), context.clone());
//!
//!     tokio::spawn(api::start_server(state));
//!     let runner = tokio::spawn({
//!         let scheduler = Arc::clone(&scheduler);
//!         async move { scheduler.run().await }
//!     });
//!
//!     nzb_stream::run_until_shutdown(&scheduler, &context).await;
//!     runner.await??;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// HTTP server
pub mod api;
/// SFV checksum manifests
pub mod checksum;
/// Configuration types
pub mod config;
/// Segment download scheduler and fetch workers
pub mod downloader;
/// Error types
pub mod error;
/// NZB manifests
pub mod manifest;
/// Retry logic with exponential backoff
pub mod retry;
/// Archive stream and blocking file view
pub mod stream;
/// Core types and events
pub mod types;
/// yEnc article decoding
pub mod yenc;

// Re-export commonly used types
pub use api::{AppState, ServerContext};
pub use config::{ApiConfig, Config, DownloadConfig, RetryConfig, ServerConfig, StreamConfig};
pub use downloader::{ArticleConnection, ArticleFetcher, NntpArticleFetcher, RunSummary, Scheduler};
pub use error::{ApiError, DecodeError, Error, ErrorDetail, FetchError, Result, ToHttpStatus};
pub use manifest::{Manifest, Part, RemoteFile};
pub use stream::{ArchiveReader, ArchiveStream, BlockingFileView, RarReader};
pub use types::{ArchiveEntry, Event, JobProgress, ProgressSnapshot};

/// Wait for a termination signal or a server shutdown, then stop the scheduler.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// A signal also triggers `context`'s shutdown so the HTTP server drains and stops.
pub async fn run_until_shutdown(scheduler: &Scheduler, context: &ServerContext) {
    let shutdown = context.shutdown_token();
    tokio::select! {
        _ = wait_for_signal() => context.trigger_shutdown(),
        _ = shutdown.cancelled() => tracing::info!("Server shutdown requested"),
    }
    scheduler.stop().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
