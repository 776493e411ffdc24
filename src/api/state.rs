//! Application state for the HTTP server

use crate::config::Config;
use crate::downloader::Scheduler;
use crate::error::{Error, Result};
use crate::stream::{ArchiveReader, ArchiveStream, RarReader};
use crate::types::{ArchiveEntry, JobProgress};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// What the byte endpoints serve
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaSource {
    /// First entry of the archive whose first volume is at this path
    Archive(PathBuf),
    /// A plain video file served through a blocking file view
    File {
        /// Name in the manifest, used to look up its declared size
        name: String,
        /// Final path on disk
        path: PathBuf,
    },
    /// The job has nothing playable
    Nothing,
}

/// Shared application state accessible to all route handlers
///
/// Cloned for each request; everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Job name shown by the status endpoint
    pub job: Arc<str>,

    /// Progress of the scheduler run
    pub progress: Arc<JobProgress>,

    /// What to serve
    pub source: Arc<MediaSource>,

    /// Configuration (stream tuning is read from here)
    pub config: Arc<Config>,

    /// Request tracking and shutdown trigger
    pub context: ServerContext,

    reader: Arc<dyn ArchiveReader>,
    entry: Arc<RwLock<Option<ArchiveEntry>>>,
    stream: Arc<Mutex<Option<ArchiveStream>>>,
}

impl AppState {
    /// State serving `source` with the built-in RAR reader
    pub fn new(
        job: impl Into<Arc<str>>,
        progress: Arc<JobProgress>,
        source: MediaSource,
        config: Arc<Config>,
        context: ServerContext,
    ) -> Self {
        let reader = Arc::new(RarReader::new(config.stream.chunk_size));
        Self::with_reader(job, progress, source, config, context, reader)
    }

    /// State serving `source` through a custom archive reader
    pub fn with_reader(
        job: impl Into<Arc<str>>,
        progress: Arc<JobProgress>,
        source: MediaSource,
        config: Arc<Config>,
        context: ServerContext,
        reader: Arc<dyn ArchiveReader>,
    ) -> Self {
        Self {
            job: job.into(),
            progress,
            source: Arc::new(source),
            config,
            context,
            reader,
            entry: Arc::new(RwLock::new(None)),
            stream: Arc::new(Mutex::new(None)),
        }
    }

    /// State for a scheduler's job: its first archive volume, else its first video file
    pub fn for_scheduler(scheduler: &Scheduler, config: Arc<Config>, context: ServerContext) -> Self {
        let source = match (scheduler.first_volume(), scheduler.video_file()) {
            (Some(first), _) => MediaSource::Archive(first),
            (None, Some(video)) => MediaSource::File {
                name: video.name.clone(),
                path: video.path.clone(),
            },
            (None, None) => MediaSource::Nothing,
        };
        Self::new(
            scheduler.manifest().name.as_str(),
            scheduler.progress(),
            source,
            config,
            context,
        )
    }

    /// The archive entry, if it has been discovered
    pub fn entry(&self) -> Option<ArchiveEntry> {
        self.entry.read().ok().and_then(|entry| entry.clone())
    }

    /// Open the archive stream if needed and return the entry it exposes
    ///
    /// Fails with [`Error::NotReady`] while the first volume is missing or
    /// unreadable, and when the job has no archive at all.
    pub async fn prepare_archive(&self) -> Result<ArchiveEntry> {
        let MediaSource::Archive(first) = self.source.as_ref() else {
            return Err(Error::NotReady("job has no archive".to_string()));
        };
        if let Some(entry) = self.entry() {
            return Ok(entry);
        }

        let mut slot = self.stream.lock().await;
        if let Some(stream) = slot.as_ref() {
            return Ok(stream.entry().clone());
        }

        let path = first.clone();
        let reader = Arc::clone(&self.reader);
        let config = self.config.stream.clone();
        let stream = tokio::task::spawn_blocking(move || ArchiveStream::open(path, reader, &config))
            .await
            .map_err(|e| Error::Other(format!("archive open task failed: {}", e)))?
            .map_err(|e| match e {
                Error::ArchiveUnavailable { reason, .. } => Error::NotReady(reason),
                other => other,
            })?;

        // Unblock readers waiting for volumes once the server goes down
        let abort = stream.abort_handle();
        let shutdown = self.context.shutdown_token();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            abort.cancel();
        });

        let entry = stream.entry().clone();
        if let Ok(mut cached) = self.entry.write() {
            *cached = Some(entry.clone());
        }
        *slot = Some(stream);
        Ok(entry)
    }

    /// Exclusive access to the open archive stream
    pub(crate) async fn lock_stream(&self) -> tokio::sync::OwnedMutexGuard<Option<ArchiveStream>> {
        Arc::clone(&self.stream).lock_owned().await
    }
}

const BUSY: u64 = u64::MAX;

#[derive(Debug)]
struct ContextInner {
    started: Instant,
    active: AtomicUsize,
    /// Milliseconds since `started` when the server last went idle, or `BUSY`
    idle_since: AtomicU64,
    shutdown: CancellationToken,
}

/// Per-server request tracking for idle shutdown
#[derive(Clone, Debug)]
pub struct ServerContext {
    inner: Arc<ContextInner>,
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerContext {
    /// Fresh context, idle and not shutting down
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                started: Instant::now(),
                active: AtomicUsize::new(0),
                idle_since: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn now_ms(&self) -> u64 {
        self.inner.started.elapsed().as_millis() as u64
    }

    /// Count a request as active until the returned guard is dropped
    pub fn begin_request(&self) -> RequestGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        self.inner.idle_since.store(BUSY, Ordering::SeqCst);
        RequestGuard {
            context: self.clone(),
        }
    }

    /// Number of requests whose response has not finished
    pub fn active_requests(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// How long the server has had no active request
    pub fn idle_for(&self) -> Option<Duration> {
        match self.inner.idle_since.load(Ordering::SeqCst) {
            BUSY => None,
            since => Some(Duration::from_millis(self.now_ms().saturating_sub(since))),
        }
    }

    /// Token cancelled when the server should shut down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Ask the server to shut down
    pub fn trigger_shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Whether shutdown has been triggered
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// Keeps a request counted as active
#[derive(Debug)]
pub struct RequestGuard {
    context: ServerContext,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let inner = &self.context.inner;
        if inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner
                .idle_since
                .store(self.context.now_ms(), Ordering::SeqCst);
        }
    }
}
