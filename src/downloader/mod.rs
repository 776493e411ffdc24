//! Segment download scheduler.
//!
//! The [`Scheduler`] owns a fixed pool of fetch workers and drives the files of
//! one manifest through it, one file at a time, in a fixed priority order:
//! - [`ordering`] - Processing order and archive volume detection
//! - [`fetcher`] - Article fetching capability and its NNTP implementation
//! - [`worker`] - Fetch workers pulling part jobs from the shared queue
//! - [`assembly`] - Per-file part collection and atomic commit

mod assembly;
pub mod fetcher;
pub mod ordering;
mod worker;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use fetcher::{ArticleConnection, ArticleFetcher, NntpArticleFetcher};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::checksum::{self, ChecksumManifest};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, RemoteFile};
use crate::types::{Event, JobProgress};
use assembly::FileAssembly;
use worker::{PartJob, PartOutcome, WorkerContext, run_worker};

/// Outcome of one [`Scheduler::run`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Files fetched and written during this run
    pub completed: usize,
    /// Files that had failing parts and were not written
    pub failed: usize,
    /// Files that were already complete on disk
    pub skipped: usize,
    /// Whether the run stopped early because of cancellation
    pub cancelled: bool,
}

/// A file found complete on disk before the run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SkippedFile {
    index: usize,
    /// Proven by checksum rather than by presence
    verified: bool,
}

/// Downloads the files of one manifest
pub struct Scheduler {
    /// Configuration (wrapped in Arc for sharing with workers)
    config: std::sync::Arc<Config>,
    manifest: Manifest,
    /// Pending file indices in processing order
    order: Vec<usize>,
    skipped: Vec<SkippedFile>,
    fetcher: std::sync::Arc<dyn ArticleFetcher>,
    /// Event broadcast channel sender (multiple subscribers supported)
    event_tx: broadcast::Sender<Event>,
    progress: std::sync::Arc<JobProgress>,
    cancel_token: CancellationToken,
    /// Tracks every fetch worker so stop/run can join them
    workers: TaskTracker,
    started: AtomicBool,
}

impl Scheduler {
    /// Load the manifest at `manifest_path` and prepare a scheduler that
    /// fetches from the configured NNTP server.
    pub async fn open(config: Config, manifest_path: &Path) -> Result<Self> {
        let manifest = Manifest::load(manifest_path, config.download_dir())?;
        let fetcher = Arc::new(NntpArticleFetcher::new(config.server.clone()));
        Self::from_manifest(config, manifest, fetcher).await
    }

    /// Prepare a scheduler for an already parsed manifest
    ///
    /// Files already complete on disk are detected here: when a checksum
    /// manifest (`.sfv`) of the job exists on disk, files it lists are verified
    /// by CRC32; every other file counts as complete when it is present.
    pub async fn from_manifest(
        config: Config,
        manifest: Manifest,
        fetcher: Arc<dyn ArticleFetcher>,
    ) -> Result<Self> {
        config.validate()?;

        let Manifest {
            name,
            title,
            job_dir,
            files,
        } = manifest;

        let (files, skipped) = tokio::task::spawn_blocking(move || {
            let mut files = files;
            let skipped = preflight(&mut files);
            (files, skipped)
        })
        .await
        .map_err(|e| Error::Other(format!("Pre-flight check panicked: {}", e)))?;

        let manifest = Manifest {
            name,
            title,
            job_dir,
            files,
        };

        let skipped_set: Vec<bool> = {
            let mut set = vec![false; manifest.files.len()];
            for s in &skipped {
                set[s.index] = true;
            }
            set
        };
        let pending: Vec<usize> = (0..manifest.files.len())
            .filter(|&i| !skipped_set[i])
            .collect();
        let pending_names: Vec<&str> = pending
            .iter()
            .map(|&i| manifest.files[i].name.as_str())
            .collect();
        let order: Vec<usize> = ordering::processing_order(&pending_names)
            .into_iter()
            .map(|i| pending[i])
            .collect();

        let progress = Arc::new(JobProgress::new(manifest.files.len()));
        for s in &skipped {
            let file = &manifest.files[s.index];
            progress.record_file_completed();
            if let Ok(meta) = std::fs::metadata(&file.path) {
                progress.set_declared_size(&file.name, meta.len());
            }
        }

        tracing::info!(
            job = %manifest.name,
            files = manifest.files.len(),
            pending = order.len(),
            skipped = skipped.len(),
            "Scheduler ready"
        );

        // Create broadcast channel with buffer size of 1000 events
        let (event_tx, _rx) = broadcast::channel(1000);

        Ok(Self {
            config: Arc::new(config),
            manifest,
            order,
            skipped,
            fetcher,
            event_tx,
            progress,
            cancel_token: CancellationToken::new(),
            workers: TaskTracker::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Subscribe to scheduler events
    ///
    /// Events are buffered, but a subscriber that falls behind by more than 1000
    /// events receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Live progress counters
    pub fn progress(&self) -> Arc<JobProgress> {
        Arc::clone(&self.progress)
    }

    /// The parsed manifest, with checksums filled in
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Directory the job's files are written to
    pub fn job_dir(&self) -> &Path {
        &self.manifest.job_dir
    }

    /// Names of the files still to download, in processing order
    pub fn pending_files(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.manifest.files[i].name.as_str())
            .collect()
    }

    /// Path of the archive volume extraction starts from, if the job has one
    pub fn first_volume(&self) -> Option<PathBuf> {
        let names: Vec<&str> = self.manifest.files.iter().map(|f| f.name.as_str()).collect();
        ordering::first_volume(&names).map(|i| self.manifest.files[i].path.clone())
    }

    /// First playable video file of the job, for jobs without an archive
    pub fn video_file(&self) -> Option<&RemoteFile> {
        self.manifest
            .files
            .iter()
            .find(|f| ordering::is_video_file(&f.name))
    }

    /// Token cancelled by [`Scheduler::stop`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Download every pending file in processing order
    ///
    /// Each file's parts are queued for the worker pool (together with the
    /// parts of the next file, so connections stay busy), then the scheduler
    /// waits for a result for every part of the current file, writes it, and
    /// moves on. A file with failed parts is reported and skipped.
    ///
    /// Can only be called once per scheduler.
    pub async fn run(&self) -> Result<RunSummary> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Other("scheduler has already been run".to_string()));
        }

        let job_name = self.manifest.name.clone();
        let mut summary = RunSummary {
            skipped: self.skipped.len(),
            ..Default::default()
        };

        self.emit(Event::JobStarted {
            name: job_name.clone(),
            pending_files: self.order.len(),
            skipped_files: self.skipped.len(),
        });
        for skipped in &self.skipped {
            self.emit(Event::FileSkipped {
                name: self.manifest.files[skipped.index].name.clone(),
                verified: skipped.verified,
            });
        }

        let (job_tx, job_rx) = mpsc::unbounded_channel::<PartJob>();
        let jobs = Arc::new(Mutex::new(job_rx));
        let connections = self.config.server.connections;
        let (result_tx, mut result_rx) = mpsc::channel::<PartOutcome>(connections * 4);

        if !self.order.is_empty() {
            for id in 0..connections {
                self.workers.spawn(run_worker(WorkerContext {
                    id,
                    fetcher: Arc::clone(&self.fetcher),
                    jobs: Arc::clone(&jobs),
                    results: result_tx.clone(),
                    retry: self.config.download.retry.clone(),
                    cancel: self.cancel_token.clone(),
                }));
            }
        }
        // Only workers hold senders, so recv() returning None means they all exited
        drop(result_tx);

        let mut job_tx = Some(job_tx);
        let mut submitted = 0;
        let mut early: HashMap<usize, Vec<PartOutcome>> = HashMap::new();

        for position in 0..self.order.len() {
            // Keep the current file and the next one queued
            while submitted < self.order.len() && submitted <= position + 1 {
                if self.cancel_token.is_cancelled() {
                    break;
                }
                if let Some(tx) = &job_tx {
                    self.submit(tx, self.order[submitted]);
                }
                submitted += 1;
            }
            if submitted == self.order.len() {
                // Workers exit once the queue is closed and empty
                job_tx = None;
            }

            let index = self.order[position];
            let file = &self.manifest.files[index];
            let mut assembly = FileAssembly::new(index, file);
            for outcome in early.remove(&index).unwrap_or_default() {
                assembly.record(outcome);
            }

            while !assembly.is_complete() {
                let received = tokio::select! {
                    biased;
                    _ = self.cancel_token.cancelled() => {
                        drop(job_tx.take());
                        return Ok(self.finish_cancelled(result_rx, summary).await);
                    }
                    received = result_rx.recv() => received,
                };

                let Some(outcome) = received else {
                    self.workers.close();
                    tracing::error!(job = %job_name, file = %file.name, "All fetch workers exited");
                    return Err(Error::Nntp(format!(
                        "all fetch workers exited before {} was complete",
                        file.name
                    )));
                };

                self.report(&outcome);
                if outcome.file_index == index {
                    assembly.record(outcome);
                } else {
                    early.entry(outcome.file_index).or_default().push(outcome);
                }
            }

            self.finish_file(assembly, &mut summary).await;
        }

        drop(job_tx);
        self.workers.close();
        self.workers.wait().await;

        tracing::info!(
            job = %job_name,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Job complete"
        );
        self.emit(Event::JobComplete {
            name: job_name,
            completed_files: summary.completed,
            failed_files: summary.failed,
        });

        Ok(summary)
    }

    /// Request cancellation and wait for every fetch worker to exit
    ///
    /// Safe to call more than once, and before or after [`Scheduler::run`].
    pub async fn stop(&self) {
        self.cancel_token.cancel();
        self.workers.close();
        self.workers.wait().await;
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }

    fn submit(&self, tx: &mpsc::UnboundedSender<PartJob>, index: usize) {
        let file = &self.manifest.files[index];
        tracing::debug!(file = %file.name, parts = file.parts.len(), "Queueing file");
        for part in &file.parts {
            let job = PartJob {
                file_index: index,
                file_name: file.name.clone(),
                part: part.clone(),
                part_count: file.part_count(),
            };
            if tx.send(job).is_err() {
                // Every worker is gone; run() notices on the result channel
                return;
            }
        }
    }

    fn report(&self, outcome: &PartOutcome) {
        let Some(file) = self.manifest.files.get(outcome.file_index) else {
            return;
        };
        match &outcome.result {
            Ok(result) => {
                self.progress.record_part(result.data.len() as u64);
                if let Some(size) = result.file_size
                    && self.progress.declared_size(&file.name).is_none()
                {
                    self.progress.set_declared_size(&file.name, size);
                }
                self.emit(Event::PartDownloaded {
                    name: file.name.clone(),
                    part: result.part_index,
                    total_parts: result.part_count,
                    bytes: result.data.len() as u64,
                });
            }
            Err(e) => {
                tracing::warn!(
                    file = %file.name,
                    part = outcome.part_index,
                    error = %e,
                    "Part failed"
                );
                self.emit(Event::PartFailed {
                    name: file.name.clone(),
                    part: outcome.part_index,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn finish_file(&self, assembly: FileAssembly, summary: &mut RunSummary) {
        let name = assembly.name.clone();
        let failed_parts = assembly.failed_count();

        if failed_parts > 0 {
            let error = assembly
                .first_error()
                .unwrap_or_else(|| "part fetch failed".to_string());
            tracing::error!(file = %name, failed_parts, error = %error, "File failed, not writing");
            self.fail_file(name, failed_parts, error, summary);
            return;
        }

        let path = self.manifest.files[assembly.file_index].path.clone();
        if let Some(size) = assembly.declared_size() {
            self.progress.set_declared_size(&name, size);
        }
        match assembly.commit().await {
            Ok(size) => {
                tracing::info!(file = %name, size, path = %path.display(), "File written");
                summary.completed += 1;
                self.progress.record_file_completed();
                self.emit(Event::FileCompleted { name, path, size });
            }
            Err(e) => {
                tracing::error!(file = %name, error = %e, "Failed to write file");
                self.fail_file(name, 0, e.to_string(), summary);
            }
        }
    }

    fn fail_file(&self, name: String, failed_parts: u32, error: String, summary: &mut RunSummary) {
        summary.failed += 1;
        self.progress.record_file_failed();
        self.emit(Event::FileFailed {
            name,
            failed_parts,
            error,
        });
    }

    /// Drain in-flight results until every worker has exited
    async fn finish_cancelled(
        &self,
        mut result_rx: mpsc::Receiver<PartOutcome>,
        mut summary: RunSummary,
    ) -> RunSummary {
        let mut drained = 0usize;
        while result_rx.recv().await.is_some() {
            drained += 1;
        }
        self.workers.close();
        self.workers.wait().await;

        tracing::info!(job = %self.manifest.name, drained, "Job cancelled");
        self.emit(Event::JobCancelled {
            name: self.manifest.name.clone(),
        });
        summary.cancelled = true;
        summary
    }
}

/// Split files into already-complete ones and pending ones, filling in
/// checksums from any SFV file of the job that exists on disk.
fn preflight(files: &mut [RemoteFile]) -> Vec<SkippedFile> {
    let mut checksums = ChecksumManifest::default();
    let mut have_checksums = false;
    for file in files.iter().filter(|f| ordering::is_sfv_file(&f.name)) {
        if !file.path.is_file() {
            continue;
        }
        match ChecksumManifest::load(&file.path) {
            Ok(sfv) => {
                tracing::debug!(file = %file.name, entries = sfv.len(), "Loaded checksum manifest");
                checksums.merge(sfv);
                have_checksums = true;
            }
            Err(e) => tracing::warn!(file = %file.name, error = %e, "Unreadable checksum manifest"),
        }
    }

    let mut skipped = Vec::new();
    for (index, file) in files.iter_mut().enumerate() {
        if have_checksums {
            file.checksum = checksums.get(&file.name).map(str::to_string);
        }
        if !file.path.is_file() {
            continue;
        }

        match &file.checksum {
            Some(expected) => match checksum::verify_file(&file.path, expected) {
                Ok(()) => {
                    tracing::debug!(file = %file.name, "Checksum verified, skipping");
                    skipped.push(SkippedFile {
                        index,
                        verified: true,
                    });
                }
                Err(e) => {
                    tracing::warn!(file = %file.name, error = %e, "Existing file failed verification, downloading again");
                    // Presence on disk must keep meaning complete
                    if let Err(e) = std::fs::remove_file(&file.path) {
                        tracing::warn!(file = %file.name, error = %e, "Failed to remove corrupt file");
                    }
                }
            },
            None => {
                tracing::debug!(file = %file.name, "File present, skipping");
                skipped.push(SkippedFile {
                    index,
                    verified: false,
                });
            }
        }
    }
    skipped
}
