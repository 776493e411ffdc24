//! Core types for nzb-stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// The single logical file exposed from inside an archive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Name of the entry inside the archive
    pub name: String,
    /// Uncompressed size in bytes
    pub size: u64,
}

/// Event emitted while a job is downloading
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The scheduler started working through the pending files
    JobStarted {
        /// Job name
        name: String,
        /// Number of files that still need downloading
        pending_files: usize,
        /// Number of files already complete on disk
        skipped_files: usize,
    },

    /// A file was already complete on disk and will not be fetched
    FileSkipped {
        /// File name
        name: String,
        /// Whether completeness was proven by a checksum (false = presence only)
        verified: bool,
    },

    /// One part of the current file was fetched and decoded
    PartDownloaded {
        /// File name
        name: String,
        /// 1-based part index
        part: u32,
        /// Number of parts in the file
        total_parts: u32,
        /// Decoded payload size
        bytes: u64,
    },

    /// One part of the current file could not be fetched
    PartFailed {
        /// File name
        name: String,
        /// 1-based part index
        part: u32,
        /// Error message
        error: String,
    },

    /// A file was written to its final path
    FileCompleted {
        /// File name
        name: String,
        /// Final path on disk
        path: PathBuf,
        /// File size in bytes
        size: u64,
    },

    /// A file had failing parts and was not written
    FileFailed {
        /// File name
        name: String,
        /// Number of parts that failed
        failed_parts: u32,
        /// First error observed
        error: String,
    },

    /// Every pending file was processed
    JobComplete {
        /// Job name
        name: String,
        /// Files written during this run
        completed_files: usize,
        /// Files that failed during this run
        failed_files: usize,
    },

    /// The job was cancelled before all files were processed
    JobCancelled {
        /// Job name
        name: String,
    },
}

/// Live progress counters shared between the scheduler and the HTTP layer
#[derive(Debug)]
pub struct JobProgress {
    /// When the scheduler was opened
    pub started_at: DateTime<Utc>,
    files_total: AtomicU64,
    files_completed: AtomicU64,
    files_failed: AtomicU64,
    parts_downloaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    declared_sizes: RwLock<HashMap<String, u64>>,
}

impl JobProgress {
    /// Create counters for a job with `files_total` files
    pub fn new(files_total: usize) -> Self {
        Self {
            started_at: Utc::now(),
            files_total: AtomicU64::new(files_total as u64),
            files_completed: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            parts_downloaded: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            declared_sizes: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn record_part(&self, bytes: u64) {
        self.parts_downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the total size a file will have once complete
    pub fn set_declared_size(&self, name: &str, size: u64) {
        if let Ok(mut sizes) = self.declared_sizes.write() {
            sizes.insert(name.to_string(), size);
        }
    }

    /// Total size a file will have once complete, if known
    pub fn declared_size(&self, name: &str) -> Option<u64> {
        self.declared_sizes
            .read()
            .ok()
            .and_then(|sizes| sizes.get(name).copied())
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            started_at: self.started_at,
            files_total: self.files_total.load(Ordering::Relaxed),
            files_completed: self.files_completed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            parts_downloaded: self.parts_downloaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`JobProgress`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// When the scheduler was opened
    pub started_at: DateTime<Utc>,
    /// Files in the manifest
    pub files_total: u64,
    /// Files complete on disk (skipped or written)
    pub files_completed: u64,
    /// Files that failed
    pub files_failed: u64,
    /// Parts fetched and decoded during this run
    pub parts_downloaded: u64,
    /// Decoded bytes fetched during this run
    pub bytes_downloaded: u64,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_snake_case_tag() {
        let event = Event::FileFailed {
            name: "movie.r03".to_string(),
            failed_parts: 2,
            error: "article <x@y> not found".to_string(),
        };

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "file_failed");
        assert_eq!(json["name"], "movie.r03");
        assert_eq!(json["failed_parts"], 2);
    }

    #[test]
    fn progress_counts_accumulate() {
        let progress = JobProgress::new(3);
        progress.record_part(100);
        progress.record_part(50);
        progress.record_file_completed();
        progress.record_file_failed();

        let snapshot = progress.snapshot();

        assert_eq!(snapshot.files_total, 3);
        assert_eq!(snapshot.files_completed, 1);
        assert_eq!(snapshot.files_failed, 1);
        assert_eq!(snapshot.parts_downloaded, 2);
        assert_eq!(snapshot.bytes_downloaded, 150);
    }

    #[test]
    fn declared_sizes_are_looked_up_by_name() {
        let progress = JobProgress::new(1);
        assert_eq!(progress.declared_size("a.mkv"), None);

        progress.set_declared_size("a.mkv", 4096);

        assert_eq!(progress.declared_size("a.mkv"), Some(4096));
    }
}
