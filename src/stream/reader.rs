//! The archive reading capability used by [`ArchiveStream`](super::ArchiveStream).
//!
//! A reader lists the single exposed entry of an archive and extracts it as a
//! sequence of chunks. Extraction is push-based: decompressed bytes go to a
//! [`ChunkSink`], and whenever another volume is needed the reader asks a
//! [`VolumeSource`] to wait for it. Both return [`ControlFlow::Break`] to abort.
//! Other waits inside an extraction go through the same [`VolumeSource`] so
//! they can be aborted too.

use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{compressed, rar};
use crate::error::{Error, Result};
use crate::types::ArchiveEntry;

/// One item of the extraction queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkOrEnd {
    /// Next bytes of the entry
    Chunk(Vec<u8>),
    /// The entry is complete
    End,
}

/// Receives extracted bytes in order
pub trait ChunkSink {
    /// Accept the next chunk; `Break` aborts the extraction
    fn push(&mut self, chunk: &[u8]) -> ControlFlow<()>;
}

/// Makes archive volumes available
pub trait VolumeSource {
    /// Block until `path` exists; `Break` aborts the extraction
    fn wait_for(&self, path: &Path) -> ControlFlow<()>;

    /// Block until `ready` returns true; `Break` aborts the extraction
    fn wait_until(&self, ready: &mut dyn FnMut() -> bool) -> ControlFlow<()>;
}

/// How an extraction ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// Every byte of the entry was pushed
    Finished,
    /// The sink or the volume source asked to stop
    Aborted,
}

/// Lists and extracts the first entry of a (possibly multi-volume) archive
pub trait ArchiveReader: Send + Sync {
    /// Name and uncompressed size of the exposed entry
    fn list(&self, path: &Path) -> Result<ArchiveEntry>;

    /// Extract the exposed entry from byte 0, pushing it into `sink`
    fn extract(
        &self,
        path: &Path,
        sink: &mut dyn ChunkSink,
        volumes: &dyn VolumeSource,
    ) -> std::io::Result<ExtractOutcome>;

    /// Drop whatever the reader keeps between extractions of one stream
    fn release(&self) {}
}

/// [`ArchiveReader`] for RAR4 and RAR5 archives
///
/// Stored entries are streamed straight out of each volume as soon as it
/// exists. Compressed entries go through `unrar` once every volume is on disk;
/// the unpacked copy is reused by later extractions until
/// [`release`](ArchiveReader::release) or drop.
#[derive(Debug)]
pub struct RarReader {
    chunk_size: usize,
    unpacked: compressed::Unpacked,
}

impl RarReader {
    /// Reader pushing chunks of at most `chunk_size` bytes
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            unpacked: compressed::Unpacked::default(),
        }
    }
}

impl ArchiveReader for RarReader {
    fn list(&self, path: &Path) -> Result<ArchiveEntry> {
        let unavailable = |reason: String| Error::ArchiveUnavailable {
            path: path.to_path_buf(),
            reason,
        };

        let mut file = std::fs::File::open(path).map_err(|e| unavailable(e.to_string()))?;
        let volume = rar::read_volume(&mut file).map_err(|e| unavailable(e.to_string()))?;

        if volume.entry.stored {
            return Ok(ArchiveEntry {
                name: volume.entry.name,
                size: volume.entry.unpacked_size,
            });
        }
        compressed::list(path).map_err(|e| unavailable(e.to_string()))
    }

    fn extract(
        &self,
        path: &Path,
        sink: &mut dyn ChunkSink,
        volumes: &dyn VolumeSource,
    ) -> std::io::Result<ExtractOutcome> {
        if volumes.wait_for(path).is_break() {
            return Ok(ExtractOutcome::Aborted);
        }
        let mut file = std::fs::File::open(path)?;
        let volume = rar::read_volume(&mut file)?;
        drop(file);
        tracing::debug!(
            path = %path.display(),
            format = ?volume.format,
            entry = %volume.entry.name,
            "Extracting archive entry"
        );

        if volume.entry.stored {
            rar::extract_stored(path, self.chunk_size, sink, volumes)
        } else {
            tracing::debug!(path = %path.display(), "Entry is compressed, extracting with unrar");
            compressed::extract(path, self.chunk_size, sink, volumes, &self.unpacked)
        }
    }

    fn release(&self) {
        self.unpacked.release();
    }
}

/// [`VolumeSource`] that polls the filesystem until a volume appears
///
/// Files are renamed into place only once complete, so presence is enough.
#[derive(Clone, Debug)]
pub struct PollingVolumes {
    interval: Duration,
    cancel: CancellationToken,
}

impl PollingVolumes {
    /// Poll every `interval` until the volume exists or `cancel` fires
    pub fn new(interval: Duration, cancel: CancellationToken) -> Self {
        Self { interval, cancel }
    }
}

impl PollingVolumes {
    fn poll(
        &self,
        ready: &mut dyn FnMut() -> bool,
        mut on_first_wait: impl FnMut(),
    ) -> ControlFlow<()> {
        let mut waited = false;
        loop {
            if self.cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            if ready() {
                return ControlFlow::Continue(());
            }
            if !waited {
                on_first_wait();
                waited = true;
            }
            std::thread::sleep(self.interval);
        }
    }
}

impl VolumeSource for PollingVolumes {
    fn wait_for(&self, path: &Path) -> ControlFlow<()> {
        self.poll(&mut || path.is_file(), || {
            tracing::info!(volume = %path.display(), "Waiting for volume");
        })
    }

    fn wait_until(&self, ready: &mut dyn FnMut() -> bool) -> ControlFlow<()> {
        self.poll(ready, || tracing::debug!("Waiting for unpack"))
    }
}
