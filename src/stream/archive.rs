//! Seekable stream over the first entry of a (possibly still downloading) archive.

use std::io::{self, Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::aborted;
use super::reader::{
    ArchiveReader, ChunkOrEnd, ChunkSink, ExtractOutcome, PollingVolumes, RarReader,
};
use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::types::ArchiveEntry;

type QueueItem = io::Result<ChunkOrEnd>;

/// Forwards extracted chunks into the bounded queue
struct QueueSink<'a> {
    tx: &'a SyncSender<QueueItem>,
    cancel: &'a CancellationToken,
}

impl ChunkSink for QueueSink<'_> {
    fn push(&mut self, chunk: &[u8]) -> ControlFlow<()> {
        if self.cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        match self.tx.send(Ok(ChunkOrEnd::Chunk(chunk.to_vec()))) {
            Ok(()) => ControlFlow::Continue(()),
            // Reader side is gone
            Err(_) => ControlFlow::Break(()),
        }
    }
}

/// The background extraction thread and its end of the queue
struct Worker {
    rx: Receiver<QueueItem>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        self.cancel.cancel();
        // Free any slot the thread may be blocked on, then hang up
        loop {
            match self.rx.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        drop(self.rx);
        if self.handle.join().is_err() {
            warn!("Extraction worker panicked");
        }
    }
}

/// Single-reader, seekable byte stream over the exposed entry of an archive
///
/// A background thread extracts the entry through an [`ArchiveReader`] and
/// feeds a bounded queue of chunks. Reads block until enough bytes have been
/// produced, which includes waiting for volumes that are still downloading.
///
/// Seeking forward reads and discards. Seeking backward stops the thread and
/// extracts again from byte 0, because extraction cannot resume mid-entry.
pub struct ArchiveStream {
    path: PathBuf,
    reader: Arc<dyn ArchiveReader>,
    entry: ArchiveEntry,
    queue_depth: usize,
    poll_interval: Duration,
    shutdown: CancellationToken,
    worker: Option<Worker>,
    chunk: Vec<u8>,
    chunk_offset: usize,
    position: u64,
    eof: bool,
    deferred_error: Option<io::Error>,
    restarts: u64,
}

impl ArchiveStream {
    /// List the entry of the archive starting at `path` and begin extracting it
    pub fn open(
        path: impl Into<PathBuf>,
        reader: Arc<dyn ArchiveReader>,
        config: &StreamConfig,
    ) -> Result<Self> {
        let path = path.into();
        let entry = reader.list(&path)?;
        info!(archive = %path.display(), entry = %entry.name, size = entry.size, "Opened archive stream");

        let mut stream = Self {
            path,
            reader,
            entry,
            queue_depth: config.queue_depth.max(1),
            poll_interval: config.volume_poll_interval,
            shutdown: CancellationToken::new(),
            worker: None,
            chunk: Vec::new(),
            chunk_offset: 0,
            position: 0,
            eof: false,
            deferred_error: None,
            restarts: 0,
        };
        stream.worker = Some(stream.spawn_worker().map_err(|e| Error::ArchiveUnavailable {
            path: stream.path.clone(),
            reason: format!("failed to start extraction: {}", e),
        })?);
        Ok(stream)
    }

    /// [`open`](Self::open) with the built-in RAR reader
    pub fn open_rar(path: impl Into<PathBuf>, config: &StreamConfig) -> Result<Self> {
        Self::open(path, Arc::new(RarReader::new(config.chunk_size)), config)
    }

    /// The exposed entry
    pub fn entry(&self) -> &ArchiveEntry {
        &self.entry
    }

    /// Path of the first volume
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current logical read position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// How many times extraction restarted from byte 0
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Token that aborts blocked reads from another thread
    ///
    /// Once cancelled, reads fail with [`io::ErrorKind::ConnectionAborted`].
    pub fn abort_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop and join the extraction worker and let the reader free its state
    pub fn close(&mut self) {
        self.shutdown.cancel();
        self.chunk.clear();
        self.chunk_offset = 0;
        if let Some(worker) = self.worker.take() {
            worker.stop();
            debug!(archive = %self.path.display(), "Closed archive stream");
        }
        self.reader.release();
    }

    fn spawn_worker(&self) -> io::Result<Worker> {
        let (tx, rx) = mpsc::sync_channel(self.queue_depth);
        let cancel = self.shutdown.child_token();
        let reader = Arc::clone(&self.reader);
        let path = self.path.clone();
        let volumes = PollingVolumes::new(self.poll_interval, cancel.clone());
        let thread_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("archive-extract".to_string())
            .spawn(move || {
                let mut sink = QueueSink {
                    tx: &tx,
                    cancel: &thread_cancel,
                };
                let last = match reader.extract(&path, &mut sink, &volumes) {
                    Ok(ExtractOutcome::Finished) => Ok(ChunkOrEnd::End),
                    Ok(ExtractOutcome::Aborted) => return,
                    Err(e) => {
                        warn!(archive = %path.display(), error = %e, "Extraction failed");
                        Err(e)
                    }
                };
                // Fails only when the reader already hung up
                let _ = tx.send(last);
            })?;

        Ok(Worker { rx, cancel, handle })
    }

    fn restart(&mut self) -> io::Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
        self.chunk.clear();
        self.chunk_offset = 0;
        self.position = 0;
        self.eof = false;
        self.deferred_error = None;
        self.restarts += 1;
        debug!(archive = %self.path.display(), restarts = self.restarts, "Restarting extraction");
        self.worker = Some(self.spawn_worker()?);
        Ok(())
    }

    /// Make sure unread bytes are buffered; `false` at end of stream
    fn fill(&mut self) -> io::Result<bool> {
        while self.chunk_offset >= self.chunk.len() {
            if self.shutdown.is_cancelled() {
                return Err(aborted("archive stream closed"));
            }
            if self.eof {
                return Ok(false);
            }
            if let Some(e) = self.deferred_error.take() {
                return Err(e);
            }
            if self.worker.is_none() {
                self.worker = Some(self.spawn_worker()?);
            }
            let Some(worker) = self.worker.as_ref() else {
                return Ok(false);
            };

            match worker.rx.recv() {
                Ok(Ok(ChunkOrEnd::Chunk(data))) => {
                    self.chunk = data;
                    self.chunk_offset = 0;
                }
                Ok(Ok(ChunkOrEnd::End)) => self.eof = true,
                Ok(Err(e)) => return Err(e),
                Err(_) if self.shutdown.is_cancelled() => {
                    return Err(aborted("archive stream closed"));
                }
                Err(_) => {
                    return Err(io::Error::other(
                        "extraction worker exited before the end of the entry",
                    ));
                }
            }
        }
        Ok(true)
    }

    fn discard(&mut self, mut count: u64) -> io::Result<()> {
        while count > 0 && self.fill()? {
            let take = count.min((self.chunk.len() - self.chunk_offset) as u64);
            self.chunk_offset += take as usize;
            self.position += take;
            count -= take;
        }
        Ok(())
    }
}

impl Read for ArchiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.fill() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if filled == 0 => return Err(e),
                Err(e) => {
                    self.deferred_error = Some(e);
                    break;
                }
            }
            let available = &self.chunk[self.chunk_offset..];
            let n = available.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&available[..n]);
            self.chunk_offset += n;
            filled += n;
        }
        self.position += filled as u64;
        Ok(filled)
    }
}

impl Seek for ArchiveStream {
    /// Seek to `pos`, returning the position actually reached
    ///
    /// Seeking past the end stops at the end of the entry.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.entry.size as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the entry",
            ));
        }
        let target = target.min(u64::MAX as i128) as u64;

        if target < self.position {
            self.restart()?;
        }
        self.discard(target - self.position)?;
        Ok(self.position)
    }
}

impl Drop for ArchiveStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ArchiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStream")
            .field("path", &self.path)
            .field("entry", &self.entry)
            .field("position", &self.position)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}
