//! Seekable view over a file the scheduler is still writing.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::aborted;
use crate::config::StreamConfig;

/// Blocking, seekable reader over a file that may not be on disk yet
///
/// Reads and seeks poll the file size until enough bytes exist, never waiting
/// for bytes past the declared size. Seeks that land past the bytes on disk
/// but close to the declared end (players probing for an index) become a
/// single virtual read that reports end of file instead of blocking.
#[derive(Debug)]
pub struct BlockingFileView {
    path: PathBuf,
    declared_size: u64,
    file: Option<File>,
    position: u64,
    virtual_read: bool,
    poll_interval: Duration,
    threshold: u64,
    cancel: Option<CancellationToken>,
}

impl BlockingFileView {
    /// View over `path`, which will hold `declared_size` bytes once complete
    pub fn new(path: impl Into<PathBuf>, declared_size: u64, config: &StreamConfig) -> Self {
        Self {
            path: path.into(),
            declared_size,
            file: None,
            position: 0,
            virtual_read: false,
            poll_interval: config.file_poll_interval,
            threshold: config.virtual_read_threshold,
            cancel: None,
        }
    }

    /// Abort blocked waits when `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// File being viewed
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size the file will have once complete
    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    /// Current read position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes currently on disk; a missing file has none
    fn disk_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn wait_until(&self, size: u64) -> io::Result<()> {
        let mut logged = false;
        loop {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(aborted("file view closed"));
            }
            if self.disk_size() >= size {
                return Ok(());
            }
            if !logged {
                debug!(file = %self.path.display(), wanted = size, "Waiting for file to grow");
                logged = true;
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => File::open(&self.path)?,
        };
        Ok(self.file.insert(file))
    }
}

impl Read for BlockingFileView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.virtual_read {
            self.virtual_read = false;
            return Ok(0);
        }
        if buf.is_empty() || self.position >= self.declared_size {
            return Ok(0);
        }

        let want = (buf.len() as u64).min(self.declared_size - self.position);
        self.wait_until(self.position + want)?;

        let position = self.position;
        let file = self.file()?;
        file.seek(SeekFrom::Start(position))?;
        let n = file.read(&mut buf[..want as usize])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for BlockingFileView {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.declared_size as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the file",
            ));
        }
        let target = target.min(u64::MAX as i128) as u64;

        if target > self.disk_size() && self.declared_size.saturating_sub(target) <= self.threshold
        {
            debug!(file = %self.path.display(), target, "Seek near the end, answering with a virtual read");
            self.virtual_read = true;
            self.position = target;
            return Ok(target);
        }

        self.virtual_read = false;
        self.wait_until(target.min(self.declared_size))?;
        self.position = target;
        Ok(target)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn config() -> StreamConfig {
        StreamConfig {
            file_poll_interval: Duration::from_millis(10),
            virtual_read_threshold: 100,
            ..StreamConfig::default()
        }
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    /// Write `bytes` to `path` after `delay`, renaming into place
    fn write_later(path: PathBuf, bytes: Vec<u8>, delay: Duration) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let partial = path.with_extension("partial");
            std::fs::write(&partial, bytes).unwrap();
            std::fs::rename(partial, path).unwrap();
        })
    }

    #[test]
    fn reads_a_complete_file_up_to_the_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.mkv");
        let content = data(1_000);
        std::fs::write(&path, &content).unwrap();

        let mut view = BlockingFileView::new(&path, 1_000, &config());
        let mut out = Vec::new();
        view.read_to_end(&mut out).unwrap();

        assert_eq!(out, content);
        assert_eq!(view.read(&mut [0u8; 8]).unwrap(), 0);
    }

    #[test]
    fn read_blocks_until_the_file_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.mkv");
        let content = data(500);
        let writer = write_later(path.clone(), content.clone(), Duration::from_millis(100));

        let started = Instant::now();
        let mut view = BlockingFileView::new(&path, 500, &config());
        let mut out = vec![0u8; 200];
        view.read_exact(&mut out).unwrap();

        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(out, &content[..200]);
        writer.join().unwrap();
    }

    #[test]
    fn seek_near_the_end_is_a_single_virtual_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.mkv");
        let content = data(1_000);

        let mut view = BlockingFileView::new(&path, 1_000, &config());
        assert_eq!(view.seek(SeekFrom::End(-50)).unwrap(), 950);
        assert_eq!(view.read(&mut [0u8; 16]).unwrap(), 0);

        // The next read waits for real bytes
        let writer = write_later(path.clone(), content.clone(), Duration::from_millis(50));
        let mut tail = [0u8; 50];
        view.read_exact(&mut tail).unwrap();
        assert_eq!(&tail[..], &content[950..]);
        writer.join().unwrap();
    }

    #[test]
    fn seek_far_from_the_end_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.mkv");
        let content = data(1_000);
        let writer = write_later(path.clone(), content.clone(), Duration::from_millis(100));

        let started = Instant::now();
        let mut view = BlockingFileView::new(&path, 1_000, &config());
        assert_eq!(view.seek(SeekFrom::Start(300)).unwrap(), 300);
        assert!(started.elapsed() >= Duration::from_millis(80));

        let mut buf = [0u8; 10];
        view.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &content[300..310]);
        writer.join().unwrap();
    }

    #[test]
    fn cancellation_aborts_waits() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut view = BlockingFileView::new(dir.path().join("never.mkv"), 1_000, &config())
            .with_cancellation(cancel.clone());

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });

        let err = view.read(&mut [0u8; 10]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        canceller.join().unwrap();
    }

    #[test]
    fn negative_seek_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut view = BlockingFileView::new(dir.path().join("v.mkv"), 10, &config());
        let err = view.seek(SeekFrom::Current(-1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
