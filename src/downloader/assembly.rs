//! Per-file part collection and atomic commit to disk.

use std::path::{Path, PathBuf};

use super::worker::{FetchResult, PartOutcome};
use crate::error::{Error, FetchError, Result};
use crate::manifest::RemoteFile;

/// Suffix of the temporary sibling a file is written to before the rename
const PARTIAL_SUFFIX: &str = ".partial";

/// Cross-platform positional file write.
///
/// Writes `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(unix)]
fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Cross-platform positional file write.
#[cfg(windows)]
fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        written += n;
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

/// A decoded piece ready to be written
#[derive(Debug)]
struct Piece {
    offset: u64,
    data: Vec<u8>,
}

/// Collects the results for one file, keyed by part index
#[derive(Debug)]
pub(crate) struct FileAssembly {
    pub(crate) file_index: usize,
    pub(crate) name: String,
    path: PathBuf,
    slots: Vec<Option<std::result::Result<Piece, FetchError>>>,
    received: usize,
    declared_size: Option<u64>,
}

impl FileAssembly {
    pub(crate) fn new(file_index: usize, file: &RemoteFile) -> Self {
        Self {
            file_index,
            name: file.name.clone(),
            path: file.path.clone(),
            slots: (0..file.parts.len()).map(|_| None).collect(),
            received: 0,
            declared_size: None,
        }
    }

    /// Store the outcome of one part. Returns `false` for outcomes that do not
    /// belong to this file or repeat a part already recorded.
    pub(crate) fn record(&mut self, outcome: PartOutcome) -> bool {
        if outcome.file_index != self.file_index {
            return false;
        }
        let Some(slot) = (outcome.part_index as usize)
            .checked_sub(1)
            .and_then(|i| self.slots.get_mut(i))
        else {
            tracing::warn!(file = %self.name, part = outcome.part_index, "Result for unknown part ignored");
            return false;
        };
        if slot.is_some() {
            return false;
        }

        *slot = Some(outcome.result.map(|result| {
            if let Some(size) = result.file_size {
                self.declared_size = Some(size);
            }
            piece_from(result, &self.name)
        }));
        self.received += 1;
        true
    }

    /// Every part has a result, successful or not
    pub(crate) fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    pub(crate) fn failed_count(&self) -> u32 {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Some(Err(_))))
            .count() as u32
    }

    pub(crate) fn first_error(&self) -> Option<String> {
        self.slots.iter().find_map(|slot| match slot {
            Some(Err(e)) => Some(e.to_string()),
            _ => None,
        })
    }

    /// Size declared by the articles, if any of them carried one
    pub(crate) fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    /// Write every part to a temporary sibling and rename it into place.
    /// Returns the size of the written file.
    pub(crate) async fn commit(self) -> Result<u64> {
        if !self.is_complete() || self.failed_count() > 0 {
            return Err(Error::Other(format!(
                "{} is not ready to be written",
                self.name
            )));
        }

        let pieces: Vec<Piece> = self.slots.into_iter().flatten().flatten().collect();
        let path = self.path;
        let declared_size = self.declared_size;

        tokio::task::spawn_blocking(move || write_file(&path, &pieces, declared_size))
            .await
            .map_err(|e| Error::Other(format!("Write task panicked: {}", e)))?
    }
}

fn piece_from(result: FetchResult, expected_name: &str) -> Piece {
    if !result.file_name.eq_ignore_ascii_case(expected_name) {
        // Obfuscated posts often carry a random name; the manifest name wins
        tracing::debug!(
            file = %expected_name,
            article_name = %result.file_name,
            part = result.part_index,
            "Article name differs from manifest name"
        );
    }
    Piece {
        offset: result.offset,
        data: result.data,
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

/// Write `pieces` (in part order) and atomically rename the result to `path`
fn write_file(path: &Path, pieces: &[Piece], declared_size: Option<u64>) -> Result<u64> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp = partial_path(path);
    let result = write_pieces(&temp, pieces, declared_size)
        .and_then(|size| std::fs::rename(&temp, path).map(|()| size).map_err(Error::Io));
    if result.is_err()
        && let Err(e) = std::fs::remove_file(&temp)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %temp.display(), error = %e, "Failed to remove partial file");
    }
    result
}

fn write_pieces(temp: &Path, pieces: &[Piece], declared_size: Option<u64>) -> Result<u64> {
    let file = std::fs::File::create(temp)?;

    let mut end = 0u64;
    for (i, piece) in pieces.iter().enumerate() {
        // Parts without a =ypart line all claim offset 0; place them back to back
        let offset = if piece.offset == 0 && i > 0 {
            end
        } else {
            piece.offset
        };
        write_all_at(&file, &piece.data, offset).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to write at offset {}: {}", offset, e),
            ))
        })?;
        end = end.max(offset + piece.data.len() as u64);
    }

    if let Some(size) = declared_size
        && size != end
    {
        return Err(Error::Other(format!(
            "Articles cover {} bytes but the file declares {}",
            end, size
        )));
    }
    file.sync_all()?;
    Ok(end)
}
