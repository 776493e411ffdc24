//! Route handlers for the HTTP surface
//!
//! Handlers are organized by domain:
//! - [`media`]: the byte endpoints serving the archive entry or video file
//! - [`system`]: status and shutdown

use crate::types::ArchiveEntry;
use serde::{Deserialize, Serialize};

mod media;
mod system;

pub use media::*;
pub use system::*;

/// Response for GET / and GET /status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Job name
    pub job: String,
    /// Files in the manifest
    pub files_total: u64,
    /// Files written or already complete on disk
    pub files_completed: u64,
    /// Files that failed
    pub files_failed: u64,
    /// Parts fetched so far
    pub parts_downloaded: u64,
    /// Whether the byte endpoints can serve something
    pub ready: bool,
    /// The exposed archive entry, once known
    pub entry: Option<ArchiveEntry>,
}

/// A parsed `Range` request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// No usable range; serve everything
    Full,
    /// Inclusive byte range
    Partial {
        /// First byte
        start: u64,
        /// Last byte, inclusive
        end: u64,
    },
    /// The range lies outside the resource
    Unsatisfiable,
}

impl ByteRange {
    /// Parse a single-range `Range` header against a resource of `size` bytes
    ///
    /// Malformed headers (a last byte before the first included) and
    /// multi-range requests are ignored and yield [`ByteRange::Full`].
    pub fn parse(header: Option<&str>, size: u64) -> Self {
        let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
            return ByteRange::Full;
        };
        if spec.contains(',') {
            return ByteRange::Full;
        }
        let Some((first, last)) = spec.split_once('-') else {
            return ByteRange::Full;
        };
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            // Suffix range: the last n bytes
            let Ok(n) = last.parse::<u64>() else {
                return ByteRange::Full;
            };
            if n == 0 || size == 0 {
                return ByteRange::Unsatisfiable;
            }
            return ByteRange::Partial {
                start: size.saturating_sub(n),
                end: size - 1,
            };
        }

        let Ok(start) = first.parse::<u64>() else {
            return ByteRange::Full;
        };
        let end = if last.is_empty() {
            u64::MAX
        } else {
            match last.parse::<u64>() {
                // A last byte before the first makes the header invalid, not unsatisfiable
                Ok(end) if end >= start => end,
                _ => return ByteRange::Full,
            }
        };
        if start >= size {
            return ByteRange::Unsatisfiable;
        }
        ByteRange::Partial {
            start,
            end: end.min(size - 1),
        }
    }
}
