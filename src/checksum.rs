//! SFV checksum manifests
//!
//! An SFV file lists one `<filename> <crc32-hex>` pair per line; lines starting
//! with `;` are comments. The scheduler uses it before downloading to decide
//! which files already on disk are complete.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Expected checksums keyed by lowercase file name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: HashMap<String, String>,
}

impl ChecksumManifest {
    /// Parse SFV content. Malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            // File names may contain spaces; the checksum is the last token
            let Some((name, checksum)) = line.rsplit_once(char::is_whitespace) else {
                continue;
            };
            let name = name.trim();
            let checksum = checksum.trim();
            if name.is_empty() || checksum.is_empty() {
                continue;
            }
            entries.insert(name.to_lowercase(), checksum.to_lowercase());
        }
        Self { entries }
    }

    /// Read and parse an SFV file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::parse(&String::from_utf8_lossy(&bytes)))
    }

    /// Expected checksum for `name` (case-insensitive), lowercase hex
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Add every entry of `other`, replacing entries for the same name
    pub fn merge(&mut self, other: ChecksumManifest) {
        self.entries.extend(other.entries);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// CRC32 of a file as eight lowercase hex digits
pub fn file_crc32(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:08x}", hasher.finalize()))
}

/// Recompute the CRC32 of `path` and compare it to `expected`, ignoring case
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let actual = file_crc32(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            expected: expected.to_lowercase(),
            actual,
        })
    }
}
