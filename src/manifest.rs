//! NZB manifest loading
//!
//! A manifest lists the remote files of one job and, for each file, the
//! ordered articles ("parts") it was posted as. Parsing is delegated to
//! `nntp-rs`; this module turns the result into [`RemoteFile`]s with resolved
//! names and destination paths.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timeout for HTTP requests when fetching NZB files from URLs
const NZB_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// One article of a remote file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    /// 1-based position within the owning file
    pub index: u32,
    /// Message-ID without angle brackets
    pub message_id: String,
    /// Encoded size announced by the manifest
    pub bytes: u64,
}

/// One file of the job
#[derive(Clone, Debug)]
pub struct RemoteFile {
    /// File name, taken from the first quoted token of the subject
    pub name: String,
    /// Original subject line
    pub subject: String,
    /// Parts ordered by index, numbered 1..=K
    pub parts: Vec<Part>,
    /// Final path on disk
    pub path: PathBuf,
    /// Expected CRC32 from the checksum manifest, filled in once by the scheduler
    pub checksum: Option<String>,
}

impl RemoteFile {
    /// Number of parts
    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    /// Sum of the announced part sizes
    pub fn encoded_size(&self) -> u64 {
        self.parts.iter().map(|p| p.bytes).sum()
    }
}

/// A parsed job
#[derive(Clone, Debug)]
pub struct Manifest {
    /// Job name, used as the name of the job directory
    pub name: String,
    /// `<meta type="title">` if present
    pub title: Option<String>,
    /// Directory the job's files are written to
    pub job_dir: PathBuf,
    /// Files in manifest order
    pub files: Vec<RemoteFile>,
}

impl Manifest {
    /// Parse NZB content for a job called `job_name`, placing its files under
    /// `destination_root/<job_name>/`.
    pub fn parse(content: &str, job_name: &str, destination_root: &Path) -> Result<Self> {
        let nzb = nntp_rs::parse_nzb(content)
            .map_err(|e| Error::InvalidManifest(format!("failed to parse NZB: {}", e)))?;

        nzb.validate()
            .map_err(|e| Error::InvalidManifest(format!("NZB validation failed: {}", e)))?;

        if nzb.files.is_empty() {
            return Err(Error::InvalidManifest("NZB contains no files".to_string()));
        }

        let job_name = safe_file_name(job_name).unwrap_or_else(|| "download".to_string());
        let job_dir = destination_root.join(&job_name);
        let mut files = Vec::with_capacity(nzb.files.len());

        for file in &nzb.files {
            let name = parse_filename_from_subject(&file.subject);
            if file.segments.is_empty() {
                return Err(Error::InvalidManifest(format!("{name} has no segments")));
            }

            let mut segments: Vec<_> = file.segments.iter().collect();
            segments.sort_by_key(|segment| segment.number as u32);

            let parts = segments
                .into_iter()
                .enumerate()
                .map(|(i, segment)| Part {
                    index: i as u32 + 1,
                    message_id: strip_angle_brackets(&segment.message_id).to_string(),
                    bytes: segment.bytes as u64,
                })
                .collect();

            files.push(RemoteFile {
                path: job_dir.join(&name),
                name,
                subject: file.subject.clone(),
                parts,
                checksum: None,
            });
        }

        Ok(Manifest {
            name: job_name,
            title: nzb.meta.get("title").map(|s| s.to_string()),
            job_dir,
            files,
        })
    }

    /// Load an NZB file from disk; the job is named after the file without `.nzb`
    pub fn load(path: &Path, destination_root: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let content = String::from_utf8(bytes)
            .map_err(|e| Error::InvalidManifest(format!("NZB is not valid UTF-8: {}", e)))?;

        let job_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("download");

        tracing::info!(path = %path.display(), job = job_name, "Loading NZB");
        Self::parse(&content, job_name, destination_root)
    }

    /// Download an NZB over HTTP
    ///
    /// The job name comes from the `Content-Disposition` filename when the
    /// server sends one, else from the last path segment of the URL.
    pub async fn fetch(url: &str, destination_root: &Path) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(NZB_FETCH_TIMEOUT)
            .build()?;

        let response = client.get(url).send().await?.error_for_status()?;
        let job_name = extract_job_name(&response, url);
        let content = response.text().await?;

        tracing::info!(url = url, job = %job_name, "Fetched NZB");
        Self::parse(&content, &job_name, destination_root)
    }

    /// Find a file by name, ignoring case
    pub fn file(&self, name: &str) -> Option<&RemoteFile> {
        self.files.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Sum of the announced part sizes over all files
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(RemoteFile::encoded_size).sum()
    }
}

/// Extract the file name from an NZB subject line
///
/// Subjects look like `[1/5] - "movie.part01.rar" yEnc (1/50)`. The first
/// quoted string is the name, reduced to its last path component. Subjects
/// without a usable one get a stable synthetic name.
pub(crate) fn parse_filename_from_subject(subject: &str) -> String {
    if let Some(start) = subject.find('"')
        && let Some(end) = subject[start + 1..].find('"')
    {
        let quoted = &subject[start + 1..start + 1 + end];
        if let Some(filename) = safe_file_name(quoted) {
            return filename;
        }
    }
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    subject.hash(&mut hasher);
    format!("file_{:x}", hasher.finish())
}

/// Last normal path component of `name`, so it cannot leave the job directory
fn safe_file_name(name: &str) -> Option<String> {
    let name = name.replace('\\', "/");
    Path::new(&name)
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .next_back()
        .map(str::to_string)
}

fn strip_angle_brackets(message_id: &str) -> &str {
    message_id
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(message_id)
}

/// Job name from a `Content-Disposition` header, falling back to the URL
fn extract_job_name(response: &reqwest::Response, url: &str) -> String {
    let header = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok());

    header
        .and_then(filename_from_content_disposition)
        .or_else(|| filename_from_url(url))
        .unwrap_or_else(|| "download".to_string())
}

fn filename_from_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(filename) = part.strip_prefix("filename*=") {
            // RFC 5987: charset'lang'percent-encoded
            let encoded = filename.rsplit('\'').next()?;
            let decoded = urlencoding::decode(encoded).ok()?;
            return Some(file_stem(decoded.as_ref()));
        }
        if let Some(filename) = part.strip_prefix("filename=") {
            let filename = filename.trim_matches('"');
            if !filename.is_empty() {
                return Some(file_stem(filename));
            }
        }
    }
    None
}

fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).ok()?;
    Some(file_stem(decoded.as_ref()))
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| name.to_string())
}
