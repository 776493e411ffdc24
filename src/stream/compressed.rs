//! Compressed entries, extracted with `unrar`.
//!
//! `unrar` needs every volume present before it can decompress, so the whole
//! chain is waited for first. The entry is then unpacked once, on its own
//! thread, into a hidden file next to the archive. Each extraction of the
//! stream (the first one and every restart) only pushes that file out chunk by
//! chunk. The unpacked copy lives as long as the [`Unpacked`] slot holding it.

use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::rar::{self, next_volume_name};
use super::reader::{ChunkSink, ExtractOutcome, VolumeSource};
use crate::types::ArchiveEntry;

static NEXT_UNPACK: AtomicU64 = AtomicU64::new(0);

fn unrar_error(e: unrar::error::UnrarError) -> io::Error {
    io::Error::other(format!("unrar: {}", e))
}

fn is_safe(name: &Path) -> bool {
    name.components()
        .any(|c| matches!(c, std::path::Component::Normal(_)))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_scratch(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove unpacked entry");
    }
}

/// First non-directory entry of the archive
pub(crate) fn list(path: &Path) -> io::Result<ArchiveEntry> {
    let listing = unrar::Archive::new(path)
        .open_for_listing()
        .map_err(unrar_error)?;

    for header in listing {
        let header = header.map_err(unrar_error)?;
        if header.is_directory() || !is_safe(&header.filename) {
            continue;
        }
        let name = header
            .filename
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(ArchiveEntry {
            name,
            size: header.unpacked_size,
        });
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "archive has no file entry",
    ))
}

/// Wait for every volume of the set that starts at `first`
fn wait_for_chain(first: &Path, volumes: &dyn VolumeSource) -> io::Result<ControlFlow<()>> {
    let mut path = first.to_path_buf();
    loop {
        if volumes.wait_for(&path).is_break() {
            return Ok(ControlFlow::Break(()));
        }
        let mut file = std::fs::File::open(&path)?;
        let segment = rar::read_volume(&mut file)?.entry;
        if !segment.continues {
            return Ok(ControlFlow::Continue(()));
        }
        path = next_volume_name(&path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("cannot name the volume after {}", path.display()),
            )
        })?;
    }
}

/// Removes a partly unpacked file unless kept
struct Scratch(Option<PathBuf>);

impl Scratch {
    fn path(&self) -> &Path {
        self.0.as_deref().unwrap_or_else(|| Path::new(""))
    }

    fn keep(mut self) -> PathBuf {
        self.0.take().unwrap_or_default()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            remove_scratch(&path);
        }
    }
}

/// Unpack the first file entry of the archive at `first` next to it
fn unpack_entry(first: &Path) -> io::Result<PathBuf> {
    let dir = first.parent().unwrap_or_else(|| Path::new("."));
    let mut cursor = unrar::Archive::new(first)
        .open_for_processing()
        .map_err(unrar_error)?;

    loop {
        let Some(entry) = cursor.read_header().map_err(unrar_error)? else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "archive has no file entry",
            ));
        };
        let header = entry.entry();
        if header.is_directory() || !is_safe(&header.filename) {
            cursor = entry.skip().map_err(unrar_error)?;
            continue;
        }

        let name = header
            .filename
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = NEXT_UNPACK.fetch_add(1, Ordering::Relaxed);
        let scratch = Scratch(Some(dir.join(format!(".{}.{}.unpacked", name, id))));
        tracing::info!(entry = %name, "Unpacking compressed entry");
        entry.extract_to(scratch.path()).map_err(unrar_error)?;
        tracing::info!(entry = %name, "Unpacked compressed entry");
        return Ok(scratch.keep());
    }
}

#[derive(Debug)]
enum UnpackState {
    Running,
    Ready(PathBuf),
    Failed(io::ErrorKind, String),
    /// Nobody wants the result any more; the unpack thread removes it
    Abandoned,
}

/// One unpack of the archive starting at `first`
///
/// `unrar` cannot be interrupted, so the unpack runs on its own thread and
/// extractions wait for it through their [`VolumeSource`], which they can
/// abort. The unpacked file is removed when the last handle goes away, or by
/// the unpack thread when it finishes after that.
#[derive(Debug)]
struct Unpack {
    first: PathBuf,
    state: Arc<Mutex<UnpackState>>,
}

impl Unpack {
    fn start(first: &Path) -> io::Result<Self> {
        let state = Arc::new(Mutex::new(UnpackState::Running));
        let shared = Arc::clone(&state);
        let path = first.to_path_buf();

        std::thread::Builder::new()
            .name("archive-unpack".to_string())
            .spawn(move || {
                let result = unpack_entry(&path);
                let mut state = lock(&shared);
                let abandoned = matches!(*state, UnpackState::Abandoned);
                match result {
                    Ok(unpacked) if abandoned => remove_scratch(&unpacked),
                    Err(_) if abandoned => {}
                    Ok(unpacked) => *state = UnpackState::Ready(unpacked),
                    Err(e) => {
                        tracing::warn!(archive = %path.display(), error = %e, "Unpacking failed");
                        *state = UnpackState::Failed(e.kind(), e.to_string());
                    }
                }
            })?;

        Ok(Self {
            first: first.to_path_buf(),
            state,
        })
    }

    fn is_running(&self) -> bool {
        matches!(*lock(&self.state), UnpackState::Running)
    }

    fn is_failed(&self) -> bool {
        matches!(*lock(&self.state), UnpackState::Failed(..))
    }

    /// The unpacked file, once the unpack has ended
    fn result(&self) -> io::Result<PathBuf> {
        match &*lock(&self.state) {
            UnpackState::Ready(path) => Ok(path.clone()),
            UnpackState::Failed(kind, message) => Err(io::Error::new(*kind, message.clone())),
            UnpackState::Running | UnpackState::Abandoned => {
                Err(io::Error::other("entry is not unpacked"))
            }
        }
    }
}

impl Drop for Unpack {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        match std::mem::replace(&mut *state, UnpackState::Abandoned) {
            UnpackState::Ready(path) => remove_scratch(&path),
            UnpackState::Running | UnpackState::Failed(..) | UnpackState::Abandoned => {}
        }
    }
}

/// The unpacked copy of a compressed entry, kept across restarts of one stream
#[derive(Debug, Default)]
pub(crate) struct Unpacked(Mutex<Option<Arc<Unpack>>>);

impl Unpacked {
    /// The unpack of `first` that is running or done, if it has not failed
    fn current(&self, first: &Path) -> Option<Arc<Unpack>> {
        lock(&self.0)
            .as_ref()
            .filter(|unpack| unpack.first == first && !unpack.is_failed())
            .map(Arc::clone)
    }

    fn get_or_start(&self, first: &Path) -> io::Result<Arc<Unpack>> {
        let mut slot = lock(&self.0);
        if let Some(unpack) = slot
            .as_ref()
            .filter(|unpack| unpack.first == first && !unpack.is_failed())
        {
            return Ok(Arc::clone(unpack));
        }
        let unpack = Arc::new(Unpack::start(first)?);
        *slot = Some(Arc::clone(&unpack));
        Ok(unpack)
    }

    /// Give up the unpacked copy
    pub(crate) fn release(&self) {
        lock(&self.0).take();
    }
}

pub(crate) fn extract(
    first: &Path,
    chunk_size: usize,
    sink: &mut dyn ChunkSink,
    volumes: &dyn VolumeSource,
    unpacked: &Unpacked,
) -> io::Result<ExtractOutcome> {
    let unpack = match unpacked.current(first) {
        Some(unpack) => unpack,
        None => {
            if wait_for_chain(first, volumes)?.is_break() {
                return Ok(ExtractOutcome::Aborted);
            }
            unpacked.get_or_start(first)?
        }
    };

    if volumes.wait_until(&mut || !unpack.is_running()).is_break() {
        return Ok(ExtractOutcome::Aborted);
    }

    let mut file = std::fs::File::open(unpack.result()?)?;
    let mut buffer = vec![0u8; chunk_size.max(1)];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            return Ok(ExtractOutcome::Finished);
        }
        if sink.push(&buffer[..n]).is_break() {
            return Ok(ExtractOutcome::Aborted);
        }
    }
}
