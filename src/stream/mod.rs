//! Streaming readers over job output.
//!
//! - [`ArchiveStream`]: the first entry of a multi-volume RAR archive, readable
//!   while later volumes are still downloading
//! - [`BlockingFileView`]: a plain file that the scheduler has not finished yet
//!
//! Both are blocking [`std::io::Read`] + [`std::io::Seek`] implementations; the
//! HTTP layer drives them from `spawn_blocking`.

mod archive;
mod compressed;
mod file_view;
pub(crate) mod rar;
mod reader;

pub use archive::ArchiveStream;
pub use file_view::BlockingFileView;
pub use rar::next_volume_name;
pub use reader::{
    ArchiveReader, ChunkOrEnd, ChunkSink, ExtractOutcome, PollingVolumes, RarReader, VolumeSource,
};

/// Error returned by reads whose wait was cancelled
pub(crate) fn aborted(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::ConnectionAborted, message.to_string())
}
