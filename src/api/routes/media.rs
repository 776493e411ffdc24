//! Byte endpoints: the archive entry (or legacy video file) as a download or for playback.

use super::ByteRange;
use crate::api::state::{AppState, MediaSource};
use crate::error::{Error, Result};
use crate::stream::BlockingFileView;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{
            ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
            RANGE,
        },
    },
    response::{IntoResponse, Response},
};
use std::io::{self, Read, Seek, SeekFrom};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Chunks buffered between the blocking reader and the response body
const BODY_BUFFER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Attachment,
    Inline,
}

/// GET /download - The exposed entry as an attachment
pub async fn download(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    serve(state, headers, Disposition::Attachment).await
}

/// GET /video - The exposed entry for inline playback
pub async fn video(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    serve(state, headers, Disposition::Inline).await
}

/// 503 answered while nothing can be served yet
pub fn not_ready() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Not ready!").into_response()
}

/// Content type for playback, from the entry's extension
pub fn video_content_type(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mkv" => "video/x-matroska",
        "mp4" | "m4v" => "video/mp4",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

async fn serve(state: AppState, headers: HeaderMap, disposition: Disposition) -> Result<Response> {
    let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
    let chunk_size = state.config.stream.chunk_size;

    match state.source.as_ref() {
        MediaSource::Archive(_) => {
            let entry = match state.prepare_archive().await {
                Ok(entry) => entry,
                Err(Error::NotReady(reason)) => {
                    debug!(reason = %reason, "Archive not ready");
                    return Ok(not_ready());
                }
                Err(e) => return Err(e),
            };
            let (start, len, response) =
                match head(&entry.name, entry.size, ByteRange::parse(range, entry.size), disposition)
                {
                    Ok(head) => head,
                    Err(response) => return Ok(response),
                };

            let guard = state.lock_stream().await;
            let (tx, body) = body_channel();
            if len > 0 {
                tokio::task::spawn_blocking(move || {
                    let mut guard = guard;
                    match guard.as_mut() {
                        Some(stream) => pump(stream, start, len, chunk_size, &tx),
                        None => {
                            let _ = tx.blocking_send(Err(io::Error::other("archive stream closed")));
                        }
                    }
                });
            }
            Ok(with_body(response, body))
        }
        MediaSource::File { name, path } => {
            let Some(size) = state.progress.declared_size(name) else {
                debug!(file = %name, "Declared size not known yet");
                return Ok(not_ready());
            };
            let (start, len, response) =
                match head(name, size, ByteRange::parse(range, size), disposition) {
                    Ok(head) => head,
                    Err(response) => return Ok(response),
                };

            let view = BlockingFileView::new(path, size, &state.config.stream)
                .with_cancellation(state.context.shutdown_token());
            let (tx, body) = body_channel();
            if len > 0 {
                tokio::task::spawn_blocking(move || {
                    let mut view = view;
                    pump(&mut view, start, len, chunk_size, &tx);
                });
            }
            Ok(with_body(response, body))
        }
        MediaSource::Nothing => Ok(not_ready()),
    }
}

/// Status and headers for a response over `size` bytes
///
/// Returns the first byte and length to send, or a finished 416 response.
fn head(
    name: &str,
    size: u64,
    range: ByteRange,
    disposition: Disposition,
) -> std::result::Result<(u64, u64, Response), Response> {
    let (status, start, end) = match range {
        ByteRange::Full => (StatusCode::OK, 0, size),
        ByteRange::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end + 1),
        ByteRange::Unsatisfiable => {
            return Err((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [
                    (CONTENT_RANGE, format!("bytes */{}", size)),
                    (ACCEPT_RANGES, "bytes".to_string()),
                ],
            )
                .into_response());
        }
    };
    let len = end - start;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    if status == StatusCode::PARTIAL_CONTENT
        && let Ok(value) = HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end - 1, size))
    {
        headers.insert(CONTENT_RANGE, value);
    }

    match disposition {
        Disposition::Attachment => {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-download"));
            let fallback: String = name
                .chars()
                .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
                .map(|c| if c == '"' || c == '\\' { '_' } else { c })
                .collect();
            let value = format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback,
                urlencoding::encode(name)
            );
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(CONTENT_DISPOSITION, value);
            }
        }
        Disposition::Inline => {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(video_content_type(name)));
        }
    }

    Ok((start, len, response))
}

fn body_channel() -> (mpsc::Sender<io::Result<Bytes>>, Body) {
    let (tx, rx) = mpsc::channel(BODY_BUFFER);
    (tx, Body::from_stream(ReceiverStream::new(rx)))
}

fn with_body(response: Response, body: Body) -> Response {
    let (parts, _) = response.into_parts();
    Response::from_parts(parts, body)
}

/// Copy `len` bytes starting at `start` from a blocking reader into the body channel
fn pump<R: Read + Seek>(
    reader: &mut R,
    start: u64,
    len: u64,
    chunk_size: usize,
    tx: &mpsc::Sender<io::Result<Bytes>>,
) {
    if let Err(e) = reader.seek(SeekFrom::Start(start)) {
        warn!(start, error = %e, "Seek failed");
        let _ = tx.blocking_send(Err(e));
        return;
    }

    let mut remaining = len;
    let mut buffer = vec![0u8; chunk_size.max(1)];
    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        match reader.read(&mut buffer[..want]) {
            Ok(0) => {
                warn!(remaining, "Source ended before the response was complete");
                let _ = tx.blocking_send(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source ended early",
                )));
                return;
            }
            Ok(n) => {
                remaining -= n as u64;
                if tx
                    .blocking_send(Ok(Bytes::copy_from_slice(&buffer[..n])))
                    .is_err()
                {
                    debug!(remaining, "Client went away");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Read failed while streaming");
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}
