//! Error types for nzb-stream
//!
//! This module provides error handling for the library, including:
//! - The crate-wide [`Error`] with contextual variants
//! - Per-part failures ([`FetchError`]) and codec failures ([`DecodeError`])
//! - HTTP status code mapping and JSON error bodies for the HTTP surface

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for nzb-stream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nzb-stream
///
/// Each variant carries enough context to tell which file, article or setting
/// the failure belongs to.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "connections")
        key: Option<String>,
    },

    /// NNTP protocol or connection error that is not tied to a single part
    #[error("NNTP error: {0}")]
    Nntp(String),

    /// Fetching a single part failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// A file already on disk does not match its recorded checksum
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// File whose checksum was recomputed
        file: String,
        /// Checksum listed in the checksum manifest
        expected: String,
        /// Checksum computed over the file on disk
        actual: String,
    },

    /// The first archive volume is missing, unreadable or has no usable entry
    #[error("archive unavailable at {path}: {reason}")]
    ArchiveUnavailable {
        /// Path of the first volume
        path: PathBuf,
        /// Why the archive could not be opened
        reason: String,
    },

    /// Invalid or empty NZB manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error (HTTP manifest fetch)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// HTTP server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Nothing can be served yet
    #[error("not ready: {0}")]
    NotReady(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Failure to fetch one part from the news server
#[derive(Debug, Error)]
pub enum FetchError {
    /// The server does not have the article (expired or never propagated)
    #[error("article {message_id} not found")]
    ArticleNotFound {
        /// Message-ID of the missing article
        message_id: String,
    },

    /// The connection is unusable; the worker holding it must exit
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server answered with an unexpected response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The article arrived but its payload could not be decoded
    #[error("{0}")]
    Decode(#[from] DecodeError),
}

impl FetchError {
    /// Whether this failure makes the connection that observed it unusable
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, FetchError::Connection(_))
    }
}

/// Failure to decode the yEnc payload of an article
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The article contains no `=ybegin` line
    #[error("article contains no yEnc payload")]
    NoPayload,

    /// The yEnc payload is malformed (bad header, part line or trailer)
    #[error("invalid yEnc header: {0}")]
    InvalidHeader(String),
}

/// API error response format
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "not_ready",
///     "message": "not ready: archive entry is not known yet"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_ready", "archive_unavailable")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::Config { .. } => 400,
            Error::InvalidManifest(_) => 422,

            // 422 Unprocessable Entity - the data on disk is wrong, not the request
            Error::ChecksumMismatch { .. } => 422,

            Error::Io(_) => 500,
            Error::ApiServerError(_) => 500,
            Error::Other(_) => 500,

            // 502 Bad Gateway - upstream failures
            Error::Nntp(_) => 502,
            Error::Fetch(_) => 502,
            Error::Network(_) => 502,

            // 503 Service Unavailable - try again once more has been downloaded
            Error::ArchiveUnavailable { .. } => 503,
            Error::NotReady(_) => 503,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Nntp(_) => "nntp_error",
            Error::Fetch(e) => match e {
                FetchError::ArticleNotFound { .. } => "article_not_found",
                FetchError::Connection(_) => "connection_failed",
                FetchError::Protocol(_) => "protocol_error",
                FetchError::Decode(_) => "decode_error",
            },
            Error::ChecksumMismatch { .. } => "checksum_mismatch",
            Error::ArchiveUnavailable { .. } => "archive_unavailable",
            Error::InvalidManifest(_) => "invalid_manifest",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::ApiServerError(_) => "api_server_error",
            Error::NotReady(_) => "not_ready",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::ArchiveUnavailable { path, .. } => Some(serde_json::json!({
                "path": path,
            })),
            Error::ChecksumMismatch {
                file,
                expected,
                actual,
            } => Some(serde_json::json!({
                "file": file,
                "expected": expected,
                "actual": actual,
            })),
            Error::Fetch(FetchError::ArticleNotFound { message_id }) => Some(serde_json::json!({
                "message_id": message_id,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn all_error_variants() -> Vec<(Error, u16, &'static str)> {
        vec![
            (
                Error::Config {
                    message: "must be at least 1".into(),
                    key: Some("connections".into()),
                },
                400,
                "config_error",
            ),
            (Error::Nntp("connection reset".into()), 502, "nntp_error"),
            (
                Error::Fetch(FetchError::ArticleNotFound {
                    message_id: "<a@b>".into(),
                }),
                502,
                "article_not_found",
            ),
            (
                Error::Fetch(FetchError::Connection("refused".into())),
                502,
                "connection_failed",
            ),
            (
                Error::Fetch(FetchError::Protocol("500 what?".into())),
                502,
                "protocol_error",
            ),
            (
                Error::Fetch(FetchError::Decode(DecodeError::NoPayload)),
                502,
                "decode_error",
            ),
            (
                Error::ChecksumMismatch {
                    file: "a.rar".into(),
                    expected: "deadbeef".into(),
                    actual: "00000000".into(),
                },
                422,
                "checksum_mismatch",
            ),
            (
                Error::ArchiveUnavailable {
                    path: PathBuf::from("/tmp/a.rar"),
                    reason: "missing".into(),
                },
                503,
                "archive_unavailable",
            ),
            (
                Error::InvalidManifest("no files".into()),
                422,
                "invalid_manifest",
            ),
            (
                Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")),
                500,
                "io_error",
            ),
            (
                Error::ApiServerError("bind failed".into()),
                500,
                "api_server_error",
            ),
            (Error::NotReady("no entry".into()), 503, "not_ready"),
            (Error::Other("unknown".into()), 500, "internal_error"),
        ]
    }

    #[test]
    fn every_variant_maps_to_expected_status_code() {
        for (error, expected_status, expected_code) in all_error_variants() {
            assert_eq!(
                error.status_code(),
                expected_status,
                "{expected_code} returned the wrong status"
            );
        }
    }

    #[test]
    fn every_variant_maps_to_expected_error_code() {
        for (error, _, expected_code) in all_error_variants() {
            assert_eq!(error.error_code(), expected_code);
        }
    }

    #[test]
    fn only_connection_errors_are_fatal_to_the_worker() {
        assert!(FetchError::Connection("eof".into()).is_fatal_to_connection());
        assert!(
            !FetchError::ArticleNotFound {
                message_id: "<x>".into()
            }
            .is_fatal_to_connection()
        );
        assert!(!FetchError::Protocol("502".into()).is_fatal_to_connection());
        assert!(!FetchError::Decode(DecodeError::NoPayload).is_fatal_to_connection());
    }

    #[test]
    fn api_error_from_archive_unavailable_has_path() {
        let api: ApiError = Error::ArchiveUnavailable {
            path: PathBuf::from("/dl/movie.part01.rar"),
            reason: "not on disk".into(),
        }
        .into();

        assert_eq!(api.error.code, "archive_unavailable");
        let details = api.error.details.unwrap();
        assert_eq!(details["path"], "/dl/movie.part01.rar");
    }

    #[test]
    fn api_error_from_checksum_mismatch_has_both_checksums() {
        let api: ApiError = Error::ChecksumMismatch {
            file: "a.r00".into(),
            expected: "cafebabe".into(),
            actual: "deadbeef".into(),
        }
        .into();

        let details = api.error.details.unwrap();
        assert_eq!(details["file"], "a.r00");
        assert_eq!(details["expected"], "cafebabe");
        assert_eq!(details["actual"], "deadbeef");
    }

    #[test]
    fn api_error_from_not_ready_has_no_details() {
        let api: ApiError = Error::NotReady("waiting for first volume".into()).into();
        assert_eq!(api.error.code, "not_ready");
        assert!(api.error.details.is_none());
        assert!(api.error.message.contains("waiting for first volume"));
    }

    #[test]
    fn decode_error_converts_into_fetch_error() {
        let fetch: FetchError = DecodeError::InvalidHeader("begin=x".into()).into();
        assert!(matches!(fetch, FetchError::Decode(DecodeError::InvalidHeader(_))));
    }
}
