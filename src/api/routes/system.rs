//! System handlers: status and shutdown.

use super::StatusResponse;
use crate::api::state::{AppState, MediaSource};
use axum::{Json, extract::State};

/// GET / and GET /status - Job progress and archive readiness
///
/// Opens the archive stream on first use, so the entry is reported as soon
/// as the first volume is on disk.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.progress.snapshot();

    let (ready, entry) = match state.source.as_ref() {
        MediaSource::Archive(_) => match state.prepare_archive().await {
            Ok(entry) => (true, Some(entry)),
            Err(e) => {
                tracing::debug!(error = %e, "Archive entry not available yet");
                (false, None)
            }
        },
        MediaSource::File { name, .. } => (state.progress.declared_size(name).is_some(), None),
        MediaSource::Nothing => (false, None),
    };

    Json(StatusResponse {
        job: state.job.to_string(),
        files_total: snapshot.files_total,
        files_completed: snapshot.files_completed,
        files_failed: snapshot.files_failed,
        parts_downloaded: snapshot.parts_downloaded,
        ready,
        entry,
    })
}

/// GET|POST /shutdown - Graceful shutdown
///
/// In-flight responses are allowed to finish.
pub async fn shutdown(State(state): State<AppState>) -> &'static str {
    tracing::info!("Shutdown requested over HTTP");
    state.context.trigger_shutdown();
    "OK"
}
