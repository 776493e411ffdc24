//! HTTP server module
//!
//! Serves the job's archive entry (or plain video file) to players and
//! browsers, reports progress, and shuts itself down when told to or after
//! sitting idle.

use crate::Result;
use crate::error::Error;
use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use futures::StreamExt;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod error_response;
pub mod routes;
pub mod state;

pub use state::{AppState, MediaSource, RequestGuard, ServerContext};

/// Create the router with all route definitions
///
/// # Routes
///
/// - `GET /`, `GET /status` - Job progress and archive readiness
/// - `GET /download` - The exposed entry as an attachment (Range aware)
/// - `GET /video` - The exposed entry for playback (Range aware)
/// - `GET|POST /shutdown` - Graceful shutdown
pub fn create_router(state: AppState) -> Router {
    let context = state.context.clone();
    let cors_enabled = state.config.api.cors_enabled;

    let router = Router::new()
        .route("/", get(routes::status))
        .route("/status", get(routes::status))
        .route("/download", get(routes::download))
        .route("/video", get(routes::video))
        .route("/shutdown", get(routes::shutdown).post(routes::shutdown))
        .with_state(state)
        .layer(middleware::from_fn_with_state(context, track_requests))
        .layer(TraceLayer::new_for_http());

    if cors_enabled {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    }
}

/// Keep each request counted as active until its body has been sent
async fn track_requests(
    State(context): State<ServerContext>,
    request: Request,
    next: Next,
) -> Response {
    let guard = context.begin_request();
    let response = next.run(request).await;

    let (parts, body) = response.into_parts();
    let body = body.into_data_stream().map(move |chunk| {
        let _ = &guard;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(body))
}

/// Trigger shutdown once the server has been idle for `idle_timeout`
pub fn spawn_idle_monitor(
    context: ServerContext,
    idle_timeout: Duration,
    check_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = context.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(check_interval) => {
                    if let Some(idle) = context.idle_for()
                        && idle >= idle_timeout
                    {
                        tracing::info!(idle_secs = idle.as_secs(), "Server idle, shutting down");
                        context.trigger_shutdown();
                        break;
                    }
                }
            }
        }
    })
}

/// Serve on an already bound listener until the context's shutdown fires
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let context = state.context.clone();
    let api = state.config.api.clone();

    let monitor = api
        .idle_timeout
        .map(|timeout| spawn_idle_monitor(context.clone(), timeout, api.idle_check_interval));

    let shutdown = context.shutdown_token();
    let result = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::ApiServerError(e.to_string()));

    if let Some(monitor) = monitor {
        monitor.abort();
    }
    tracing::info!("HTTP server stopped");
    result
}

/// Bind the configured address and serve until shutdown
pub async fn start_server(state: AppState) -> Result<()> {
    let bind_address = state.config.api.bind_address;

    tracing::info!(address = %bind_address, "Starting HTTP server");
    let listener = TcpListener::bind(bind_address).await.map_err(Error::Io)?;
    tracing::info!(address = %bind_address, "HTTP server listening");

    serve(listener, state).await
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
