use super::*;
use crate::config::Config;
use crate::stream::rar::fixtures::{rar4_set, sample, write_set};
use crate::types::JobProgress;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

mod media;

fn test_config() -> Arc<Config> {
    let mut config = Config::default();
    config.stream.chunk_size = 1_000;
    config.stream.queue_depth = 2;
    config.stream.volume_poll_interval = Duration::from_millis(10);
    config.stream.file_poll_interval = Duration::from_millis(10);
    Arc::new(config)
}

fn state_for(source: MediaSource) -> AppState {
    AppState::new(
        "Test.Job",
        Arc::new(JobProgress::new(3)),
        source,
        test_config(),
        ServerContext::new(),
    )
}

/// Write a stored two-volume archive holding `content` as `movie.mkv`
fn write_archive(dir: &Path, content: &[u8]) -> std::path::PathBuf {
    write_set(dir, "movie", &rar4_set("movie.mkv", content, 2))[0].clone()
}

async fn get(app: Router, uri: &str, range: Option<&str>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let mut request = Request::builder().uri(uri);
    if let Some(range) = range {
        request = request.header("Range", range);
    }
    let response = app
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

#[tokio::test]
async fn cors_headers_are_sent_when_enabled() {
    let app = create_router(state_for(MediaSource::Nothing));

    let request = Request::builder()
        .uri("/status")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn cors_can_be_disabled() {
    let mut config = (*test_config()).clone();
    config.api.cors_enabled = false;
    let state = AppState::new(
        "job",
        Arc::new(JobProgress::new(0)),
        MediaSource::Nothing,
        Arc::new(config),
        ServerContext::new(),
    );

    let request = Request::builder()
        .uri("/status")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = create_router(state).oneshot(request).await.unwrap();

    assert!(!response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn requests_are_tracked_until_the_body_is_done() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_archive(dir.path(), &sample(5_000));
    let state = state_for(MediaSource::Archive(first));
    let context = state.context.clone();
    let app = create_router(state);

    let response = app
        .oneshot(Request::builder().uri("/video").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(context.active_requests(), 1);
    assert_eq!(context.idle_for(), None);

    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(context.active_requests(), 0);
    assert!(context.idle_for().is_some());
}

#[tokio::test]
async fn idle_monitor_triggers_shutdown() {
    let context = ServerContext::new();
    let monitor = spawn_idle_monitor(
        context.clone(),
        Duration::from_millis(50),
        Duration::from_millis(10),
    );

    tokio::time::timeout(Duration::from_secs(5), monitor)
        .await
        .expect("monitor finishes")
        .unwrap();
    assert!(context.is_shutting_down());
}

#[tokio::test]
async fn idle_monitor_waits_for_active_requests() {
    let context = ServerContext::new();
    let guard = context.begin_request();
    let monitor = spawn_idle_monitor(
        context.clone(),
        Duration::from_millis(20),
        Duration::from_millis(5),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!context.is_shutting_down());

    drop(guard);
    tokio::time::timeout(Duration::from_secs(5), monitor)
        .await
        .expect("monitor finishes")
        .unwrap();
    assert!(context.is_shutting_down());
}

#[tokio::test]
async fn server_stops_on_shutdown_trigger() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let state = state_for(MediaSource::Nothing);
    let context = state.context.clone();

    let server = tokio::spawn(serve(listener, state));
    tokio::time::sleep(Duration::from_millis(50)).await;
    context.trigger_shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server stops")
        .unwrap();
    assert!(result.is_ok());
}
