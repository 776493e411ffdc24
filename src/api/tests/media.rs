use super::*;

#[tokio::test]
async fn video_is_not_ready_before_the_first_volume_exists() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_for(MediaSource::Archive(
        dir.path().join("movie.part1.rar"),
    )));

    let (status, _, body) = get(app, "/video", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, b"Not ready!");
}

#[tokio::test]
async fn nothing_to_serve_is_not_ready() {
    let app = create_router(state_for(MediaSource::Nothing));
    let (status, _, body) = get(app, "/download", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, b"Not ready!");
}

#[tokio::test]
async fn video_serves_the_whole_entry() {
    let dir = tempfile::tempdir().unwrap();
    let content = sample(7_000);
    let app = create_router(state_for(MediaSource::Archive(write_archive(
        dir.path(),
        &content,
    ))));

    let (status, headers, body) = get(app, "/video", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "video/x-matroska");
    assert_eq!(headers["content-length"], "7000");
    assert_eq!(headers["accept-ranges"], "bytes");
    assert_eq!(body, content);
}

#[tokio::test]
async fn download_honours_ranges_in_any_order() {
    let dir = tempfile::tempdir().unwrap();
    let content = sample(7_000);
    let app = create_router(state_for(MediaSource::Archive(write_archive(
        dir.path(),
        &content,
    ))));

    let (status, headers, body) = get(app.clone(), "/download", Some("bytes=5000-5999")).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers["content-range"], "bytes 5000-5999/7000");
    assert_eq!(headers["content-length"], "1000");
    assert_eq!(headers["content-type"], "application/x-download");
    assert!(
        headers["content-disposition"]
            .to_str()
            .unwrap()
            .starts_with("attachment; filename=\"movie.mkv\"")
    );
    assert_eq!(body, &content[5_000..6_000]);

    // Backwards from where the previous response left the stream
    let (status, _, body) = get(app.clone(), "/download", Some("bytes=10-19")).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, &content[10..20]);

    let (status, headers, body) = get(app, "/video", Some("bytes=-500")).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers["content-range"], "bytes 6500-6999/7000");
    assert_eq!(body, &content[6_500..]);
}

#[tokio::test]
async fn unsatisfiable_range_is_416() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_for(MediaSource::Archive(write_archive(
        dir.path(),
        &sample(1_000),
    ))));

    let (status, headers, _) = get(app, "/video", Some("bytes=1000-")).await;

    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(headers["content-range"], "bytes */1000");
}

#[tokio::test]
async fn reversed_range_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let content = sample(1_000);
    let app = create_router(state_for(MediaSource::Archive(write_archive(
        dir.path(),
        &content,
    ))));

    let (status, headers, body) = get(app, "/video", Some("bytes=50-10")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-length"], "1000");
    assert!(headers.get("content-range").is_none());
    assert_eq!(body, content);
}

#[tokio::test]
async fn legacy_file_is_served_with_its_declared_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.mp4");
    let content = sample(3_000);
    std::fs::write(&path, &content).unwrap();

    let state = state_for(MediaSource::File {
        name: "clip.mp4".to_string(),
        path,
    });
    let progress = Arc::clone(&state.progress);
    let app = create_router(state);

    let (status, _, body) = get(app.clone(), "/video", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, b"Not ready!");

    progress.set_declared_size("clip.mp4", 3_000);

    let (status, headers, body) = get(app, "/video", Some("bytes=1000-1999")).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers["content-type"], "video/mp4");
    assert_eq!(body, &content[1_000..2_000]);
}

#[test]
fn content_types_follow_the_extension() {
    assert_eq!(routes::video_content_type("a.MKV"), "video/x-matroska");
    assert_eq!(routes::video_content_type("a.mp4"), "video/mp4");
    assert_eq!(routes::video_content_type("a.avi"), "video/x-msvideo");
    assert_eq!(routes::video_content_type("a.iso"), "application/octet-stream");
    assert_eq!(routes::video_content_type("noext"), "application/octet-stream");
}
