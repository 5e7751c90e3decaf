use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::Stream;
use segdl_core::{
    Completion, DmError, DownloadConfig, DownloadEvent, DownloadManager, DownloadRequest,
    DownloadStatus, Downloader,
};
use tokio::sync::mpsc::UnboundedReceiver;

const MB: usize = 1024 * 1024;

#[derive(Clone)]
struct AppState {
    content: Arc<Vec<u8>>,
    accept_ranges: bool,
    chunk_size: usize,
    delay: Duration,
    /// Held before the response headers go out
    header_delay: Duration,
    /// Break every response after this many body bytes
    fail_after: Option<usize>,
    disposition: Option<&'static str>,
    ranges: Arc<Mutex<Vec<String>>>,
}

impl AppState {
    fn new(len: usize) -> Self {
        Self {
            content: Arc::new(content(len)),
            accept_ranges: true,
            chunk_size: 16 * 1024,
            delay: Duration::ZERO,
            header_delay: Duration::ZERO,
            fail_after: None,
            disposition: None,
            ranges: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn ranges(&self) -> Vec<String> {
        self.ranges.lock().unwrap().clone()
    }
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 7) as u8).collect()
}

fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let value = value.strip_prefix("bytes=")?;
    let (start, end) = value.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = if end.is_empty() {
        total - 1
    } else {
        end.parse().ok()?
    };
    (start <= end && end < total).then_some((start, end))
}

fn body_stream(
    state: AppState,
    start: usize,
    end: usize,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    futures::stream::unfold(start, move |offset| {
        let state = state.clone();
        async move {
            if offset > end {
                return None;
            }
            if let Some(limit) = state.fail_after {
                if offset - start >= limit {
                    let error = io::Error::new(io::ErrorKind::ConnectionReset, "dropped");
                    return Some((Err(error), end + 1));
                }
            }
            if !state.delay.is_zero() {
                tokio::time::sleep(state.delay).await;
            }
            let next = (offset + state.chunk_size).min(end + 1);
            Some((Ok(Bytes::copy_from_slice(&state.content[offset..next])), next))
        }
    })
}

async fn handle_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.header_delay.is_zero() {
        tokio::time::sleep(state.header_delay).await;
    }
    let total = state.content.len();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if let Some(range) = &range {
        state.ranges.lock().unwrap().push(range.clone());
    }

    let (status, start, end) = match range.as_deref().and_then(|r| parse_range(r, total)) {
        Some((start, end)) if state.accept_ranges => (StatusCode::PARTIAL_CONTENT, start, end),
        _ => (StatusCode::OK, 0, total - 1),
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&(end - start + 1).to_string()).unwrap(),
    );
    if state.accept_ranges {
        response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    if status == StatusCode::PARTIAL_CONTENT {
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, total)).unwrap(),
        );
    }
    if let Some(disposition) = state.disposition {
        response_headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static(disposition),
        );
    }

    let body = Body::from_stream(body_stream(state.clone(), start, end));
    (status, response_headers, body).into_response()
}

async fn spawn_server(state: AppState) -> String {
    let app = Router::new()
        .route("/file", get(handle_get))
        .route(
            "/empty",
            get(|| async { ([(header::CONTENT_LENGTH, "0")], Bytes::new()) }),
        )
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn config() -> DownloadConfig {
    DownloadConfig::new()
        .with_threads(4)
        .with_max_cache_size(MB)
        .with_progress_update_interval(Duration::from_millis(10))
        .with_read_timeout(Duration::from_secs(10))
}

async fn next_event(rx: &mut UnboundedReceiver<DownloadEvent>) -> DownloadEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream closed")
}

async fn wait_for_completion(rx: &mut UnboundedReceiver<DownloadEvent>) -> Completion {
    loop {
        if let DownloadEvent::Completed(completion) = next_event(rx).await {
            return completion;
        }
    }
}

async fn wait_for_status(rx: &mut UnboundedReceiver<DownloadEvent>, status: DownloadStatus) {
    loop {
        match next_event(rx).await {
            DownloadEvent::StatusChanged(s) if s == status => return,
            DownloadEvent::Completed(completion) => {
                panic!("completed while waiting for {}: {:?}", status, completion)
            }
            _ => {}
        }
    }
}

/// Counts completions that show up after the first one
async fn late_completions(rx: &mut UnboundedReceiver<DownloadEvent>) -> usize {
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, DownloadEvent::Completed(_)) {
            count += 1;
        }
    }
    count
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_at_half_then_resume_writes_exact_file() {
    let mut state = AppState::new(10 * MB);
    state.delay = Duration::from_millis(5);
    let base = spawn_server(state.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");
    let downloader =
        Downloader::new(DownloadRequest::new(format!("{}/file", base), &path), config()).unwrap();
    let mut rx = downloader.subscribe();

    downloader.download().await.unwrap();
    assert_eq!(downloader.segment_count(), 4);
    assert_eq!(downloader.total_size(), (10 * MB) as u64);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), (10 * MB) as u64);

    loop {
        match next_event(&mut rx).await {
            DownloadEvent::Progress(progress) if progress.percentage() >= 50.0 => break,
            DownloadEvent::Completed(completion) => panic!("finished too early: {:?}", completion),
            _ => {}
        }
    }

    downloader.pause().unwrap();
    wait_for_status(&mut rx, DownloadStatus::Paused).await;
    assert_eq!(downloader.status(), DownloadStatus::Paused);
    assert_eq!(downloader.cached_bytes(), 0);

    // everything counted as downloaded is already on disk
    let expected = state.content.clone();
    let on_disk = read(&path);
    let mut expected_ranges = Vec::new();
    for worker in downloader.segments() {
        let segment = worker.segment();
        let done = worker.downloaded_bytes();
        let from = segment.start as usize;
        let to = from + done as usize;
        assert_eq!(&on_disk[from..to], &expected[from..to]);

        if worker.status() == DownloadStatus::Paused && done < segment.size() {
            expected_ranges.push(format!("bytes={}-{}", segment.start + done, segment.end));
        }
    }
    assert!(downloader.downloaded_bytes() < (10 * MB) as u64);

    state.ranges.lock().unwrap().clear();
    downloader.resume().unwrap();

    let completion = wait_for_completion(&mut rx).await;
    assert!(completion.is_success(), "{:?}", completion.error);
    assert_eq!(completion.downloaded, (10 * MB) as u64);
    assert_eq!(completion.total_size, (10 * MB) as u64);
    assert_eq!(completion.path.as_deref(), Some(path.as_path()));
    assert_eq!(downloader.status(), DownloadStatus::Completed);
    assert_eq!(late_completions(&mut rx).await, 0);

    let mut resumed = state.ranges();
    resumed.sort();
    expected_ranges.sort();
    assert_eq!(resumed, expected_ranges);

    assert!(read(&path) == *expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_without_ranges_uses_one_segment() {
    let mut state = AppState::new(200 * 1024);
    state.accept_ranges = false;
    let base = spawn_server(state.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("single.bin");
    let downloader =
        Downloader::new(DownloadRequest::new(format!("{}/file", base), &path), config()).unwrap();
    let mut rx = downloader.subscribe();

    let info = downloader.check().await.unwrap();
    assert!(!info.range_supported);
    assert_eq!(info.total_size, 200 * 1024);
    assert_eq!(info.filename.as_deref(), Some("file"));

    downloader.download().await.unwrap();
    assert_eq!(downloader.segment_count(), 1);

    let completion = wait_for_completion(&mut rx).await;
    assert!(completion.is_success(), "{:?}", completion.error);
    assert_eq!(read(&path), *state.content);
    assert_eq!(state.ranges(), vec!["bytes=0-".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn requested_range_lands_at_file_start() {
    let state = AppState::new(MB);
    let base = spawn_server(state.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("part.bin");
    let request = DownloadRequest::new(format!("{}/file", base), &path).with_range(1000, 50_999);
    let config = config().with_max_cache_size(8 * 1024);
    let downloader = Downloader::new(request, config).unwrap();
    let mut rx = downloader.subscribe();

    downloader.download().await.unwrap();
    assert_eq!(downloader.total_size(), 50_000);
    assert_eq!(downloader.segment_count(), 4);

    let completion = wait_for_completion(&mut rx).await;
    assert!(completion.is_success(), "{:?}", completion.error);
    assert_eq!(read(&path), state.content[1000..=50_999].to_vec());

    let ranges = state.ranges();
    assert!(ranges.contains(&"bytes=1000-50999".to_string()));
    assert!(ranges.contains(&"bytes=1000-13499".to_string()));
    assert!(ranges.contains(&"bytes=38500-50999".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn suggested_filename_comes_from_content_disposition() {
    let mut state = AppState::new(4096);
    state.disposition = Some("attachment; filename=\"report.pdf\"");
    let base = spawn_server(state).await;

    let dir = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(
        DownloadRequest::new(format!("{}/file", base), dir.path().join("x")),
        config(),
    )
    .unwrap();

    let info = downloader.check().await.unwrap();
    assert_eq!(info.filename.as_deref(), Some("report.pdf"));
    assert_eq!(downloader.suggested_filename().as_deref(), Some("report.pdf"));
    assert_eq!(downloader.status(), DownloadStatus::Initialized);
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_file_of_another_size_is_a_conflict() {
    let base = spawn_server(AppState::new(64 * 1024)).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taken.bin");
    std::fs::write(&path, b"0123456789").unwrap();

    let downloader =
        Downloader::new(DownloadRequest::new(format!("{}/file", base), &path), config()).unwrap();
    let mut rx = downloader.subscribe();

    let err = downloader.download().await.unwrap_err();
    assert!(matches!(
        err,
        DmError::FileConflict {
            expected: 65536,
            actual: 10,
            ..
        }
    ));
    assert_eq!(downloader.status(), DownloadStatus::Canceled);

    let completion = wait_for_completion(&mut rx).await;
    assert!(matches!(completion.error, Some(DmError::FileConflict { .. })));
    assert_eq!(late_completions(&mut rx).await, 0);
    assert_eq!(read(&path), b"0123456789");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_resources_fail_before_any_file_is_created() {
    let base = spawn_server(AppState::new(16)).await;
    let dir = tempfile::tempdir().unwrap();

    let path = dir.path().join("empty.bin");
    let downloader =
        Downloader::new(DownloadRequest::new(format!("{}/empty", base), &path), config()).unwrap();
    assert!(matches!(
        downloader.download().await,
        Err(DmError::ResourceMissing)
    ));
    assert_eq!(downloader.status(), DownloadStatus::Canceled);
    assert!(!path.exists());

    let path = dir.path().join("missing.bin");
    let downloader =
        Downloader::new(DownloadRequest::new(format!("{}/missing", base), &path), config()).unwrap();
    let err = downloader.check().await.unwrap_err();
    assert!(matches!(err, DmError::ServerError { status: 404, .. }));
    assert!(err.is_transport());
    assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn broken_transfer_cancels_the_whole_job() {
    let mut state = AppState::new(MB);
    state.fail_after = Some(64 * 1024);
    let base = spawn_server(state).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.bin");
    let config = config().with_max_cache_size(32 * 1024);
    let downloader =
        Downloader::new(DownloadRequest::new(format!("{}/file", base), &path), config).unwrap();
    let mut rx = downloader.subscribe();

    downloader.begin_download().unwrap();

    let completion = wait_for_completion(&mut rx).await;
    let error = completion.error.expect("job should carry the transfer error");
    assert!(error.is_transport(), "{:?}", error);
    assert!(completion.downloaded < MB as u64);
    assert!(completion.path.is_none());

    assert_eq!(late_completions(&mut rx).await, 0);
    assert_eq!(downloader.status(), DownloadStatus::Canceled);
    for status in downloader.segment_statuses() {
        assert_eq!(status, DownloadStatus::Canceled);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_transfer_reports_cancellation_once() {
    let mut state = AppState::new(4 * MB);
    state.delay = Duration::from_millis(5);
    let base = spawn_server(state).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("canceled.bin");
    let downloader =
        Downloader::new(DownloadRequest::new(format!("{}/file", base), &path), config()).unwrap();
    let mut rx = downloader.subscribe();

    downloader.download().await.unwrap();
    loop {
        if let DownloadEvent::Progress(progress) = next_event(&mut rx).await {
            if progress.received() > 0 {
                break;
            }
        }
    }

    downloader.cancel();
    let completion = wait_for_completion(&mut rx).await;
    assert!(completion.error.as_ref().is_some_and(DmError::is_cancelled));
    assert_eq!(downloader.status(), DownloadStatus::Canceled);
    assert_eq!(late_completions(&mut rx).await, 0);

    // a canceled job stays canceled
    downloader.cancel();
    assert!(downloader.resume().is_err());
    assert_eq!(downloader.status(), DownloadStatus::Canceled);
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_right_after_start_or_resume_is_not_lost() {
    let mut state = AppState::new(4 * MB);
    state.delay = Duration::from_millis(5);
    let base = spawn_server(state).await;
    let dir = tempfile::tempdir().unwrap();
    let config = config().with_threads(8).with_max_cache_size(64 * 1024);

    for round in 0..10 {
        let path = dir.path().join(format!("eager-{}.bin", round));
        let downloader = Downloader::new(
            DownloadRequest::new(format!("{}/file", base), &path),
            config.clone(),
        )
        .unwrap();
        let mut rx = downloader.subscribe();

        downloader.begin_download().unwrap();
        wait_for_status(&mut rx, DownloadStatus::Downloading).await;
        downloader.pause().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_status(&mut rx, DownloadStatus::Paused),
        )
        .await
        .unwrap_or_else(|_| panic!("round {}: pause after start stalled", round));

        downloader.resume().unwrap();
        downloader.pause().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_status(&mut rx, DownloadStatus::Paused),
        )
        .await
        .unwrap_or_else(|_| panic!("round {}: pause after resume stalled", round));
        assert_eq!(downloader.status(), DownloadStatus::Paused);

        downloader.cancel();
        let completion = wait_for_completion(&mut rx).await;
        assert!(completion.error.as_ref().is_some_and(DmError::is_cancelled));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_while_waiting_leaves_no_file() {
    let mut state = AppState::new(MB);
    state.header_delay = Duration::from_millis(400);
    let base = spawn_server(state).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never.bin");
    let downloader =
        Downloader::new(DownloadRequest::new(format!("{}/file", base), &path), config()).unwrap();
    let mut rx = downloader.subscribe();

    downloader.begin_download().unwrap();
    downloader.cancel();
    assert_eq!(downloader.status(), DownloadStatus::Canceled);

    let completion = wait_for_completion(&mut rx).await;
    assert!(completion.error.as_ref().is_some_and(DmError::is_cancelled));

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!path.exists());
    assert_eq!(downloader.status(), DownloadStatus::Canceled);
    assert_eq!(downloader.segment_count(), 0);
    assert_eq!(late_completions(&mut rx).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn manager_forwards_to_the_selected_job() {
    let state = AppState::new(128 * 1024);
    let base = spawn_server(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let manager = DownloadManager::new(config().with_max_cache_size(32 * 1024));
    let first = manager
        .add(DownloadRequest::new(format!("{}/file", base), dir.path().join("a.bin")))
        .unwrap();
    let second = manager
        .add(DownloadRequest::new(format!("{}/file", base), dir.path().join("b.bin")))
        .unwrap();

    assert!(manager.select(second));
    let selected = manager.current().unwrap();
    let mut rx = selected.subscribe();

    assert!(manager.download().await.unwrap());
    let completion = wait_for_completion(&mut rx).await;
    assert!(completion.is_success(), "{:?}", completion.error);

    assert_eq!(read(&dir.path().join("b.bin")), *state.content);
    assert!(!dir.path().join("a.bin").exists());
    assert_eq!(
        manager.get(first).unwrap().status(),
        DownloadStatus::Initialized
    );
    assert_eq!(selected.status(), DownloadStatus::Completed);

    // completed jobs cannot be paused, and a cancel leaves them completed
    assert!(manager.pause().is_err());
    assert!(manager.cancel());
    assert_eq!(selected.status(), DownloadStatus::Completed);
}
