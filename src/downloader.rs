//! Core downloader module for the segmented downloader
//!
//! This module implements the job-level coordination: probing and preparing
//! the destination, partitioning it into segments, starting one worker per
//! segment and folding the workers' events back into a single status and
//! progress stream.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use crate::config::DownloadConfig;
use crate::error::{DmError, DmResult};
use crate::event::{Completion, DownloadEvent, Notifier, SegmentEvent};
use crate::http::{HttpClient, ProbeInfo};
use crate::progress::{Progress, SpeedMeter};
use crate::segment::partition;
use crate::status::{aggregate_status, DownloadStatus};
use crate::storage::{check_disk_space, prepare_file};
use crate::utils::validate_url;
use crate::worker::SegmentWorker;

/// What to download and where to put it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    /// Full path of the destination file
    pub destination: PathBuf,
    /// First byte of the resource to fetch
    pub start: u64,
    /// Last byte of the resource to fetch, inclusive; `None` means the end
    pub end: Option<u64>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            start: 0,
            end: None,
        }
    }

    /// Restricts the job to bytes `start..=end` of the resource
    pub fn with_range(mut self, start: u64, end: impl Into<Option<u64>>) -> Self {
        self.start = start;
        self.end = end.into();
        self
    }
}

#[derive(Debug)]
struct JobState {
    status: DownloadStatus,
    /// The resource was probed and the destination prepared
    checked: bool,
    start: u64,
    end: Option<u64>,
    total_size: u64,
    range_supported: bool,
    filename: Option<String>,
    used_time: Duration,
    last_start: Option<Instant>,
    speed: SpeedMeter,
    last_speed: u64,
    last_progress: Option<Instant>,
    /// Reported by the next `Canceled` completion instead of `Cancelled`
    pending_error: Option<DmError>,
}

struct Inner {
    url: Url,
    destination: PathBuf,
    config: Arc<DownloadConfig>,
    client: HttpClient,
    state: Mutex<JobState>,
    workers: OnceLock<Vec<Arc<SegmentWorker>>>,
    events: Notifier<DownloadEvent>,
}

/// Core downloader engine for one job
///
/// Cloning yields another handle to the same job.
///
/// # Examples
///
/// ```no_run
/// use segdl_core::{DownloadConfig, DownloadEvent, DownloadRequest, Downloader, DmResult};
///
/// #[tokio::main]
/// async fn main() -> DmResult<()> {
///     let request = DownloadRequest::new("https://example.com/large-file.zip", "./large-file.zip");
///     let config = DownloadConfig::new()
///         .with_threads(4)
///         .with_max_cache_size(1024 * 1024);
///
///     let downloader = Downloader::new(request, config)?;
///     let mut events = downloader.subscribe();
///     downloader.download().await?;
///
///     while let Some(event) = events.recv().await {
///         match event {
///             DownloadEvent::Progress(progress) => {
///                 println!("Downloaded: {:.1}%", progress.percentage())
///             }
///             DownloadEvent::Completed(completion) => {
///                 println!("Finished: {:?}", completion.error);
///                 break;
///             }
///             DownloadEvent::StatusChanged(_) => {}
///         }
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

impl Downloader {
    /// Creates a job for `request`; nothing is sent until `check` or `download`
    pub fn new(request: DownloadRequest, config: DownloadConfig) -> DmResult<Self> {
        let url = validate_url(&request.url)?;
        if let Some(end) = request.end {
            if end < request.start {
                return Err(DmError::config(format!(
                    "range end ({}) cannot be less than range start ({})",
                    end, request.start
                )));
            }
        }

        let config = Arc::new(config);
        let client = HttpClient::new(config.clone())?;

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                destination: request.destination,
                config,
                client,
                state: Mutex::new(JobState {
                    status: DownloadStatus::Initialized,
                    checked: false,
                    start: request.start,
                    end: request.end,
                    total_size: 0,
                    range_supported: false,
                    filename: None,
                    used_time: Duration::ZERO,
                    last_start: None,
                    speed: SpeedMeter::new(Instant::now(), 0),
                    last_speed: 0,
                    last_progress: None,
                    pending_error: None,
                }),
                workers: OnceLock::new(),
                events: Notifier::new(),
            }),
        })
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> DownloadStatus {
        self.inner.state.lock().status
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn destination(&self) -> &Path {
        &self.inner.destination
    }

    /// Bytes to download; 0 until the resource has been probed
    pub fn total_size(&self) -> u64 {
        self.inner.state.lock().total_size
    }

    pub fn range_supported(&self) -> bool {
        self.inner.state.lock().range_supported
    }

    /// Filename suggested by the server or the URL, once probed
    pub fn suggested_filename(&self) -> Option<String> {
        self.inner.state.lock().filename.clone()
    }

    /// Bytes flushed to disk across all segments
    pub fn downloaded_bytes(&self) -> u64 {
        self.workers().iter().map(|w| w.downloaded_bytes()).sum()
    }

    /// Bytes held in segment caches
    pub fn cached_bytes(&self) -> u64 {
        self.workers().iter().map(|w| w.cached_bytes()).sum()
    }

    /// Active transfer time, excluding time spent paused
    pub fn elapsed(&self) -> Duration {
        let state = self.inner.state.lock();
        Self::elapsed_locked(&state)
    }

    fn elapsed_locked(state: &JobState) -> Duration {
        state.used_time + state.last_start.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Current progress, with the speed of the last notification
    pub fn progress(&self) -> Progress {
        let moved = self.downloaded_bytes() + self.cached_bytes();
        let state = self.inner.state.lock();
        Progress::new(moved, state.total_size, state.last_speed)
    }

    /// Number of segments the job was split into; 0 before the download starts
    pub fn segment_count(&self) -> usize {
        self.workers().len()
    }

    pub fn segment_statuses(&self) -> Vec<DownloadStatus> {
        self.workers().iter().map(|w| w.status()).collect()
    }

    pub fn segments(&self) -> &[Arc<SegmentWorker>] {
        self.workers()
    }

    fn workers(&self) -> &[Arc<SegmentWorker>] {
        self.inner.workers.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Probes the resource and prepares the destination ahead of `download`
    pub async fn check(&self) -> DmResult<ProbeInfo> {
        {
            let state = self.inner.state.lock();
            if state.status != DownloadStatus::Initialized {
                return Err(DmError::invalid_state("check", state.status));
            }
        }
        self.prepare("check", DownloadStatus::Initialized).await
    }

    /// Probes, then reserves the destination unless the job left `expected` meanwhile
    async fn prepare(
        &self,
        operation: &'static str,
        expected: DownloadStatus,
    ) -> DmResult<ProbeInfo> {
        let (start, end) = {
            let state = self.inner.state.lock();
            (state.start, state.end)
        };

        let info = self.inner.client.probe(&self.inner.url, start, end).await?;

        let status = self.status();
        if status != expected {
            return Err(DmError::invalid_state(operation, status));
        }

        if self.inner.config.check_disk_space {
            check_disk_space(&self.inner.destination, info.total_size)?;
        }

        let path = self.inner.destination.clone();
        let size = info.total_size;
        tokio::task::spawn_blocking(move || prepare_file(&path, size))
            .await
            .map_err(|e| DmError::Other(format!("file preparation task failed: {}", e)))??;

        let mut state = self.inner.state.lock();
        state.checked = true;
        state.start = info.start;
        state.end = info.end;
        state.total_size = info.total_size;
        state.range_supported = info.range_supported;
        state.filename = info.filename.clone();
        Ok(info)
    }

    /// Sets the job up and starts every segment
    ///
    /// Setup errors are returned and also reported by a `Canceled`
    /// completion. The transfer itself runs in the background.
    pub async fn download(&self) -> DmResult<()> {
        self.enter_waiting()?;
        match self.setup().await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.abort(error.clone());
                Err(error)
            }
        }
    }

    /// Like [`download`](Self::download), but runs the setup on a spawned task
    pub fn begin_download(&self) -> DmResult<()> {
        self.enter_waiting()?;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(error) = this.setup().await {
                this.abort(error);
            }
        });
        Ok(())
    }

    fn enter_waiting(&self) -> DmResult<()> {
        let mut state = self.inner.state.lock();
        if state.status != DownloadStatus::Initialized {
            return Err(DmError::invalid_state("download", state.status));
        }
        self.set_status(&mut state, DownloadStatus::Waiting);
        Ok(())
    }

    async fn setup(&self) -> DmResult<()> {
        let inner = &self.inner;
        inner.config.validate()?;

        let checked = inner.state.lock().checked;
        if !checked {
            match self.prepare("download", DownloadStatus::Waiting).await {
                Ok(_) => {}
                Err(DmError::InvalidState { status, .. }) => {
                    debug!(url = %inner.url, %status, "Download left waiting while probing");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let (origin, total_size, range_supported) = {
            let state = inner.state.lock();
            (state.start, state.total_size, state.range_supported)
        };

        let segments = partition(
            total_size,
            range_supported,
            inner.config.max_threads,
            inner.config.max_cache_size,
        );
        if segments.is_empty() {
            return Err(DmError::NothingToDownload);
        }
        info!(
            url = %inner.url,
            size = total_size,
            range_supported,
            segments = segments.len(),
            "Download partitioned"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let workers: Vec<_> = segments
            .into_iter()
            .map(|segment| {
                let worker = SegmentWorker::new(
                    segment,
                    origin,
                    range_supported,
                    inner.url.clone(),
                    inner.destination.clone(),
                    inner.client.clone(),
                    inner.config.clone(),
                );
                worker.attach(tx.clone());
                worker
            })
            .collect();
        drop(tx);

        {
            let mut state = inner.state.lock();
            if state.status != DownloadStatus::Waiting {
                debug!(url = %inner.url, status = %state.status, "Download left waiting during setup");
                return Ok(());
            }
            if inner.workers.set(workers).is_err() {
                return Err(DmError::Other("segments were already created".to_string()));
            }
            tokio::spawn(supervise(Arc::downgrade(inner), rx));

            // every segment is waiting before anyone can see the job downloading
            for worker in self.workers() {
                if let Err(e) = worker.start() {
                    warn!(segment = worker.index(), error = %e, "Failed to start segment");
                }
            }

            let now = Instant::now();
            state.last_start = Some(now);
            state.speed.reset(now, 0);
            state.last_progress = None;
            self.set_status(&mut state, DownloadStatus::Downloading);
        }
        Ok(())
    }

    /// Ends the job with `error` as the reason
    fn abort(&self, error: DmError) {
        error!(url = %self.inner.url, error = %error, "Download failed");
        {
            let mut state = self.inner.state.lock();
            if !state.status.is_terminal() {
                state.pending_error = Some(error);
                self.set_status(&mut state, DownloadStatus::Canceled);
            }
        }
        for worker in self.workers() {
            worker.cancel();
        }
    }

    /// Requests a pause; the job becomes `Paused` once every unfinished segment has
    ///
    /// Legal while downloading, and while waiting on segments that were
    /// already started or resumed.
    pub fn pause(&self) -> DmResult<()> {
        let mut state = self.inner.state.lock();
        let started = state.status == DownloadStatus::Waiting && !self.workers().is_empty();
        if state.status != DownloadStatus::Downloading && !started {
            return Err(DmError::invalid_state("pause", state.status));
        }
        self.set_status(&mut state, DownloadStatus::Pausing);

        for worker in self.workers() {
            if matches!(
                worker.status(),
                DownloadStatus::Waiting | DownloadStatus::Downloading
            ) {
                if let Err(e) = worker.pause() {
                    // the segment finished in the meantime
                    debug!(segment = worker.index(), error = %e, "Segment not paused");
                }
            }
        }
        Ok(())
    }

    /// Restarts every unfinished segment from where it stopped
    pub fn resume(&self) -> DmResult<()> {
        let mut state = self.inner.state.lock();
        if state.status != DownloadStatus::Paused {
            return Err(DmError::invalid_state("resume", state.status));
        }
        let now = Instant::now();
        let moved = self.downloaded_bytes() + self.cached_bytes();
        state.last_start = Some(now);
        state.speed.reset(now, moved);
        state.last_progress = None;
        self.set_status(&mut state, DownloadStatus::Waiting);

        for worker in self.workers() {
            if worker.status() == DownloadStatus::Completed {
                continue;
            }
            if let Err(e) = worker.resume() {
                warn!(segment = worker.index(), error = %e, "Failed to resume segment");
            }
        }
        Ok(())
    }

    /// Like [`resume`](Self::resume), but restarts the segments on a spawned task
    pub fn begin_resume(&self) -> DmResult<()> {
        let status = self.status();
        if status != DownloadStatus::Paused {
            return Err(DmError::invalid_state("resume", status));
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.resume() {
                warn!(url = %this.inner.url, error = %e, "Background resume failed");
            }
        });
        Ok(())
    }

    /// Cancels the job
    ///
    /// Without a transfer in flight the job is canceled at once. Otherwise it
    /// becomes `Canceling` until every segment has flushed and stopped. A
    /// completed job stays completed.
    pub fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            match state.status {
                DownloadStatus::Completed | DownloadStatus::Canceled => return,
                status if status.is_quiescent() => {
                    self.set_status(&mut state, DownloadStatus::Canceled);
                }
                _ => {
                    self.set_status(&mut state, DownloadStatus::Canceling);
                }
            }
        }

        for worker in self.workers() {
            worker.cancel();
        }
    }

    /// Applies a job transition, publishing it only if the status really changed
    fn set_status(&self, state: &mut JobState, status: DownloadStatus) -> bool {
        if state.status == status {
            return false;
        }
        let previous = std::mem::replace(&mut state.status, status);

        if matches!(
            status,
            DownloadStatus::Paused | DownloadStatus::Canceled | DownloadStatus::Completed
        ) {
            if let Some(started) = state.last_start.take() {
                state.used_time += started.elapsed();
            }
        }

        info!(
            url = %self.inner.url,
            from = %previous,
            to = %status,
            "Download status changed"
        );
        self.inner.events.publish(DownloadEvent::StatusChanged(status));

        match status {
            DownloadStatus::Canceled => {
                let error = state.pending_error.take().unwrap_or(DmError::Cancelled);
                let completion = self.completion(state, Some(error));
                self.inner.events.publish(DownloadEvent::Completed(completion));
            }
            DownloadStatus::Completed => {
                let completion = self.completion(state, None);
                info!(
                    path = %self.inner.destination.display(),
                    size = completion.downloaded,
                    elapsed = ?completion.elapsed,
                    "Download completed"
                );
                self.inner.events.publish(DownloadEvent::Completed(completion));
            }
            _ => {}
        }
        true
    }

    fn completion(&self, state: &JobState, error: Option<DmError>) -> Completion {
        Completion {
            downloaded: self.downloaded_bytes(),
            total_size: state.total_size,
            elapsed: Self::elapsed_locked(state),
            path: error.is_none().then(|| self.inner.destination.clone()),
            error,
        }
    }

    /// Re-derives the job status after a segment changed
    fn refresh_status(&self) {
        let mut state = self.inner.state.lock();
        let statuses = self.segment_statuses();
        let mut next = aggregate_status(&statuses, state.status);

        // completed and canceled segments mixed under a cancel
        if next == DownloadStatus::Canceling && statuses.iter().all(|s| s.is_terminal()) {
            next = DownloadStatus::Canceled;
        }

        if next != state.status {
            debug!(url = %self.inner.url, segments = ?statuses, "Segment statuses aggregated");
        }
        self.set_status(&mut state, next);
    }

    /// Publishes job progress, at most once per `progress_update_interval`
    fn refresh_progress(&self) {
        let now = Instant::now();
        let moved = self.downloaded_bytes() + self.cached_bytes();

        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            return;
        }
        if let Some(last) = state.last_progress {
            if now.saturating_duration_since(last) < self.inner.config.progress_update_interval {
                return;
            }
        }
        state.last_progress = Some(now);

        let speed = state.speed.sample(now, moved);
        state.last_speed = speed;
        let progress = Progress::new(moved, state.total_size, speed);
        trace!(
            received = moved,
            total = state.total_size,
            speed,
            "Download progress"
        );
        self.inner.events.publish(DownloadEvent::Progress(progress));
    }

    /// Turns a segment failure into a whole-job cancel carrying the error
    fn segment_failed(&self, index: usize, error: DmError) {
        {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() || state.status == DownloadStatus::Canceling {
                return;
            }
            error!(url = %self.inner.url, segment = index, error = %error, "Segment failed, canceling download");
            state.pending_error = Some(error);
        }
        self.cancel();
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("url", &self.inner.url.as_str())
            .field("destination", &self.inner.destination)
            .field("status", &self.status())
            .finish()
    }
}

/// Folds segment events into job events until the job ends or is dropped
async fn supervise(job: Weak<Inner>, mut events: mpsc::UnboundedReceiver<SegmentEvent>) {
    while let Some(SegmentEvent { index, event }) = events.recv().await {
        let Some(inner) = job.upgrade() else {
            break;
        };
        let downloader = Downloader { inner };

        match event {
            DownloadEvent::StatusChanged(_) => downloader.refresh_status(),
            DownloadEvent::Progress(_) => downloader.refresh_progress(),
            DownloadEvent::Completed(completion) => match completion.error {
                Some(error) if !error.is_cancelled() => downloader.segment_failed(index, error),
                _ => {}
            },
        }

        if downloader.status().is_terminal() {
            break;
        }
    }
}
