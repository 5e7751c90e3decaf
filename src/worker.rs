//! Segment worker: transfers one byte range of a job into the shared file
//!
//! The transfer loop reads `buffer_size` bytes at a time into an in-memory
//! cache and flushes the cache to the segment's offset whenever it would
//! overflow, when the body ends, or when a pause or cancel was requested.
//! Pause and cancel only take effect at those flush boundaries, so the file
//! always agrees with `downloaded_bytes` and a resume continues from there.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use crate::config::DownloadConfig;
use crate::error::{DmError, DmResult};
use crate::event::{Completion, DownloadEvent, Notifier, SegmentEvent};
use crate::http::HttpClient;
use crate::progress::{Progress, SpeedMeter};
use crate::segment::Segment;
use crate::status::DownloadStatus;
use crate::storage::write_at_async;

#[derive(Debug)]
struct WorkerState {
    status: DownloadStatus,
    /// A transfer task has been spawned and has not exited yet
    running: bool,
    used_time: Duration,
    last_start: Option<Instant>,
    speed: SpeedMeter,
}

/// Owns one [`Segment`] of a job and moves its bytes from the server to disk
pub struct SegmentWorker {
    segment: Segment,
    /// Resource offset of file byte 0, non-zero when a sub-range was requested
    origin: u64,
    /// Whether range requests carry an upper bound
    bounded: bool,
    url: Url,
    path: PathBuf,
    client: HttpClient,
    config: Arc<DownloadConfig>,
    downloaded: AtomicU64,
    cached: AtomicU64,
    state: Mutex<WorkerState>,
    events: Notifier<SegmentEvent>,
}

impl SegmentWorker {
    pub fn new(
        segment: Segment,
        origin: u64,
        bounded: bool,
        url: Url,
        path: PathBuf,
        client: HttpClient,
        config: Arc<DownloadConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            segment,
            origin,
            bounded,
            url,
            path,
            client,
            config,
            downloaded: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            state: Mutex::new(WorkerState {
                status: DownloadStatus::Initialized,
                running: false,
                used_time: Duration::ZERO,
                last_start: None,
                speed: SpeedMeter::new(Instant::now(), 0),
            }),
            events: Notifier::new(),
        })
    }

    pub fn index(&self) -> usize {
        self.segment.index
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.lock().status
    }

    /// Bytes flushed to disk
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Bytes read but still held in memory
    pub fn cached_bytes(&self) -> u64 {
        self.cached.load(Ordering::SeqCst)
    }

    pub fn total_size(&self) -> u64 {
        self.segment.size()
    }

    fn moved_bytes(&self) -> u64 {
        self.downloaded_bytes() + self.cached_bytes()
    }

    /// Active transfer time, including the current run while downloading
    pub fn elapsed(&self) -> Duration {
        let state = self.state.lock();
        Self::elapsed_locked(&state)
    }

    fn elapsed_locked(state: &WorkerState) -> Duration {
        state.used_time + state.last_start.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SegmentEvent> {
        self.events.subscribe()
    }

    pub(crate) fn attach(&self, tx: mpsc::UnboundedSender<SegmentEvent>) {
        self.events.attach(tx);
    }

    /// Starts the first transfer; only legal from `Initialized`
    pub fn start(self: &Arc<Self>) -> DmResult<()> {
        self.launch("start", DownloadStatus::Initialized)
    }

    /// Restarts a paused transfer from `start + downloaded_bytes`
    pub fn resume(self: &Arc<Self>) -> DmResult<()> {
        self.launch("resume", DownloadStatus::Paused)
    }

    fn launch(self: &Arc<Self>, operation: &'static str, from: DownloadStatus) -> DmResult<()> {
        self.config.validate()?;

        {
            let mut state = self.state.lock();
            if state.status != from {
                return Err(DmError::invalid_state(operation, state.status));
            }
            state.running = true;
            self.set_status(&mut state, DownloadStatus::Waiting);
        }

        tokio::spawn(self.clone().run());
        Ok(())
    }

    /// Asks the loop to flush and stop at its next iteration
    ///
    /// A worker that is still waiting for its task to run pauses as soon as
    /// the task picks it up, without sending a request.
    pub fn pause(&self) -> DmResult<()> {
        let mut state = self.state.lock();
        if !matches!(
            state.status,
            DownloadStatus::Waiting | DownloadStatus::Downloading
        ) {
            return Err(DmError::invalid_state("pause", state.status));
        }
        self.set_status(&mut state, DownloadStatus::Pausing);
        Ok(())
    }

    /// Cancels immediately when nothing is in flight, otherwise at the next flush
    ///
    /// A completed segment stays completed.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if state.status == DownloadStatus::Completed {
            return;
        }
        if state.status.is_quiescent() || !state.running {
            self.set_status(&mut state, DownloadStatus::Canceled);
        } else if state.status != DownloadStatus::Canceling {
            self.set_status(&mut state, DownloadStatus::Canceling);
        }
    }

    /// Applies a transition, publishing it only if the status really changed
    fn set_status(&self, state: &mut WorkerState, status: DownloadStatus) -> bool {
        if state.status == status {
            return false;
        }
        let previous = std::mem::replace(&mut state.status, status);
        debug!(
            segment = self.segment.index,
            from = %previous,
            to = %status,
            "Segment status changed"
        );

        self.publish(DownloadEvent::StatusChanged(status));
        match status {
            DownloadStatus::Canceled => {
                let completion = self.completion(state, Some(DmError::Cancelled));
                self.publish(DownloadEvent::Completed(completion));
            }
            DownloadStatus::Completed => {
                let completion = self.completion(state, None);
                self.publish(DownloadEvent::Completed(completion));
            }
            _ => {}
        }
        true
    }

    fn completion(&self, state: &WorkerState, error: Option<DmError>) -> Completion {
        Completion {
            downloaded: self.downloaded_bytes(),
            total_size: self.total_size(),
            elapsed: Self::elapsed_locked(state),
            path: error.is_none().then(|| self.path.clone()),
            error,
        }
    }

    fn publish(&self, event: DownloadEvent) {
        self.events.publish(SegmentEvent {
            index: self.segment.index,
            event,
        });
    }

    async fn run(self: Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status != DownloadStatus::Waiting {
                // paused or canceled before the task got going
                state.running = false;
                if state.status == DownloadStatus::Pausing {
                    self.set_status(&mut state, DownloadStatus::Paused);
                }
                return;
            }
            let now = Instant::now();
            state.last_start = Some(now);
            state.speed.reset(now, self.moved_bytes());
            self.set_status(&mut state, DownloadStatus::Downloading);
        }

        if let Err(error) = self.transfer().await {
            self.fail(error);
        }
    }

    async fn transfer(&self) -> DmResult<()> {
        let offset = self.segment.start + self.downloaded_bytes();
        if offset > self.segment.end {
            self.finish();
            return Ok(());
        }

        let end = self.bounded.then(|| self.origin + self.segment.end);
        let mut body = self
            .client
            .open_range(&self.url, self.origin + offset, end)
            .await?;
        debug!(segment = self.segment.display(), offset, "Segment transfer started");

        let buffer_size = self.config.buffer_size;
        let max_cache_size = self.config.max_cache_size;
        let mut cache = BytesMut::with_capacity(max_cache_size);
        let mut reads = 0usize;

        loop {
            let mut data = body.read(buffer_size).await?;

            // never write past the segment, even if the server sends more
            let room = self
                .segment
                .size()
                .saturating_sub(self.downloaded_bytes() + cache.len() as u64);
            if data.len() as u64 > room {
                data.truncate(room as usize);
            }

            let exhausted = data.is_empty();
            let stopping = exhausted || self.status() != DownloadStatus::Downloading;
            if stopping || cache.len() + data.len() > max_cache_size {
                self.flush(&mut cache).await?;
                if exhausted && self.downloaded_bytes() < self.segment.size() {
                    return Err(DmError::IncompleteBody {
                        expected: self.segment.size(),
                        received: self.downloaded_bytes(),
                    });
                }
                if stopping {
                    break;
                }
            }

            cache.extend_from_slice(&data);
            self.cached.store(cache.len() as u64, Ordering::SeqCst);

            reads += 1;
            if reads == self.config.notify_every_n_buffers {
                self.notify_progress();
                reads = 0;
            }
        }

        self.finish();
        Ok(())
    }

    /// Writes the cache at `start + downloaded` and empties it
    async fn flush(&self, cache: &mut BytesMut) -> DmResult<()> {
        if cache.is_empty() {
            return Ok(());
        }

        let data = Bytes::copy_from_slice(&cache[..]);
        let len = data.len() as u64;
        let offset = self.segment.start + self.downloaded_bytes();

        write_at_async(self.path.clone(), offset, data).await?;

        self.downloaded.fetch_add(len, Ordering::SeqCst);
        self.cached.store(0, Ordering::SeqCst);
        cache.clear();

        trace!(
            segment = self.segment.index,
            offset,
            bytes = len,
            downloaded = self.downloaded_bytes(),
            "Segment cache flushed"
        );
        Ok(())
    }

    fn notify_progress(&self) {
        let moved = self.moved_bytes();
        let speed = self.state.lock().speed.sample(Instant::now(), moved);
        self.publish(DownloadEvent::Progress(Progress::new(
            moved,
            self.total_size(),
            speed,
        )));
    }

    /// Resolves the status after a clean loop exit
    fn finish(&self) {
        let mut state = self.state.lock();
        if let Some(started) = state.last_start.take() {
            state.used_time += started.elapsed();
        }
        state.running = false;

        let next = match state.status {
            DownloadStatus::Pausing => DownloadStatus::Paused,
            DownloadStatus::Canceling => DownloadStatus::Canceled,
            _ => DownloadStatus::Completed,
        };
        debug!(
            segment = self.segment.index,
            downloaded = self.downloaded_bytes(),
            status = %next,
            "Segment transfer stopped"
        );
        self.set_status(&mut state, next);
    }

    /// Reports a transport or storage failure, leaving the status unresolved
    ///
    /// A cancel that was already requested still resolves to `Canceled`.
    fn fail(&self, error: DmError) {
        error!(
            segment = self.segment.display(),
            downloaded = self.downloaded_bytes(),
            error = %error,
            "Segment transfer failed"
        );

        let mut state = self.state.lock();
        if let Some(started) = state.last_start.take() {
            state.used_time += started.elapsed();
        }
        state.running = false;
        self.cached.store(0, Ordering::SeqCst);

        if state.status == DownloadStatus::Canceling {
            self.set_status(&mut state, DownloadStatus::Canceled);
            return;
        }

        let completion = self.completion(&state, Some(error));
        self.publish(DownloadEvent::Completed(completion));
    }
}

impl std::fmt::Debug for SegmentWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWorker")
            .field("segment", &self.segment)
            .field("status", &self.status())
            .field("downloaded", &self.downloaded_bytes())
            .field("cached", &self.cached_bytes())
            .finish()
    }
}
