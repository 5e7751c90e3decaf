//! Notifications published by segment workers and download jobs
//!
//! Every subscriber gets its own unbounded channel, so each one receives
//! every event in publish order and a slow subscriber never drops events.

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::DmError;
use crate::progress::Progress;
use crate::status::DownloadStatus;

/// Final report of a job or segment reaching a terminal state or failing
#[derive(Debug, Clone)]
pub struct Completion {
    /// Bytes flushed to disk
    pub downloaded: u64,
    /// Total size in bytes
    pub total_size: u64,
    /// Active transfer time
    pub elapsed: Duration,
    /// Destination file, set on a clean completion
    pub path: Option<PathBuf>,
    /// Why the transfer ended early, `None` on a clean completion
    pub error: Option<DmError>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    StatusChanged(DownloadStatus),
    Progress(Progress),
    Completed(Completion),
}

/// An event raised by the segment worker at `index`
#[derive(Debug, Clone)]
pub struct SegmentEvent {
    pub index: usize,
    pub event: DownloadEvent,
}

/// Fan-out of events to any number of subscribers
#[derive(Debug)]
pub struct Notifier<E> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> Notifier<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber that sees every event published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attach(tx);
        rx
    }

    pub(crate) fn attach(&self, tx: mpsc::UnboundedSender<E>) {
        self.subscribers.lock().push(tx);
    }

    /// Sends the event to every live subscriber, forgetting closed ones
    pub(crate) fn publish(&self, event: E) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E: Clone> Default for Notifier<E> {
    fn default() -> Self {
        Self::new()
    }
}
