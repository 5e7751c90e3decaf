//! Lifecycle states shared by download jobs and their segments

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a download job or of one of its segments
///
/// `Initialized -> Waiting -> Downloading -> {Pausing -> Paused, Canceling -> Canceled, Completed}`,
/// with `Paused -> Waiting` on resume. `Completed` and `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadStatus {
    Initialized,
    Waiting,
    Downloading,
    Pausing,
    Paused,
    Canceling,
    Canceled,
    Completed,
}

impl DownloadStatus {
    /// No transfer is in flight, so a cancel can take effect immediately
    pub fn is_quiescent(self) -> bool {
        matches!(
            self,
            Self::Initialized | Self::Waiting | Self::Paused | Self::Completed | Self::Canceled
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }

    /// A pause or cancel has been requested but not yet honored
    pub fn is_stopping(self) -> bool {
        matches!(self, Self::Pausing | Self::Canceling)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Derives a job status from the statuses of its segments.
///
/// First matching rule wins: all completed, all canceled, then among the
/// segments that are not completed: all waiting, all paused, otherwise
/// downloading unless a pause or cancel is still in flight. A job that has
/// already reached a terminal status keeps it.
pub fn aggregate_status(segments: &[DownloadStatus], job: DownloadStatus) -> DownloadStatus {
    if segments.is_empty() || job.is_terminal() {
        return job;
    }

    if segments.iter().all(|s| *s == DownloadStatus::Completed) {
        return DownloadStatus::Completed;
    }
    if segments.iter().all(|s| *s == DownloadStatus::Canceled) {
        return DownloadStatus::Canceled;
    }

    let mut unfinished = segments
        .iter()
        .copied()
        .filter(|s| *s != DownloadStatus::Completed)
        .peekable();
    let first = unfinished.peek().copied();
    let uniform = unfinished.all(|s| Some(s) == first);

    match first {
        Some(DownloadStatus::Waiting) if uniform => DownloadStatus::Waiting,
        Some(DownloadStatus::Paused) if uniform => DownloadStatus::Paused,
        _ if job.is_stopping() => job,
        _ => DownloadStatus::Downloading,
    }
}
