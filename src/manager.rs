//! The set of jobs a user works with, plus a current selection
//!
//! Lifecycle calls on the manager are forwarded to the selected job.

use parking_lot::RwLock;

use crate::config::DownloadConfig;
use crate::downloader::{DownloadRequest, Downloader};
use crate::error::DmResult;

#[derive(Debug, Default)]
struct Jobs {
    downloads: Vec<Downloader>,
    current: Option<usize>,
}

/// The main entry point for managing several downloads.
///
/// # Examples
///
/// ```no_run
/// use segdl_core::{DmResult, DownloadConfig, DownloadManager, DownloadRequest};
///
/// #[tokio::main]
/// async fn main() -> DmResult<()> {
///     let manager = DownloadManager::new(DownloadConfig::new().with_threads(4));
///
///     let index = manager.add(DownloadRequest::new(
///         "https://example.com/large-file.zip",
///         "./downloads/large-file.zip",
///     ))?;
///     manager.select(index);
///
///     manager.download().await?;
///     manager.pause()?;
///     manager.resume()?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Default)]
pub struct DownloadManager {
    config: DownloadConfig,
    jobs: RwLock<Jobs>,
}

impl DownloadManager {
    /// Creates an empty manager whose jobs use `config`
    pub fn new(config: DownloadConfig) -> Self {
        Self {
            config,
            jobs: RwLock::new(Jobs::default()),
        }
    }

    /// Creates a job from `request` with the manager's configuration
    pub fn add(&self, request: DownloadRequest) -> DmResult<usize> {
        let downloader = Downloader::new(request, self.config.clone())?;
        Ok(self.add_downloader(downloader))
    }

    /// Adds an existing job and returns its index
    pub fn add_downloader(&self, downloader: Downloader) -> usize {
        let mut jobs = self.jobs.write();
        debug!(url = %downloader.url(), index = jobs.downloads.len(), "Job added");
        jobs.downloads.push(downloader);
        jobs.downloads.len() - 1
    }

    /// Removes the job at `index`, canceling it
    ///
    /// The selection follows the job it pointed at; removing the selected
    /// job clears it.
    pub fn remove(&self, index: usize) -> Option<Downloader> {
        let mut jobs = self.jobs.write();
        if index >= jobs.downloads.len() {
            return None;
        }
        let downloader = jobs.downloads.remove(index);
        jobs.current = match jobs.current {
            Some(current) if current == index => None,
            Some(current) if current > index => Some(current - 1),
            other => other,
        };
        drop(jobs);

        downloader.cancel();
        debug!(url = %downloader.url(), index, "Job removed");
        Some(downloader)
    }

    /// Selects the job at `index`; returns false if there is none
    pub fn select(&self, index: usize) -> bool {
        let mut jobs = self.jobs.write();
        if index >= jobs.downloads.len() {
            return false;
        }
        jobs.current = Some(index);
        true
    }

    pub fn current(&self) -> Option<Downloader> {
        let jobs = self.jobs.read();
        jobs.current.and_then(|i| jobs.downloads.get(i).cloned())
    }

    pub fn current_index(&self) -> Option<usize> {
        self.jobs.read().current
    }

    pub fn get(&self, index: usize) -> Option<Downloader> {
        self.jobs.read().downloads.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles to every job, in insertion order
    pub fn downloads(&self) -> Vec<Downloader> {
        self.jobs.read().downloads.clone()
    }

    /// Starts the selected job.
    ///
    /// Returns false if no job is selected.
    pub async fn download(&self) -> DmResult<bool> {
        match self.current() {
            Some(downloader) => downloader.download().await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Pauses the selected job.
    ///
    /// Returns false if no job is selected.
    pub fn pause(&self) -> DmResult<bool> {
        match self.current() {
            Some(downloader) => downloader.pause().map(|_| true),
            None => Ok(false),
        }
    }

    /// Resumes the selected job.
    ///
    /// Returns false if no job is selected.
    pub fn resume(&self) -> DmResult<bool> {
        match self.current() {
            Some(downloader) => downloader.resume().map(|_| true),
            None => Ok(false),
        }
    }

    /// Cancels the selected job.
    ///
    /// Returns false if no job is selected.
    pub fn cancel(&self) -> bool {
        match self.current() {
            Some(downloader) => {
                downloader.cancel();
                true
            }
            None => false,
        }
    }
}
