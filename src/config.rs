//! Configuration module for the segmented downloader
//!
//! This module provides configuration options for a download job,
//! including thread count, buffer and cache sizes, notification pacing,
//! timeouts, credentials and proxy settings.

use std::time::Duration;

use crate::error::{DmError, DmResult};

/// HTTP basic-auth credentials sent with every request of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<Option<String>>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Configuration for a download job
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Upper bound on the number of segments transferred concurrently
    pub max_threads: usize,
    /// Bytes requested from the response stream per read
    pub buffer_size: usize,
    /// Bytes a segment keeps in memory before flushing to disk
    pub max_cache_size: usize,
    /// A segment reports progress once every this many reads
    pub notify_every_n_buffers: usize,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Deadline for each individual read from the response stream
    pub read_timeout: Duration,
    /// Minimum spacing between job-level progress notifications
    pub progress_update_interval: Duration,
    /// Whether to follow redirects
    pub follow_redirects: bool,
    /// User agent string
    pub user_agent: String,
    /// Whether to verify SSL certificates
    pub verify_ssl: bool,
    /// Basic-auth credentials, if the server needs them
    pub credentials: Option<Credentials>,
    /// Proxy URL used for every request; `None` connects directly
    pub proxy: Option<String>,
    /// Whether to check free disk space before reserving the destination
    pub check_disk_space: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self {
            max_threads: cores * 2,
            buffer_size: 1024,
            max_cache_size: 1024 * 1024, // 1MB
            notify_every_n_buffers: 64,
            connection_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            progress_update_interval: Duration::from_millis(100),
            follow_redirects: true,
            user_agent: format!("segdl/{}", env!("CARGO_PKG_VERSION")),
            verify_ssl: true,
            credentials: None,
            proxy: None,
            check_disk_space: true,
        }
    }
}

impl DownloadConfig {
    /// Creates a new download configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of concurrent segments
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.max_threads = threads.max(1); // Ensure at least one thread
        self
    }

    /// Sets the number of bytes requested per read
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the number of bytes a segment caches before flushing
    pub fn with_max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size;
        self
    }

    /// Sets how many reads happen between two segment progress notifications
    pub fn with_notify_every(mut self, buffers: usize) -> Self {
        self.notify_every_n_buffers = buffers;
        self
    }

    /// Sets the connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets the per-read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the job-level progress notification interval
    pub fn with_progress_update_interval(mut self, interval: Duration) -> Self {
        self.progress_update_interval = interval;
        self
    }

    /// Sets whether to follow redirects
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Sets the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets whether to verify SSL certificates
    pub fn with_verify_ssl(mut self, verify: bool) -> Self {
        self.verify_ssl = verify;
        self
    }

    /// Sets basic-auth credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Routes every request through the given proxy URL
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Sets whether free disk space is checked before preallocation
    pub fn with_disk_space_check(mut self, check: bool) -> Self {
        self.check_disk_space = check;
        self
    }

    /// Checks the sizing knobs before any network activity happens
    pub fn validate(&self) -> DmResult<()> {
        if self.max_threads < 1 {
            return Err(DmError::config("max_threads cannot be less than 1"));
        }
        if self.buffer_size == 0 {
            return Err(DmError::config("buffer_size cannot be 0"));
        }
        if self.max_cache_size < self.buffer_size {
            return Err(DmError::config(format!(
                "max_cache_size ({}) cannot be less than buffer_size ({})",
                self.max_cache_size, self.buffer_size
            )));
        }
        if self.notify_every_n_buffers == 0 {
            return Err(DmError::config("notify_every_n_buffers must be positive"));
        }
        Ok(())
    }
}
