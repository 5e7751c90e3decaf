//! Progress tracking module for the segmented downloader
//!
//! This module provides the progress snapshot published to subscribers and
//! the speed algorithm shared by segment workers and the orchestrator.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Samples spaced this far apart are too sparse to yield a meaningful speed
pub const STALE_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Represents the current progress of a segment or a whole job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes moved so far, flushed plus cached
    received: u64,
    /// Total size in bytes
    total_size: u64,
    /// Current download speed in bytes per second
    speed: u64,
}

impl Progress {
    pub fn new(received: u64, total_size: u64, speed: u64) -> Self {
        Self {
            received,
            total_size,
            speed,
        }
    }

    /// Returns the percentage of the download that has been completed
    pub fn percentage(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.received as f64 / self.total_size as f64) * 100.0
    }

    /// Returns the number of bytes received so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Returns the total size in bytes
    pub fn total(&self) -> u64 {
        self.total_size
    }

    /// Returns the current download speed in bytes per second
    pub fn speed(&self) -> u64 {
        self.speed
    }

    /// Returns the estimated time remaining in seconds
    pub fn eta(&self) -> Option<u64> {
        if self.speed == 0 {
            return None;
        }
        Some(self.total_size.saturating_sub(self.received) / self.speed)
    }
}

/// Computes speed between consecutive notifications
///
/// Remembers the time and byte count of the last sample. A new sample yields
/// `floor(delta_bytes / interval_seconds)`, or 0 when the interval reached
/// [`STALE_SAMPLE_INTERVAL`]. Both trackers move forward on every sample.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    last_time: Instant,
    last_bytes: u64,
}

impl SpeedMeter {
    pub fn new(now: Instant, bytes: u64) -> Self {
        Self {
            last_time: now,
            last_bytes: bytes,
        }
    }

    /// Restarts measurement, e.g. when a transfer resumes after a pause
    pub fn reset(&mut self, now: Instant, bytes: u64) {
        self.last_time = now;
        self.last_bytes = bytes;
    }

    /// Records a sample and returns the speed in bytes per second
    pub fn sample(&mut self, now: Instant, bytes: u64) -> u64 {
        let interval = now.saturating_duration_since(self.last_time);
        let delta = bytes.saturating_sub(self.last_bytes);

        let speed = if interval >= STALE_SAMPLE_INTERVAL || interval.is_zero() {
            0
        } else {
            (delta as f64 / interval.as_secs_f64()).floor() as u64
        };

        trace!(
            interval_ms = interval.as_millis() as u64,
            delta,
            speed,
            "Speed sample taken"
        );

        self.last_time = now;
        self.last_bytes = bytes;
        speed
    }
}
