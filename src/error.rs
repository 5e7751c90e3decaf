//! Error handling module for the segmented downloader
//!
//! This module defines the error kinds a download job can run into: bad
//! configuration, missing resources, destination conflicts, transport and
//! storage failures, and illegal lifecycle calls.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::status::DownloadStatus;

pub type DmResult<T> = std::result::Result<T, DmError>;

/// Represents errors that can occur while probing, preparing or transferring
///
/// Errors are `Clone` so one failure can be both returned to the caller and
/// carried by completion notifications.
#[derive(Error, Debug, Clone)]
pub enum DmError {
    /// Invalid buffer, cache, thread or range settings
    #[error("Bad configuration: {0}")]
    Config(String),

    /// The probe reported an empty or missing resource
    #[error("The file to download does not exist")]
    ResourceMissing,

    /// File preparation was asked to reserve zero bytes
    #[error("Nothing to download")]
    NothingToDownload,

    /// A file already sits at the destination with a different length
    #[error("File conflict at {path}: expected {expected} bytes, found {actual} bytes")]
    FileConflict {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Error occurred during HTTP request/response
    #[error("HTTP error: {0}")]
    HttpError(Arc<reqwest::Error>),

    /// Server returned an error status code
    #[error("Server error: {status} {message}")]
    ServerError { status: u16, message: String },

    /// Server answered a resumed range request with the whole body
    #[error("Server ignored the range request starting at byte {offset}")]
    RangeIgnored { offset: u64 },

    /// The response ended before the segment was filled
    #[error("Response ended early: received {received} of {expected} bytes")]
    IncompleteBody { expected: u64, received: u64 },

    /// A single read from the response stream took too long
    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    /// Error occurred during I/O operations
    #[error("I/O error: {0}")]
    IoError(Arc<io::Error>),

    /// Insufficient disk space
    #[error("Insufficient disk space: need {needed} bytes, available {available} bytes")]
    InsufficientDiskSpace { needed: u64, available: u64 },

    /// Invalid URL provided
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A lifecycle operation was called from a status that does not allow it
    #[error("Cannot {operation} a download that is {status}")]
    InvalidState {
        operation: &'static str,
        status: DownloadStatus,
    },

    /// Download was cancelled by the user
    #[error("Downloading is canceled by user's request")]
    Cancelled,

    /// Other unexpected errors
    #[error("Unexpected error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for DmError {
    fn from(error: reqwest::Error) -> Self {
        Self::HttpError(Arc::new(error))
    }
}

impl From<io::Error> for DmError {
    fn from(error: io::Error) -> Self {
        Self::IoError(Arc::new(error))
    }
}

impl DmError {
    /// Returns true if the error came from the network side of a transfer
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::HttpError(_)
                | Self::ServerError { .. }
                | Self::RangeIgnored { .. }
                | Self::IncompleteBody { .. }
                | Self::Timeout(_)
        )
    }

    /// Returns true if the error is related to user cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Creates a new server error
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn invalid_state(operation: &'static str, status: DownloadStatus) -> Self {
        Self::InvalidState { operation, status }
    }
}
