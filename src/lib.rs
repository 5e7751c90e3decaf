//! Segdl Core - A segmented HTTP downloader with pause, resume and progress tracking
//!
//! This crate provides functionality for downloading files with the following features:
//! - Splitting a file into byte ranges transferred concurrently into one preallocated file
//! - Pause and resume at flush boundaries, without corrupting written bytes
//! - A single status and progress stream per job, aggregated from its segments
//! - Exactly one completion notification per job, carrying the error if any
//! - A job set with a current selection
//!
//! # Examples
//!
//! ```no_run
//! use segdl_core::{DmResult, DownloadConfig, DownloadRequest, Downloader};
//!
//! #[tokio::main]
//! async fn main() -> DmResult<()> {
//!     let request = DownloadRequest::new("https://example.com/large-file.zip", "./large-file.zip");
//!     let downloader = Downloader::new(request, DownloadConfig::new().with_threads(8))?;
//!
//!     let info = downloader.check().await?;
//!     println!("{:?} is {} bytes", info.filename, info.total_size);
//!
//!     downloader.download().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod downloader;
mod error;
mod event;
mod http;
mod manager;
mod progress;
mod segment;
mod status;
mod storage;
mod utils;
mod worker;

pub use config::{Credentials, DownloadConfig};
pub use downloader::{DownloadRequest, Downloader};
pub use error::{DmError, DmResult};
pub use event::{Completion, DownloadEvent, Notifier, SegmentEvent};
pub use http::{BodyReader, HttpClient, ProbeInfo};
pub use manager::DownloadManager;
pub use progress::{Progress, SpeedMeter, STALE_SAMPLE_INTERVAL};
pub use segment::{partition, Segment};
pub use status::{aggregate_status, DownloadStatus};
pub use storage::{check_disk_space, prepare_file, write_at};
pub use utils::{extract_filename, format_duration, format_size, format_speed};
pub use worker::SegmentWorker;

#[macro_use]
extern crate tracing;
