//! Storage module for the segmented downloader
//!
//! This module reserves the destination file up front and performs the
//! offset writes segments make when they flush their caches. All file
//! access goes through one process-wide lock.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{DmError, DmResult};

/// Size of the zero-filled blocks used to reserve a new file
pub const PREALLOCATION_CHUNK: usize = 4096;

/// Serializes preparation and writes across every job in the process
static FILE_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Validates an existing destination or creates it zero-filled to `expected_size`
///
/// Fails with [`DmError::FileConflict`] when a file of a different length is
/// already there, leaving it untouched.
pub fn prepare_file(path: &Path, expected_size: u64) -> DmResult<()> {
    let _guard = FILE_LOCK.lock();

    if let Ok(metadata) = std::fs::metadata(path) {
        let actual = metadata.len();
        if actual != expected_size {
            warn!(
                path = %path.display(),
                expected = expected_size,
                actual,
                "Destination already holds a file of another size"
            );
            return Err(DmError::FileConflict {
                path: path.to_path_buf(),
                expected: expected_size,
                actual,
            });
        }
        debug!(path = %path.display(), size = actual, "Reusing existing destination file");
        return Ok(());
    }

    if expected_size == 0 {
        return Err(DmError::NothingToDownload);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = File::create(path).map_err(|e| {
        error!(error = %e, path = %path.display(), "Failed to create destination file");
        DmError::from(e)
    })?;

    let zeros = [0u8; PREALLOCATION_CHUNK];
    let mut created = 0u64;
    while created < expected_size {
        let len = (expected_size - created).min(PREALLOCATION_CHUNK as u64) as usize;
        file.write_all(&zeros[..len])?;
        created += len as u64;
    }
    file.flush()?;

    info!(path = %path.display(), size = expected_size, "Destination file reserved");
    Ok(())
}

/// Writes `data` at `offset` of an already reserved file
pub fn write_at(path: &Path, offset: u64, data: &[u8]) -> DmResult<()> {
    let _guard = FILE_LOCK.lock();

    let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
        error!(error = %e, path = %path.display(), "Failed to open destination file");
        DmError::from(e)
    })?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    file.flush()?;

    trace!(path = %path.display(), offset, bytes = data.len(), "Flushed cache to file");
    Ok(())
}

/// Runs [`write_at`] on the blocking pool so async callers never stall the runtime
pub(crate) async fn write_at_async(path: PathBuf, offset: u64, data: Bytes) -> DmResult<()> {
    tokio::task::spawn_blocking(move || write_at(&path, offset, &data))
        .await
        .map_err(|e| DmError::Other(format!("write task failed: {}", e)))?
}

/// Checks there is room for `required_bytes` next to `path`
pub fn check_disk_space(path: &Path, required_bytes: u64) -> DmResult<()> {
    if path.exists() {
        // space is already reserved
        return Ok(());
    }

    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) if parent.exists() => parent.to_path_buf(),
        Some(_) => return Ok(()),
        None => PathBuf::from("."),
    };

    match fs2::available_space(&dir) {
        Ok(available) if available < required_bytes => {
            warn!(
                needed = required_bytes,
                available,
                "Insufficient disk space in destination directory"
            );
            Err(DmError::InsufficientDiskSpace {
                needed: required_bytes,
                available,
            })
        }
        Ok(available) => {
            debug!(available, needed = required_bytes, "Disk space check passed");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Could not determine available space in destination directory");
            Ok(())
        }
    }
}
