//! Utility functions for the segmented downloader
//!
//! This module provides helper functions for URL parsing, HTTP client creation,
//! response header parsing and human-readable formatting.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH, USER_AGENT};
use url::Url;

use crate::config::DownloadConfig;
use crate::error::{DmError, DmResult};

/// Creates an HTTP client with the specified configuration
pub(crate) fn create_client(config: &DownloadConfig) -> DmResult<reqwest::Client> {
    let mut headers = HeaderMap::new();

    // Set user agent
    if let Ok(value) = HeaderValue::from_str(&config.user_agent) {
        headers.insert(USER_AGENT, value);
    }

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(config.connection_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(config.max_threads.max(20))
        .http1_only()
        .tcp_keepalive(Duration::from_secs(60))
        .danger_accept_invalid_certs(!config.verify_ssl)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    builder = match &config.proxy {
        Some(proxy) => {
            let proxy = reqwest::Proxy::all(proxy.as_str()).map_err(|e| {
                DmError::config(format!("invalid proxy {}: {}", proxy, e))
            })?;
            builder.proxy(proxy)
        }
        // no proxy configured means direct connections, whatever the environment says
        None => builder.no_proxy(),
    };

    builder.build().map_err(DmError::from)
}

/// Parses the Content-Length header
pub(crate) fn parse_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Pulls the quoted `filename="..."` attribute out of a Content-Disposition header
pub(crate) fn parse_content_disposition(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    filename_from_disposition(value)
}

fn filename_from_disposition(value: &str) -> Option<String> {
    const MARKER: &str = "filename=\"";

    // the attribute only counts after the disposition type
    let (_, params) = value.split_once(';')?;
    let start = params.find(MARKER)? + MARKER.len();
    let rest = &params[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string()).filter(|name| !name.is_empty())
}

const SIZE_UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];

fn format_bytes_with_unit(bytes: u64) -> (f64, usize) {
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < SIZE_UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    (size, unit_index)
}

/// Formats a size in bytes to a human-readable string
pub fn format_size(size: u64) -> String {
    let (scaled, unit_index) = format_bytes_with_unit(size);
    if unit_index == 0 {
        return format!("{} {}", size, SIZE_UNITS[0]);
    }
    format!("{:.2} {}", scaled, SIZE_UNITS[unit_index])
}

/// Formats speed in bytes per second; a stalled transfer shows nothing
pub fn format_speed(speed: u64) -> String {
    if speed == 0 {
        return String::new();
    }
    let (scaled, unit_index) = format_bytes_with_unit(speed);
    if unit_index == 0 {
        return format!("{} {}/s", speed, SIZE_UNITS[0]);
    }
    format!("{:.2} {}/s", scaled, SIZE_UNITS[unit_index])
}

/// Formats a duration as `HH:MM:SS`; hours keep growing past 99
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

/// Validates a URL
pub(crate) fn validate_url(url: &str) -> DmResult<Url> {
    match Url::parse(url) {
        Ok(url) => {
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(DmError::InvalidUrl(format!(
                    "Unsupported scheme: {}",
                    url.scheme()
                )));
            }
            Ok(url)
        }
        Err(e) => Err(DmError::InvalidUrl(e.to_string())),
    }
}

/// Extracts the filename from a URL
pub fn extract_filename(url: &Url) -> Option<String> {
    url.path_segments()?
        .next_back()
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}
