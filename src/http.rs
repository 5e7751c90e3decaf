use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::header::{ACCEPT_RANGES, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use url::Url;

use crate::config::DownloadConfig;
use crate::error::{DmError, DmResult};
use crate::utils::{create_client, extract_filename, parse_content_disposition, parse_content_length};

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Handles HTTP operations for probing and downloading
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    config: Arc<DownloadConfig>,
}

impl HttpClient {
    pub fn new(config: Arc<DownloadConfig>) -> DmResult<Self> {
        debug!("Creating new HTTP client with config: {:?}", config);
        let client = create_client(config.as_ref())?;
        Ok(Self { client, config })
    }

    fn get(&self, url: &Url) -> RequestBuilder {
        let request = self.client.get(url.clone());
        match &self.config.credentials {
            Some(credentials) => {
                request.basic_auth(&credentials.username, credentials.password.as_ref())
            }
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, url: &Url) -> DmResult<Response> {
        let response = request.send().await.map_err(|e| {
            error!(error = %e, url = %url, "Failed to send request");
            DmError::from(e)
        })?;

        if !response.status().is_success() {
            warn!(
                status = %response.status(),
                url = %url,
                "Request failed with non-success status"
            );
            return Err(DmError::server_error(
                response.status().as_u16(),
                response.status().to_string(),
            ));
        }
        Ok(response)
    }

    /// Discovers size, range support and a suggested filename
    ///
    /// Only response headers are read. When ranges are supported and a
    /// sub-range was requested, a second request for exactly that range
    /// decides the size to download.
    pub async fn probe(&self, url: &Url, start: u64, end: Option<u64>) -> DmResult<ProbeInfo> {
        debug!(url = %url, "Probing resource");

        let response = self.send(self.get(url), url).await?;
        let headers = response.headers();

        let range_supported = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| !v.trim().eq_ignore_ascii_case("none"))
            .unwrap_or(false);
        let filename = parse_content_disposition(headers).or_else(|| extract_filename(url));
        let mut total_size = parse_content_length(headers).unwrap_or(0);
        drop(response);

        if total_size == 0 {
            warn!(url = %url, "Probe reported no content");
            return Err(DmError::ResourceMissing);
        }

        let (start, end) = if range_supported { (start, end) } else { (0, None) };

        if range_supported && (start != 0 || end.is_some()) {
            let request = self.get(url).header(RANGE, range_header(start, end));
            let response = self.send(request, url).await?;
            total_size = parse_content_length(response.headers()).unwrap_or(0);
            if total_size == 0 {
                warn!(url = %url, start, ?end, "Requested range is empty");
                return Err(DmError::ResourceMissing);
            }
        }

        info!(
            url = %url,
            size = total_size,
            range_supported,
            ?filename,
            "Resource probed"
        );

        Ok(ProbeInfo {
            total_size,
            range_supported,
            start,
            end,
            filename,
        })
    }

    /// Opens a GET for `[offset, end]`, or `[offset, ..)` when `end` is unset
    pub async fn open_range(&self, url: &Url, offset: u64, end: Option<u64>) -> DmResult<BodyReader> {
        let range = range_header(offset, end);
        debug!(url = %url, range = %range, "Sending range request");

        let request = self.get(url).header(RANGE, &range);
        let response = self.send(request, url).await?;

        if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            warn!(url = %url, offset, status = %response.status(), "Server ignored range request");
            return Err(DmError::RangeIgnored { offset });
        }

        Ok(BodyReader::new(
            response.bytes_stream().boxed(),
            self.config.read_timeout,
        ))
    }
}

fn range_header(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={}-{}", start, end),
        None => format!("bytes={}-", start),
    }
}

/// Information about a resource to be downloaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Bytes to download: the whole resource, or the requested range
    pub total_size: u64,
    pub range_supported: bool,
    /// Effective first byte; forced to 0 without range support
    pub start: u64,
    /// Effective last byte; cleared without range support
    pub end: Option<u64>,
    /// From Content-Disposition, else the last URL path segment
    pub filename: Option<String>,
}

/// Reads a response body in pieces of at most a given size
pub struct BodyReader {
    stream: BodyStream,
    pending: Bytes,
    read_timeout: Duration,
}

impl BodyReader {
    fn new(stream: BodyStream, read_timeout: Duration) -> Self {
        Self {
            stream,
            pending: Bytes::new(),
            read_timeout,
        }
    }

    /// Returns up to `max` bytes; an empty result means the body is exhausted
    pub async fn read(&mut self, max: usize) -> DmResult<Bytes> {
        while self.pending.is_empty() {
            match tokio::time::timeout(self.read_timeout, self.stream.next()).await {
                Err(_) => return Err(DmError::Timeout(self.read_timeout)),
                Ok(None) => return Ok(Bytes::new()),
                Ok(Some(chunk)) => self.pending = chunk?,
            }
        }

        let len = max.min(self.pending.len());
        Ok(self.pending.split_to(len))
    }
}
