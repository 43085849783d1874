//! HTTP utilities
//!
//! Single-request building blocks for transfers: probing a remote asset and
//! streaming one response body into a partial file. Retry, splitting and
//! resume bookkeeping live in [`crate::downloader::chunked`].

use futures::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{FileOperation, HarvestError, Result};
use super::files::{existing_size, url_hint};

/// What a HEAD request told us about a remote asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteInfo {
    pub size: Option<u64>,
    pub accepts_ranges: bool,
}

impl RemoteInfo {
    pub fn unknown() -> Self {
        Self::default()
    }
}

/// Result of one sequential fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequentialFetch {
    /// Bytes in the partial file afterwards
    pub size: u64,
    /// Server ignored the range request and the file was rewritten from zero
    pub restarted: bool,
}

/// HTTP client wrapper with streaming-to-file helpers
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    timeout_secs: u64,
}

impl HttpClient {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout_secs: timeout.as_secs(),
        }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// HEAD the asset for its size and range support
    ///
    /// Headers are read directly because `content_length()` is unreliable on HEAD responses.
    pub async fn probe(&self, url: &str) -> Result<RemoteInfo> {
        debug!("Probing {}", url_hint(url));
        let response = self.client.head(url).send().await
            .map_err(|e| HarvestError::from_reqwest(url, e, self.timeout_secs))?;

        if !response.status().is_success() {
            return Err(HarvestError::from_status(url, response.status(), None));
        }

        let headers = response.headers();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        Ok(RemoteInfo { size, accepts_ranges })
    }

    /// Fetch `[offset of temp_path, end)` and append it to `temp_path`
    ///
    /// `counter` is kept equal to the bytes present in the partial file.
    pub async fn fetch_sequential(
        &self,
        url: &str,
        temp_path: &Path,
        total: Option<u64>,
        counter: &AtomicU64,
        cancel: &CancellationToken,
    ) -> Result<SequentialFetch> {
        let offset = existing_size(temp_path).await?.unwrap_or(0);
        counter.store(offset, Ordering::Relaxed);

        if offset > 0 && total == Some(offset) {
            debug!("Partial file already holds all {} bytes", offset);
            return Ok(SequentialFetch { size: offset, restarted: false });
        }

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
            debug!("Requesting range: bytes={}-", offset);
        }

        let response = request.send().await
            .map_err(|e| HarvestError::from_reqwest(url, e, self.timeout_secs))?;
        let status = response.status();

        let (mut file, start, restarted) = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(temp_path)
                    .await
                    .map_err(|e| HarvestError::file_system(temp_path, FileOperation::Write, e))?;
                (file, offset, false)
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                let remote_total = total_from_content_range(&response);
                if remote_total == Some(offset) {
                    return Ok(SequentialFetch { size: offset, restarted: false });
                }
                warn!("Range {}- not satisfiable for {}; discarding partial file", offset, url_hint(url));
                fs::remove_file(temp_path).await
                    .map_err(|e| HarvestError::file_system(temp_path, FileOperation::Delete, e))?;
                return Err(HarvestError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            s if s.is_success() => {
                if offset > 0 {
                    warn!("Server ignored range request for {}; restarting from zero", url_hint(url));
                }
                let file = File::create(temp_path).await
                    .map_err(|e| HarvestError::file_system(temp_path, FileOperation::Create, e))?;
                counter.store(0, Ordering::Relaxed);
                (file, 0, offset > 0)
            }
            s => return Err(HarvestError::from_status(url, s, None)),
        };

        let written = self
            .pump(url, response, &mut file, temp_path, None, cancel, |n| {
                counter.fetch_add(n, Ordering::Relaxed);
            })
            .await?;

        Ok(SequentialFetch {
            size: start + written,
            restarted,
        })
    }

    /// Fetch the inclusive range `[cursor, end]` into its own offset of `part_path`
    ///
    /// `on_bytes` is called after every chunk has been handed to the file.
    pub async fn fetch_segment<F>(
        &self,
        url: &str,
        part_path: &Path,
        cursor: u64,
        end: u64,
        cancel: &CancellationToken,
        on_bytes: F,
    ) -> Result<u64>
    where
        F: FnMut(u64),
    {
        let response = self.client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", cursor, end))
            .send()
            .await
            .map_err(|e| HarvestError::from_reqwest(url, e, self.timeout_secs))?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            s if s.is_success() => {
                return Err(HarvestError::RangeIgnored { url: url.to_string() });
            }
            s => return Err(HarvestError::from_status(url, s, None)),
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(part_path)
            .await
            .map_err(|e| HarvestError::file_system(part_path, FileOperation::Write, e))?;
        file.seek(SeekFrom::Start(cursor)).await
            .map_err(|e| HarvestError::file_system(part_path, FileOperation::Write, e))?;

        let limit = end - cursor + 1;
        let written = self.pump(url, response, &mut file, part_path, Some(limit), cancel, on_bytes).await?;
        if written < limit {
            return Err(HarvestError::UnexpectedResponse {
                url: url.to_string(),
                reason: format!("range {}-{} ended after {} of {} bytes", cursor, end, written, limit),
            });
        }
        Ok(written)
    }

    /// Stream a response body into `file`, never writing more than `limit` bytes
    ///
    /// The file is flushed on every exit path, so bytes reported through
    /// `on_bytes` are on disk when this returns.
    #[allow(clippy::too_many_arguments)]
    async fn pump<F>(
        &self,
        url: &str,
        response: reqwest::Response,
        file: &mut File,
        path: &Path,
        limit: Option<u64>,
        cancel: &CancellationToken,
        mut on_bytes: F,
    ) -> Result<u64>
    where
        F: FnMut(u64),
    {
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        let outcome: Result<()> = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };

            let chunk = match next {
                None => {
                    break Err(HarvestError::Cancelled {
                        reason: format!("transfer of {} interrupted", url_hint(url)),
                    });
                }
                Some(None) => break Ok(()),
                Some(Some(Err(e))) => break Err(HarvestError::from_reqwest(url, e, self.timeout_secs)),
                Some(Some(Ok(chunk))) => chunk,
            };

            let mut bytes = &chunk[..];
            if let Some(limit) = limit {
                let room = limit.saturating_sub(written);
                if bytes.len() as u64 > room {
                    bytes = &bytes[..room as usize];
                }
            }

            if let Err(e) = file.write_all(bytes).await {
                break Err(HarvestError::file_system(path, FileOperation::Write, e));
            }
            written += bytes.len() as u64;
            on_bytes(bytes.len() as u64);

            if limit.is_some_and(|limit| written >= limit) {
                break Ok(());
            }
        };

        file.flush().await
            .map_err(|e| HarvestError::file_system(path, FileOperation::Write, e))?;
        outcome.map(|_| written)
    }
}

/// Total size from a `Content-Range: bytes a-b/N` or `bytes */N` header
fn total_from_content_range(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|v| v.trim().parse().ok())
}
