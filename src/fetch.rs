//! HTTP primitives shared by whole-file transfers, chunk workers and patch
//! fetches: size discovery, range probing and resumable streaming to disk.

use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{header, Client, Response, StatusCode};
use std::io::{self, SeekFrom};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// What a `Range: bytes=0-0` request revealed about the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeProbe {
    pub supported: bool,
    pub total_bytes: Option<u64>,
}

/// Cheap to clone; clones share the connection pool and the rate limiter.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    limiter: Option<Arc<Limiter>>,
    burst: u32,
}

impl Fetcher {
    pub fn new(config: &TransferConfig) -> Self {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        let limit = config.rate_limit.and_then(NonZeroU32::new);
        let limiter = limit.map(|limit| Arc::new(RateLimiter::direct(Quota::per_second(limit))));

        Self {
            client,
            limiter,
            burst: limit.map_or(u32::MAX, NonZeroU32::get),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// `Content-Length` of a HEAD response, if the server gives one.
    ///
    /// A failing HEAD is not fatal; the caller falls back to other sources.
    pub async fn content_length(&self, url: &str, cancel: &CancellationToken) -> TransferResult<Option<u64>> {
        let response = tokio::select! {
            r = self.client.head(url).send() => r,
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        match response {
            Ok(resp) if resp.status().is_success() => Ok(header_u64(&resp, header::CONTENT_LENGTH)),
            Ok(resp) => {
                debug!(url, status = %resp.status(), "HEAD not answered");
                Ok(None)
            }
            Err(e) => {
                debug!(url, error = %e, "HEAD failed");
                Ok(None)
            }
        }
    }

    /// Asks for the first byte. A 206 means byte ranges work.
    pub async fn probe_range(&self, url: &str, cancel: &CancellationToken) -> TransferResult<RangeProbe> {
        let request = self.client.get(url).header(header::RANGE, "bytes=0-0");
        let response = self.send(url, request, cancel).await?;
        let status = response.status();

        if status == StatusCode::PARTIAL_CONTENT {
            let total_bytes = response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .and_then(|range| range.total);
            return Ok(RangeProbe {
                supported: true,
                total_bytes,
            });
        }
        if status.is_success() {
            debug!(url, %status, "server ignores byte ranges");
            return Ok(RangeProbe {
                supported: false,
                total_bytes: header_u64(&response, header::CONTENT_LENGTH),
            });
        }
        Err(TransferError::from_status(url, status))
    }

    /// Streams `url` into `path`, resuming from whatever the file already holds.
    ///
    /// `on_position` receives the absolute file position after every write. A
    /// 416 on a resume or a server that ignores the range restarts from zero.
    /// With `expected_total` set, a body that ends early is a network error.
    pub async fn fetch_to_file(
        &self,
        url: &str,
        path: &Path,
        expected_total: Option<u64>,
        cancel: &CancellationToken,
        on_position: &(dyn Fn(u64) + Send + Sync),
    ) -> TransferResult<u64> {
        let mut existing = file_len(path).await?.unwrap_or(0);
        let mut restarted = false;

        loop {
            let mut request = self.client.get(url);
            if existing > 0 {
                request = request.header(header::RANGE, format!("bytes={}-", existing));
            }
            let response = self.send(url, request, cancel).await?;
            let status = response.status();

            if status == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 && !restarted {
                warn!(url, existing, "resume offset rejected, restarting from zero");
                existing = 0;
                restarted = true;
                continue;
            }
            if !status.is_success() {
                return Err(TransferError::from_status(url, status));
            }

            let append = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
            if existing > 0 && !append {
                warn!(url, existing, "server ignored range, restarting from zero");
                existing = 0;
            }
            if append {
                let start = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range)
                    .map(|range| range.start);
                if start.map_or(false, |start| start != existing) {
                    return Err(TransferError::protocol(url, "partial response starts at the wrong offset"));
                }
            }

            let mut options = OpenOptions::new();
            options.create(true);
            if append {
                options.append(true);
            } else {
                options.write(true).truncate(true);
            }
            let mut file = options.open(path).await.map_err(|e| TransferError::io(path, e))?;

            on_position(existing);
            let mut position = existing;
            let limit = expected_total.map(|total| total.saturating_sub(existing));
            self.stream_body(url, path, response, &mut file, limit, cancel, &mut |n| {
                position += n;
                on_position(position);
            })
            .await?;
            file.flush().await.map_err(|e| TransferError::io(path, e))?;

            if let Some(total) = expected_total {
                if position < total {
                    return Err(TransferError::network(
                        url,
                        format!("connection closed after {} of {} bytes", position, total),
                    ));
                }
            }
            return Ok(position);
        }
    }

    /// Fetches `[start, start + len)` into the preallocated file at `path`.
    ///
    /// Each call opens its own handle, so concurrent chunks never share a
    /// file cursor. Returns only after exactly `len` bytes were written.
    pub async fn fetch_range(
        &self,
        url: &str,
        path: &Path,
        start: u64,
        len: u64,
        cancel: &CancellationToken,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> TransferResult<u64> {
        if len == 0 {
            return Ok(0);
        }
        let range = format!("bytes={}-{}", start, start + len - 1);
        let request = self.client.get(url).header(header::RANGE, range);
        let response = self.send(url, request, cancel).await?;
        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            if status.is_success() {
                return Err(TransferError::protocol(url, "byte range ignored by server"));
            }
            return Err(TransferError::from_status(url, status));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| TransferError::io(path, e))?;

        let mut received = 0u64;
        self.stream_body(url, path, response, &mut file, Some(len), cancel, &mut |n| {
            received += n;
            on_bytes(n);
        })
        .await?;
        file.flush().await.map_err(|e| TransferError::io(path, e))?;

        if received != len {
            return Err(TransferError::network(
                url,
                format!("chunk at {} ended after {} of {} bytes", start, received, len),
            ));
        }
        Ok(received)
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> TransferResult<Response> {
        tokio::select! {
            r = request.send() => r.map_err(|e| TransferError::from_reqwest(url, e)),
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
        }
    }

    /// Copies the body into `file`. More than `limit` bytes is a protocol error.
    #[allow(clippy::too_many_arguments)]
    async fn stream_body(
        &self,
        url: &str,
        path: &Path,
        response: Response,
        file: &mut File,
        limit: Option<u64>,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn FnMut(u64) + Send),
    ) -> TransferResult<()> {
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let chunk = item.map_err(|e| TransferError::network(url, e))?;
            if chunk.is_empty() {
                continue;
            }

            let len = chunk.len() as u64;
            if limit.map_or(false, |limit| written + len > limit) {
                return Err(TransferError::protocol(url, "server sent more bytes than expected"));
            }

            self.throttle(len, cancel).await?;
            file.write_all(&chunk).await.map_err(|e| TransferError::io(path, e))?;
            written += len;
            on_chunk(len);
        }
        Ok(())
    }

    /// Waits for the global limiter in slices no larger than its burst.
    async fn throttle(&self, len: u64, cancel: &CancellationToken) -> TransferResult<()> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        let mut remaining = len;
        while remaining > 0 {
            let step = remaining.min(self.burst as u64) as u32;
            if let Some(n) = NonZeroU32::new(step) {
                tokio::select! {
                    _ = limiter.until_n_ready(n) => {}
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                }
            }
            remaining -= step as u64;
        }
        Ok(())
    }
}

/// Length of the file at `path`, or `None` when it does not exist.
pub async fn file_len(path: &Path) -> TransferResult<Option<u64>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TransferError::io(path, e)),
    }
}

pub async fn remove_if_exists(path: &Path) -> TransferResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransferError::io(path, e)),
    }
}

// reqwest reports 0 from content_length() for HEAD responses; read the header.
fn header_u64(response: &Response, name: header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: u64,
    total: Option<u64>,
}

/// `bytes 0-0/1000` or `bytes 0-0/*`.
fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, _) = span.split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        total,
    })
}
