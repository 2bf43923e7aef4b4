//! Loopback HTTP/1.1 file server for the integration tests.
//!
//! Every response carries `Connection: close`, so each request is one TCP
//! connection and the request log reads in send order.

#![allow(dead_code)]

use parking_lot::Mutex;
use rpatch::config::TransferConfig;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const PACE_SLICE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Resource {
    pub body: Vec<u8>,
    /// Answer `Range` requests with 206; otherwise every GET gets the whole body.
    pub ranges: bool,
    /// Sleep between body slices, to keep a transfer in flight.
    pub pace: Option<Duration>,
}

impl Resource {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ranges: true,
            pace: None,
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

#[derive(Default)]
struct Shared {
    resources: Mutex<HashMap<String, Resource>>,
    fail_once: Mutex<HashSet<(String, String)>>,
    requests: Mutex<Vec<Recorded>>,
}

pub struct TestServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());

        let task = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, shared).await;
                    });
                }
            })
        };

        Self { addr, shared, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn put(&self, path: &str, resource: Resource) {
        self.shared.resources.lock().insert(path.to_string(), resource);
    }

    /// The next request for `path` with exactly this `Range` header gets a 500.
    pub fn fail_once(&self, path: &str, range: &str) {
        self.shared
            .fail_once
            .lock()
            .insert((path.to_string(), range.to_string()));
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.shared.requests.lock().clone()
    }

    /// `(method, range)` pairs for one path, in arrival order.
    pub fn log_for(&self, path: &str) -> Vec<(String, Option<String>)> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .map(|r| (r.method, r.range))
            .collect()
    }

    pub fn clear_log(&self) {
        self.shared.requests.lock().clear();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let (read, mut write) = stream.split();
    let mut reader = BufReader::new(read);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }

    shared.requests.lock().push(Recorded {
        method: method.clone(),
        path: path.clone(),
        range: range.clone(),
    });

    let key = (path.clone(), range.clone().unwrap_or_default());
    if shared.fail_once.lock().remove(&key) {
        write_head(&mut write, 500, "Internal Server Error", 0, "").await?;
        return write.shutdown().await;
    }

    let resource = shared.resources.lock().get(&path).cloned();
    let Some(resource) = resource else {
        write_head(&mut write, 404, "Not Found", 0, "").await?;
        return write.shutdown().await;
    };
    let len = resource.body.len() as u64;

    if method == "HEAD" {
        write_head(&mut write, 200, "OK", len, "").await?;
        return write.shutdown().await;
    }

    let requested = range.as_deref().filter(|_| resource.ranges).and_then(parse_range);
    let (status, reason, body, extra) = match requested {
        Some((start, _)) if start >= len => {
            let extra = format!("Content-Range: bytes */{}\r\n", len);
            (416, "Range Not Satisfiable", &resource.body[..0], extra)
        }
        Some((start, end)) => {
            let end = end.unwrap_or(len - 1).min(len - 1);
            let extra = format!("Content-Range: bytes {}-{}/{}\r\nAccept-Ranges: bytes\r\n", start, end, len);
            (
                206,
                "Partial Content",
                &resource.body[start as usize..=end as usize],
                extra,
            )
        }
        None => (200, "OK", &resource.body[..], String::new()),
    };

    write_head(&mut write, status, reason, body.len() as u64, &extra).await?;
    match resource.pace {
        Some(pace) => {
            for slice in body.chunks(PACE_SLICE) {
                write.write_all(slice).await?;
                write.flush().await?;
                tokio::time::sleep(pace).await;
            }
        }
        None => write.write_all(body).await?,
    }
    write.shutdown().await
}

async fn write_head<W: AsyncWriteExt + Unpin>(
    write: &mut W,
    status: u16,
    reason: &str,
    content_length: u64,
    extra: &str,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n",
        status, reason, content_length, extra
    );
    write.write_all(head.as_bytes()).await
}

/// `bytes=a-b` or `bytes=a-`.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let bounds = value.strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().ok()?),
    };
    Some((start, end))
}

/// Deterministic, non-repeating-at-chunk-boundaries content.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Quick retries and frequent progress ticks.
pub fn fast_config() -> TransferConfig {
    TransferConfig {
        max_attempts: 3,
        retry_delay: Duration::from_millis(20),
        progress_interval: Duration::from_millis(10),
        state_flush_interval: Duration::from_millis(0),
        ..Default::default()
    }
}

pub fn get(range: Option<&str>) -> (String, Option<String>) {
    ("GET".to_string(), range.map(str::to_string))
}

pub fn head() -> (String, Option<String>) {
    ("HEAD".to_string(), None)
}
