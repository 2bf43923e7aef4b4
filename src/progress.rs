//! Progress snapshots and the channels that carry them.
//!
//! Producers never share mutable progress state with observers; they publish
//! immutable snapshots through `watch` (latest value wins) or `mpsc` channels.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::TransferConfig;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferProgress {
    pub name: String,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub bytes_per_second: f64,
    /// Set by the watchdog when nothing arrived for the stall threshold.
    pub stalled: bool,
}

impl TransferProgress {
    pub fn percentage(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => self.downloaded_bytes as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchProgress {
    pub processed_count: usize,
    pub total_count: usize,
    pub current_name: String,
    /// 0-100 for the entry named by `current_name`.
    pub current_file_percentage: f64,
    pub total_bytes_downloaded: u64,
}

impl PatchProgress {
    pub fn percentage(&self) -> f64 {
        if self.total_count == 0 {
            100.0
        } else {
            self.processed_count as f64 / self.total_count as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanProgress {
    pub processed_count: usize,
    pub total_count: usize,
    pub current_name: String,
}

impl ScanProgress {
    pub fn percentage(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.processed_count as f64 / self.total_count as f64 * 100.0
        }
    }
}

/// Optional sending half of a progress channel. Dropped receivers are ignored.
#[derive(Debug)]
pub struct ProgressSender<T>(Option<mpsc::UnboundedSender<T>>);

impl<T> ProgressSender<T> {
    pub fn new(tx: mpsc::UnboundedSender<T>) -> Self {
        Self(Some(tx))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn report(&self, value: T) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(value);
        }
    }
}

impl<T> Clone for ProgressSender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for ProgressSender<T> {
    fn default() -> Self {
        Self::none()
    }
}

/// Rolling throughput over the last `window` of samples.
#[derive(Debug)]
pub struct SpeedWindow {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Records the cumulative byte count. A count that went backwards (restart
    /// from zero) resets the window.
    pub fn record(&mut self, now: Instant, total: u64) {
        if matches!(self.samples.back(), Some(&(_, last)) if total < last) {
            self.samples.clear();
        }
        self.samples.push_back((now, total));
        while self.samples.len() > 1 {
            match self.samples.front() {
                Some(&(at, _)) if now.duration_since(at) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Bytes per second between the oldest retained sample and `now`.
    pub fn speed(&self, now: Instant) -> f64 {
        let (Some(&(first_at, first)), Some(&(_, last))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = now.duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (last - first) as f64 / elapsed
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Lock-free byte counter fed by transfer workers.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    name: String,
    downloaded: AtomicU64,
    total: Mutex<Option<u64>>,
}

impl ProgressTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            downloaded: AtomicU64::new(0),
            total: Mutex::new(None),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set(&self, bytes: u64) {
        self.downloaded.store(bytes, Ordering::Relaxed);
    }

    pub fn set_total(&self, total: Option<u64>) {
        *self.total.lock() = total;
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, bytes_per_second: f64, stalled: bool) -> TransferProgress {
        TransferProgress {
            name: self.name.clone(),
            downloaded_bytes: self.downloaded(),
            total_bytes: *self.total.lock(),
            bytes_per_second,
            stalled,
        }
    }
}

/// Publishes tracker snapshots at a fixed cadence until dropped.
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
    tx: Arc<watch::Sender<TransferProgress>>,
    task: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(
        tracker: Arc<ProgressTracker>,
        tx: Arc<watch::Sender<TransferProgress>>,
        config: &TransferConfig,
    ) -> Self {
        let cadence = config.progress_interval;
        let stall_after = config.stall_after;
        let mut window = SpeedWindow::new(config.speed_window);
        let task = {
            let tracker = tracker.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cadence);
                let mut last_bytes = tracker.downloaded();
                let mut last_change = Instant::now();
                let mut last_stall_tick: Option<Instant> = None;
                window.record(last_change, last_bytes);
                loop {
                    ticker.tick().await;
                    let now = Instant::now();
                    let bytes = tracker.downloaded();
                    if bytes != last_bytes {
                        window.record(now, bytes);
                        last_bytes = bytes;
                        last_change = now;
                        last_stall_tick = None;
                        tx.send_replace(tracker.snapshot(window.speed(now), false));
                    } else if now.duration_since(last_change) > stall_after
                        && last_stall_tick.map_or(true, |at| now.duration_since(at) >= stall_after)
                    {
                        window.reset();
                        window.record(now, bytes);
                        last_stall_tick = Some(now);
                        tx.send_replace(tracker.snapshot(0.0, true));
                    }
                }
            })
        };
        Self { tracker, tx, task }
    }

    /// Stops the ticker and publishes the final count.
    pub fn finish(self) {
        self.task.abort();
        self.tx.send_replace(self.tracker.snapshot(0.0, false));
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.task.abort();
    }
}
