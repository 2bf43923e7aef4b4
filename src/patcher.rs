//! Manifest-driven patching of an install tree.
//!
//! Every entry is checked first; only entries that still need work are queued.
//! The queue runs on a bounded pool and stops at the first entry that cannot
//! be delivered. Whatever was fetched or deleted before that stays in place,
//! so running the same manifest again only redoes what is still wrong.

use futures::StreamExt;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PatchConfig;
use crate::error::{PatchError, ScanError, TransferError, TransferResult};
use crate::fetch::{file_len, remove_if_exists, Fetcher};
use crate::hashing::FingerprintVerifier;
use crate::manifest::{PatchEntry, PatchManifest};
use crate::progress::{PatchProgress, ProgressSender};
use crate::sanitizer::{check_entry, SanitizationReport};
use crate::utils::{entry_url, flat_entry_url, local_path};

/// Outcome of one apply pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Entries that needed work after the initial check.
    pub queued: usize,
    pub delivered: usize,
    pub deleted: usize,
    pub bytes_downloaded: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Fetch,
    Delete,
}

#[derive(Debug, Clone)]
struct QueuedEntry {
    entry: PatchEntry,
    destination: PathBuf,
    work: Work,
}

#[derive(Debug, Clone, Copy)]
enum Done {
    Delivered,
    Deleted,
}

/// Aggregate progress shared by all workers of one batch.
struct BatchProgress {
    total: usize,
    processed: AtomicUsize,
    bytes: AtomicU64,
    last_report: Mutex<Instant>,
    interval: Duration,
    sink: ProgressSender<PatchProgress>,
}

impl BatchProgress {
    fn add_bytes(&self, name: &str, delta: u64, file_percentage: f64) {
        let bytes = self.bytes.fetch_add(delta, Ordering::Relaxed) + delta;
        {
            let mut last = self.last_report.lock();
            if last.elapsed() < self.interval {
                return;
            }
            *last = Instant::now();
        }
        self.report(name, file_percentage, bytes);
    }

    fn finish_entry(&self, name: &str) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.report(name, 100.0, self.bytes.load(Ordering::Relaxed));
    }

    fn report(&self, name: &str, file_percentage: f64, bytes: u64) {
        self.sink.report(PatchProgress {
            processed_count: self.processed.load(Ordering::Relaxed),
            total_count: self.total,
            current_name: name.to_string(),
            current_file_percentage: file_percentage,
            total_bytes_downloaded: bytes,
        });
    }
}

/// Converts absolute file positions from the fetcher into byte deltas.
struct EntryProgress<'a> {
    batch: &'a BatchProgress,
    name: String,
    size: u64,
    last: AtomicU64,
}

impl EntryProgress<'_> {
    fn update(&self, position: u64) {
        let previous = self.last.swap(position, Ordering::Relaxed);
        // The first report is the resume offset; a smaller position is a restart.
        if previous == u64::MAX || position <= previous {
            return;
        }
        let percentage = if self.size > 0 {
            (position as f64 / self.size as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        self.batch.add_bytes(&self.name, position - previous, percentage);
    }
}

pub struct PatchApplier {
    fetcher: Fetcher,
    verifier: Arc<dyn FingerprintVerifier>,
    config: PatchConfig,
}

impl PatchApplier {
    pub fn new(fetcher: Fetcher, verifier: Arc<dyn FingerprintVerifier>, config: PatchConfig) -> Self {
        Self {
            fetcher,
            verifier,
            config,
        }
    }

    /// Applies the manifest and folds the outcome into a success flag.
    pub async fn apply_patches(
        &self,
        install_path: &Path,
        manifest: &PatchManifest,
        progress: &ProgressSender<PatchProgress>,
    ) -> bool {
        match self
            .apply(install_path, manifest, progress, &CancellationToken::new())
            .await
        {
            Ok(report) => {
                info!(?report, "patch process finished");
                true
            }
            Err(e) => {
                error!(error = %e, "patch process failed");
                false
            }
        }
    }

    /// Applies only the entries a scan flagged.
    pub async fn apply_repairs(
        &self,
        install_path: &Path,
        manifest: &PatchManifest,
        scan: &SanitizationReport,
        progress: &ProgressSender<PatchProgress>,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, PatchError> {
        let selected = PatchManifest {
            patches: manifest
                .patches
                .iter()
                .filter(|entry| scan.contains(&entry.relative_path))
                .cloned()
                .collect(),
            ..manifest.clone()
        };
        debug!(flagged = scan.mismatched_files.len(), selected = selected.patches.len(), "applying repairs");
        self.apply(install_path, &selected, progress, cancel).await
    }

    pub async fn apply(
        &self,
        install_path: &Path,
        manifest: &PatchManifest,
        progress: &ProgressSender<PatchProgress>,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, PatchError> {
        let queue = self.plan(install_path, manifest).await?;
        let total = queue.len();
        let mut report = ApplyReport {
            queued: total,
            ..Default::default()
        };

        if total == 0 {
            info!(entries = manifest.patches.len(), "install already matches patch manifest");
            progress.report(PatchProgress {
                current_file_percentage: 100.0,
                ..Default::default()
            });
            return Ok(report);
        }
        info!(queued = total, entries = manifest.patches.len(), "applying patches");

        let batch_progress = Arc::new(BatchProgress {
            total,
            processed: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            last_report: Mutex::new(Instant::now()),
            interval: self.config.progress_interval,
            sink: progress.clone(),
        });
        let batch = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut workers = JoinSet::new();

        for item in queue {
            let fetcher = self.fetcher.clone();
            let base_url = manifest.base_url.clone();
            let batch = batch.clone();
            let semaphore = semaphore.clone();
            let batch_progress = batch_progress.clone();

            workers.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = batch.cancelled() => return Err(PatchError::Cancelled),
                    permit = semaphore.acquire_owned() => permit.map_err(|_| PatchError::Cancelled)?,
                };
                let name = item.entry.display_name();
                match item.work {
                    Work::Delete => {
                        remove_best_effort(&item.destination).await;
                        batch_progress.finish_entry(&name);
                        Ok(Done::Deleted)
                    }
                    Work::Fetch => {
                        match fetch_entry(&fetcher, &base_url, &item, &batch, &batch_progress).await {
                            Ok(bytes) => {
                                debug!(path = %item.entry.relative_path, bytes, "patch entry delivered");
                                batch_progress.finish_entry(&name);
                                Ok(Done::Delivered)
                            }
                            Err(TransferError::Cancelled) => Err(PatchError::Cancelled),
                            Err(source) => {
                                // Stop queued entries before this permit is released.
                                batch.cancel();
                                Err(PatchError::Entry {
                                    relative: item.entry.relative_path.clone(),
                                    source,
                                })
                            }
                        }
                    }
                }
            });
        }

        let mut first_error: Option<PatchError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(PatchError::Worker(e.to_string())));
            match result {
                Ok(done) if first_error.is_none() => match done {
                    Done::Delivered => report.delivered += 1,
                    Done::Deleted => report.deleted += 1,
                },
                Ok(_) => {}
                Err(e) => {
                    batch.cancel();
                    let cancelled = matches!(e, PatchError::Cancelled);
                    // A real failure outranks the cancellations it caused.
                    let keep = match &first_error {
                        None => true,
                        Some(PatchError::Cancelled) => !cancelled,
                        Some(_) => false,
                    };
                    if keep {
                        if !cancelled {
                            warn!(error = %e, "patch entry failed, stopping batch");
                        }
                        first_error = Some(e);
                    }
                }
            }
        }

        report.bytes_downloaded = batch_progress.bytes.load(Ordering::Relaxed);
        if let Some(e) = first_error {
            return Err(e);
        }
        info!(
            delivered = report.delivered,
            deleted = report.deleted,
            bytes = report.bytes_downloaded,
            "patches applied"
        );
        Ok(report)
    }

    /// Checks every entry, at most `max_parallel` at a time, keeping manifest order.
    async fn plan(&self, install_path: &Path, manifest: &PatchManifest) -> Result<Vec<QueuedEntry>, PatchError> {
        if !install_path.is_dir() {
            return Err(ScanError::InstallPathUnreadable {
                path: install_path.to_path_buf(),
            }
            .into());
        }

        let verifier = &self.verifier;
        let checked: Vec<_> = futures::stream::iter(manifest.patches.iter())
            .map(|entry| async move {
                let state = check_entry(install_path, entry, verifier).await?;
                Ok::<_, ScanError>((entry, state))
            })
            .buffered(self.config.max_parallel.max(1))
            .collect()
            .await;

        let mut queue = vec![];
        for result in checked {
            let (entry, state) = result?;
            if !state.needs_action() {
                continue;
            }
            let destination = local_path(install_path, &entry.relative_path).ok_or_else(|| {
                ScanError::InvalidPath {
                    relative: entry.relative_path.clone(),
                }
            })?;
            debug!(path = %entry.relative_path, ?state, "queued patch entry");
            queue.push(QueuedEntry {
                entry: entry.clone(),
                destination,
                work: if entry.is_delete() { Work::Delete } else { Work::Fetch },
            });
        }
        Ok(queue)
    }
}

/// Fetches one entry in place. A 404 on the nested URL is retried once
/// against `base_url/<file name>`.
async fn fetch_entry(
    fetcher: &Fetcher,
    base_url: &str,
    item: &QueuedEntry,
    cancel: &CancellationToken,
    batch: &BatchProgress,
) -> TransferResult<u64> {
    let entry = &item.entry;
    let destination = &item.destination;
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::io(parent, e))?;
    }

    // A full-length file that reached the queue already failed verification.
    if let Some(existing) = file_len(destination).await? {
        if existing >= entry.size {
            debug!(path = ?destination, existing, "discarding local copy that failed verification");
            remove_if_exists(destination).await?;
        }
    }

    let expected = (entry.size > 0).then_some(entry.size);
    let progress = EntryProgress {
        batch,
        name: entry.display_name(),
        size: entry.size,
        last: AtomicU64::new(u64::MAX),
    };
    let on_position = |position: u64| progress.update(position);

    let url = entry_url(base_url, &entry.relative_path).map_err(|e| TransferError::protocol(base_url, e))?;
    match fetcher
        .fetch_to_file(url.as_str(), destination, expected, cancel, &on_position)
        .await
    {
        Err(TransferError::NotFound { .. }) => {
            let flat = flat_entry_url(base_url, &entry.relative_path)
                .map_err(|e| TransferError::protocol(base_url, e))?;
            warn!(url = %url, flat = %flat, "patch file not found, retrying flat URL");
            fetcher
                .fetch_to_file(flat.as_str(), destination, expected, cancel, &on_position)
                .await
        }
        other => other,
    }
}

async fn remove_best_effort(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => info!(path = ?path, "deleted file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "could not delete file"),
    }
}
