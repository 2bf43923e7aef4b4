//! Whole-file transfers: the coordinator that owns the single active
//! transfer, the handle callers observe it through, and the retry loop that
//! picks a strategy for every attempt.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunked::ParallelChunks;
use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};
use crate::fetch::{file_len, remove_if_exists, Fetcher};
use crate::progress::{ProgressReporter, ProgressTracker, TransferProgress};
use crate::state::TransferState;
use crate::utils::{get_filename_from_url, with_suffix};

/// Source URL plus final destination. Two requests for the same pair are the
/// same transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferTarget {
    pub url: String,
    pub destination: PathBuf,
}

impl TransferTarget {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
        }
    }

    /// Bytes land here until the transfer completes.
    pub fn temp_path(&self) -> PathBuf {
        with_suffix(&self.destination, ".downloading")
    }

    pub fn meta_path(&self) -> PathBuf {
        TransferState::meta_path(&self.destination)
    }

    pub fn display_name(&self) -> String {
        self.destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .or_else(|| get_filename_from_url(&self.url).ok())
            .unwrap_or_else(|| self.url.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Running,
    Paused,
    Completed { bytes: u64 },
    Failed { message: String },
    /// Replaced by a transfer of a different target.
    Superseded,
}

impl TransferStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TransferStatus::Running | TransferStatus::Paused)
    }
}

/// Everything one strategy run needs.
pub(crate) struct TransferContext<'a> {
    pub fetcher: &'a Fetcher,
    pub config: &'a TransferConfig,
    pub target: &'a TransferTarget,
    pub cancel: &'a CancellationToken,
    pub tracker: &'a Arc<ProgressTracker>,
}

/// The two ways a file can be fetched. Both report through the same tracker
/// and leave the finished file at the destination.
pub(crate) enum TransferStrategy {
    SingleStream(SingleStream),
    Parallel(ParallelChunks),
}

impl TransferStrategy {
    async fn execute(&self, ctx: &TransferContext<'_>) -> TransferResult<u64> {
        match self {
            TransferStrategy::SingleStream(s) => s.execute(ctx).await,
            TransferStrategy::Parallel(p) => p.execute(ctx).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TransferStrategy::SingleStream(_) => "single-stream",
            TransferStrategy::Parallel(_) => "parallel",
        }
    }
}

/// One connection, appending to `<dest>.downloading`.
pub(crate) struct SingleStream {
    pub total_bytes: Option<u64>,
}

impl SingleStream {
    async fn execute(&self, ctx: &TransferContext<'_>) -> TransferResult<u64> {
        let temp = ctx.target.temp_path();
        let meta_path = ctx.target.meta_path();

        // A chunked layout is not a prefix; it cannot be appended to.
        if file_len(&meta_path).await?.is_some() {
            info!(path = ?temp, "discarding chunked partial for single-stream transfer");
            TransferState::remove(&meta_path).await;
            remove_if_exists(&temp).await?;
        }

        let existing = file_len(&temp).await?.unwrap_or(0);
        if let Some(total) = self.total_bytes {
            if existing > total {
                warn!(path = ?temp, existing, total, "partial file larger than remote, discarding");
                remove_if_exists(&temp).await?;
            } else if existing == total && total > 0 {
                debug!(path = ?temp, "partial file already complete");
                ctx.tracker.set_total(Some(total));
                ctx.tracker.set(total);
                promote(&temp, &ctx.target.destination).await?;
                return Ok(total);
            }
        }

        ctx.tracker.set_total(self.total_bytes);
        let tracker = ctx.tracker.clone();
        let written = ctx
            .fetcher
            .fetch_to_file(&ctx.target.url, &temp, self.total_bytes, ctx.cancel, &move |pos| {
                tracker.set(pos)
            })
            .await?;
        if self.total_bytes.is_none() {
            ctx.tracker.set_total(Some(written));
        }

        promote(&temp, &ctx.target.destination).await?;
        Ok(written)
    }
}

/// Moves a finished temp file to its final name.
pub(crate) async fn promote(temp: &Path, destination: &Path) -> TransferResult<()> {
    fs::rename(temp, destination)
        .await
        .map_err(|e| TransferError::io(destination, e))?;
    info!(path = ?destination, "transfer complete");
    Ok(())
}

/// Retry loop and strategy selection, shared by every handle.
pub(crate) struct TransferEngine {
    fetcher: Fetcher,
    config: TransferConfig,
}

impl TransferEngine {
    async fn run(
        &self,
        target: &TransferTarget,
        cancel: &CancellationToken,
        progress_tx: &Arc<watch::Sender<TransferProgress>>,
    ) -> TransferResult<u64> {
        let tracker = Arc::new(ProgressTracker::new(target.display_name()));
        let reporter = ProgressReporter::spawn(tracker.clone(), progress_tx.clone(), &self.config);
        let result = self.run_with_retries(target, cancel, &tracker).await;
        reporter.finish();
        result
    }

    async fn run_with_retries(
        &self,
        target: &TransferTarget,
        cancel: &CancellationToken,
        tracker: &Arc<ProgressTracker>,
    ) -> TransferResult<u64> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut protocol_retry_used = false;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(target, cancel, tracker).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() => {
                    warn!(url = %target.url, attempt, max_attempts, error = %e, "transfer attempt failed");
                    last_error = e.to_string();
                }
                Err(e) if e.is_protocol() => {
                    if protocol_retry_used {
                        return Err(e);
                    }
                    protocol_retry_used = true;
                    warn!(url = %target.url, attempt, error = %e, "unexpected response, retrying once");
                    last_error = e.to_string();
                }
                // Cancellation and local disk failures
                Err(e) => return Err(e),
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                }
            }
        }

        Err(TransferError::Exhausted {
            attempts: max_attempts,
            last: last_error,
        })
    }

    async fn attempt(
        &self,
        target: &TransferTarget,
        cancel: &CancellationToken,
        tracker: &Arc<ProgressTracker>,
    ) -> TransferResult<u64> {
        if let Some(parent) = target.destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TransferError::io(parent, e))?;
            }
        }

        let strategy = self.select_strategy(target, cancel).await?;
        let strategy = match strategy {
            Some(strategy) => strategy,
            None => {
                let total = file_len(&target.destination).await?.unwrap_or(0);
                tracker.set_total(Some(total));
                tracker.set(total);
                info!(path = ?target.destination, "destination already complete");
                return Ok(total);
            }
        };

        debug!(url = %target.url, strategy = strategy.name(), "starting transfer attempt");
        let ctx = TransferContext {
            fetcher: &self.fetcher,
            config: &self.config,
            target,
            cancel,
            tracker,
        };
        strategy.execute(&ctx).await
    }

    /// `None` when the destination already holds the whole file.
    async fn select_strategy(
        &self,
        target: &TransferTarget,
        cancel: &CancellationToken,
    ) -> TransferResult<Option<TransferStrategy>> {
        let persisted = TransferState::load(&target.meta_path())
            .await
            .filter(|s| s.url == target.url && s.total_bytes > 0);

        let mut total = match &persisted {
            Some(state) => Some(state.total_bytes),
            None => self.fetcher.content_length(&target.url, cancel).await?,
        };
        if self.already_complete(target, total).await? {
            return Ok(None);
        }

        let mut probe = None;
        if total.map_or(true, |t| t >= self.config.parallel_threshold) {
            let result = self.fetcher.probe_range(&target.url, cancel).await?;
            if total.is_none() {
                total = result.total_bytes;
                if self.already_complete(target, total).await? {
                    return Ok(None);
                }
            }
            probe = Some(result);
        }

        let parallel = matches!(
            (total, probe),
            (Some(t), Some(p)) if p.supported && t >= self.config.parallel_threshold
        );
        Ok(Some(match total {
            Some(total_bytes) if parallel => TransferStrategy::Parallel(ParallelChunks { total_bytes }),
            _ => TransferStrategy::SingleStream(SingleStream { total_bytes: total }),
        }))
    }

    /// Clears leftover `.meta`/`.downloading` when the destination already
    /// has exactly `total` bytes.
    async fn already_complete(&self, target: &TransferTarget, total: Option<u64>) -> TransferResult<bool> {
        let Some(total) = total else {
            return Ok(false);
        };
        if file_len(&target.destination).await? != Some(total) {
            return Ok(false);
        }
        TransferState::remove(&target.meta_path()).await;
        remove_if_exists(&target.temp_path()).await?;
        Ok(true)
    }
}

struct Control {
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct HandleInner {
    target: TransferTarget,
    engine: Arc<TransferEngine>,
    control: Mutex<Control>,
    status_tx: watch::Sender<TransferStatus>,
    progress_tx: Arc<watch::Sender<TransferProgress>>,
}

/// Observation and control surface of one transfer.
///
/// Clones refer to the same transfer. Status and progress are published on
/// `watch` channels; a late subscriber sees the latest value.
#[derive(Clone)]
pub struct TransferHandle {
    inner: Arc<HandleInner>,
}

impl TransferHandle {
    /// `previous` is a task the first run must outlive, e.g. a superseded
    /// transfer writing the same destination.
    fn start(engine: Arc<TransferEngine>, target: TransferTarget, previous: Option<JoinHandle<()>>) -> Self {
        let (status_tx, _) = watch::channel(TransferStatus::Running);
        let (progress_tx, _) = watch::channel(TransferProgress {
            name: target.display_name(),
            ..Default::default()
        });
        let handle = Self {
            inner: Arc::new(HandleInner {
                target,
                engine,
                control: Mutex::new(Control {
                    generation: 0,
                    cancel: CancellationToken::new(),
                    task: previous,
                }),
                status_tx,
                progress_tx: Arc::new(progress_tx),
            }),
        };
        handle.launch(&mut handle.inner.control.lock());
        handle
    }

    // Each launch bumps the generation; a run only publishes its outcome while
    // it is still the current one. A new run waits for the previous task so
    // two runs never write the same temp file.
    fn launch(&self, control: &mut Control) {
        control.cancel.cancel();
        control.generation += 1;
        control.cancel = CancellationToken::new();

        let generation = control.generation;
        let cancel = control.cancel.clone();
        let previous = control.task.take();
        let inner = self.inner.clone();
        self.inner.status_tx.send_replace(TransferStatus::Running);

        control.task = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = inner.engine.run(&inner.target, &cancel, &inner.progress_tx).await;

            let status = match result {
                Ok(bytes) => TransferStatus::Completed { bytes },
                Err(TransferError::Cancelled) => return,
                Err(e) => {
                    warn!(url = %inner.target.url, error = %e, "transfer failed");
                    TransferStatus::Failed { message: e.to_string() }
                }
            };
            let control = inner.control.lock();
            if control.generation == generation {
                inner.status_tx.send_replace(status);
            }
        }));
    }

    pub fn target(&self) -> &TransferTarget {
        &self.inner.target
    }

    pub fn current_status(&self) -> TransferStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn status(&self) -> watch::Receiver<TransferStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.inner.progress_tx.subscribe()
    }

    /// Stops the running attempt. Durable progress stays on disk.
    pub fn pause(&self) -> bool {
        let control = self.inner.control.lock();
        if self.current_status() != TransferStatus::Running {
            return false;
        }
        control.cancel.cancel();
        self.inner.status_tx.send_replace(TransferStatus::Paused);
        info!(url = %self.inner.target.url, "transfer paused");
        true
    }

    /// Restarts a paused or failed transfer from its durable progress.
    pub fn resume(&self) -> bool {
        let mut control = self.inner.control.lock();
        match self.current_status() {
            TransferStatus::Paused | TransferStatus::Failed { .. } => {
                info!(url = %self.inner.target.url, "transfer resumed");
                self.launch(&mut control);
                true
            }
            _ => false,
        }
    }

    /// Cancels the run and marks it superseded. Returns the run's task when
    /// `successor` writes the same files, so the successor can wait for it.
    fn supersede(&self, successor: &TransferTarget) -> Option<JoinHandle<()>> {
        let mut control = self.inner.control.lock();
        control.generation += 1;
        control.cancel.cancel();
        self.inner.status_tx.send_replace(TransferStatus::Superseded);
        if self.inner.target.destination == successor.destination {
            control.task.take()
        } else {
            None
        }
    }

    /// Waits for the current run's task to exit, e.g. after a pause, so its
    /// state is on disk.
    pub async fn settle(&self) {
        let task = self.inner.control.lock().task.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Resolves once the transfer is no longer running.
    pub async fn wait(&self) -> TransferStatus {
        let mut rx = self.status();
        loop {
            let status = rx.borrow_and_update().clone();
            if status != TransferStatus::Running {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.current_status();
            }
        }
    }
}

/// Owns at most one active transfer at a time.
pub struct TransferCoordinator {
    engine: Arc<TransferEngine>,
    active: Mutex<Option<TransferHandle>>,
}

impl TransferCoordinator {
    pub fn new(config: TransferConfig) -> Self {
        Self::with_fetcher(Fetcher::new(&config), config)
    }

    /// Shares an existing connection pool and rate limiter.
    pub fn with_fetcher(fetcher: Fetcher, config: TransferConfig) -> Self {
        Self {
            engine: Arc::new(TransferEngine { fetcher, config }),
            active: Mutex::new(None),
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.engine.fetcher
    }

    /// Starts fetching `url` into `destination`.
    ///
    /// Asking again for the transfer already in flight returns the same
    /// handle, resuming it if it was paused. A different target supersedes
    /// the current one; its partial data stays on disk.
    pub fn start_download(&self, url: &str, destination: impl Into<PathBuf>) -> TransferHandle {
        let target = TransferTarget::new(url, destination);
        let mut active = self.active.lock();
        let mut previous = None;

        if let Some(current) = active.as_ref() {
            if current.target() == &target {
                match current.current_status() {
                    TransferStatus::Running => {
                        debug!(url, "transfer already running");
                        return current.clone();
                    }
                    TransferStatus::Paused => {
                        current.resume();
                        return current.clone();
                    }
                    _ => {}
                }
            } else if !current.current_status().is_finished() {
                info!(old = %current.target().url, new = url, "superseding active transfer");
                previous = current.supersede(&target);
            }
        }

        info!(url, destination = ?target.destination, "starting transfer");
        let handle = TransferHandle::start(self.engine.clone(), target, previous);
        *active = Some(handle.clone());
        handle
    }

    pub fn active(&self) -> Option<TransferHandle> {
        self.active.lock().clone()
    }

    pub fn pause(&self) -> bool {
        self.active().map_or(false, |h| h.pause())
    }

    pub fn resume(&self) -> bool {
        self.active().map_or(false, |h| h.resume())
    }
}
