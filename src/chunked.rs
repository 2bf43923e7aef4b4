use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::downloader::{promote, TransferContext};
use crate::error::{TransferError, TransferResult};
use crate::fetch::file_len;
use crate::state::TransferState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub start_offset: u64,
    pub size: u64,
    pub completed: bool,
}

/// Splits `total` bytes into consecutive chunks; only the last may be short.
pub fn plan_chunks(total: u64, chunk_size: u64) -> Vec<ChunkRecord> {
    let chunk_size = if chunk_size == 0 { total.max(1) } else { chunk_size };
    let mut chunks = Vec::with_capacity((total / chunk_size + 1) as usize);
    let mut start = 0;
    while start < total {
        let size = chunk_size.min(total - start);
        chunks.push(ChunkRecord {
            start_offset: start,
            size,
            completed: false,
        });
        start += size;
    }
    chunks
}

/// Throttled writer of the `.meta` file. Writes are serialized by the lock.
struct StatePersister {
    path: PathBuf,
    interval: Duration,
    inner: Mutex<(TransferState, Instant)>,
}

impl StatePersister {
    async fn mark_complete(&self, offset: u64) -> TransferResult<()> {
        let mut guard = self.inner.lock().await;
        let (state, last_flush) = &mut *guard;
        state.mark_complete(offset);
        if last_flush.elapsed() >= self.interval {
            state
                .save(&self.path)
                .await
                .map_err(|e| TransferError::io(&self.path, e))?;
            *last_flush = Instant::now();
        }
        Ok(())
    }

    async fn flush(&self) -> TransferResult<()> {
        let mut guard = self.inner.lock().await;
        let (state, last_flush) = &mut *guard;
        state
            .save(&self.path)
            .await
            .map_err(|e| TransferError::io(&self.path, e))?;
        *last_flush = Instant::now();
        Ok(())
    }
}

/// Fixed-size chunks fetched by a bounded worker pool into a preallocated
/// `<dest>.downloading`, with completed offsets recorded in `<dest>.meta`.
pub(crate) struct ParallelChunks {
    pub total_bytes: u64,
}

impl ParallelChunks {
    pub(crate) async fn execute(&self, ctx: &TransferContext<'_>) -> TransferResult<u64> {
        let total = self.total_bytes;
        let url = ctx.target.url.as_str();
        let chunk_size = ctx.config.chunk_size;
        let temp = ctx.target.temp_path();
        let meta_path = ctx.target.meta_path();

        let allocated = file_len(&temp).await?.unwrap_or(0);
        let state = match TransferState::load(&meta_path).await {
            Some(state) if state.is_valid_for(url, total, chunk_size, allocated) => {
                info!(url, restored = state.completed_chunks.len(), "resuming chunked transfer");
                state
            }
            Some(_) => {
                warn!(url, "transfer state does not match the remote file, starting over");
                TransferState::new(url, total, chunk_size)
            }
            None => TransferState::new(url, total, chunk_size),
        };

        let mut chunks = plan_chunks(total, chunk_size);
        for chunk in &mut chunks {
            chunk.completed = state.is_complete(chunk.start_offset);
        }
        let mut state = state;
        state
            .completed_chunks
            .retain(|offset| chunks.iter().any(|c| c.start_offset == *offset));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&temp)
            .await
            .map_err(|e| TransferError::io(&temp, e))?;
        if allocated != total {
            file.set_len(total).await.map_err(|e| TransferError::io(&temp, e))?;
        }
        drop(file);

        let done: u64 = chunks.iter().filter(|c| c.completed).map(|c| c.size).sum();
        ctx.tracker.set_total(Some(total));
        ctx.tracker.set(done);

        let persister = Arc::new(StatePersister {
            path: meta_path.clone(),
            interval: ctx.config.state_flush_interval,
            inner: Mutex::new((state, Instant::now())),
        });
        persister.flush().await?;

        let pending: Vec<ChunkRecord> = chunks.iter().filter(|c| !c.completed).copied().collect();
        info!(url, chunks = chunks.len(), pending = pending.len(), "parallel transfer");

        // Child token: a failing chunk stops its siblings without touching the caller's token.
        let batch = ctx.cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(ctx.config.max_chunk_workers.max(1)));
        let received = Arc::new(AtomicU64::new(done));
        let mut workers = JoinSet::new();

        for chunk in pending {
            let fetcher = ctx.fetcher.clone();
            let url = url.to_string();
            let temp = temp.clone();
            let batch = batch.clone();
            let semaphore = semaphore.clone();
            let tracker = ctx.tracker.clone();
            let persister = persister.clone();
            let received = received.clone();

            workers.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.map_err(|_| TransferError::Cancelled)?,
                    _ = batch.cancelled() => return Err(TransferError::Cancelled),
                };
                let bytes = fetcher
                    .fetch_range(&url, &temp, chunk.start_offset, chunk.size, &batch, &move |n| {
                        tracker.add(n)
                    })
                    .await?;
                persister.mark_complete(chunk.start_offset).await?;
                received.fetch_add(bytes, Ordering::Relaxed);
                debug!(offset = chunk.start_offset, bytes, "chunk complete");
                Ok::<(), TransferError>(())
            });
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(TransferError::network(url, format!("chunk worker died: {}", e))));
            if let Err(e) = result {
                if first_error.is_none() {
                    if !e.is_cancelled() {
                        warn!(url, error = %e, "chunk failed, stopping batch");
                    }
                    batch.cancel();
                    first_error = Some(e);
                }
            }
        }
        persister.flush().await?;

        if let Some(e) = first_error {
            return Err(e);
        }

        let received = received.load(Ordering::Relaxed);
        if received != total {
            return Err(TransferError::protocol(
                url,
                format!("chunks add up to {} of {} bytes", received, total),
            ));
        }

        promote(&temp, &ctx.target.destination).await?;
        TransferState::remove(&meta_path).await;
        Ok(total)
    }
}
