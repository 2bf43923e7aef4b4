use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::utils::with_suffix;

/// Durable chunk progress of one parallel transfer, stored as `<dest>.meta`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferState {
    pub url: String,
    pub total_bytes: u64,
    pub completed_chunks: BTreeSet<u64>,
    /// Chunk layout the offsets refer to; absent in files written by older tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

impl TransferState {
    pub fn new(url: &str, total_bytes: u64, chunk_size: u64) -> Self {
        Self {
            url: url.to_string(),
            total_bytes,
            completed_chunks: BTreeSet::new(),
            chunk_size: Some(chunk_size),
        }
    }

    pub fn meta_path(destination: &Path) -> PathBuf {
        with_suffix(destination, ".meta")
    }

    /// Reads the state file. A missing or unparsable file yields `None`.
    pub async fn load(meta_path: &Path) -> Option<Self> {
        let content = fs::read_to_string(meta_path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "discarding unreadable transfer state");
                None
            }
        }
    }

    /// The state only describes a file that is still laid out for it.
    pub fn is_valid_for(&self, url: &str, total_bytes: u64, chunk_size: u64, allocated_len: u64) -> bool {
        self.url == url
            && self.total_bytes == total_bytes
            && allocated_len == total_bytes
            && self.chunk_size.map_or(true, |size| size == chunk_size)
    }

    pub fn mark_complete(&mut self, offset: u64) {
        self.completed_chunks.insert(offset);
    }

    pub fn is_complete(&self, offset: u64) -> bool {
        self.completed_chunks.contains(&offset)
    }

    /// Writes through a sibling temp file so a crash never leaves half a JSON document.
    pub async fn save(&self, meta_path: &Path) -> io::Result<()> {
        let content = serde_json::to_string(self)?;
        let tmp = with_suffix(meta_path, ".tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, meta_path).await
    }

    pub async fn remove(meta_path: &Path) {
        match fs::remove_file(meta_path).await {
            Ok(()) => debug!(path = ?meta_path, "removed transfer state"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?meta_path, error = %e, "failed to remove transfer state"),
        }
    }
}
