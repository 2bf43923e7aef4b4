use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

/// Tunables of the transfer coordinator.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Files at least this large use the parallel strategy when ranges work.
    pub parallel_threshold: u64,
    pub chunk_size: u64,
    pub max_chunk_workers: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Minimum spacing between two writes of the `.meta` file.
    pub state_flush_interval: Duration,
    pub progress_interval: Duration,
    pub speed_window: Duration,
    /// No bytes for this long makes the watchdog publish a zero-speed tick.
    pub stall_after: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Global cap in bytes per second, shared by every worker.
    pub rate_limit: Option<u32>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 32 * MIB,
            chunk_size: 16 * MIB,
            max_chunk_workers: 4,
            max_attempts: 50,
            retry_delay: Duration::from_secs(2),
            state_flush_interval: Duration::from_secs(5),
            progress_interval: Duration::from_millis(100),
            speed_window: Duration::from_secs(2),
            stall_after: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("rpatch/{}", env!("CARGO_PKG_VERSION")),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchConfig {
    pub max_parallel: usize,
    pub progress_interval: Duration,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            progress_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Progress is published once every `report_every` items.
    pub report_every: usize,
    /// Launcher-owned file names, matched case-insensitively.
    pub reserved_files: Vec<String>,
    /// Glob patterns for transfer artifacts left next to game files.
    pub reserved_patterns: Vec<String>,
    /// Directories holding user data; never inspected.
    pub user_data_dirs: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            report_every: 50,
            reserved_files: [
                "rpatch",
                "rpatch.exe",
                "rpatch.log",
                "rpatch.pid",
                "config.json",
                "base_manifest.json",
                "patch_manifest.json",
                "patch_state.json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            reserved_patterns: ["*.downloading", "*.meta", "*.meta.tmp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            user_data_dirs: ["Cache", "Logs", "Screenshots", "WTF", "Interface", "Errors"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}
