//! Update engine of a game launcher: resumable whole-file transfers,
//! manifest-driven patching and integrity scanning of an install tree.

pub mod chunked;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fetch;
pub mod hashing;
pub mod manifest;
pub mod patcher;
pub mod progress;
pub mod sanitizer;
pub mod state;
pub mod utils;

pub use config::{PatchConfig, ScanConfig, TransferConfig};
pub use downloader::{TransferCoordinator, TransferHandle, TransferStatus, TransferTarget};
pub use error::{PatchError, ScanError, TransferError};
pub use fetch::Fetcher;
pub use hashing::{FingerprintVerifier, PartialSha256, SizeOnly};
pub use manifest::{BaseManifest, PatchAction, PatchEntry, PatchManifest};
pub use patcher::{ApplyReport, PatchApplier};
pub use progress::{PatchProgress, ProgressSender, ScanProgress, TransferProgress};
pub use sanitizer::{IntegrityScanner, SanitizationReport};
