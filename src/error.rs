use std::io;
use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

pub type TransferResult<T> = Result<T, TransferError>;

/// Failure classes of a transfer or patch fetch.
///
/// `Network` is transient and retried, `Protocol` gets one fallback attempt,
/// `Io` surfaces immediately and `Cancelled` is a control-flow outcome that is
/// never reported as an error to the user.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("network error on {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("unexpected response from {url}: {reason}")]
    Protocol { url: String, reason: String },

    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl TransferError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn network(url: &str, reason: impl ToString) -> Self {
        TransferError::Network {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(url: &str, reason: impl ToString) -> Self {
        TransferError::Protocol {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(url: &str, status: StatusCode) -> Self {
        if status == StatusCode::NOT_FOUND {
            TransferError::NotFound {
                url: url.to_string(),
            }
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            TransferError::network(url, format!("server answered {}", status))
        } else {
            TransferError::protocol(url, format!("server answered {}", status))
        }
    }

    pub fn from_reqwest(url: &str, error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => TransferError::from_status(url, status),
            None => TransferError::network(url, error),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Network { .. })
    }

    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            TransferError::Protocol { .. } | TransferError::NotFound { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

/// Scan-infrastructure failures. Content mismatches are never errors.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("install path {path:?} is not a readable directory")]
    InstallPathUnreadable { path: PathBuf },

    #[error("manifest path {relative:?} escapes the install directory")]
    InvalidPath { relative: String },

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// First unrecoverable failure of a patch batch.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("failed to patch {relative}: {source}")]
    Entry {
        relative: String,
        #[source]
        source: TransferError,
    },

    #[error("patch worker stopped unexpectedly: {0}")]
    Worker(String),

    #[error("patch batch cancelled")]
    Cancelled,
}
