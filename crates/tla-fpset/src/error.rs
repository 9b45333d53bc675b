//! Error types for fingerprint set operations

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias for fingerprint set operations
pub type FpSetResult<T> = std::result::Result<T, FpSetError>;

/// Errors that can occur while storing or recovering fingerprints
#[derive(Debug, Error)]
pub enum FpSetError {
    /// The in-memory table could not be allocated
    #[error("failed to allocate {bytes} bytes for fingerprint storage")]
    Allocation { bytes: u64 },

    /// Reading, writing or renaming a fingerprint file failed
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration cannot produce a usable set
    #[error("invalid fingerprint set configuration: {0}")]
    Config(String),

    /// A set was opened for a fingerprint width other than the configured one
    #[error("fingerprint width mismatch: configured {configured} bits, requested {requested} bits")]
    WidthMismatch { configured: u32, requested: u32 },

    /// A run file does not have the expected layout
    #[error("corrupt fingerprint run {}: {reason}", path.display())]
    CorruptRun { path: PathBuf, reason: String },

    /// Checkpoint protocol misuse or an unreadable checkpoint
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Checkpoint header could not be (de)serialized
    #[error("checkpoint header: {0}")]
    Header(#[from] serde_json::Error),

    /// An internal ordering or uniqueness invariant does not hold
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The set has been closed
    #[error("fingerprint set has been closed")]
    Closed,
}

impl FpSetError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FpSetError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        FpSetError::Config(message.into())
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        FpSetError::CorruptRun {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        FpSetError::Checkpoint(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        FpSetError::Invariant(message.into())
    }

    /// True for errors after which the set state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FpSetError::Allocation { .. } | FpSetError::Invariant(_) | FpSetError::CorruptRun { .. }
        )
    }
}

/// Attach the offending path to an `io::Result`.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> FpSetResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> FpSetResult<T> {
        self.map_err(|e| FpSetError::io(path, e))
    }
}
