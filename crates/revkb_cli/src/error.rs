//! CLI error types.

use revkb_codec::CodecError;
use revkb_core::CoreError;
use revkb_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// A command needs `--path`.
    #[error("store path required for {0}")]
    PathRequired(&'static str),

    /// The directory holds no journal.
    #[error("no store found at {}", .0.display())]
    NoStore(PathBuf),

    /// The demo read back something unexpected.
    #[error("demo check failed: {0}")]
    DemoMismatch(String),

    /// Verification found problems.
    #[error("verification failed with {0} problem(s)")]
    VerificationFailed(usize),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Knowledge base error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Codec error.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// JSON output error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
