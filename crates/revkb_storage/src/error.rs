//! Error types for storage operations.

use std::io;

use revkb_codec::{BranchId, CodecError, RevisionNumber};
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A journal record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store lock.
    #[error("store is locked by another process")]
    Locked,

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,

    /// A commit used a revision number not above the last committed one.
    #[error("revision {revision} is not after last committed revision {last}")]
    StaleRevision {
        /// Revision of the rejected batch.
        revision: RevisionNumber,
        /// Last committed revision.
        last: RevisionNumber,
    },

    /// A row change did not match the stored row history.
    #[error("row conflict in {table}@b{branch} id {id}: {message}")]
    RowConflict {
        /// Table of the row.
        table: String,
        /// Branch of the row.
        branch: BranchId,
        /// Row id.
        id: u64,
        /// What did not match.
        message: String,
    },

    /// A branch was referenced that does not exist.
    #[error("unknown branch {0}")]
    UnknownBranch(BranchId),

    /// A branch id is already taken.
    #[error("branch {0} already exists")]
    BranchExists(BranchId),
}

impl StorageError {
    /// Create a row conflict error.
    pub fn row_conflict(
        table: impl Into<String>,
        branch: BranchId,
        id: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::RowConflict {
            table: table.into(),
            branch,
            id,
            message: message.into(),
        }
    }
}
