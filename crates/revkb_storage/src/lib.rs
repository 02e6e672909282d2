//! # revkb Storage
//!
//! Versioned row storage for revkb.
//!
//! This crate is the lowest persistent layer of a knowledge base. Rows carry
//! the revision range they are valid for, so every past state of every
//! object stays readable. Backends also keep the revision table, the branch
//! table and named sequences.
//!
//! ## Design Principles
//!
//! - Backends store rows, not objects; they know no schema
//! - A commit batch is applied completely or not at all
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral stores
//! - [`FileBackend`] - Journaled persistent storage in a directory

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod row;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use row::{
    BranchRow, ChangeKind, ColumnFilter, CommitBatch, FlexRow, ObjectChange, RevisionRow, Row,
    RowChange, StorageStats,
};
