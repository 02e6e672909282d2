//! Storage backend trait definition.

use revkb_codec::{BranchId, RevisionNumber};

use crate::error::StorageResult;
use crate::row::{
    BranchRow, ColumnFilter, CommitBatch, FlexRow, ObjectChange, RevisionRow, Row, StorageStats,
};

/// A versioned row store.
///
/// Backends persist rows with revision ranges, the revision table, the
/// branch table and named sequences. They know nothing about types,
/// caches or contexts.
///
/// # Invariants
///
/// - `commit` applies all changes of a batch or none of them
/// - committed revision numbers strictly increase; gaps are allowed
/// - a row visible at revision `r` stays visible at `r` forever
/// - `reserve_sequence` never hands out the same value twice
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - Journaled persistent storage
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Number of the last committed revision, or `INITIAL_REV`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn last_revision(&self) -> StorageResult<RevisionNumber>;

    /// Metadata of one revision.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn revision(&self, number: RevisionNumber) -> StorageResult<Option<RevisionRow>>;

    /// All revisions in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn revisions(&self) -> StorageResult<Vec<RevisionRow>>;

    /// The version of one object valid at `revision`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn fetch(
        &self,
        table: &str,
        branch: BranchId,
        id: u64,
        revision: RevisionNumber,
    ) -> StorageResult<Option<Row>>;

    /// Every stored version of one object, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn history(&self, table: &str, branch: BranchId, id: u64) -> StorageResult<Vec<Row>>;

    /// Ids of every object with stored history in a table, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn object_ids(&self, table: &str, branch: BranchId) -> StorageResult<Vec<u64>>;

    /// All rows of a table valid at `revision` passing every filter, by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn scan(
        &self,
        table: &str,
        branch: BranchId,
        revision: RevisionNumber,
        filters: &[ColumnFilter],
    ) -> StorageResult<Vec<Row>>;

    /// Flex rows of the given objects valid at `revision`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn fetch_flex(
        &self,
        table: &str,
        branch: BranchId,
        ids: &[u64],
        revision: RevisionNumber,
    ) -> StorageResult<Vec<FlexRow>>;

    /// Every object touched by a revision after `after`, ordered by
    /// revision. An object whose rows and flex rows both changed in one
    /// revision is listed once, with its row change.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn changes_since(&self, after: RevisionNumber) -> StorageResult<Vec<ObjectChange>>;

    /// Atomically applies a commit batch.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the store unchanged, if the revision is not
    /// after the last one or a change does not fit the stored rows,
    /// including rows replaced after the batch's base revision.
    fn commit(&self, batch: CommitBatch) -> StorageResult<()>;

    /// Creates a branch by copying the rows of `branch.tables` valid at
    /// `branch.base_revision` in `branch.base_branch`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is taken or the base is unknown.
    fn create_branch(&self, branch: BranchRow, revision: RevisionRow) -> StorageResult<()>;

    /// All branches by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn branches(&self) -> StorageResult<Vec<BranchRow>>;

    /// Reserves `count` consecutive values of a named sequence and returns
    /// the first one. Values start at 1.
    ///
    /// Concurrent reservations on the same sequence are serialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the reservation cannot be persisted.
    fn reserve_sequence(&self, name: &str, count: u64) -> StorageResult<u64>;

    /// Names of all tables that ever received a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn tables(&self) -> StorageResult<Vec<String>>;

    /// Summary counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn stats(&self) -> StorageResult<StorageStats>;

    /// Syncs all written data to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;
}
