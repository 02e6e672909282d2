//! Journaled file backend for persistent storage.
//!
//! Directory layout:
//!
//! ```text
//! <store>/
//! ├─ LOCK           # Advisory lock for single-process access
//! └─ journal.rkb    # Append-only journal of checksummed CBOR frames
//! ```
//!
//! The journal opens with a header record and then holds one record per
//! commit, branch creation and sequence reservation. Opening a store
//! replays the journal into an [`InMemoryBackend`] image; a torn frame at
//! the tail is cut off.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use revkb_codec::{encode_frame, from_cbor, to_cbor, BranchId, FrameReader, RevisionNumber};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::memory::InMemoryBackend;
use crate::row::{
    BranchRow, ColumnFilter, CommitBatch, FlexRow, ObjectChange, RevisionRow, Row, StorageStats,
};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.rkb";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
enum JournalRecord {
    Header { store_id: Uuid, format_version: u32 },
    Commit(CommitBatch),
    Branch { branch: BranchRow, revision: RevisionRow },
    Sequence { name: String, value: u64 },
}

/// A file-based, journaled versioned row store.
///
/// All reads are served from an in-memory image. Every mutation is first
/// validated against the image, then appended to the journal, then applied.
///
/// # Durability
///
/// With `sync_on_commit` every journal append is followed by
/// `File::sync_data()`. Without it data reaches the OS on every append and
/// disk on [`StorageBackend::sync`].
///
/// # Example
///
/// ```no_run
/// use revkb_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("my_store"), true).unwrap();
/// println!("last revision {}", backend.last_revision().unwrap());
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    store_id: Uuid,
    image: InMemoryBackend,
    journal: Mutex<File>,
    sync_on_commit: bool,
    _lock_file: File,
}

impl FileBackend {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - Another process holds the lock (returns `Locked`)
    /// - The journal is corrupted before its last frame
    pub fn open(path: &Path, sync_on_commit: bool) -> StorageResult<Self> {
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let journal_path = Self::journal_path(path);
        let mut journal = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&journal_path)?;
        let mut data = Vec::new();
        journal.read_to_end(&mut data)?;

        let image = InMemoryBackend::new();
        let (store_id, valid_len) = replay(&data, &image)?;
        if valid_len < data.len() {
            warn!(
                discarded = data.len() - valid_len,
                "cutting torn frame off journal tail"
            );
            journal.set_len(valid_len as u64)?;
            journal.sync_all()?;
        }
        let store_id = match store_id {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                let header = JournalRecord::Header {
                    store_id: id,
                    format_version: FORMAT_VERSION,
                };
                journal.write_all(&encode_frame(&to_cbor(&header)?))?;
                journal.sync_all()?;
                info!(store = %id, path = %path.display(), "created store");
                id
            }
        };

        debug!(store = %store_id, bytes = valid_len, "opened store");
        Ok(Self {
            path: path.to_path_buf(),
            store_id,
            image,
            journal: Mutex::new(journal),
            sync_on_commit,
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the journal file of the store in directory `path`.
    #[must_use]
    pub fn journal_path(path: &Path) -> PathBuf {
        path.join(JOURNAL_FILE)
    }

    /// Returns the id generated when the store was created.
    #[must_use]
    pub fn store_id(&self) -> Uuid {
        self.store_id
    }

    fn append(journal: &mut File, record: &JournalRecord, sync: bool) -> StorageResult<()> {
        journal.write_all(&encode_frame(&to_cbor(record)?))?;
        journal.flush()?;
        if sync {
            journal.sync_data()?;
        }
        Ok(())
    }
}

#[allow(clippy::while_let_on_iterator)]
fn replay(data: &[u8], image: &InMemoryBackend) -> StorageResult<(Option<Uuid>, usize)> {
    let mut store_id = None;
    let mut reader = FrameReader::new(data);
    let mut valid_len = 0;
    while let Some(frame) = reader.next() {
        let payload = match frame {
            Ok(payload) => payload,
            Err(e) if e.is_truncation() => break,
            Err(e) => return Err(StorageError::Corrupted(e.to_string())),
        };
        match from_cbor::<JournalRecord>(payload)? {
            JournalRecord::Header {
                store_id: id,
                format_version,
            } => {
                if format_version != FORMAT_VERSION {
                    return Err(StorageError::Corrupted(format!(
                        "unsupported journal format {format_version}"
                    )));
                }
                store_id = Some(id);
            }
            JournalRecord::Commit(batch) => image.commit(batch)?,
            JournalRecord::Branch { branch, revision } => image.create_branch(branch, revision)?,
            JournalRecord::Sequence { name, value } => image.restore_sequence(&name, value),
        }
        valid_len = reader.offset();
    }
    Ok((store_id, valid_len))
}

impl StorageBackend for FileBackend {
    fn last_revision(&self) -> StorageResult<RevisionNumber> {
        self.image.last_revision()
    }

    fn revision(&self, number: RevisionNumber) -> StorageResult<Option<RevisionRow>> {
        self.image.revision(number)
    }

    fn revisions(&self) -> StorageResult<Vec<RevisionRow>> {
        self.image.revisions()
    }

    fn fetch(
        &self,
        table: &str,
        branch: BranchId,
        id: u64,
        revision: RevisionNumber,
    ) -> StorageResult<Option<Row>> {
        self.image.fetch(table, branch, id, revision)
    }

    fn history(&self, table: &str, branch: BranchId, id: u64) -> StorageResult<Vec<Row>> {
        self.image.history(table, branch, id)
    }

    fn object_ids(&self, table: &str, branch: BranchId) -> StorageResult<Vec<u64>> {
        self.image.object_ids(table, branch)
    }

    fn scan(
        &self,
        table: &str,
        branch: BranchId,
        revision: RevisionNumber,
        filters: &[ColumnFilter],
    ) -> StorageResult<Vec<Row>> {
        self.image.scan(table, branch, revision, filters)
    }

    fn fetch_flex(
        &self,
        table: &str,
        branch: BranchId,
        ids: &[u64],
        revision: RevisionNumber,
    ) -> StorageResult<Vec<FlexRow>> {
        self.image.fetch_flex(table, branch, ids, revision)
    }

    fn changes_since(&self, after: RevisionNumber) -> StorageResult<Vec<ObjectChange>> {
        self.image.changes_since(after)
    }

    fn commit(&self, batch: CommitBatch) -> StorageResult<()> {
        let mut journal = self.journal.lock();
        self.image.check_commit(&batch)?;
        let record = JournalRecord::Commit(batch.clone());
        Self::append(&mut journal, &record, self.sync_on_commit)?;
        self.image.commit(batch)
    }

    fn create_branch(&self, branch: BranchRow, revision: RevisionRow) -> StorageResult<()> {
        let mut journal = self.journal.lock();
        self.image.check_branch(&branch, &revision)?;
        let record = JournalRecord::Branch {
            branch: branch.clone(),
            revision: revision.clone(),
        };
        Self::append(&mut journal, &record, self.sync_on_commit)?;
        self.image.create_branch(branch, revision)
    }

    fn branches(&self) -> StorageResult<Vec<BranchRow>> {
        self.image.branches()
    }

    fn reserve_sequence(&self, name: &str, count: u64) -> StorageResult<u64> {
        self.image.reserve_with(name, count, |value| {
            let mut journal = self.journal.lock();
            let record = JournalRecord::Sequence {
                name: name.to_string(),
                value,
            };
            Self::append(&mut journal, &record, self.sync_on_commit)
        })
    }

    fn tables(&self) -> StorageResult<Vec<String>> {
        self.image.tables()
    }

    fn stats(&self) -> StorageResult<StorageStats> {
        self.image.stats()
    }

    fn sync(&self) -> StorageResult<()> {
        self.journal.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowChange;
    use revkb_codec::{Value, CURRENT_REV, TRUNK};
    use tempfile::tempdir;

    fn batch(number: RevisionNumber, id: u64, name: &str) -> CommitBatch {
        CommitBatch {
            revision: RevisionRow {
                number,
                author: "tester".into(),
                date_millis: 1_700_000_000_000,
                log: format!("create {name}"),
            },
            base: None,
            changes: vec![RowChange::Create {
                table: "Person".into(),
                branch: TRUNK,
                id,
                values: vec![Value::from(name)],
            }],
        }
    }

    #[test]
    fn reopen_replays_commits_and_sequences() {
        let dir = tempdir().unwrap();
        let store_id;
        {
            let backend = FileBackend::open(dir.path(), true).unwrap();
            store_id = backend.store_id();
            backend.commit(batch(1, 1, "Ada")).unwrap();
            backend.commit(batch(2, 2, "Bob")).unwrap();
            assert_eq!(backend.reserve_sequence("ids", 8).unwrap(), 1);
        }

        let backend = FileBackend::open(dir.path(), true).unwrap();
        assert_eq!(backend.store_id(), store_id);
        assert_eq!(backend.last_revision().unwrap(), 2);
        assert_eq!(backend.revision(1).unwrap().unwrap().log, "create Ada");
        let bob = backend.fetch("Person", TRUNK, 2, CURRENT_REV).unwrap().unwrap();
        assert_eq!(bob.values, vec![Value::from("Bob")]);
        assert_eq!(backend.reserve_sequence("ids", 8).unwrap(), 9);
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let _first = FileBackend::open(dir.path(), false).unwrap();
        let second = FileBackend::open(dir.path(), false);
        assert!(matches!(second, Err(StorageError::Locked)));
    }

    #[test]
    fn rejected_commit_is_not_journaled() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path(), false).unwrap();
            backend.commit(batch(1, 1, "Ada")).unwrap();
            assert!(backend.commit(batch(2, 1, "Again")).is_err());
        }
        let backend = FileBackend::open(dir.path(), false).unwrap();
        assert_eq!(backend.last_revision().unwrap(), 1);
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path(), true).unwrap();
            backend.commit(batch(1, 1, "Ada")).unwrap();
        }
        let journal = dir.path().join(JOURNAL_FILE);
        let intact = fs::metadata(&journal).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&journal).unwrap();
            file.write_all(b"RKBF\x40\x00").unwrap();
        }

        let backend = FileBackend::open(dir.path(), true).unwrap();
        assert_eq!(backend.last_revision().unwrap(), 1);
        drop(backend);
        assert_eq!(fs::metadata(&journal).unwrap().len(), intact);
    }

    #[test]
    fn branches_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path(), false).unwrap();
            backend.commit(batch(1, 1, "Ada")).unwrap();
            backend
                .create_branch(
                    BranchRow {
                        id: 2,
                        base_branch: Some(TRUNK),
                        base_revision: 1,
                        created_at: 2,
                        tables: vec!["Person".into()],
                    },
                    RevisionRow {
                        number: 2,
                        author: "tester".into(),
                        date_millis: 0,
                        log: "branch".into(),
                    },
                )
                .unwrap();
            backend.sync().unwrap();
        }
        let backend = FileBackend::open(dir.path(), false).unwrap();
        assert_eq!(backend.branches().unwrap().len(), 2);
        assert_eq!(backend.scan("Person", 2, CURRENT_REV, &[]).unwrap().len(), 1);
    }
}
