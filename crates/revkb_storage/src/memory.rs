//! In-memory storage backend.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use revkb_codec::{BranchId, ObjectKey, RevisionNumber, Value, CURRENT_REV, INITIAL_REV, TRUNK};

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::row::{
    BranchRow, ChangeKind, ColumnFilter, CommitBatch, FlexRow, ObjectChange, RevisionRow, Row,
    RowChange, StorageStats,
};

type HistoryKey = (String, BranchId, u64);

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<(BranchId, u64), Vec<Row>>,
    flex: BTreeMap<(BranchId, u64), Vec<FlexRow>>,
}

#[derive(Debug)]
struct MemoryState {
    tables: BTreeMap<String, Table>,
    revisions: BTreeMap<RevisionNumber, RevisionRow>,
    branches: BTreeMap<BranchId, BranchRow>,
}

/// Row histories touched by a batch, with the batch already applied.
struct Staged {
    revision: RevisionRow,
    rows: BTreeMap<HistoryKey, Vec<Row>>,
    flex: BTreeMap<HistoryKey, Vec<FlexRow>>,
}

impl MemoryState {
    fn new() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(
            TRUNK,
            BranchRow {
                id: TRUNK,
                base_branch: None,
                base_revision: INITIAL_REV,
                created_at: INITIAL_REV,
                tables: Vec::new(),
            },
        );
        Self {
            tables: BTreeMap::new(),
            revisions: BTreeMap::new(),
            branches,
        }
    }

    fn last_revision(&self) -> RevisionNumber {
        self.revisions
            .keys()
            .next_back()
            .copied()
            .unwrap_or(INITIAL_REV)
    }

    fn check_revision(&self, revision: RevisionNumber) -> StorageResult<()> {
        let last = self.last_revision();
        if revision <= last {
            return Err(StorageError::StaleRevision { revision, last });
        }
        Ok(())
    }

    fn row_history(&self, key: &HistoryKey) -> Vec<Row> {
        self.tables
            .get(&key.0)
            .and_then(|t| t.rows.get(&(key.1, key.2)))
            .cloned()
            .unwrap_or_default()
    }

    fn flex_history(&self, key: &HistoryKey) -> Vec<FlexRow> {
        self.tables
            .get(&key.0)
            .and_then(|t| t.flex.get(&(key.1, key.2)))
            .cloned()
            .unwrap_or_default()
    }

    fn staged_rows<'a>(
        &self,
        staged: &'a mut BTreeMap<HistoryKey, Vec<Row>>,
        key: HistoryKey,
    ) -> &'a mut Vec<Row> {
        match staged.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let history = self.row_history(e.key());
                e.insert(history)
            }
        }
    }

    fn staged_flex<'a>(
        &self,
        staged: &'a mut BTreeMap<HistoryKey, Vec<FlexRow>>,
        key: HistoryKey,
    ) -> &'a mut Vec<FlexRow> {
        match staged.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let history = self.flex_history(e.key());
                e.insert(history)
            }
        }
    }

    fn stage(&self, batch: &CommitBatch) -> StorageResult<Staged> {
        let r = batch.revision.number;
        self.check_revision(r)?;

        let mut rows = BTreeMap::new();
        let mut flex = BTreeMap::new();
        for change in &batch.changes {
            let (branch, id) = change.target();
            if !self.branches.contains_key(&branch) {
                return Err(StorageError::UnknownBranch(branch));
            }
            let key = (change.table().to_string(), branch, id);
            match change {
                RowChange::Create { table, values, .. } => {
                    let history = self.staged_rows(&mut rows, key);
                    if history.last().is_some_and(Row::is_open) {
                        return Err(StorageError::row_conflict(
                            table.as_str(),
                            branch,
                            id,
                            "object already exists",
                        ));
                    }
                    history.push(Row {
                        id,
                        rev_min: r,
                        rev_max: CURRENT_REV,
                        values: values.clone(),
                    });
                }
                RowChange::Update { table, values, .. } => {
                    let history = self.staged_rows(&mut rows, key);
                    close_live_row(history, r, batch.base, table, branch, id)?;
                    history.push(Row {
                        id,
                        rev_min: r,
                        rev_max: CURRENT_REV,
                        values: values.clone(),
                    });
                }
                RowChange::Delete { table, .. } => {
                    let history = self.staged_rows(&mut rows, key);
                    close_live_row(history, r, batch.base, table, branch, id)?;
                }
                RowChange::SetFlex {
                    attribute, value, ..
                } => {
                    let history = self.staged_flex(&mut flex, key);
                    if let Some(pos) = history
                        .iter()
                        .position(|f| f.attribute == *attribute && f.rev_max == CURRENT_REV)
                    {
                        if history[pos].rev_min == r {
                            history.remove(pos);
                        } else {
                            history[pos].rev_max = r - 1;
                        }
                    }
                    if let Some(value) = value {
                        history.push(FlexRow {
                            id,
                            attribute: attribute.clone(),
                            rev_min: r,
                            rev_max: CURRENT_REV,
                            value: value.clone(),
                        });
                    }
                }
            }
        }
        Ok(Staged {
            revision: batch.revision.clone(),
            rows,
            flex,
        })
    }

    fn install(&mut self, staged: Staged) {
        for ((table, branch, id), history) in staged.rows {
            self.tables
                .entry(table)
                .or_default()
                .rows
                .insert((branch, id), history);
        }
        for ((table, branch, id), history) in staged.flex {
            self.tables
                .entry(table)
                .or_default()
                .flex
                .insert((branch, id), history);
        }
        self.revisions
            .insert(staged.revision.number, staged.revision);
    }

    fn changes_since(&self, after: RevisionNumber) -> Vec<ObjectChange> {
        let mut changes = BTreeSet::new();
        for (name, table) in &self.tables {
            for (&(branch, id), history) in &table.rows {
                let change = |revision, kind| ObjectChange {
                    revision,
                    table: name.clone(),
                    branch,
                    id,
                    kind,
                };
                for (i, row) in history.iter().enumerate() {
                    if row.rev_min > after {
                        let replaced = i > 0 && history[i - 1].rev_max + 1 == row.rev_min;
                        let kind = if replaced {
                            ChangeKind::Updated
                        } else {
                            ChangeKind::Created
                        };
                        changes.insert(change(row.rev_min, kind));
                    }
                    if !row.is_open() && row.rev_max >= after {
                        let ended = row.rev_max + 1;
                        let replaced = history.get(i + 1).is_some_and(|next| next.rev_min == ended);
                        if !replaced {
                            changes.insert(change(ended, ChangeKind::Deleted));
                        }
                    }
                }
            }
        }

        let mut touched: BTreeSet<(RevisionNumber, &str, BranchId, u64)> = changes
            .iter()
            .map(|c| (c.revision, c.table.as_str(), c.branch, c.id))
            .collect();
        let mut flex_only = Vec::new();
        for (name, table) in &self.tables {
            for (&(branch, id), history) in &table.flex {
                for row in history {
                    let mut revisions = vec![row.rev_min];
                    if row.rev_max != CURRENT_REV {
                        revisions.push(row.rev_max + 1);
                    }
                    for revision in revisions {
                        if revision > after && touched.insert((revision, name.as_str(), branch, id)) {
                            flex_only.push(ObjectChange {
                                revision,
                                table: name.clone(),
                                branch,
                                id,
                                kind: ChangeKind::Flex,
                            });
                        }
                    }
                }
            }
        }
        drop(touched);
        changes.extend(flex_only);
        changes.into_iter().collect()
    }

    fn check_branch(&self, branch: &BranchRow, revision: &RevisionRow) -> StorageResult<()> {
        if self.branches.contains_key(&branch.id) {
            return Err(StorageError::BranchExists(branch.id));
        }
        let base = branch.base_branch.unwrap_or(TRUNK);
        if !self.branches.contains_key(&base) {
            return Err(StorageError::UnknownBranch(base));
        }
        self.check_revision(revision.number)
    }

    fn copy_branch(&mut self, branch: BranchRow, revision: RevisionRow) {
        let base = branch.base_branch.unwrap_or(TRUNK);
        let at = branch.base_revision;
        let r = revision.number;
        for name in &branch.tables {
            let Some(table) = self.tables.get_mut(name) else {
                continue;
            };
            let copied: Vec<_> = table
                .rows
                .range((base, 0)..=(base, u64::MAX))
                .filter_map(|(&(_, id), history)| {
                    history.iter().find(|row| row.is_alive_at(at)).map(|row| {
                        (
                            (branch.id, id),
                            vec![Row {
                                id,
                                rev_min: r,
                                rev_max: CURRENT_REV,
                                values: row
                                    .values
                                    .iter()
                                    .map(|v| rebranch(v, base, branch.id))
                                    .collect(),
                            }],
                        )
                    })
                })
                .collect();
            table.rows.extend(copied);

            let copied_flex: Vec<_> = table
                .flex
                .range((base, 0)..=(base, u64::MAX))
                .map(|(&(_, id), history)| {
                    let alive: Vec<_> = history
                        .iter()
                        .filter(|f| f.is_alive_at(at))
                        .map(|f| FlexRow {
                            rev_min: r,
                            rev_max: CURRENT_REV,
                            value: rebranch(&f.value, base, branch.id),
                            ..f.clone()
                        })
                        .collect();
                    ((branch.id, id), alive)
                })
                .filter(|(_, alive)| !alive.is_empty())
                .collect();
            table.flex.extend(copied_flex);
        }
        self.revisions.insert(r, revision);
        self.branches.insert(branch.id, branch);
    }
}

/// Points references into `from` at the same objects in `to`.
fn rebranch(value: &Value, from: BranchId, to: BranchId) -> Value {
    match value {
        Value::Ref(key) if key.branch == from => Value::Ref(ObjectKey {
            branch: to,
            ..key.clone()
        }),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| rebranch(v, from, to)).collect())
        }
        other => other.clone(),
    }
}

fn close_live_row(
    history: &mut [Row],
    revision: RevisionNumber,
    base: Option<RevisionNumber>,
    table: &str,
    branch: BranchId,
    id: u64,
) -> StorageResult<()> {
    if let (Some(base), Some(row)) = (base, history.last()) {
        if row.is_open() && row.rev_min > base {
            return Err(StorageError::row_conflict(
                table,
                branch,
                id,
                format!("live row starts at {} after base revision {base}", row.rev_min),
            ));
        }
    }
    match history.last_mut() {
        Some(row) if row.is_open() && row.rev_min < revision => {
            row.rev_max = revision - 1;
            Ok(())
        }
        Some(row) if row.is_open() => Err(StorageError::row_conflict(
            table,
            branch,
            id,
            format!("live row starts at {} not before {revision}", row.rev_min),
        )),
        _ => Err(StorageError::row_conflict(table, branch, id, "no live row")),
    }
}

/// An in-memory versioned row store.
///
/// This backend stores all data in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral knowledge bases that don't need persistence
///
/// It is also the in-memory image behind [`super::FileBackend`].
///
/// # Thread Safety
///
/// Reads share a lock; commits and branch creation take it exclusively.
/// Each named sequence has its own row lock.
///
/// # Example
///
/// ```rust
/// use revkb_storage::{CommitBatch, InMemoryBackend, RevisionRow, RowChange, StorageBackend};
/// use revkb_codec::{Value, TRUNK};
///
/// let backend = InMemoryBackend::new();
/// backend.commit(CommitBatch {
///     revision: RevisionRow { number: 1, author: "root".into(), date_millis: 0, log: String::new() },
///     base: None,
///     changes: vec![RowChange::Create {
///         table: "Person".into(), branch: TRUNK, id: 1, values: vec![Value::from("Ada")],
///     }],
/// }).unwrap();
/// assert_eq!(backend.last_revision().unwrap(), 1);
/// ```
#[derive(Debug)]
pub struct InMemoryBackend {
    state: RwLock<MemoryState>,
    sequences: Mutex<HashMap<String, Arc<Mutex<u64>>>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Creates a new empty backend holding only the trunk branch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::new()),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Checks that `batch` would commit, without applying it.
    pub(crate) fn check_commit(&self, batch: &CommitBatch) -> StorageResult<()> {
        self.state.read().stage(batch).map(|_| ())
    }

    /// Checks that a branch could be created, without creating it.
    pub(crate) fn check_branch(
        &self,
        branch: &BranchRow,
        revision: &RevisionRow,
    ) -> StorageResult<()> {
        self.state.read().check_branch(branch, revision)
    }

    fn sequence_row(&self, name: &str) -> Arc<Mutex<u64>> {
        self.sequences
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Reserves sequence values, running `persist` with the new high-water
    /// mark while the sequence row is locked.
    pub(crate) fn reserve_with(
        &self,
        name: &str,
        count: u64,
        persist: impl FnOnce(u64) -> StorageResult<()>,
    ) -> StorageResult<u64> {
        let row = self.sequence_row(name);
        let mut value = row.lock();
        let first = *value + 1;
        let next = *value + count.max(1);
        persist(next)?;
        *value = next;
        Ok(first)
    }

    /// Restores a sequence high-water mark during journal replay.
    pub(crate) fn restore_sequence(&self, name: &str, value: u64) {
        let row = self.sequence_row(name);
        let mut current = row.lock();
        *current = (*current).max(value);
    }
}

impl StorageBackend for InMemoryBackend {
    fn last_revision(&self) -> StorageResult<RevisionNumber> {
        Ok(self.state.read().last_revision())
    }

    fn revision(&self, number: RevisionNumber) -> StorageResult<Option<RevisionRow>> {
        Ok(self.state.read().revisions.get(&number).cloned())
    }

    fn revisions(&self) -> StorageResult<Vec<RevisionRow>> {
        Ok(self.state.read().revisions.values().cloned().collect())
    }

    fn fetch(
        &self,
        table: &str,
        branch: BranchId,
        id: u64,
        revision: RevisionNumber,
    ) -> StorageResult<Option<Row>> {
        let state = self.state.read();
        Ok(state
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&(branch, id)))
            .and_then(|history| history.iter().find(|row| row.is_alive_at(revision)))
            .cloned())
    }

    fn history(&self, table: &str, branch: BranchId, id: u64) -> StorageResult<Vec<Row>> {
        Ok(self
            .state
            .read()
            .row_history(&(table.to_string(), branch, id)))
    }

    fn object_ids(&self, table: &str, branch: BranchId) -> StorageResult<Vec<u64>> {
        let state = self.state.read();
        Ok(state
            .tables
            .get(table)
            .map(|t| {
                t.rows
                    .range((branch, 0)..=(branch, u64::MAX))
                    .map(|(&(_, id), _)| id)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn scan(
        &self,
        table: &str,
        branch: BranchId,
        revision: RevisionNumber,
        filters: &[ColumnFilter],
    ) -> StorageResult<Vec<Row>> {
        let state = self.state.read();
        let Some(table) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(table
            .rows
            .range((branch, 0)..=(branch, u64::MAX))
            .filter_map(|(_, history)| history.iter().find(|row| row.is_alive_at(revision)))
            .filter(|row| filters.iter().all(|f| f.matches(row)))
            .cloned()
            .collect())
    }

    fn fetch_flex(
        &self,
        table: &str,
        branch: BranchId,
        ids: &[u64],
        revision: RevisionNumber,
    ) -> StorageResult<Vec<FlexRow>> {
        let state = self.state.read();
        let Some(table) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| table.flex.get(&(branch, *id)))
            .flat_map(|history| history.iter().filter(|f| f.is_alive_at(revision)))
            .cloned()
            .collect())
    }

    fn changes_since(&self, after: RevisionNumber) -> StorageResult<Vec<ObjectChange>> {
        Ok(self.state.read().changes_since(after))
    }

    fn commit(&self, batch: CommitBatch) -> StorageResult<()> {
        let mut state = self.state.write();
        let staged = state.stage(&batch)?;
        state.install(staged);
        Ok(())
    }

    fn create_branch(&self, branch: BranchRow, revision: RevisionRow) -> StorageResult<()> {
        let mut state = self.state.write();
        state.check_branch(&branch, &revision)?;
        state.copy_branch(branch, revision);
        Ok(())
    }

    fn branches(&self) -> StorageResult<Vec<BranchRow>> {
        Ok(self.state.read().branches.values().cloned().collect())
    }

    fn reserve_sequence(&self, name: &str, count: u64) -> StorageResult<u64> {
        self.reserve_with(name, count, |_| Ok(()))
    }

    fn tables(&self) -> StorageResult<Vec<String>> {
        Ok(self.state.read().tables.keys().cloned().collect())
    }

    fn stats(&self) -> StorageResult<StorageStats> {
        let state = self.state.read();
        let mut stats = StorageStats {
            tables: state.tables.len(),
            revisions: state.revisions.len(),
            branches: state.branches.len(),
            ..StorageStats::default()
        };
        for table in state.tables.values() {
            for history in table.rows.values() {
                stats.row_versions += history.len();
                stats.live_rows += history.iter().filter(|r| r.is_open()).count();
            }
            stats.flex_versions += table.flex.values().map(Vec::len).sum::<usize>();
        }
        Ok(stats)
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}
