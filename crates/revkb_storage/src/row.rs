//! Versioned rows and commit batches.
//!
//! Every stored row carries the inclusive revision range `[rev_min, rev_max]`
//! it is valid for. The live row of an object has `rev_max == CURRENT_REV`.

use revkb_codec::{BranchId, RevisionNumber, Value, CURRENT_REV};
use serde::{Deserialize, Serialize};

/// One version of an object's attribute values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Object id.
    pub id: u64,
    /// First revision this version is valid for.
    pub rev_min: RevisionNumber,
    /// Last revision this version is valid for.
    pub rev_max: RevisionNumber,
    /// Attribute values in schema order.
    pub values: Vec<Value>,
}

impl Row {
    /// Returns true if this version is valid at `revision`.
    #[must_use]
    pub fn is_alive_at(&self, revision: RevisionNumber) -> bool {
        self.rev_min <= revision && revision <= self.rev_max
    }

    /// Returns true if this is the live version.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.rev_max == CURRENT_REV
    }

    /// Value of column `column`, or `Null` past the end.
    #[must_use]
    pub fn value(&self, column: usize) -> &Value {
        self.values.get(column).unwrap_or(&Value::Null)
    }
}

/// One version of a dynamic (flex) attribute of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlexRow {
    /// Object id.
    pub id: u64,
    /// Attribute name.
    pub attribute: String,
    /// First revision this version is valid for.
    pub rev_min: RevisionNumber,
    /// Last revision this version is valid for.
    pub rev_max: RevisionNumber,
    /// Attribute value.
    pub value: Value,
}

impl FlexRow {
    /// Returns true if this version is valid at `revision`.
    #[must_use]
    pub fn is_alive_at(&self, revision: RevisionNumber) -> bool {
        self.rev_min <= revision && revision <= self.rev_max
    }
}

/// Metadata of one committed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRow {
    /// Revision number.
    pub number: RevisionNumber,
    /// Who committed it.
    pub author: String,
    /// Commit time, milliseconds since the Unix epoch.
    pub date_millis: i64,
    /// Free-form commit message.
    pub log: String,
}

/// Metadata of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRow {
    /// Branch id.
    pub id: BranchId,
    /// Branch this one was copied from; `None` for the trunk.
    pub base_branch: Option<BranchId>,
    /// Revision of the base branch the copy was taken at.
    pub base_revision: RevisionNumber,
    /// Revision that created this branch.
    pub created_at: RevisionNumber,
    /// Tables whose rows were copied.
    pub tables: Vec<String>,
}

/// One row-level change of a commit.
///
/// All changes of a batch happen at the batch's revision `r`: created rows
/// start at `r`; replaced and deleted rows end at `r - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowChange {
    /// Insert the first version of an object.
    Create {
        /// Table name.
        table: String,
        /// Branch.
        branch: BranchId,
        /// Object id.
        id: u64,
        /// Attribute values.
        values: Vec<Value>,
    },
    /// Replace the live version of an object.
    Update {
        /// Table name.
        table: String,
        /// Branch.
        branch: BranchId,
        /// Object id.
        id: u64,
        /// New attribute values.
        values: Vec<Value>,
    },
    /// End the live version of an object.
    Delete {
        /// Table name.
        table: String,
        /// Branch.
        branch: BranchId,
        /// Object id.
        id: u64,
    },
    /// Set or clear a flex attribute.
    SetFlex {
        /// Table name.
        table: String,
        /// Branch.
        branch: BranchId,
        /// Object id.
        id: u64,
        /// Attribute name.
        attribute: String,
        /// New value; `None` removes the attribute.
        value: Option<Value>,
    },
}

impl RowChange {
    /// Table touched by this change.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Create { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. }
            | Self::SetFlex { table, .. } => table,
        }
    }

    /// Branch and object id touched by this change.
    #[must_use]
    pub fn target(&self) -> (BranchId, u64) {
        match self {
            Self::Create { branch, id, .. }
            | Self::Update { branch, id, .. }
            | Self::Delete { branch, id, .. }
            | Self::SetFlex { branch, id, .. } => (*branch, *id),
        }
    }
}

/// All row changes of one revision, applied atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBatch {
    /// Revision metadata; its number is the revision of every change.
    pub revision: RevisionRow,
    /// Revision the changes were made against. When set, updates and
    /// deletes of an object whose live row starts after it are rejected.
    #[serde(default)]
    pub base: Option<RevisionNumber>,
    /// Row changes.
    pub changes: Vec<RowChange>,
}

/// How a revision touched an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ChangeKind {
    /// First row of the object.
    Created,
    /// The live row was replaced.
    Updated,
    /// The live row was ended.
    Deleted,
    /// Only flex attributes changed.
    Flex,
}

/// One object touched by one committed revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectChange {
    /// The revision.
    pub revision: RevisionNumber,
    /// Table name.
    pub table: String,
    /// Branch.
    pub branch: BranchId,
    /// Object id.
    pub id: u64,
    /// What happened.
    pub kind: ChangeKind,
}

/// Equality filter on a value column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    /// Column index in schema order.
    pub column: usize,
    /// Required value.
    pub value: Value,
}

impl ColumnFilter {
    /// Creates a filter.
    #[must_use]
    pub fn new(column: usize, value: Value) -> Self {
        Self { column, value }
    }

    /// Returns true if `row` passes.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        row.value(self.column) == &self.value
    }
}

/// Summary counts of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Number of tables.
    pub tables: usize,
    /// Number of row versions, live and historic.
    pub row_versions: usize,
    /// Number of live rows.
    pub live_rows: usize,
    /// Number of flex row versions.
    pub flex_versions: usize,
    /// Number of committed revisions.
    pub revisions: usize,
    /// Number of branches.
    pub branches: usize,
}
