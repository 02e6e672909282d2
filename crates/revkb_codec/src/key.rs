//! Object identity and revision numbering.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A revision number. Revisions are totally ordered and increase by commit.
pub type RevisionNumber = u64;

/// Sentinel revision meaning "the latest state, still moving".
pub const CURRENT_REV: RevisionNumber = u64::MAX;

/// The first revision any commit can produce.
pub const FIRST_REV: RevisionNumber = 1;

/// The revision of an empty store, before any commit.
pub const INITIAL_REV: RevisionNumber = 0;

/// Branch identifier. The trunk branch always exists.
pub type BranchId = u64;

/// The trunk branch.
pub const TRUNK: BranchId = 1;

/// Identity of one object in one branch at one history position.
///
/// `history` is [`CURRENT_REV`] for the current, mutable view of an object
/// and a concrete revision for an immutable historic view.
///
/// Keys are ordered by `(branch, history, type_name, id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Branch the object lives in.
    pub branch: BranchId,
    /// History context: [`CURRENT_REV`] or a concrete revision.
    pub history: RevisionNumber,
    /// Name of the object's type.
    pub type_name: Arc<str>,
    /// Object id, unique per type table.
    pub id: u64,
}

impl ObjectKey {
    /// Creates a key for the current view of an object.
    pub fn current(branch: BranchId, type_name: impl Into<Arc<str>>, id: u64) -> Self {
        Self {
            branch,
            history: CURRENT_REV,
            type_name: type_name.into(),
            id,
        }
    }

    /// Creates a key for a historic view of an object.
    pub fn historic(
        branch: BranchId,
        revision: RevisionNumber,
        type_name: impl Into<Arc<str>>,
        id: u64,
    ) -> Self {
        Self {
            branch,
            history: revision,
            type_name: type_name.into(),
            id,
        }
    }

    /// Returns true for keys of current (mutable) objects.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.history == CURRENT_REV
    }

    /// The same object in another history context.
    #[must_use]
    pub fn at(&self, history: RevisionNumber) -> Self {
        Self {
            history,
            ..self.clone()
        }
    }

    /// The current view of this object.
    #[must_use]
    pub fn to_current(&self) -> Self {
        self.at(CURRENT_REV)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_current() {
            write!(f, "{}#{}@b{}", self.type_name, self.id, self.branch)
        } else {
            write!(
                f,
                "{}#{}@b{}/r{}",
                self.type_name, self.id, self.branch, self.history
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_and_historic_keys_differ() {
        let current = ObjectKey::current(TRUNK, "Person", 7);
        let historic = current.at(3);
        assert!(current.is_current());
        assert!(!historic.is_current());
        assert_ne!(current, historic);
        assert_eq!(historic.to_current(), current);
    }

    #[test]
    fn display_format() {
        let key = ObjectKey::current(TRUNK, "Person", 7);
        assert_eq!(key.to_string(), "Person#7@b1");
        assert_eq!(key.at(4).to_string(), "Person#7@b1/r4");
    }

    #[test]
    fn ordering_groups_by_branch_first() {
        let a = ObjectKey::current(1, "Z", 9);
        let b = ObjectKey::current(2, "A", 1);
        assert!(a < b);
    }
}
