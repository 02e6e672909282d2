//! Object identity and revision metadata.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use revkb_storage::RevisionRow;
use serde::Serialize;

use revkb_codec::RevisionNumber;

/// Unique identifier for a transaction context.
///
/// Context ids are monotonically increasing and never reused within a
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Creates a new context id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx:{}", self.0)
    }
}

/// A committed point in history.
///
/// Revisions are immutable and totally ordered by `number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revision {
    /// Commit number.
    pub number: RevisionNumber,
    /// Who committed.
    pub author: String,
    /// When it was committed.
    pub date: DateTime<Utc>,
    /// Commit message.
    pub log: String,
}

impl Revision {
    /// Creates a revision dated now.
    pub fn now(number: RevisionNumber, author: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            number,
            author: author.into(),
            date: Utc::now(),
            log: log.into(),
        }
    }

    /// Converts to the stored row.
    #[must_use]
    pub fn to_row(&self) -> RevisionRow {
        RevisionRow {
            number: self.number,
            author: self.author.clone(),
            date_millis: self.date.timestamp_millis(),
            log: self.log.clone(),
        }
    }
}

impl From<RevisionRow> for Revision {
    fn from(row: RevisionRow) -> Self {
        let date = Utc
            .timestamp_millis_opt(row.date_millis)
            .single()
            .unwrap_or_default();
        Self {
            number: row.number,
            author: row.author,
            date,
            log: row.log,
        }
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.number.cmp(&other.number)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r{} by {} at {}",
            self.number,
            self.author,
            self.date.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_row_roundtrip_keeps_millis() {
        let revision = Revision::now(4, "ada", "initial import");
        let back = Revision::from(revision.to_row());
        assert_eq!(back.number, 4);
        assert_eq!(back.author, "ada");
        assert_eq!(
            back.date.timestamp_millis(),
            revision.date.timestamp_millis()
        );
    }

    #[test]
    fn revisions_order_by_number() {
        let early = Revision::now(2, "b", "");
        let late = Revision::now(10, "a", "");
        assert!(early < late);
    }

    #[test]
    fn context_id_display() {
        assert_eq!(ContextId::new(3).to_string(), "ctx:3");
    }
}
