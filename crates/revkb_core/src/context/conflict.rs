//! Optimistic merge checks.
//!
//! A context edits against its session revision `s`. Before its changes can
//! be applied on top of the last revision `L`, every commit in `(s, L]` is
//! checked against them through the stored row ranges: a row of interest
//! whose `rev_min` lies after `s` was written concurrently.

use std::fmt;
use std::sync::Arc;

use revkb_codec::{ObjectKey, RevisionNumber, Value};
use revkb_storage::{ColumnFilter, Row};

use super::ContextState;
use crate::arena::Env;
use crate::error::CoreResult;

/// One reason a context's changes cannot be merged with concurrent commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeConflict {
    /// An object changed here was changed by a later commit.
    ConcurrentChange {
        /// The object.
        key: ObjectKey,
        /// Revision of the concurrent change.
        revision: RevisionNumber,
    },
    /// An object changed here was deleted by a later commit.
    ChangedDeleted {
        /// The object.
        key: ObjectKey,
    },
    /// An object deleted here was changed by a later commit.
    DeletedChanged {
        /// The object.
        key: ObjectKey,
        /// Revision of the concurrent change.
        revision: RevisionNumber,
    },
    /// An object created here already exists.
    ConcurrentCreation {
        /// The object.
        key: ObjectKey,
    },
    /// An object written here references an object deleted by a later
    /// commit.
    ReferenceToDeleted {
        /// The referencing object.
        key: ObjectKey,
        /// The deleted target.
        target: ObjectKey,
    },
    /// A later commit made an object reference an object deleted here.
    DeletingReference {
        /// The object deleted here.
        key: ObjectKey,
        /// The object now referencing it.
        referrer: ObjectKey,
        /// Revision that wrote the reference.
        revision: RevisionNumber,
    },
}

impl MergeConflict {
    /// The object of this context the conflict is about.
    #[must_use]
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::ConcurrentChange { key, .. }
            | Self::ChangedDeleted { key }
            | Self::DeletedChanged { key, .. }
            | Self::ConcurrentCreation { key }
            | Self::ReferenceToDeleted { key, .. }
            | Self::DeletingReference { key, .. } => key,
        }
    }
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConcurrentChange { key, revision } => {
                write!(f, "{key} was changed concurrently in revision {revision}")
            }
            Self::ChangedDeleted { key } => write!(f, "{key} was deleted concurrently"),
            Self::DeletedChanged { key, revision } => {
                write!(f, "deleted {key} was changed concurrently in revision {revision}")
            }
            Self::ConcurrentCreation { key } => write!(f, "{key} already exists"),
            Self::ReferenceToDeleted { key, target } => {
                write!(f, "{key} references {target}, which was deleted concurrently")
            }
            Self::DeletingReference {
                key,
                referrer,
                revision,
            } => write!(
                f,
                "deleted {key} is referenced by {referrer} since revision {revision}"
            ),
        }
    }
}

fn row_at(env: &Env, key: &ObjectKey, revision: RevisionNumber) -> CoreResult<Option<Row>> {
    Ok(env
        .backend
        .fetch(&key.type_name, key.branch, key.id, revision)?)
}

/// Checks the changes of `state` made against `session` for conflicts with
/// everything committed up to `last`.
pub(crate) fn detect(
    env: &Env,
    state: &ContextState,
    session: RevisionNumber,
    last: RevisionNumber,
) -> CoreResult<Vec<MergeConflict>> {
    let mut conflicts = Vec::new();

    for key in state.created.keys() {
        let history = env.backend.history(&key.type_name, key.branch, key.id)?;
        if !history.is_empty() {
            conflicts.push(MergeConflict::ConcurrentCreation { key: key.clone() });
        }
    }
    if last <= session {
        return Ok(conflicts);
    }

    for key in state.changed.keys() {
        match row_at(env, key, last)? {
            None => conflicts.push(MergeConflict::ChangedDeleted { key: key.clone() }),
            Some(row) if row.rev_min > session => conflicts.push(MergeConflict::ConcurrentChange {
                key: key.clone(),
                revision: row.rev_min,
            }),
            Some(_) => {}
        }
    }

    for key in state.flex.keys() {
        let tracked = state.changed.contains_key(key)
            || state.created.contains_key(key)
            || state.removed.contains_key(key);
        if !tracked && row_at(env, key, last)?.is_none() {
            conflicts.push(MergeConflict::ChangedDeleted { key: key.clone() });
        }
    }

    for key in state.removed.keys() {
        // Deleted on both sides: nothing to merge.
        if let Some(row) = row_at(env, key, last)? {
            if row.rev_min > session {
                conflicts.push(MergeConflict::DeletedChanged {
                    key: key.clone(),
                    revision: row.rev_min,
                });
            }
        }
    }

    for (key, values) in state.written_values() {
        let type_def = env.schema.type_def(&key.type_name)?;
        for (column, _) in type_def.reference_columns() {
            let Some(Value::Ref(target)) = values.get(column) else {
                continue;
            };
            if state.created.contains_key(target) || state.removed.contains_key(target) {
                continue;
            }
            if row_at(env, target, last)?.is_none() && row_at(env, target, session)?.is_some() {
                conflicts.push(MergeConflict::ReferenceToDeleted {
                    key: key.clone(),
                    target: target.clone(),
                });
            }
        }
    }

    for key in state.removed.keys() {
        let reference = Value::Ref(key.clone());
        for type_def in env.schema.types() {
            for (column, _) in type_def.reference_columns() {
                let filter = [ColumnFilter::new(column, reference.clone())];
                for row in env
                    .backend
                    .scan(type_def.name(), key.branch, last, &filter)?
                {
                    if row.rev_min <= session {
                        continue;
                    }
                    let referrer = ObjectKey::current(key.branch, Arc::clone(type_def.name()), row.id);
                    if state.removed.contains_key(&referrer) {
                        continue;
                    }
                    let referenced_before = row_at(env, &referrer, session)?
                        .is_some_and(|old| old.value(column) == &reference);
                    if !referenced_before {
                        conflicts.push(MergeConflict::DeletingReference {
                            key: key.clone(),
                            referrer,
                            revision: row.rev_min,
                        });
                    }
                }
            }
        }
    }

    Ok(conflicts)
}
