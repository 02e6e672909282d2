//! Commit, rollback and session refresh.

use std::collections::BTreeSet;
use std::sync::Arc;

use revkb_codec::{ObjectKey, RevisionNumber, Value};
use revkb_storage::{CommitBatch, RowChange, StorageError};
use tracing::{debug, error, info, info_span, warn};

use super::{conflict, ContextState, ContextStatus, DbContext};
use crate::arena::Env;
use crate::error::{CoreError, CoreResult};
use crate::event::{CommitNotice, CommittedChange, UpdateEvent};
use crate::identity::Revision;
use crate::item::ItemData;

/// Tries before giving up when another instance keeps committing between
/// the conflict check and the write.
const COMMIT_ATTEMPTS: usize = 3;

impl DbContext {
    /// Commits with an empty log message. See [`Self::commit_with_log`].
    ///
    /// # Errors
    ///
    /// Fails like [`Self::commit_with_log`].
    pub fn commit(&self) -> CoreResult<Option<Revision>> {
        self.commit_with_log("")
    }

    /// Writes every change of this context as one new revision.
    ///
    /// Returns `None` without writing if there is nothing to commit. The
    /// context is inert afterwards. Revisions other instances wrote to the
    /// backend are folded in and checked like local commits.
    ///
    /// # Errors
    ///
    /// - `TransactionClosed` if the context was committed or rolled back
    /// - `InvalidOperation` if a written item lacks mandatory attributes
    /// - `ConcurrentModification` listing every conflict with commits made
    ///   since the session revision; the context stays open
    /// - `AllocationFailure` if no revision number can be reserved
    /// - storage errors; nothing is written then and the context stays open
    pub fn commit_with_log(&self, log: &str) -> CoreResult<Option<Revision>> {
        let _serial = self.kb.commit_lock().lock();
        let mut state = self.open_state()?;

        if !state.has_changes() {
            state.close(ContextStatus::Committed);
            drop(state);
            self.kb.deregister_context(self.id);
            debug!(context = %self.id, "nothing to commit");
            return Ok(None);
        }

        check_mandatory(&state)?;

        let env = Arc::clone(self.kb.env());
        let session = state.session_revision;
        let mut attempt = 1;
        let (revision, row_count) = loop {
            let last = self.kb.refetch_locked()?;
            let conflicts = conflict::detect(&env, &state, session, last)?;
            if !conflicts.is_empty() {
                warn!(
                    context = %self.id,
                    author = %self.author,
                    session,
                    conflicts = conflicts.len(),
                    first = %conflicts[0],
                    "commit rejected"
                );
                return Err(CoreError::ConcurrentModification { conflicts });
            }

            let number = self.kb.reserve_revision()?;
            let revision = Revision::now(number, self.author.as_str(), log);
            let batch = CommitBatch {
                revision: revision.to_row(),
                base: Some(session),
                changes: row_changes(&state, &already_deleted(&env, &state, last)?),
            };
            let row_count = batch.changes.len();
            match env.backend.commit(batch) {
                Ok(()) => break (revision, row_count),
                Err(e @ (StorageError::StaleRevision { .. } | StorageError::RowConflict { .. }))
                    if attempt < COMMIT_ATTEMPTS =>
                {
                    debug!(context = %self.id, attempt, revision = number, error = %e, "backend moved on, retrying commit");
                    attempt += 1;
                }
                Err(e) => {
                    warn!(context = %self.id, revision = number, error = %e, "commit failed");
                    return Err(e.into());
                }
            }
        };
        let number = revision.number;
        let span = info_span!("commit", author = %self.author, revision = number);
        let _enter = span.enter();

        let (event, changes) = collect_changes(&state, number, &self.author);
        let published = {
            let _publish = env.publish_lock.write();
            let published = publish(&state, number);
            if published.is_err() {
                for change in &changes {
                    change.item.reset();
                }
            }
            for entry in state.created.values() {
                entry.item.mark_persistent();
            }
            env.set_last_revision(number);
            self.kb.feed().publish(&CommitNotice {
                event: &event,
                changes: &changes,
            });
            published
        };

        state.close(ContextStatus::Committed);
        drop(state);
        self.kb.deregister_context(self.id);

        if let Err(e) = published {
            error!(error = %e, "publishing committed revision failed, touched items were reset");
            return Err(e);
        }
        info!(
            created = event.created.len(),
            updated = event.updated.len(),
            deleted = event.deleted.len(),
            rows = row_count,
            "committed"
        );
        Ok(Some(revision))
    }

    /// Discards every change of this context.
    ///
    /// # Errors
    ///
    /// `TransactionClosed` if the context was already committed or rolled
    /// back.
    pub fn rollback(&self) -> CoreResult<()> {
        let mut state = self.open_state()?;
        for (key, entry) in &state.created {
            entry.item.mark_discarded();
            self.kb.arena().discard(key);
        }
        debug!(
            context = %self.id,
            created = state.created.len(),
            changed = state.changed.len(),
            removed = state.removed.len(),
            "rolled back"
        );
        state.close(ContextStatus::RolledBack);
        drop(state);
        self.kb.deregister_context(self.id);
        Ok(())
    }

    /// Moves the session revision to the last committed revision, merging
    /// every commit made since.
    ///
    /// Local association views are rebuilt against the new snapshot on
    /// their next read.
    ///
    /// # Errors
    ///
    /// `ConcurrentModification` if a commit since the session revision
    /// conflicts with the changes of this context; the session revision is
    /// unchanged then.
    pub fn update_session_revision(&self) -> CoreResult<RevisionNumber> {
        self.kb.refetch()?;
        let mut state = self.open_state()?;
        let env = self.kb.env();
        let last = env.last_revision();
        let session = state.session_revision;
        if last == session {
            return Ok(last);
        }

        let conflicts = conflict::detect(env, &state, session, last)?;
        if !conflicts.is_empty() {
            warn!(
                context = %self.id,
                session,
                last,
                conflicts = conflicts.len(),
                "session refresh rejected"
            );
            return Err(CoreError::ConcurrentModification { conflicts });
        }

        state.session_revision = last;
        state.local_associations.clear();
        drop(state);
        self.kb.update_context(self.id, last);
        debug!(context = %self.id, from = session, to = last, "session revision updated");
        Ok(last)
    }
}

fn check_mandatory(state: &ContextState) -> CoreResult<()> {
    for (key, values) in state.written_values() {
        let type_def = state
            .created
            .get(key)
            .map(|e| &e.item)
            .or_else(|| state.changed.get(key).map(|e| &e.item))
            .map(|item| Arc::clone(item.type_def()));
        let Some(type_def) = type_def else { continue };
        let missing = type_def.missing_mandatory(values);
        if !missing.is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "{key} lacks mandatory attributes: {}",
                missing.join(", ")
            )));
        }
    }
    Ok(())
}

/// Objects deleted here whose row a later commit already closed.
fn already_deleted(
    env: &Env,
    state: &ContextState,
    last: RevisionNumber,
) -> CoreResult<BTreeSet<ObjectKey>> {
    let mut gone = BTreeSet::new();
    for key in state.removed.keys() {
        if env.backend.fetch(&key.type_name, key.branch, key.id, last)?.is_none() {
            gone.insert(key.clone());
        }
    }
    Ok(gone)
}

fn row_changes(state: &ContextState, already_deleted: &BTreeSet<ObjectKey>) -> Vec<RowChange> {
    let mut changes = Vec::new();
    for (key, entry) in &state.created {
        changes.push(RowChange::Create {
            table: key.type_name.to_string(),
            branch: key.branch,
            id: key.id,
            values: entry.values.clone(),
        });
    }
    for (key, entry) in &state.changed {
        changes.push(RowChange::Update {
            table: key.type_name.to_string(),
            branch: key.branch,
            id: key.id,
            values: entry.values.clone(),
        });
    }
    for key in state.removed.keys().filter(|key| !already_deleted.contains(*key)) {
        changes.push(RowChange::Delete {
            table: key.type_name.to_string(),
            branch: key.branch,
            id: key.id,
        });
    }
    for (key, entry) in &state.flex {
        for (attribute, value) in &entry.changes {
            changes.push(RowChange::SetFlex {
                table: key.type_name.to_string(),
                branch: key.branch,
                id: key.id,
                attribute: attribute.clone(),
                value: value.clone(),
            });
        }
    }
    changes
}

fn collect_changes(
    state: &ContextState,
    revision: RevisionNumber,
    author: &str,
) -> (UpdateEvent, Vec<CommittedChange>) {
    let mut event = UpdateEvent {
        revision,
        author: author.to_string(),
        created: Vec::with_capacity(state.created.len()),
        updated: Vec::with_capacity(state.changed.len()),
        deleted: Vec::with_capacity(state.removed.len()),
    };
    let mut changes = Vec::new();

    let frozen = |values: &[Value]| -> Arc<[Value]> { Arc::from(values) };
    for (key, entry) in &state.created {
        event.created.push(key.clone());
        changes.push(CommittedChange {
            item: Arc::clone(&entry.item),
            before: None,
            after: Some(frozen(&entry.values)),
        });
    }
    for (key, entry) in &state.changed {
        event.updated.push(key.clone());
        changes.push(CommittedChange {
            item: Arc::clone(&entry.item),
            before: Some(Arc::clone(&entry.before)),
            after: Some(frozen(&entry.values)),
        });
    }
    for (key, entry) in &state.removed {
        event.deleted.push(key.clone());
        changes.push(CommittedChange {
            item: Arc::clone(&entry.item),
            before: Some(Arc::clone(&entry.before)),
            after: None,
        });
    }
    for key in state.flex.keys() {
        let tracked = state.created.contains_key(key)
            || state.changed.contains_key(key)
            || state.removed.contains_key(key);
        if !tracked {
            event.updated.push(key.clone());
        }
    }
    (event, changes)
}

/// Moves the committed state into the item chains. Must run with the
/// publish lock held exclusively.
fn publish(state: &ContextState, revision: RevisionNumber) -> CoreResult<()> {
    let alive = |values: &[Value]| ItemData::Alive(Arc::from(values));
    for entry in state.created.values() {
        entry.item.publish(revision, alive(&entry.values))?;
    }
    for entry in state.changed.values() {
        entry.item.publish(revision, alive(&entry.values))?;
    }
    for entry in state.removed.values() {
        entry.item.publish(revision, ItemData::Deleted)?;
    }
    for entry in state.flex.values() {
        if !state.removed.contains_key(entry.item.key()) {
            entry.item.publish_flex(revision, &entry.changes)?;
        }
    }
    Ok(())
}
