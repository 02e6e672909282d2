//! Transaction contexts.
//!
//! A [`DbContext`] is the unit of work of one writer. It reads committed
//! data at its session revision and keeps every uncommitted change in its
//! own state:
//!
//! - new items with their column values,
//! - changed items with the committed snapshot they were changed from,
//! - removed items,
//! - flex attribute changes,
//! - copy-on-write association containers layered over the committed ones.
//!
//! Committing checks the changes against everything committed since the
//! session revision, writes them as one revision and publishes them into the
//! item chains and caches. See [`DbContext::commit`].

mod commit;
mod conflict;
mod local;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use revkb_codec::{BranchId, ObjectKey, RevisionNumber, Value};
use tracing::debug;

use crate::association::{order_assignments, AssociationQuery, AssociationView, Container, ContainerShape};
use crate::error::{CoreError, CoreResult};
use crate::identity::ContextId;
use crate::item::{AliveState, ItemReader, ItemState, KnowledgeItem};
use crate::kb::KnowledgeBase;
use crate::schema::AttributeSlot;

pub use conflict::MergeConflict;
pub(crate) use local::LocalAssociation;

/// Lifecycle of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    /// Accepting reads and writes.
    Open,
    /// Committed; inert.
    Committed,
    /// Rolled back; inert.
    RolledBack,
}

impl ContextStatus {
    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        }
    }
}

#[derive(Debug)]
pub(crate) struct LocalEntry {
    pub(crate) item: Arc<KnowledgeItem>,
    pub(crate) values: Vec<Value>,
}

#[derive(Debug)]
pub(crate) struct ChangedEntry {
    pub(crate) item: Arc<KnowledgeItem>,
    pub(crate) before: Arc<[Value]>,
    pub(crate) values: Vec<Value>,
}

#[derive(Debug)]
pub(crate) struct RemovedEntry {
    pub(crate) item: Arc<KnowledgeItem>,
    pub(crate) before: Arc<[Value]>,
}

#[derive(Debug)]
pub(crate) struct FlexEntry {
    pub(crate) item: Arc<KnowledgeItem>,
    pub(crate) changes: BTreeMap<String, Option<Value>>,
}

#[derive(Debug)]
pub(crate) struct ContextState {
    pub(crate) status: ContextStatus,
    pub(crate) session_revision: RevisionNumber,
    pub(crate) created: BTreeMap<ObjectKey, LocalEntry>,
    pub(crate) changed: BTreeMap<ObjectKey, ChangedEntry>,
    pub(crate) removed: BTreeMap<ObjectKey, RemovedEntry>,
    pub(crate) flex: BTreeMap<ObjectKey, FlexEntry>,
    pub(crate) local_associations: HashMap<(ObjectKey, Arc<str>), LocalAssociation>,
}

impl ContextState {
    fn new(session_revision: RevisionNumber) -> Self {
        Self {
            status: ContextStatus::Open,
            session_revision,
            created: BTreeMap::new(),
            changed: BTreeMap::new(),
            removed: BTreeMap::new(),
            flex: BTreeMap::new(),
            local_associations: HashMap::new(),
        }
    }

    pub(crate) fn has_changes(&self) -> bool {
        !(self.created.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.flex.is_empty())
    }

    /// Column values this context will write, by key.
    pub(crate) fn written_values(&self) -> impl Iterator<Item = (&ObjectKey, &[Value])> {
        self.created
            .iter()
            .map(|(k, e)| (k, e.values.as_slice()))
            .chain(self.changed.iter().map(|(k, e)| (k, e.values.as_slice())))
    }

    /// Local column values of every touched item of `type_name`; `None` for
    /// removed items.
    pub(crate) fn touched_of_type<'a>(
        &'a self,
        type_name: &'a str,
    ) -> impl Iterator<Item = (&'a ObjectKey, Option<&'a [Value]>)> + 'a {
        self.written_values()
            .map(|(k, v)| (k, Some(v)))
            .chain(self.removed.keys().map(|k| (k, None)))
            .filter(move |(k, _)| &*k.type_name == type_name)
    }

    fn close(&mut self, status: ContextStatus) {
        self.status = status;
        self.created.clear();
        self.changed.clear();
        self.removed.clear();
        self.flex.clear();
        self.local_associations.clear();
    }
}

/// The unit of work of one writer.
///
/// Contexts are created by [`KnowledgeBase::begin_transaction`] and may be
/// shared between threads; all state is behind one lock. Dropping an open
/// context rolls it back.
pub struct DbContext {
    id: ContextId,
    kb: KnowledgeBase,
    author: String,
    branch: BranchId,
    state: Mutex<ContextState>,
}

impl fmt::Debug for DbContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DbContext")
            .field("id", &self.id)
            .field("author", &self.author)
            .field("branch", &self.branch)
            .field("status", &state.status)
            .field("session_revision", &state.session_revision)
            .field("created", &state.created.len())
            .field("changed", &state.changed.len())
            .field("removed", &state.removed.len())
            .finish()
    }
}

impl DbContext {
    pub(crate) fn new(
        id: ContextId,
        kb: KnowledgeBase,
        author: String,
        branch: BranchId,
        session_revision: RevisionNumber,
    ) -> Self {
        Self {
            id,
            kb,
            author,
            branch,
            state: Mutex::new(ContextState::new(session_revision)),
        }
    }

    /// Context id.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Author recorded on commit.
    pub fn author(&self) -> &str {
        &self.author
    }

    /// Branch this context writes to.
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// The knowledge base.
    pub fn kb(&self) -> &KnowledgeBase {
        &self.kb
    }

    /// Revision committed data is read at.
    pub fn session_revision(&self) -> RevisionNumber {
        self.state.lock().session_revision
    }

    /// Lifecycle state.
    pub fn status(&self) -> ContextStatus {
        self.state.lock().status
    }

    /// Returns true while the context accepts reads and writes.
    pub fn is_open(&self) -> bool {
        self.status() == ContextStatus::Open
    }

    fn open_state(&self) -> CoreResult<MutexGuard<'_, ContextState>> {
        let state = self.state.lock();
        if state.status != ContextStatus::Open {
            return Err(CoreError::TransactionClosed {
                context: self.id.as_u64(),
                state: state.status.name(),
            });
        }
        Ok(state)
    }

    // ---- liveness -------------------------------------------------------

    fn alive_state_in(&self, state: &ContextState, item: &KnowledgeItem) -> CoreResult<AliveState> {
        if item.is_historic() {
            return Ok(if item.alive_at(item.key().history)? {
                AliveState::Alive
            } else {
                AliveState::PersistentDeleted
            });
        }
        Ok(match item.state() {
            ItemState::New(owner) if owner == self.id => {
                if state.created.contains_key(item.key()) {
                    AliveState::Alive
                } else {
                    AliveState::NewDeleted
                }
            }
            ItemState::New(_) => AliveState::NewFromForeignContext,
            ItemState::Discarded => AliveState::NewDeleted,
            ItemState::Persistent => {
                if state.removed.contains_key(item.key()) {
                    AliveState::PersistentLocallyDeleted
                } else if state.changed.contains_key(item.key())
                    || item.alive_at(state.session_revision)?
                {
                    AliveState::Alive
                } else {
                    AliveState::PersistentDeleted
                }
            }
        })
    }

    /// Column values of `item` as this context sees them.
    fn visible_values(&self, state: &ContextState, item: &KnowledgeItem) -> CoreResult<Arc<[Value]>> {
        let key = item.key();
        if item.is_historic() {
            return item.require_values_at(key.history);
        }
        let locally_dead = |detail: &str| CoreError::DeletedObjectAccess {
            key: key.clone(),
            revision: state.session_revision,
            detail: detail.to_string(),
            dead_range: None,
        };
        match item.state() {
            ItemState::New(owner) if owner == self.id => state
                .created
                .get(key)
                .map(|entry| Arc::from(entry.values.as_slice()))
                .ok_or_else(|| locally_dead("new object was deleted in this context")),
            ItemState::New(owner) => Err(CoreError::ForeignContext {
                key: key.clone(),
                owner: owner.as_u64(),
            }),
            ItemState::Discarded => Err(locally_dead("new object was deleted or rolled back")),
            ItemState::Persistent => {
                if state.removed.contains_key(key) {
                    return Err(locally_dead("deleted in this context"));
                }
                if let Some(entry) = state.changed.get(key) {
                    return Ok(Arc::from(entry.values.as_slice()));
                }
                item.require_values_at(state.session_revision)
            }
        }
    }

    /// How `item` looks from this context.
    ///
    /// # Errors
    ///
    /// Fails if the context is closed or on storage errors.
    pub fn alive_state(&self, item: &KnowledgeItem) -> CoreResult<AliveState> {
        let state = self.open_state()?;
        self.alive_state_in(&state, item)
    }

    /// Fails unless `item` is alive from this context.
    ///
    /// # Errors
    ///
    /// `DeletedObjectAccess` (naming the dead range when known) or
    /// `ForeignContext`.
    pub fn check_alive(&self, item: &KnowledgeItem) -> CoreResult<()> {
        let state = self.open_state()?;
        self.visible_values(&state, item).map(|_| ())
    }

    // ---- reads ----------------------------------------------------------

    /// Column values of `item`, including uncommitted changes.
    ///
    /// # Errors
    ///
    /// Fails if the item is not alive here.
    pub fn values(&self, item: &KnowledgeItem) -> CoreResult<Arc<[Value]>> {
        let state = self.open_state()?;
        self.visible_values(&state, item)
    }

    /// Value of a declared or flex attribute, including uncommitted changes.
    ///
    /// # Errors
    ///
    /// Fails with `NoSuchAttribute` for unknown attributes or if the item is
    /// not alive here.
    pub fn value(&self, item: &KnowledgeItem, attribute: &str) -> CoreResult<Value> {
        let state = self.open_state()?;
        let slot = item.type_def().resolve(attribute)?;
        let values = self.visible_values(&state, item)?;
        match slot {
            AttributeSlot::Column(column) => Ok(values[column].clone()),
            AttributeSlot::Flex => {
                if let Some(change) = state
                    .flex
                    .get(item.key())
                    .and_then(|entry| entry.changes.get(attribute))
                {
                    return Ok(change.clone().unwrap_or(Value::Null));
                }
                if state.created.contains_key(item.key()) {
                    return Ok(Value::Null);
                }
                Ok(item
                    .flex_at(state.session_revision)?
                    .get(attribute)
                    .cloned()
                    .unwrap_or(Value::Null))
            }
        }
    }

    /// Target of a reference attribute.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::value`], or with `TypeMismatch` for non-references.
    pub fn referenced_key(&self, item: &KnowledgeItem, attribute: &str) -> CoreResult<Option<ObjectKey>> {
        let value = self.value(item, attribute)?;
        item.reference_of(attribute, &value)
    }

    /// Target item of a reference attribute, if alive here.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::referenced_key`].
    pub fn referenced_item(
        &self,
        item: &KnowledgeItem,
        attribute: &str,
    ) -> CoreResult<Option<Arc<KnowledgeItem>>> {
        match self.referenced_key(item, attribute)? {
            Some(target) => self.resolve(&target),
            None => Ok(None),
        }
    }

    /// The item for `key`, or `None` if it is not alive from this context.
    ///
    /// # Errors
    ///
    /// Fails with `UnknownType` or on storage errors.
    pub fn resolve(&self, key: &ObjectKey) -> CoreResult<Option<Arc<KnowledgeItem>>> {
        let state = self.open_state()?;
        let item = self.kb.arena().item(key)?;
        Ok(self
            .alive_state_in(&state, &item)?
            .is_alive()
            .then_some(item))
    }

    // ---- creation -------------------------------------------------------

    fn create_in(
        &self,
        state: &mut ContextState,
        type_name: &str,
        id: u64,
    ) -> CoreResult<Arc<KnowledgeItem>> {
        let type_def = Arc::clone(self.kb.schema().type_def(type_name)?);
        let key = ObjectKey::current(self.branch, Arc::clone(type_def.name()), id);
        let item = self.kb.arena().insert_new(key.clone(), self.id)?.ok_or_else(|| {
            CoreError::invalid_operation(format!("{key} is already in use"))
        })?;
        state.created.insert(
            key,
            LocalEntry {
                item: Arc::clone(&item),
                values: type_def.empty_values(),
            },
        );
        Ok(item)
    }

    /// Creates a new item with a fresh id.
    ///
    /// # Errors
    ///
    /// Fails with `UnknownType` or `AllocationFailure`.
    pub fn create_item(&self, type_name: &str) -> CoreResult<Arc<KnowledgeItem>> {
        let mut state = self.open_state()?;
        self.kb.schema().type_def(type_name)?;
        let id = self.kb.allocate_id()?;
        self.create_in(&mut state, type_name, id)
    }

    /// Creates a new item with an explicit id.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidOperation` if the key exists or another context
    /// is creating it. Creation of the same key through another knowledge
    /// base on a shared backend is reported on commit.
    pub fn create_item_with_id(&self, type_name: &str, id: u64) -> CoreResult<Arc<KnowledgeItem>> {
        let mut state = self.open_state()?;
        let type_def = self.kb.schema().type_def(type_name)?;
        let existing = self.kb.env().backend.history(type_def.name(), self.branch, id)?;
        if !existing.is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "{type_name}#{id} already exists in branch {}",
                self.branch
            )));
        }
        self.create_in(&mut state, type_name, id)
    }

    /// Creates `count` new items of one type with fresh ids.
    ///
    /// # Errors
    ///
    /// Fails with `UnknownType` or `AllocationFailure`; nothing is created
    /// then.
    pub fn create_items(&self, type_name: &str, count: usize) -> CoreResult<Vec<Arc<KnowledgeItem>>> {
        let mut state = self.open_state()?;
        self.kb.schema().type_def(type_name)?;
        let ids = self.kb.allocate_ids(count)?;
        ids.into_iter()
            .map(|id| self.create_in(&mut state, type_name, id))
            .collect()
    }

    /// Creates a new item and sets attributes on it.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::create_item`] and [`Self::set_value`].
    pub fn create_item_with<'a>(
        &self,
        type_name: &str,
        values: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> CoreResult<Arc<KnowledgeItem>> {
        let item = self.create_item(type_name)?;
        for (attribute, value) in values {
            self.set_value(&item, attribute, value)?;
        }
        Ok(item)
    }

    // ---- writes ---------------------------------------------------------

    fn check_writable(&self, state: &ContextState, item: &KnowledgeItem) -> CoreResult<()> {
        let key = item.key();
        if item.is_historic() {
            return Err(CoreError::immutable(
                key,
                format!("historic view at revision {}", key.history),
            ));
        }
        if key.branch != self.branch {
            return Err(CoreError::invalid_operation(format!(
                "{key} is not in branch {} of context {}",
                self.branch, self.id
            )));
        }
        if item.type_def().is_immutable() && !state.created.contains_key(key) {
            return Err(CoreError::immutable(
                key,
                format!("type {} is immutable", item.type_def().name()),
            ));
        }
        Ok(())
    }

    /// Sets a declared or flex attribute.
    ///
    /// Setting a flex attribute to `Null` removes it.
    ///
    /// # Errors
    ///
    /// `ImmutabilityViolation` for historic items and immutable types,
    /// `TypeMismatch` for values that do not fit the attribute, and the
    /// liveness errors of [`Self::check_alive`].
    pub fn set_value(&self, item: &KnowledgeItem, attribute: &str, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        let mut state = self.open_state()?;
        self.check_writable(&state, item)?;
        let slot = item.type_def().resolve(attribute)?;
        let current = self.visible_values(&state, item)?;
        let key = item.key();

        let column = match slot {
            AttributeSlot::Flex => {
                let held = self.held(&state, item)?;
                let entry = state.flex.entry(key.clone()).or_insert_with(|| FlexEntry {
                    item: held,
                    changes: BTreeMap::new(),
                });
                let value = (!value.is_null()).then_some(value);
                entry.changes.insert(attribute.to_string(), value);
                return Ok(());
            }
            AttributeSlot::Column(column) => column,
        };

        item.type_def().check_value(key, column, &value)?;
        if current[column] == value {
            return Ok(());
        }

        let after: Vec<Value> = if let Some(entry) = state.created.get_mut(key) {
            entry.values[column] = value;
            entry.values.clone()
        } else {
            let held = self.held(&state, item)?;
            let entry = state
                .changed
                .entry(key.clone())
                .or_insert_with(|| ChangedEntry {
                    item: held,
                    before: Arc::clone(&current),
                    values: current.to_vec(),
                });
            entry.values[column] = value;
            entry.values.clone()
        };
        state.notify_local(key, Some(&after));
        Ok(())
    }

    /// Sets a reference attribute to the current key of `target`.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::set_value`].
    pub fn set_reference(&self, item: &KnowledgeItem, attribute: &str, target: &KnowledgeItem) -> CoreResult<()> {
        self.set_value(item, attribute, Value::Ref(target.key().to_current()))
    }

    /// Deletes an item. New items vanish; persistent ones are deleted on
    /// commit.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::set_value`].
    pub fn delete(&self, item: &KnowledgeItem) -> CoreResult<()> {
        let mut state = self.open_state()?;
        self.check_writable(&state, item)?;
        let current = self.visible_values(&state, item)?;
        let key = item.key().clone();

        state.flex.remove(&key);
        if let Some(entry) = state.created.remove(&key) {
            entry.item.mark_discarded();
            self.kb.arena().discard(&key);
        } else {
            let held = self.held(&state, item)?;
            let before = state
                .changed
                .remove(&key)
                .map_or(current, |entry| entry.before);
            state.removed.insert(key.clone(), RemovedEntry { item: held, before });
        }
        state.notify_local(&key, None);
        Ok(())
    }

    /// The shared handle of an item this context touches.
    fn held(&self, state: &ContextState, item: &KnowledgeItem) -> CoreResult<Arc<KnowledgeItem>> {
        let key = item.key();
        if let Some(entry) = state.changed.get(key) {
            return Ok(Arc::clone(&entry.item));
        }
        if let Some(entry) = state.created.get(key) {
            return Ok(Arc::clone(&entry.item));
        }
        self.kb.arena().item(key)
    }

    // ---- change inspection ---------------------------------------------

    /// Returns true if this context changed or deleted a committed item.
    pub fn is_persistent_item_modified(&self, item: &KnowledgeItem) -> bool {
        let state = self.state.lock();
        let key = item.key();
        state.changed.contains_key(key)
            || state.removed.contains_key(key)
            || (state.flex.contains_key(key) && !state.created.contains_key(key))
    }

    /// Items created in this context.
    pub fn new_objects(&self) -> Vec<Arc<KnowledgeItem>> {
        let state = self.state.lock();
        state.created.values().map(|e| Arc::clone(&e.item)).collect()
    }

    /// Committed items changed in this context.
    pub fn changed_objects(&self) -> Vec<Arc<KnowledgeItem>> {
        let state = self.state.lock();
        state.changed.values().map(|e| Arc::clone(&e.item)).collect()
    }

    /// Keys of committed items deleted in this context.
    pub fn removed_keys(&self) -> Vec<ObjectKey> {
        self.state.lock().removed.keys().cloned().collect()
    }

    /// Returns true if `key` was deleted in this context.
    pub fn is_removed_key(&self, key: &ObjectKey) -> bool {
        self.state.lock().removed.contains_key(key)
    }

    /// Returns true if committing would write anything.
    pub fn has_changes(&self) -> bool {
        self.state.lock().has_changes()
    }

    /// Local column values of every item of `type_name` this context
    /// created, changed or deleted; `None` for deleted ones.
    pub(crate) fn local_rows(&self, type_name: &str) -> CoreResult<Vec<(ObjectKey, Option<Arc<[Value]>>)>> {
        let state = self.open_state()?;
        Ok(state
            .touched_of_type(type_name)
            .map(|(key, values)| (key.clone(), values.map(Arc::from)))
            .collect())
    }

    // ---- associations ---------------------------------------------------

    /// Links of `base` matching `query`, including uncommitted link changes
    /// of this context.
    ///
    /// # Errors
    ///
    /// Fails if `base` is not alive here or on storage errors.
    pub fn association(
        &self,
        base: &KnowledgeItem,
        query: &Arc<AssociationQuery>,
    ) -> CoreResult<AssociationView> {
        let mut state = self.open_state()?;
        self.visible_values(&state, base)?;
        let session = state.session_revision;

        if base.is_historic() {
            let container = base.association_cache(query).read(base, session)?;
            return Ok(AssociationView::new(
                base.key().clone(),
                Arc::clone(query),
                base.key().history,
                container,
                false,
            ));
        }

        let slot = (base.key().clone(), Arc::clone(query.cache_key()));
        if let Some(local) = state.local_associations.get(&slot) {
            return Ok(local.view(session));
        }

        let committed = if state.created.contains_key(base.key()) {
            Arc::new(Container::empty(query.shape()))
        } else {
            base.association_cache(query).read(base, session)?
        };
        let local = LocalAssociation::layer(&state, Arc::clone(query), base.key().clone(), committed);
        let view = local.view(session);
        state.local_associations.insert(slot, local);
        Ok(view)
    }

    /// Moves `link` to position `index` of a live ordered association of
    /// `base` by rewriting order attributes.
    ///
    /// `link` must already point at `base` through the query's reference.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for stable lists, other shapes, or links that do
    /// not point at `base`; otherwise like [`Self::set_value`].
    pub fn insert_link(
        &self,
        base: &KnowledgeItem,
        query: &Arc<AssociationQuery>,
        index: usize,
        link: &KnowledgeItem,
    ) -> CoreResult<()> {
        let ContainerShape::OrderedList {
            order_attribute,
            live,
            indexed,
        } = query.shape()
        else {
            return Err(CoreError::invalid_operation(format!(
                "association {} is not an ordered list",
                query.cache_key()
            )));
        };
        if !live {
            return Err(CoreError::invalid_operation(format!(
                "association {} is a stable list",
                query.cache_key()
            )));
        }

        let values = self.values(link)?;
        let base_ref = Value::Ref(base.key().to_current());
        if values.get(query.reference_column()) != Some(&base_ref) {
            return Err(CoreError::invalid_operation(format!(
                "{} does not point at {} through {}",
                link.key(),
                base.key(),
                query.reference()
            )));
        }

        let view = self.association(base, query)?;
        let others: Vec<_> = view
            .container()
            .entries()
            .iter()
            .filter(|(_, key)| key != link.key())
            .cloned()
            .collect();
        let assignments = order_assignments(&others, index, link.key(), *indexed);
        debug!(base = %base.key(), link = %link.key(), index, writes = assignments.len(), "placing link");
        for (key, order) in assignments {
            let item = self.kb.arena().item(&key)?;
            self.set_value(&item, order_attribute, order)?;
        }
        Ok(())
    }

    /// Same as [`Self::insert_link`] for a link already in the list.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::insert_link`].
    pub fn move_link(
        &self,
        base: &KnowledgeItem,
        query: &Arc<AssociationQuery>,
        link: &KnowledgeItem,
        index: usize,
    ) -> CoreResult<()> {
        self.insert_link(base, query, index, link)
    }
}

impl ItemReader for DbContext {
    fn read_revision(&self) -> RevisionNumber {
        self.session_revision()
    }

    fn values(&self, item: &KnowledgeItem) -> CoreResult<Arc<[Value]>> {
        DbContext::values(self, item)
    }

    fn resolve(&self, key: &ObjectKey) -> CoreResult<Option<Arc<KnowledgeItem>>> {
        DbContext::resolve(self, key)
    }
}

impl Drop for DbContext {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.status == ContextStatus::Open {
            for (key, entry) in &state.created {
                entry.item.mark_discarded();
                self.kb.arena().discard(key);
            }
            state.close(ContextStatus::RolledBack);
        }
        self.kb.deregister_context(self.id);
    }
}
