//! Knowledge items.
//!
//! A [`KnowledgeItem`] is the in-memory identity of one object. It owns the
//! chain of committed value arrays, the chain of committed flex attribute
//! data, and the association caches built for it. Uncommitted values are not
//! stored on the item: each [`crate::DbContext`] keeps its own overlay, so any
//! number of contexts may edit disjoint views of the same item.
//!
//! # Loading
//!
//! Chain nodes are created on first access. A lookup for revision `r` that
//! no node covers loads the row valid at `r` while commits are held off, and
//! links the node into the gap it belongs to. Missing rows produce a
//! [`ItemData::Deleted`] node spanning the whole range in which the object
//! did not exist, so repeated misses do not go back to storage.
//!
//! # Historic items
//!
//! An item whose key carries a concrete history revision is a read-only view
//! of the object at that revision. Every read is answered at that revision
//! regardless of the revision asked for, and references read from it are
//! mapped to historic keys at the same revision.

mod flex;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use revkb_codec::{ObjectKey, RevisionNumber, Value, CURRENT_REV, INITIAL_REV};

use crate::arena::Env;
use crate::association::{AssociationCache, AssociationQuery};
use crate::error::{CoreError, CoreResult};
use crate::identity::ContextId;
use crate::schema::{AttributeSlot, TypeDef};
use crate::validity::{ChainSlot, ValidityChain};
use crate::wrapper::Binding;

pub use flex::FlexData;
pub(crate) use flex::ensure_flex_loaded;

/// Payload of a committed item chain node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemData {
    /// The object existed with these column values.
    Alive(Arc<[Value]>),
    /// The object did not exist.
    Deleted,
}

impl ItemData {
    /// Column values, if alive.
    #[must_use]
    pub fn values(&self) -> Option<&Arc<[Value]>> {
        match self {
            Self::Alive(values) => Some(values),
            Self::Deleted => None,
        }
    }
}

/// Whether an item can be accessed from some viewpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveState {
    /// Readable and writable.
    Alive,
    /// No committed data at the access revision.
    PersistentDeleted,
    /// Deleted in the accessing context, not yet committed.
    PersistentLocallyDeleted,
    /// A new item that was deleted or rolled back before commit.
    NewDeleted,
    /// A new item owned by another context.
    NewFromForeignContext,
}

impl AliveState {
    /// Returns true for [`AliveState::Alive`].
    #[must_use]
    pub fn is_alive(self) -> bool {
        self == Self::Alive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemState {
    New(ContextId),
    Persistent,
    Discarded,
}

/// Reads items from one viewpoint: a transaction context or a committed
/// revision.
pub trait ItemReader {
    /// Revision committed reads are answered at.
    fn read_revision(&self) -> RevisionNumber;

    /// Column values of `item` as seen from this viewpoint.
    ///
    /// # Errors
    ///
    /// Fails with `DeletedObjectAccess` or `ForeignContext` if the item is
    /// not alive here.
    fn values(&self, item: &KnowledgeItem) -> CoreResult<Arc<[Value]>>;

    /// The item for `key`, or `None` if it is not alive from this viewpoint.
    ///
    /// # Errors
    ///
    /// Fails on storage errors or unknown types.
    fn resolve(&self, key: &ObjectKey) -> CoreResult<Option<Arc<KnowledgeItem>>>;
}

/// One versioned object.
pub struct KnowledgeItem {
    key: ObjectKey,
    type_def: Arc<TypeDef>,
    env: Arc<Env>,
    state: Mutex<ItemState>,
    global: ChainSlot<ItemData>,
    flex: ChainSlot<FlexData>,
    associations: Mutex<HashMap<Arc<str>, Arc<AssociationCache>>>,
    binding: OnceLock<Binding>,
}

impl fmt::Debug for KnowledgeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeItem")
            .field("key", &self.key)
            .field("state", &*self.state.lock())
            .field("global", &self.global.ranges())
            .finish_non_exhaustive()
    }
}

impl KnowledgeItem {
    fn with_state(key: ObjectKey, type_def: Arc<TypeDef>, env: Arc<Env>, state: ItemState) -> Self {
        Self {
            key,
            type_def,
            env,
            state: Mutex::new(state),
            global: ChainSlot::new(),
            flex: ChainSlot::new(),
            associations: Mutex::new(HashMap::new()),
            binding: OnceLock::new(),
        }
    }

    pub(crate) fn persistent(key: ObjectKey, type_def: Arc<TypeDef>, env: Arc<Env>) -> Self {
        Self::with_state(key, type_def, env, ItemState::Persistent)
    }

    pub(crate) fn new_in(
        key: ObjectKey,
        type_def: Arc<TypeDef>,
        env: Arc<Env>,
        owner: ContextId,
    ) -> Self {
        Self::with_state(key, type_def, env, ItemState::New(owner))
    }

    /// The object key.
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// The object's type.
    pub fn type_def(&self) -> &Arc<TypeDef> {
        &self.type_def
    }

    /// Returns true for read-only views of a past revision.
    pub fn is_historic(&self) -> bool {
        !self.key.is_current()
    }

    /// Returns true while the item is not committed.
    pub fn is_new(&self) -> bool {
        matches!(*self.state.lock(), ItemState::New(_))
    }

    /// Returns true for new items that were rolled back or deleted.
    pub fn is_discarded(&self) -> bool {
        *self.state.lock() == ItemState::Discarded
    }

    /// The creating context of a new item.
    pub fn owner(&self) -> Option<ContextId> {
        match *self.state.lock() {
            ItemState::New(owner) => Some(owner),
            _ => None,
        }
    }

    pub(crate) fn state(&self) -> ItemState {
        *self.state.lock()
    }

    pub(crate) fn mark_new(&self, owner: ContextId) {
        *self.state.lock() = ItemState::New(owner);
    }

    pub(crate) fn mark_persistent(&self) {
        *self.state.lock() = ItemState::Persistent;
    }

    pub(crate) fn mark_discarded(&self) {
        *self.state.lock() = ItemState::Discarded;
    }

    pub(crate) fn env(&self) -> &Arc<Env> {
        &self.env
    }

    pub(crate) fn binding(&self) -> &OnceLock<Binding> {
        &self.binding
    }

    /// Revision a read for `revision` is answered at.
    pub fn read_revision(&self, revision: RevisionNumber) -> RevisionNumber {
        if self.is_historic() {
            self.key.history
        } else {
            revision
        }
    }

    /// Maps a stored reference into this item's history context.
    pub fn map_reference(&self, target: &ObjectKey) -> ObjectKey {
        if self.is_historic() {
            target.at(self.key.history)
        } else {
            target.clone()
        }
    }

    /// Ranges of the loaded committed nodes, newest first.
    pub fn chain_ranges(&self) -> Vec<(RevisionNumber, RevisionNumber)> {
        self.global.ranges()
    }

    /// The committed chain node covering `revision`, loading it if needed.
    ///
    /// # Errors
    ///
    /// Fails on storage errors or chain bookkeeping defects.
    pub fn node_at(&self, revision: RevisionNumber) -> CoreResult<Arc<ValidityChain<ItemData>>> {
        let revision = self.read_revision(revision);
        if let Some(node) = self.global.find(revision) {
            return Ok(node);
        }
        self.env.load(|last| {
            if let Some(node) = self.global.find(revision) {
                return Ok(node);
            }
            let node = self.load_node(revision.min(last))?;
            Ok(self.global.insert(node)?.node())
        })
    }

    fn load_node(&self, at: RevisionNumber) -> CoreResult<Arc<ValidityChain<ItemData>>> {
        let backend = &self.env.backend;
        let (table, branch, id) = (&*self.key.type_name, self.key.branch, self.key.id);
        if let Some(row) = backend.fetch(table, branch, id, at)? {
            let values = self.pad(row.values);
            return Ok(ValidityChain::new(
                row.rev_min,
                row.rev_max,
                ItemData::Alive(values),
            )?);
        }
        let history = backend.history(table, branch, id)?;
        let min = history
            .iter()
            .filter(|row| row.rev_max < at)
            .map(|row| row.rev_max + 1)
            .max()
            .unwrap_or(INITIAL_REV);
        let max = history
            .iter()
            .filter(|row| row.rev_min > at)
            .map(|row| row.rev_min - 1)
            .min()
            .unwrap_or(CURRENT_REV);
        Ok(ValidityChain::new(min, max, ItemData::Deleted)?)
    }

    fn pad(&self, mut values: Vec<Value>) -> Arc<[Value]> {
        values.resize(self.type_def.width(), Value::Null);
        values.into()
    }

    /// Committed column values at `revision`, or `None` if the object did not
    /// exist then.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn values_at(&self, revision: RevisionNumber) -> CoreResult<Option<Arc<[Value]>>> {
        Ok(self.node_at(revision)?.payload().values().cloned())
    }

    /// Returns true if committed data exists at `revision`.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn alive_at(&self, revision: RevisionNumber) -> CoreResult<bool> {
        Ok(self.values_at(revision)?.is_some())
    }

    /// Committed column values at `revision`.
    ///
    /// # Errors
    ///
    /// Fails with `DeletedObjectAccess` naming the dead range if the object
    /// did not exist at `revision`.
    pub fn require_values_at(&self, revision: RevisionNumber) -> CoreResult<Arc<[Value]>> {
        let node = self.node_at(revision)?;
        match node.payload() {
            ItemData::Alive(values) => Ok(Arc::clone(values)),
            ItemData::Deleted => Err(self.dead_error(self.read_revision(revision), node.range())),
        }
    }

    pub(crate) fn dead_error(
        &self,
        revision: RevisionNumber,
        (min, max): (RevisionNumber, RevisionNumber),
    ) -> CoreError {
        let detail = if min == INITIAL_REV {
            "not created yet".to_string()
        } else if max == CURRENT_REV {
            format!("deleted since revision {min}, last alive at {}", min - 1)
        } else {
            format!("not alive in revisions [{min}, {max}], last alive at {}", min - 1)
        };
        CoreError::DeletedObjectAccess {
            key: self.key.clone(),
            revision,
            detail,
            dead_range: Some((min, max)),
        }
    }

    /// Committed value of a declared or flex attribute at `revision`.
    ///
    /// # Errors
    ///
    /// Fails with `NoSuchAttribute` for unknown attributes and with
    /// `DeletedObjectAccess` if the object did not exist.
    pub fn value_at(&self, attribute: &str, revision: RevisionNumber) -> CoreResult<Value> {
        let slot = self.type_def.resolve(attribute)?;
        let values = self.require_values_at(revision)?;
        match slot {
            AttributeSlot::Column(column) => Ok(values[column].clone()),
            AttributeSlot::Flex => Ok(self
                .flex_at(revision)?
                .get(attribute)
                .cloned()
                .unwrap_or(Value::Null)),
        }
    }

    /// Committed target of a reference attribute at `revision`, mapped into
    /// this item's history context.
    ///
    /// # Errors
    ///
    /// Fails like [`Self::value_at`], or with `TypeMismatch` if the value is
    /// not a reference.
    pub fn referenced_key_at(
        &self,
        attribute: &str,
        revision: RevisionNumber,
    ) -> CoreResult<Option<ObjectKey>> {
        let value = self.value_at(attribute, revision)?;
        self.reference_of(attribute, &value)
    }

    pub(crate) fn reference_of(&self, attribute: &str, value: &Value) -> CoreResult<Option<ObjectKey>> {
        match value {
            Value::Null => Ok(None),
            Value::Ref(target) => Ok(Some(self.map_reference(target))),
            other => Err(CoreError::type_mismatch(format!(
                "{}.{attribute} holds {}, not a reference",
                self.type_def.name(),
                other.kind()
            ))),
        }
    }

    /// Publishes committed data valid from `revision`.
    pub(crate) fn publish(&self, revision: RevisionNumber, data: ItemData) -> CoreResult<()> {
        self.global.advance(revision, data)?;
        Ok(())
    }

    /// The association cache of this item for `query`, created empty on
    /// first use.
    pub(crate) fn association_cache(&self, query: &Arc<AssociationQuery>) -> Arc<AssociationCache> {
        let mut caches = self.associations.lock();
        let cache = caches
            .entry(Arc::clone(query.cache_key()))
            .or_insert_with(|| Arc::new(AssociationCache::new(Arc::clone(query))));
        Arc::clone(cache)
    }

    /// Association caches built so far.
    pub(crate) fn association_caches(&self) -> Vec<Arc<AssociationCache>> {
        self.associations.lock().values().cloned().collect()
    }

    /// Forgets every loaded chain node and association cache; the next read
    /// reloads from storage.
    pub(crate) fn reset(&self) {
        self.global.clear();
        self.flex.clear();
        for cache in self.association_caches() {
            cache.reset();
        }
    }

    /// Drops chain nodes no reader at `oldest` or later can reach. Returns
    /// the number of dropped nodes.
    pub(crate) fn truncate_before(&self, oldest: RevisionNumber) -> usize {
        let caches = self.association_caches();
        self.global.truncate_before(oldest)
            + self.flex.truncate_before(oldest)
            + caches
                .iter()
                .map(|cache| cache.truncate_before(oldest))
                .sum::<usize>()
    }
}
