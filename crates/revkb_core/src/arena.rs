//! Shared environment and the item arena.
//!
//! Items, caches and contexts never point at each other directly. Items
//! hold the [`Env`] they load from; everything else addresses items by
//! [`ObjectKey`] through the [`Arena`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use revkb_codec::{ObjectKey, RevisionNumber};
use revkb_storage::StorageBackend;

use crate::config::KbConfig;
use crate::error::CoreResult;
use crate::identity::ContextId;
use crate::item::KnowledgeItem;
use crate::schema::Schema;

/// State shared by every item of one knowledge base.
#[derive(Debug)]
pub(crate) struct Env {
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) schema: Arc<Schema>,
    pub(crate) config: KbConfig,
    /// Held shared while loading from storage, exclusively while a commit
    /// publishes into chains and caches.
    pub(crate) publish_lock: RwLock<()>,
    last_revision: AtomicU64,
}

impl Env {
    pub(crate) fn new(
        backend: Arc<dyn StorageBackend>,
        schema: Arc<Schema>,
        config: KbConfig,
        last_revision: RevisionNumber,
    ) -> Self {
        Self {
            backend,
            schema,
            config,
            publish_lock: RwLock::new(()),
            last_revision: AtomicU64::new(last_revision),
        }
    }

    /// Last published revision.
    pub(crate) fn last_revision(&self) -> RevisionNumber {
        self.last_revision.load(Ordering::Acquire)
    }

    /// Must be called with `publish_lock` held exclusively.
    pub(crate) fn set_last_revision(&self, revision: RevisionNumber) {
        self.last_revision.store(revision, Ordering::Release);
    }

    /// Runs a storage load against a stable published revision.
    ///
    /// Commits cannot publish while `load` runs, so whatever it reads at the
    /// revision it is given is exactly what the chains will agree with.
    pub(crate) fn load<T>(&self, load: impl FnOnce(RevisionNumber) -> CoreResult<T>) -> CoreResult<T> {
        let _guard = self.publish_lock.read_recursive();
        load(self.last_revision())
    }
}

/// All materialized items, keyed by object key.
#[derive(Debug)]
pub(crate) struct Arena {
    env: Arc<Env>,
    items: RwLock<HashMap<ObjectKey, Arc<KnowledgeItem>>>,
}

impl Arena {
    pub(crate) fn new(env: Arc<Env>) -> Self {
        Self {
            env,
            items: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn env(&self) -> &Arc<Env> {
        &self.env
    }

    /// The materialized item, if any.
    pub(crate) fn get(&self, key: &ObjectKey) -> Option<Arc<KnowledgeItem>> {
        self.items.read().get(key).cloned()
    }

    /// The item for `key`, materialized without touching storage.
    ///
    /// # Errors
    ///
    /// Fails with `UnknownType` if the key names an unregistered type.
    pub(crate) fn item(&self, key: &ObjectKey) -> CoreResult<Arc<KnowledgeItem>> {
        if let Some(item) = self.get(key) {
            return Ok(item);
        }
        let type_def = Arc::clone(self.env.schema.type_def(&key.type_name)?);
        let mut items = self.items.write();
        let item = items.entry(key.clone()).or_insert_with(|| {
            Arc::new(KnowledgeItem::persistent(
                key.clone(),
                type_def,
                Arc::clone(&self.env),
            ))
        });
        Ok(Arc::clone(item))
    }

    /// Registers a new item created by `owner`.
    ///
    /// A materialized item without stored history is taken over. Returns
    /// `None` if another context is creating the same key.
    pub(crate) fn insert_new(
        &self,
        key: ObjectKey,
        owner: ContextId,
    ) -> CoreResult<Option<Arc<KnowledgeItem>>> {
        let type_def = Arc::clone(self.env.schema.type_def(&key.type_name)?);
        let mut items = self.items.write();
        if let Some(existing) = items.get(&key) {
            if existing.is_new() {
                return Ok(None);
            }
            existing.mark_new(owner);
            return Ok(Some(Arc::clone(existing)));
        }
        let item = Arc::new(KnowledgeItem::new_in(
            key.clone(),
            type_def,
            Arc::clone(&self.env),
            owner,
        ));
        items.insert(key, Arc::clone(&item));
        Ok(Some(item))
    }

    /// Drops a new item that was rolled back.
    pub(crate) fn discard(&self, key: &ObjectKey) {
        self.items.write().remove(key);
    }

    /// Snapshot of all materialized items.
    pub(crate) fn items(&self) -> Vec<Arc<KnowledgeItem>> {
        self.items.read().values().cloned().collect()
    }

    /// Number of materialized items.
    pub(crate) fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Drops committed items nobody outside the arena holds. Returns the
    /// number of evicted items.
    pub(crate) fn evict_unreferenced(&self) -> usize {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, item| item.is_new() || Arc::strong_count(item) > 1);
        before - items.len()
    }
}
