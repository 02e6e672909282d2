//! Knowledge base facade.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use revkb_codec::{BranchId, ObjectKey, RevisionNumber, Value, TRUNK};
use revkb_storage::{BranchRow, ChangeKind, StorageBackend};
use serde::Serialize;
use tracing::{debug, info};

use crate::arena::{Arena, Env};
use crate::association::{
    fill_caches, AssociationMaintainer, AssociationQuery, AssociationQueryBuilder, AssociationView,
};
use crate::config::{KbConfig, QueryCacheStrategy};
use crate::context::DbContext;
use crate::error::{CoreError, CoreResult};
use crate::event::{CommitNotice, SubscriptionId, UpdateEvent, UpdateFeed, UpdateListener};
use crate::identity::{ContextId, Revision};
use crate::item::{ensure_flex_loaded, ItemReader, KnowledgeItem};
use crate::query::{CompiledQuery, QueryCache};
use crate::schema::Schema;
use crate::sequence::{SequenceAllocator, OBJECT_ID_SEQUENCE, REVISION_SEQUENCE};
use crate::wrapper::{bind, Bound, NoWrappers, WrapperFactory};

/// What [`KnowledgeBase::cleanup`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Oldest revision still readable through a chain.
    pub oldest_revision: RevisionNumber,
    /// Chain nodes dropped from items, association caches and query caches.
    pub truncated_nodes: usize,
    /// Arena entries dropped.
    pub evicted_items: usize,
    /// Invalidated query caches unregistered.
    pub released_query_caches: usize,
}

struct KbInner {
    env: Arc<Env>,
    arena: Arc<Arena>,
    feed: Arc<UpdateFeed>,
    wrappers: Arc<dyn WrapperFactory>,
    ids: SequenceAllocator,
    /// Serializes commits and branch creation.
    commit_lock: Mutex<()>,
    /// Session revision of every open context.
    contexts: Mutex<BTreeMap<ContextId, RevisionNumber>>,
    next_context: AtomicU64,
    query_caches: Mutex<Vec<(SubscriptionId, Arc<QueryCache>)>>,
    maintainer: SubscriptionId,
}

/// A versioned, branchable object store.
///
/// `KnowledgeBase` is a cheap handle; clones share everything. Writes go
/// through [`DbContext`]s:
///
/// ```rust,ignore
/// let kb = KnowledgeBase::open(Arc::new(InMemoryBackend::new()), schema)?;
///
/// let ctx = kb.begin_transaction("ada")?;
/// let person = ctx.create_item("Person")?;
/// ctx.set_value(&person, "name", "Ada")?;
/// let revision = ctx.commit()?.expect("changes were made");
///
/// assert_eq!(person.value_at("name", revision.number)?, Value::from("Ada"));
/// ```
#[derive(Clone)]
pub struct KnowledgeBase {
    inner: Arc<KbInner>,
}

impl fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("last_revision", &self.last_revision())
            .field("items", &self.inner.arena.len())
            .field("open_contexts", &self.inner.contexts.lock().len())
            .field("feed", &self.inner.feed)
            .finish_non_exhaustive()
    }
}

impl KnowledgeBase {
    /// Opens a knowledge base with the default configuration and no
    /// wrappers.
    ///
    /// # Errors
    ///
    /// Fails if the backend is unreadable.
    pub fn open(backend: Arc<dyn StorageBackend>, schema: Schema) -> CoreResult<Self> {
        Self::open_with(backend, schema, KbConfig::default(), Arc::new(NoWrappers))
    }

    /// Opens a knowledge base.
    ///
    /// # Errors
    ///
    /// Fails if the backend is unreadable.
    pub fn open_with(
        backend: Arc<dyn StorageBackend>,
        schema: Schema,
        config: KbConfig,
        wrappers: Arc<dyn WrapperFactory>,
    ) -> CoreResult<Self> {
        let last = backend.last_revision()?;
        let ids = SequenceAllocator::new(OBJECT_ID_SEQUENCE, Arc::clone(&backend), &config);
        let feed = Arc::new(UpdateFeed::with_max_history(config.feed_history));
        let type_count = schema.types().count();
        let env = Arc::new(Env::new(backend, Arc::new(schema), config, last));
        let arena = Arc::new(Arena::new(Arc::clone(&env)));
        let maintainer = feed.subscribe(Arc::new(AssociationMaintainer::new(Arc::clone(&arena))));

        info!(last_revision = last, types = type_count, "opened knowledge base");
        Ok(Self {
            inner: Arc::new(KbInner {
                env,
                arena,
                feed,
                wrappers,
                ids,
                commit_lock: Mutex::new(()),
                contexts: Mutex::new(BTreeMap::new()),
                next_context: AtomicU64::new(1),
                query_caches: Mutex::new(Vec::new()),
                maintainer,
            }),
        })
    }

    // ---- contexts -------------------------------------------------------

    /// Starts a transaction on the trunk.
    ///
    /// # Errors
    ///
    /// See [`Self::begin_transaction_on`].
    pub fn begin_transaction(&self, author: &str) -> CoreResult<DbContext> {
        self.begin_transaction_on(TRUNK, author)
    }

    /// Starts a transaction on `branch`, reading at the last revision.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if an author is required but `author` is blank or
    /// if the branch does not exist.
    pub fn begin_transaction_on(&self, branch: BranchId, author: &str) -> CoreResult<DbContext> {
        if self.config().author_required && author.trim().is_empty() {
            return Err(CoreError::invalid_operation("transactions require an author"));
        }
        if branch != TRUNK && !self.branches()?.iter().any(|b| b.id == branch) {
            return Err(CoreError::invalid_operation(format!("unknown branch {branch}")));
        }
        self.refetch()?;
        let id = ContextId::new(self.inner.next_context.fetch_add(1, Ordering::Relaxed));
        let session = {
            let mut contexts = self.inner.contexts.lock();
            let session = self.last_revision();
            contexts.insert(id, session);
            session
        };
        debug!(context = %id, branch, session, author, "transaction started");
        Ok(DbContext::new(id, self.clone(), author.to_string(), branch, session))
    }

    /// Number of open contexts.
    pub fn open_contexts(&self) -> usize {
        self.inner.contexts.lock().len()
    }

    pub(crate) fn deregister_context(&self, id: ContextId) {
        self.inner.contexts.lock().remove(&id);
    }

    pub(crate) fn update_context(&self, id: ContextId, session: RevisionNumber) {
        if let Some(entry) = self.inner.contexts.lock().get_mut(&id) {
            *entry = session;
        }
    }

    // ---- reads ----------------------------------------------------------

    /// The item for `key`, or `None` if it has no committed data at the
    /// last revision (or, for historic keys, at their revision).
    ///
    /// # Errors
    ///
    /// `UnknownType` or storage errors.
    pub fn resolve_object_key(&self, key: &ObjectKey) -> CoreResult<Option<Arc<KnowledgeItem>>> {
        let item = self.inner.arena.item(key)?;
        if item.is_new() || item.is_discarded() {
            return Ok(None);
        }
        Ok(item.alive_at(self.last_revision())?.then_some(item))
    }

    /// A reader for committed data at `revision`.
    pub fn reader(&self, revision: RevisionNumber) -> RevisionReader {
        RevisionReader {
            kb: self.clone(),
            revision: revision.min(self.last_revision()),
        }
    }

    /// Last committed revision.
    pub fn last_revision(&self) -> RevisionNumber {
        self.inner.env.last_revision()
    }

    /// Metadata of one revision.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn revision(&self, number: RevisionNumber) -> CoreResult<Option<Revision>> {
        Ok(self.inner.env.backend.revision(number)?.map(Revision::from))
    }

    /// All revisions, oldest first.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn revisions(&self) -> CoreResult<Vec<Revision>> {
        Ok(self
            .inner
            .env
            .backend
            .revisions()?
            .into_iter()
            .map(Revision::from)
            .collect())
    }

    /// Committed links of `base` matching `query` at `revision`.
    ///
    /// # Errors
    ///
    /// `DeletedObjectAccess` if `base` has no data at `revision`, or
    /// storage errors.
    pub fn association(
        &self,
        base: &KnowledgeItem,
        query: &Arc<AssociationQuery>,
        revision: RevisionNumber,
    ) -> CoreResult<AssociationView> {
        let revision = base.read_revision(revision.min(self.last_revision()));
        base.require_values_at(revision)?;
        let container = base.association_cache(query).read(base, revision)?;
        Ok(AssociationView::new(
            base.key().clone(),
            Arc::clone(query),
            revision,
            container,
            false,
        ))
    }

    /// Starts an association query over `association_type` from the side
    /// named by `reference`.
    pub fn association_query(
        &self,
        cache_key: impl Into<Arc<str>>,
        association_type: &str,
        reference: &str,
    ) -> AssociationQueryBuilder {
        AssociationQuery::builder(cache_key, association_type, reference)
    }

    /// Registered types.
    pub fn schema(&self) -> &Schema {
        &self.inner.env.schema
    }

    /// Configuration.
    pub fn config(&self) -> &KbConfig {
        &self.inner.env.config
    }

    /// Number of materialized items.
    pub fn item_count(&self) -> usize {
        self.inner.arena.len()
    }

    /// The application object for `item`.
    pub fn wrap(&self, item: &Arc<KnowledgeItem>) -> Bound {
        bind(self.inner.wrappers.as_ref(), item)
    }

    // ---- bulk loading ---------------------------------------------------

    /// Builds the association caches of `bases` for `query` at the last
    /// revision with one storage scan per branch. Returns the number of
    /// caches built.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn fill_caches(&self, bases: &[Arc<KnowledgeItem>], query: &Arc<AssociationQuery>) -> CoreResult<usize> {
        fill_caches(&self.inner.env, bases, query, self.last_revision())
    }

    /// Loads the flex attributes of `items` at `revision` with one storage
    /// round trip per type and branch. Returns the number of items loaded.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn ensure_flex_loaded(&self, items: &[Arc<KnowledgeItem>], revision: RevisionNumber) -> CoreResult<usize> {
        ensure_flex_loaded(&self.inner.env, items, revision)
    }

    // ---- query caches ---------------------------------------------------

    /// A new trunk cache for `query` with the configured strategy.
    pub fn query_cache(&self, query: Arc<dyn CompiledQuery>, args: Vec<Value>) -> Arc<QueryCache> {
        self.query_cache_with(query, args, TRUNK, self.config().query_cache_strategy)
    }

    /// A new cache for `query` on `branch`.
    ///
    /// The cache follows every commit until it is invalidated through
    /// [`Self::invalidate_query_cache`].
    pub fn query_cache_with(
        &self,
        query: Arc<dyn CompiledQuery>,
        args: Vec<Value>,
        branch: BranchId,
        strategy: QueryCacheStrategy,
    ) -> Arc<QueryCache> {
        let cache = Arc::new(QueryCache::new(
            query,
            args,
            branch,
            strategy,
            Arc::clone(&self.inner.arena),
        ));
        let id = self.inner.feed.subscribe(Arc::clone(&cache) as Arc<dyn UpdateListener>);
        self.inner.query_caches.lock().push((id, Arc::clone(&cache)));
        cache
    }

    /// Invalidates `cache` and stops feeding it commits. Invalidating twice
    /// does nothing.
    pub fn invalidate_query_cache(&self, cache: &Arc<QueryCache>) {
        cache.invalidate();
        let mut caches = self.inner.query_caches.lock();
        caches.retain(|(id, registered)| {
            if Arc::ptr_eq(registered, cache) {
                self.inner.feed.unsubscribe(*id);
                false
            } else {
                true
            }
        });
    }

    /// Number of registered query caches.
    pub fn query_cache_count(&self) -> usize {
        self.inner.query_caches.lock().len()
    }

    // ---- branches -------------------------------------------------------

    /// Creates a branch holding a copy of every object alive in
    /// `base_branch` at `base_revision`. Returns the new branch id and the
    /// revision that created it.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if branching is disabled or `base_revision` is in
    /// the future; storage errors if the base branch is unknown.
    pub fn create_branch(
        &self,
        base_branch: BranchId,
        base_revision: RevisionNumber,
        author: &str,
    ) -> CoreResult<(BranchId, Revision)> {
        if !self.config().branching {
            return Err(CoreError::invalid_operation("branching is disabled"));
        }
        let _serial = self.inner.commit_lock.lock();
        let last = self.refetch_locked()?;
        if base_revision > last {
            return Err(CoreError::invalid_operation(format!(
                "base revision {base_revision} is after the last revision {last}"
            )));
        }

        let env = &self.inner.env;
        let id = env.backend.branches()?.iter().map(|b| b.id).max().unwrap_or(TRUNK) + 1;
        let number = self.reserve_revision()?;
        let revision = Revision::now(number, author, format!("create branch {id}"));
        let row = BranchRow {
            id,
            base_branch: Some(base_branch),
            base_revision,
            created_at: number,
            tables: self.schema().table_names(),
        };
        env.backend.create_branch(row, revision.to_row())?;

        let event = UpdateEvent {
            revision: number,
            author: author.to_string(),
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        };
        {
            let _publish = env.publish_lock.write();
            for item in self.inner.arena.items() {
                if item.key().branch == id {
                    item.reset();
                }
            }
            env.set_last_revision(number);
            self.inner.feed.publish(&CommitNotice {
                event: &event,
                changes: &[],
            });
        }
        info!(branch = id, base_branch, base_revision, revision = number, "created branch");
        Ok((id, revision))
    }

    /// All branches by id.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn branches(&self) -> CoreResult<Vec<BranchRow>> {
        Ok(self.inner.env.backend.branches()?)
    }

    // ---- foreign revisions ----------------------------------------------

    /// Folds revisions other instances committed to the shared backend
    /// since this instance last looked. Returns the last revision.
    ///
    /// Transactions and session refreshes do this on their own; call it to
    /// make plain reads see foreign commits.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn refetch(&self) -> CoreResult<RevisionNumber> {
        if self.inner.env.backend.last_revision()? <= self.last_revision() {
            return Ok(self.last_revision());
        }
        let _serial = self.inner.commit_lock.lock();
        self.refetch_locked()
    }

    /// [`Self::refetch`] for callers already holding the commit lock.
    ///
    /// Touched items and the association caches over touched tables are
    /// reset, query caches drop their results, and every foreign revision
    /// is replayed to the feed without item changes.
    pub(crate) fn refetch_locked(&self) -> CoreResult<RevisionNumber> {
        let env = &self.inner.env;
        let known = env.last_revision();
        let last = env.backend.last_revision()?;
        if last <= known {
            return Ok(known);
        }

        let changes = env.backend.changes_since(known)?;
        let revisions: Vec<Revision> = env
            .backend
            .revisions()?
            .into_iter()
            .filter(|row| row.number > known && row.number <= last)
            .map(Revision::from)
            .collect();
        let new_branches: BTreeSet<BranchId> = env
            .backend
            .branches()?
            .iter()
            .filter(|b| b.created_at > known)
            .map(|b| b.id)
            .collect();

        let mut events: BTreeMap<RevisionNumber, UpdateEvent> = revisions
            .iter()
            .map(|revision| {
                let event = UpdateEvent {
                    revision: revision.number,
                    author: revision.author.clone(),
                    created: Vec::new(),
                    updated: Vec::new(),
                    deleted: Vec::new(),
                };
                (revision.number, event)
            })
            .collect();
        let mut touched = BTreeSet::new();
        let mut tables = BTreeSet::new();
        for change in changes.into_iter().filter(|c| c.revision <= last) {
            let key = ObjectKey::current(change.branch, change.table.as_str(), change.id);
            if let Some(event) = events.get_mut(&change.revision) {
                match change.kind {
                    ChangeKind::Created => event.created.push(key.clone()),
                    ChangeKind::Updated | ChangeKind::Flex => event.updated.push(key.clone()),
                    ChangeKind::Deleted => event.deleted.push(key.clone()),
                }
            }
            tables.insert(change.table);
            touched.insert(key);
        }

        {
            let _publish = env.publish_lock.write();
            for item in self.inner.arena.items() {
                if touched.contains(item.key()) || new_branches.contains(&item.key().branch) {
                    item.reset();
                    continue;
                }
                for cache in item.association_caches() {
                    if tables.iter().any(|t| cache.query().covers_type(t)) {
                        cache.reset();
                    }
                }
            }
            for (_, cache) in self.inner.query_caches.lock().iter() {
                cache.reset();
            }
            env.set_last_revision(last);
            for event in events.values() {
                self.inner.feed.publish(&CommitNotice {
                    event,
                    changes: &[],
                });
            }
        }
        info!(
            from = known,
            to = last,
            revisions = events.len(),
            objects = touched.len(),
            "fetched foreign revisions"
        );
        Ok(last)
    }

    // ---- maintenance ----------------------------------------------------

    /// Drops history no open context can read any more, unregisters
    /// invalidated query caches and, if configured, evicts items only the
    /// arena holds.
    pub fn cleanup(&self) -> CleanupReport {
        let oldest = self
            .inner
            .contexts
            .lock()
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.last_revision());

        let mut report = CleanupReport {
            oldest_revision: oldest,
            ..CleanupReport::default()
        };

        let live_caches: Vec<Arc<QueryCache>> = {
            let mut caches = self.inner.query_caches.lock();
            caches.retain(|(id, cache)| {
                if cache.is_invalidated() {
                    self.inner.feed.unsubscribe(*id);
                    report.released_query_caches += 1;
                    false
                } else {
                    true
                }
            });
            caches.iter().map(|(_, cache)| Arc::clone(cache)).collect()
        };

        for item in self.inner.arena.items() {
            report.truncated_nodes += item.truncate_before(oldest);
        }
        for cache in &live_caches {
            report.truncated_nodes += cache.truncate_before(oldest);
        }
        if self.config().evict_unreferenced {
            report.evicted_items = self.inner.arena.evict_unreferenced();
        }
        self.inner.feed.truncate_history(oldest);

        info!(
            oldest_revision = oldest,
            truncated = report.truncated_nodes,
            evicted = report.evicted_items,
            released = report.released_query_caches,
            "history cleanup"
        );
        report
    }

    // ---- feed -----------------------------------------------------------

    /// The update feed.
    pub fn feed(&self) -> &Arc<UpdateFeed> {
        &self.inner.feed
    }

    /// Registers a commit listener.
    pub fn subscribe(&self, listener: Arc<dyn UpdateListener>) -> SubscriptionId {
        self.inner.feed.subscribe(listener)
    }

    /// Removes a commit listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        id != self.inner.maintainer && self.inner.feed.unsubscribe(id)
    }

    /// Update events after `revision`, oldest first.
    pub fn poll(&self, after: RevisionNumber, limit: usize) -> Vec<UpdateEvent> {
        self.inner.feed.poll(after, limit)
    }

    // ---- crate internals ------------------------------------------------

    pub(crate) fn env(&self) -> &Arc<Env> {
        &self.inner.env
    }

    pub(crate) fn arena(&self) -> &Arc<Arena> {
        &self.inner.arena
    }

    pub(crate) fn commit_lock(&self) -> &Mutex<()> {
        &self.inner.commit_lock
    }

    pub(crate) fn allocate_id(&self) -> CoreResult<u64> {
        self.inner.ids.next_id()
    }

    pub(crate) fn allocate_ids(&self, count: usize) -> CoreResult<Vec<u64>> {
        self.inner.ids.next_ids(count)
    }

    pub(crate) fn reserve_revision(&self) -> CoreResult<RevisionNumber> {
        self.inner
            .env
            .backend
            .reserve_sequence(REVISION_SEQUENCE, 1)
            .map_err(|source| CoreError::AllocationFailure {
                sequence: REVISION_SEQUENCE.to_string(),
                source,
            })
    }
}

/// Read-only access to committed data at one revision.
#[derive(Debug, Clone)]
pub struct RevisionReader {
    kb: KnowledgeBase,
    revision: RevisionNumber,
}

impl RevisionReader {
    /// The revision read at.
    pub fn revision(&self) -> RevisionNumber {
        self.revision
    }
}

impl ItemReader for RevisionReader {
    fn read_revision(&self) -> RevisionNumber {
        self.revision
    }

    fn values(&self, item: &KnowledgeItem) -> CoreResult<Arc<[Value]>> {
        item.require_values_at(self.revision)
    }

    fn resolve(&self, key: &ObjectKey) -> CoreResult<Option<Arc<KnowledgeItem>>> {
        let item = self.kb.arena().item(key)?;
        if item.is_new() || item.is_discarded() {
            return Ok(None);
        }
        Ok(item.alive_at(self.revision)?.then_some(item))
    }
}
