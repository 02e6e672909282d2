//! Revision-scoped caches of search results.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use revkb_codec::{BranchId, ObjectKey, RevisionNumber, Value, CURRENT_REV};
use tracing::{debug, debug_span, error};

use super::{CompiledQuery, SearchScope};
use crate::arena::{Arena, Env};
use crate::config::QueryCacheStrategy;
use crate::context::DbContext;
use crate::error::{CoreError, CoreResult};
use crate::event::{CommitNotice, UpdateListener};
use crate::item::KnowledgeItem;
use crate::validity::{ChainSlot, ValidityChain};

/// Cached results of one committed revision, in key order.
#[derive(Debug, Clone)]
enum Payload {
    Values(BTreeMap<ObjectKey, Arc<KnowledgeItem>>),
    Ids(BTreeSet<ObjectKey>),
}

impl Payload {
    fn contains(&self, key: &ObjectKey) -> bool {
        match self {
            Self::Values(items) => items.contains_key(key),
            Self::Ids(keys) => keys.contains(key),
        }
    }

    fn remove(&mut self, key: &ObjectKey) -> bool {
        match self {
            Self::Values(items) => items.remove(key).is_some(),
            Self::Ids(keys) => keys.remove(key),
        }
    }

    fn insert(&mut self, item: &Arc<KnowledgeItem>) {
        match self {
            Self::Values(items) => {
                items.insert(item.key().clone(), Arc::clone(item));
            }
            Self::Ids(keys) => {
                keys.insert(item.key().clone());
            }
        }
    }

    fn keys(&self) -> Vec<ObjectKey> {
        match self {
            Self::Values(items) => items.keys().cloned().collect(),
            Self::Ids(keys) => keys.iter().cloned().collect(),
        }
    }

    fn cached(&self, key: &ObjectKey) -> Option<&Arc<KnowledgeItem>> {
        match self {
            Self::Values(items) => items.get(key),
            Self::Ids(_) => None,
        }
    }
}

/// Results of one compiled query with fixed arguments in one branch.
///
/// The cache keeps one result list per committed revision it was read at,
/// and folds every commit into the newest one instead of searching again.
/// Reads through a context see the context's own edits on top.
#[derive(Debug)]
pub struct QueryCache {
    query: Arc<dyn CompiledQuery>,
    args: Vec<Value>,
    branch: BranchId,
    strategy: QueryCacheStrategy,
    env: Arc<Env>,
    arena: Arc<Arena>,
    chain: ChainSlot<Arc<Payload>>,
    invalidated: AtomicBool,
}

impl QueryCache {
    pub(crate) fn new(
        query: Arc<dyn CompiledQuery>,
        args: Vec<Value>,
        branch: BranchId,
        strategy: QueryCacheStrategy,
        arena: Arc<Arena>,
    ) -> Self {
        Self {
            query,
            args,
            branch,
            strategy,
            env: Arc::clone(arena.env()),
            arena,
            chain: ChainSlot::new(),
            invalidated: AtomicBool::new(false),
        }
    }

    /// The query.
    pub fn query(&self) -> &Arc<dyn CompiledQuery> {
        &self.query
    }

    /// Search arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Branch searched.
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// How results are kept.
    pub fn strategy(&self) -> QueryCacheStrategy {
        self.strategy
    }

    /// Returns true after [`Self::invalidate`].
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Ranges of the cached result lists, newest first.
    pub fn ranges(&self) -> Vec<(RevisionNumber, RevisionNumber)> {
        self.chain.ranges()
    }

    /// Drops every cached result list. Later reads fail with
    /// `InvalidatedCache`; invalidating again does nothing.
    pub fn invalidate(&self) {
        if !self.invalidated.swap(true, Ordering::AcqRel) {
            self.chain.clear();
            debug!(query = self.query.name(), "query cache invalidated");
        }
    }

    /// Results at the last committed revision.
    ///
    /// # Errors
    ///
    /// `InvalidatedCache` after [`Self::invalidate`], storage errors, or
    /// errors of the compiled query.
    pub fn read(&self) -> CoreResult<Vec<Arc<KnowledgeItem>>> {
        self.check_valid()?;
        let payload = self.committed(self.env.last_revision())?;
        self.materialize(&payload, payload.keys())
    }

    /// Results as seen by `context`: the committed results at its session
    /// revision, without objects it changed or deleted, plus objects it
    /// created or changed that match now.
    ///
    /// # Errors
    ///
    /// Like [`Self::read`]; `InvalidOperation` if `context` writes another
    /// branch.
    pub fn read_in(&self, context: &DbContext) -> CoreResult<Vec<Arc<KnowledgeItem>>> {
        self.check_valid()?;
        if context.branch() != self.branch {
            return Err(CoreError::invalid_operation(format!(
                "query cache {} reads branch {}, context {} writes branch {}",
                self.query.name(),
                self.branch,
                context.id(),
                context.branch()
            )));
        }
        let payload = self.committed(context.session_revision())?;
        let mut keys: BTreeSet<ObjectKey> = payload.keys().into_iter().collect();

        let type_def = self.env.schema.type_def(self.query.result_type())?;
        for (key, values) in context.local_rows(self.query.result_type())? {
            keys.remove(&key);
            if let Some(values) = values {
                if self.query.matches(type_def, &values, &self.args)? {
                    keys.insert(key);
                }
            }
        }
        self.materialize(&payload, keys.into_iter().collect())
    }

    fn check_valid(&self) -> CoreResult<()> {
        if self.is_invalidated() {
            return Err(CoreError::InvalidatedCache {
                name: self.query.name().to_string(),
            });
        }
        Ok(())
    }

    fn materialize(&self, payload: &Payload, keys: Vec<ObjectKey>) -> CoreResult<Vec<Arc<KnowledgeItem>>> {
        keys.iter()
            .map(|key| match payload.cached(key) {
                Some(item) => Ok(Arc::clone(item)),
                None => self.arena.item(key),
            })
            .collect()
    }

    /// The committed result list at `revision`, searching if no cached list
    /// covers it.
    fn committed(&self, revision: RevisionNumber) -> CoreResult<Arc<Payload>> {
        if let Some(node) = self.chain.find(revision) {
            return Ok(Arc::clone(node.payload()));
        }
        self.env.load(|last| {
            if let Some(node) = self.chain.find(revision) {
                return Ok(Arc::clone(node.payload()));
            }
            let at = revision.min(last);
            let span = debug_span!("query_search", query = self.query.name(), revision = at);
            let _enter = span.enter();

            let scope = SearchScope {
                backend: &*self.env.backend,
                schema: &self.env.schema,
                branch: self.branch,
                revision: at,
            };
            let keys = self.query.search(&scope, &self.args)?;
            debug!(results = keys.len(), "searched");
            let payload = match self.strategy {
                QueryCacheStrategy::Values => Payload::Values(
                    keys.into_iter()
                        .map(|key| Ok((key.clone(), self.arena.item(&key)?)))
                        .collect::<CoreResult<_>>()?,
                ),
                QueryCacheStrategy::Ids => Payload::Ids(keys.into_iter().collect()),
            };
            let max = if at == last { CURRENT_REV } else { at };
            let node = ValidityChain::new(at, max, Arc::new(payload))?;
            let node = self.chain.insert(node)?.node();
            Ok(Arc::clone(node.payload()))
        })
    }

    /// Forgets the cached result lists; the next read searches again.
    pub(crate) fn reset(&self) {
        self.chain.clear();
    }

    pub(crate) fn truncate_before(&self, oldest: RevisionNumber) -> usize {
        self.chain.truncate_before(oldest)
    }

    fn fold(&self, notice: &CommitNotice<'_>) -> CoreResult<bool> {
        let result_type = self.query.result_type();
        let type_def = self.env.schema.type_def(result_type)?;
        let mut verdicts = Vec::new();
        for change in notice.changes {
            let key = change.key();
            if key.branch != self.branch || &*key.type_name != result_type {
                continue;
            }
            let matches = match &change.after {
                Some(values) => self.query.matches(type_def, values, &self.args)?,
                None => false,
            };
            verdicts.push((&change.item, matches));
        }
        if verdicts.is_empty() {
            return Ok(false);
        }
        Ok(self.chain.derive(notice.event.revision, |old| {
            let mut payload = (**old).clone();
            let mut changed = false;
            for (item, matches) in &verdicts {
                if *matches {
                    if !payload.contains(item.key()) {
                        payload.insert(item);
                        changed = true;
                    }
                } else {
                    changed |= payload.remove(item.key());
                }
            }
            changed.then(|| Arc::new(payload))
        })?)
    }
}

impl UpdateListener for QueryCache {
    fn on_commit(&self, notice: &CommitNotice<'_>) {
        if self.is_invalidated() {
            return;
        }
        if let Err(e) = self.fold(notice) {
            error!(query = self.query.name(), revision = notice.event.revision, error = %e, "query cache fold failed, dropping cached results");
            self.chain.clear();
        }
    }
}
