//! Committed association caches.

use std::collections::HashMap;
use std::sync::Arc;

use revkb_codec::{ObjectKey, RevisionNumber, Value, CURRENT_REV};
use revkb_storage::{ColumnFilter, Row};
use tracing::{debug, debug_span};

use super::{AssociationQuery, Container, Member};
use crate::arena::Env;
use crate::error::CoreResult;
use crate::item::KnowledgeItem;
use crate::validity::{ChainSlot, ValidityChain};

/// Committed links of one base item matching one query, by revision.
#[derive(Debug)]
pub struct AssociationCache {
    query: Arc<AssociationQuery>,
    chain: ChainSlot<Arc<Container>>,
}

impl AssociationCache {
    pub(crate) fn new(query: Arc<AssociationQuery>) -> Self {
        Self {
            query,
            chain: ChainSlot::new(),
        }
    }

    /// The query this cache answers.
    pub fn query(&self) -> &Arc<AssociationQuery> {
        &self.query
    }

    /// Ranges of the cached containers, newest first.
    pub fn ranges(&self) -> Vec<(RevisionNumber, RevisionNumber)> {
        self.chain.ranges()
    }

    /// The committed container of `base` at `revision`, built from storage
    /// if no cached one covers it.
    ///
    /// A container built at the last published revision stays valid until a
    /// commit changes it; one built for an older revision covers only that
    /// revision.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn read(&self, base: &KnowledgeItem, revision: RevisionNumber) -> CoreResult<Arc<Container>> {
        let revision = base.read_revision(revision);
        if let Some(node) = self.chain.find(revision) {
            return Ok(Arc::clone(node.payload()));
        }
        let env = base.env();
        env.load(|last| {
            if let Some(node) = self.chain.find(revision) {
                return Ok(Arc::clone(node.payload()));
            }
            let at = revision.min(last);
            let container = build_container(env, &self.query, base.key(), at)?;
            let node = self.chain.insert(cache_node(at, last, container)?)?.node();
            Ok(Arc::clone(node.payload()))
        })
    }

    /// Folds committed link changes into the open container.
    ///
    /// `changes` pairs each touched link with its committed columns, `None`
    /// for deleted links. Does nothing if no open container is cached or no
    /// membership changes.
    pub(crate) fn fold(
        &self,
        revision: RevisionNumber,
        base: &ObjectKey,
        changes: &[(ObjectKey, Option<Arc<[Value]>>)],
    ) -> CoreResult<bool> {
        let folded = self.chain.derive(revision, |old| {
            let mut container = (**old).clone();
            let mut changed = false;
            for (link, values) in changes {
                changed |= container.remove(link);
                if let Some(member) = values
                    .as_deref()
                    .and_then(|values| self.query.member(base, link, values))
                {
                    container.insert(member);
                    changed = true;
                }
            }
            changed.then(|| Arc::new(container))
        })?;
        Ok(folded)
    }

    /// Returns true if an open container is cached.
    pub(crate) fn is_open(&self) -> bool {
        self.chain.head().is_some_and(|head| head.is_open())
    }

    pub(crate) fn is_loaded_at(&self, revision: RevisionNumber) -> bool {
        self.chain.find(revision).is_some()
    }

    pub(crate) fn insert_built(
        &self,
        at: RevisionNumber,
        last: RevisionNumber,
        container: Container,
    ) -> CoreResult<()> {
        self.chain.insert(cache_node(at, last, container)?)?;
        Ok(())
    }

    /// Drops every cached container; the next read rebuilds from storage.
    pub(crate) fn reset(&self) {
        self.chain.clear();
    }

    pub(crate) fn truncate_before(&self, oldest: RevisionNumber) -> usize {
        self.chain.truncate_before(oldest)
    }
}

fn cache_node(
    at: RevisionNumber,
    last: RevisionNumber,
    container: Container,
) -> CoreResult<Arc<ValidityChain<Arc<Container>>>> {
    let max = if at == last { CURRENT_REV } else { at };
    Ok(ValidityChain::new(at, max, Arc::new(container))?)
}

fn link_key(query: &AssociationQuery, base: &ObjectKey, row: &Row) -> ObjectKey {
    ObjectKey::historic(
        base.branch,
        base.history,
        Arc::clone(query.association_type().name()),
        row.id,
    )
}

fn filters(query: &AssociationQuery) -> Vec<ColumnFilter> {
    query
        .filters()
        .iter()
        .map(|(column, value)| ColumnFilter::new(*column, value.clone()))
        .collect()
}

fn build_container(
    env: &Env,
    query: &AssociationQuery,
    base: &ObjectKey,
    at: RevisionNumber,
) -> CoreResult<Container> {
    let span = debug_span!("build_association_cache", base = %base, cache_key = %query.cache_key());
    let _enter = span.enter();

    let current = base.to_current();
    let mut filters = filters(query);
    filters.push(ColumnFilter::new(
        query.reference_column(),
        Value::Ref(current.clone()),
    ));
    let rows = env
        .backend
        .scan(query.association_type().name(), base.branch, at, &filters)?;
    let members: Vec<Member> = rows
        .iter()
        .filter_map(|row| query.member(&current, &link_key(query, base, row), &row.values))
        .collect();
    debug!(revision = at, links = members.len(), "built association cache");
    Ok(Container::from_members(query.shape(), members))
}

/// Builds the caches of every listed base item for `query` with a single
/// storage scan per branch. Bases already cached at `revision` are skipped.
/// Returns the number of caches built.
pub(crate) fn fill_caches(
    env: &Env,
    bases: &[Arc<KnowledgeItem>],
    query: &Arc<AssociationQuery>,
    revision: RevisionNumber,
) -> CoreResult<usize> {
    env.load(|last| {
        let mut groups: HashMap<(u64, RevisionNumber), Vec<(&Arc<KnowledgeItem>, Arc<AssociationCache>)>> =
            HashMap::new();
        for base in bases {
            let cache = base.association_cache(query);
            let at = base.read_revision(revision).min(last);
            if cache.is_loaded_at(base.read_revision(revision)) {
                continue;
            }
            groups
                .entry((base.key().branch, at))
                .or_default()
                .push((base, cache));
        }

        let mut built = 0;
        for ((branch, at), members) in groups {
            let rows = env
                .backend
                .scan(query.association_type().name(), branch, at, &filters(query))?;
            let mut by_base: HashMap<ObjectKey, Vec<&Row>> = HashMap::new();
            for row in &rows {
                if let Value::Ref(target) = row.value(query.reference_column()) {
                    by_base.entry(target.clone()).or_default().push(row);
                }
            }
            for (base, cache) in members {
                let current = base.key().to_current();
                let matches: Vec<Member> = by_base
                    .get(&current)
                    .into_iter()
                    .flatten()
                    .filter_map(|row| {
                        query.member(&current, &link_key(query, base.key(), row), &row.values)
                    })
                    .collect();
                cache.insert_built(at, last, Container::from_members(query.shape(), matches))?;
                built += 1;
            }
            debug!(branch, revision = at, built, "filled association caches");
        }
        Ok(built)
    })
}
