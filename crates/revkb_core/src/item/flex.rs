//! Dynamic ("flex") attribute data.
//!
//! Flex attributes of an object are loaded together, on first access, into
//! a chain of maps. A map loaded at the last published revision stays open
//! until a commit changes it; maps loaded for older revisions cover only
//! that revision.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use revkb_codec::{BranchId, RevisionNumber, Value, CURRENT_REV};
use revkb_storage::FlexRow;
use tracing::debug;

use super::KnowledgeItem;
use crate::arena::Env;
use crate::error::CoreResult;
use crate::validity::ValidityChain;

/// Flex attribute values of one object, by attribute name.
pub type FlexData = Arc<BTreeMap<String, Value>>;

fn flex_node(
    at: RevisionNumber,
    last: RevisionNumber,
    rows: impl IntoIterator<Item = FlexRow>,
) -> CoreResult<Arc<ValidityChain<FlexData>>> {
    let data: BTreeMap<String, Value> = rows
        .into_iter()
        .map(|row| (row.attribute, row.value))
        .collect();
    let max = if at == last { CURRENT_REV } else { at };
    Ok(ValidityChain::new(at, max, Arc::new(data))?)
}

impl KnowledgeItem {
    /// Committed flex attributes at `revision`. Empty for non-flex types.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn flex_at(&self, revision: RevisionNumber) -> CoreResult<FlexData> {
        if !self.type_def.is_flex() {
            return Ok(FlexData::default());
        }
        let revision = self.read_revision(revision);
        if let Some(node) = self.flex.find(revision) {
            return Ok(Arc::clone(node.payload()));
        }
        self.env.load(|last| {
            if let Some(node) = self.flex.find(revision) {
                return Ok(Arc::clone(node.payload()));
            }
            let at = revision.min(last);
            let rows = self.env.backend.fetch_flex(
                &self.key.type_name,
                self.key.branch,
                &[self.key.id],
                at,
            )?;
            let node = self.flex.insert(flex_node(at, last, rows)?)?.node();
            Ok(Arc::clone(node.payload()))
        })
    }

    /// Returns true if flex data covering `revision` is resident.
    pub fn is_flex_loaded(&self, revision: RevisionNumber) -> bool {
        !self.type_def.is_flex() || self.flex.find(self.read_revision(revision)).is_some()
    }

    /// Folds committed flex changes into an open flex chain.
    pub(crate) fn publish_flex(
        &self,
        revision: RevisionNumber,
        changes: &BTreeMap<String, Option<Value>>,
    ) -> CoreResult<()> {
        self.flex.derive(revision, |old| {
            let mut data = (**old).clone();
            for (attribute, value) in changes {
                match value {
                    Some(value) => data.insert(attribute.clone(), value.clone()),
                    None => data.remove(attribute),
                };
            }
            Some(Arc::new(data))
        })?;
        Ok(())
    }
}

/// Loads flex data of every listed item not yet resident at `revision`,
/// with one storage round trip per table and branch. Returns the number of
/// items loaded.
pub(crate) fn ensure_flex_loaded(
    env: &Env,
    items: &[Arc<KnowledgeItem>],
    revision: RevisionNumber,
) -> CoreResult<usize> {
    env.load(|last| {
        let mut groups: HashMap<(Arc<str>, BranchId, RevisionNumber), Vec<&Arc<KnowledgeItem>>> =
            HashMap::new();
        for item in items {
            if item.is_flex_loaded(revision) {
                continue;
            }
            let at = item.read_revision(revision).min(last);
            groups
                .entry((Arc::clone(&item.key.type_name), item.key.branch, at))
                .or_default()
                .push(item);
        }

        let mut loaded = 0;
        for ((table, branch, at), members) in groups {
            let ids: Vec<u64> = members.iter().map(|item| item.key.id).collect();
            let mut rows: HashMap<u64, Vec<FlexRow>> = HashMap::new();
            for row in env.backend.fetch_flex(&table, branch, &ids, at)? {
                rows.entry(row.id).or_default().push(row);
            }
            for item in members {
                let node = flex_node(at, last, rows.remove(&item.key.id).unwrap_or_default())?;
                item.flex.insert(node)?;
                loaded += 1;
            }
            debug!(table = %table, branch, revision = at, count = ids.len(), "loaded flex data");
        }
        Ok(loaded)
    })
}
