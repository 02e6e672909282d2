//! Keeps committed association caches current.

use std::collections::HashMap;
use std::sync::Arc;

use revkb_codec::{ObjectKey, Value};
use tracing::error;

use super::AssociationCache;
use crate::arena::Arena;
use crate::event::{CommitNotice, UpdateListener};

/// Folds every commit into the open association caches of both endpoints of
/// each touched link.
#[derive(Debug)]
pub(crate) struct AssociationMaintainer {
    arena: Arc<Arena>,
}

type Pending = (Arc<AssociationCache>, ObjectKey, Vec<(ObjectKey, Option<Arc<[Value]>>)>);

impl AssociationMaintainer {
    pub(crate) fn new(arena: Arc<Arena>) -> Self {
        Self { arena }
    }
}

impl UpdateListener for AssociationMaintainer {
    fn on_commit(&self, notice: &CommitNotice<'_>) {
        let mut pending: HashMap<*const AssociationCache, Pending> = HashMap::new();

        for change in notice.changes {
            let type_def = change.item.type_def();
            let mut endpoints: Vec<&ObjectKey> = Vec::new();
            for (column, _) in type_def.reference_columns() {
                for values in [&change.before, &change.after].into_iter().flatten() {
                    if let Some(Value::Ref(target)) = values.get(column) {
                        if !endpoints.contains(&target) {
                            endpoints.push(target);
                        }
                    }
                }
            }

            for endpoint in endpoints {
                let Some(base) = self.arena.get(endpoint) else {
                    continue;
                };
                for cache in base.association_caches() {
                    if !cache.query().covers_type(type_def.name()) || !cache.is_open() {
                        continue;
                    }
                    pending
                        .entry(Arc::as_ptr(&cache))
                        .or_insert_with(|| (Arc::clone(&cache), endpoint.clone(), Vec::new()))
                        .2
                        .push((change.key().clone(), change.after.clone()));
                }
            }
        }

        for (cache, base, changes) in pending.into_values() {
            if let Err(e) = cache.fold(notice.event.revision, &base, &changes) {
                error!(base = %base, cache_key = %cache.query().cache_key(), error = %e, "association cache fold failed, resetting");
                cache.reset();
            }
        }
    }
}
