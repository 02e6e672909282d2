//! Snapshot handles over association containers.

use std::sync::Arc;

use revkb_codec::{ObjectKey, RevisionNumber, Value};

use super::{AssociationQuery, Container};
use crate::error::{CoreError, CoreResult};
use crate::item::{ItemReader, KnowledgeItem};

/// An immutable view of the links of one base item.
///
/// Views are snapshots: later local edits or commits produce new containers
/// and never change a view that was handed out.
#[derive(Debug, Clone)]
pub struct AssociationView {
    base: ObjectKey,
    query: Arc<AssociationQuery>,
    revision: RevisionNumber,
    container: Arc<Container>,
    local: bool,
}

impl AssociationView {
    pub(crate) fn new(
        base: ObjectKey,
        query: Arc<AssociationQuery>,
        revision: RevisionNumber,
        container: Arc<Container>,
        local: bool,
    ) -> Self {
        Self {
            base,
            query,
            revision,
            container,
            local,
        }
    }

    /// The base item.
    pub fn base(&self) -> &ObjectKey {
        &self.base
    }

    /// The query.
    pub fn query(&self) -> &Arc<AssociationQuery> {
        &self.query
    }

    /// Committed revision the view is based on.
    pub fn revision(&self) -> RevisionNumber {
        self.revision
    }

    /// Returns true if the view includes uncommitted edits of a context.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// The underlying container.
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Link keys in container order.
    pub fn links(&self) -> Vec<ObjectKey> {
        self.container.links()
    }

    /// Number of links.
    pub fn len(&self) -> usize {
        self.container.len()
    }

    /// Returns true if there are no links.
    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    /// Returns true if `link` is part of the view.
    pub fn contains(&self, link: &ObjectKey) -> bool {
        self.container.contains(link)
    }

    /// The link stored under `key` in a keyed view.
    pub fn get(&self, key: &Value) -> Option<&ObjectKey> {
        self.container.get(key)
    }

    /// Position of `link` in an ordered view.
    pub fn position(&self, link: &ObjectKey) -> Option<usize> {
        self.container.position(link)
    }

    /// Maps every link to its opposite endpoint, in container order.
    ///
    /// Links without an opposite endpoint value are skipped.
    ///
    /// # Errors
    ///
    /// Fails with `DanglingReference` for a link whose endpoint (or the
    /// link itself) is not alive for `reader`, with `InvalidOperation` for
    /// queries over custom references and with `TypeMismatch` if an
    /// endpoint is not of the expected type.
    pub fn resolve_endpoints(&self, reader: &dyn ItemReader) -> CoreResult<Vec<Arc<KnowledgeItem>>> {
        let column = self.query.opposite_column().ok_or_else(|| {
            CoreError::invalid_operation(format!(
                "query {} has no opposite endpoint",
                self.query.cache_key()
            ))
        })?;

        let mut endpoints = Vec::with_capacity(self.len());
        for link in self.links() {
            let dangling = |target: &ObjectKey| CoreError::DanglingReference {
                link: link.clone(),
                target: target.clone(),
            };
            let link_item = reader.resolve(&link)?.ok_or_else(|| dangling(&link))?;
            let values = reader.values(&link_item)?;
            let target = match values.get(column) {
                Some(Value::Ref(target)) => link_item.map_reference(target),
                _ => continue,
            };
            if let Some(expected) = self.query.expected_type() {
                if target.type_name != *expected {
                    return Err(CoreError::type_mismatch(format!(
                        "link {link} ends at {target}, expected a {expected}"
                    )));
                }
            }
            let endpoint = reader.resolve(&target)?.ok_or_else(|| dangling(&target))?;
            endpoints.push(endpoint);
        }
        Ok(endpoints)
    }
}
