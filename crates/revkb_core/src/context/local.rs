//! Association containers layered with a context's uncommitted edits.

use std::sync::Arc;

use revkb_codec::{ObjectKey, RevisionNumber, Value};

use super::ContextState;
use crate::association::{AssociationQuery, AssociationView, Container};

#[derive(Debug)]
pub(crate) struct LocalAssociation {
    query: Arc<AssociationQuery>,
    base: ObjectKey,
    container: Arc<Container>,
}

impl LocalAssociation {
    /// Layers every link this context touched over the committed container.
    pub(crate) fn layer(
        state: &ContextState,
        query: Arc<AssociationQuery>,
        base: ObjectKey,
        committed: Arc<Container>,
    ) -> Self {
        let mut local = Self {
            query,
            base,
            container: committed,
        };
        let type_name = Arc::clone(local.query.association_type().name());
        for (link, values) in state.touched_of_type(&type_name) {
            local.apply(link, values);
        }
        local
    }

    pub(crate) fn view(&self, session: RevisionNumber) -> AssociationView {
        AssociationView::new(
            self.base.clone(),
            Arc::clone(&self.query),
            session,
            Arc::clone(&self.container),
            true,
        )
    }

    /// Moves `link` into or out of the container after a local edit.
    /// Views handed out earlier keep the previous container.
    fn apply(&mut self, link: &ObjectKey, values: Option<&[Value]>) {
        let member = values.and_then(|values| self.query.member(&self.base, link, values));
        let present = self.container.contains(link);
        match member {
            Some(member) => {
                let unchanged = present
                    && match &*self.container {
                        Container::Set(_) => true,
                        Container::List(entries) => entries
                            .iter()
                            .any(|(sort, key)| key == link && *sort == member.sort),
                        Container::Map { .. } => self.container.key_of(link) == Some(&member.sort),
                    };
                if !unchanged {
                    Arc::make_mut(&mut self.container).insert(member);
                }
            }
            None if present => {
                Arc::make_mut(&mut self.container).remove(link);
            }
            None => {}
        }
    }
}

impl ContextState {
    /// Updates the local containers after `link` was written (`Some`) or
    /// deleted (`None`) in this context.
    pub(crate) fn notify_local(&mut self, link: &ObjectKey, values: Option<&[Value]>) {
        for local in self.local_associations.values_mut() {
            if local.query.covers_type(&link.type_name) {
                local.apply(link, values);
            }
        }
    }
}
