//! Association caches.
//!
//! An [`AssociationQuery`] describes the links of one association type that
//! point at a base item through one reference attribute, optionally
//! restricted by attribute equality predicates, and the container shape the
//! matching links are kept in.
//!
//! Every `(base item, query)` pair gets an [`AssociationCache`]: a validity
//! chain of immutable containers built once from storage and then folded
//! forward by the [`AssociationMaintainer`] on every commit that touches a
//! link of the association type. Transaction contexts layer their own
//! copy-on-write containers over the committed ones (see
//! [`crate::DbContext::association`]).

mod cache;
mod container;
mod maintainer;
mod ordered;
mod view;

use std::fmt;
use std::sync::Arc;

use revkb_codec::{ObjectKey, Value};

use crate::error::{CoreError, CoreResult};
use crate::schema::{Schema, TypeDef, DEST, SOURCE};

pub use cache::AssociationCache;
pub use container::{Container, Member};
pub(crate) use cache::fill_caches;
pub(crate) use maintainer::AssociationMaintainer;
pub(crate) use ordered::order_assignments;
pub use view::AssociationView;

/// Container shape of an association query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerShape {
    /// Unordered set of links.
    Set,
    /// Links sorted by an order attribute, then by key.
    OrderedList {
        /// Attribute holding the sort value.
        order_attribute: Arc<str>,
        /// Whether links may be re-ordered through the list.
        live: bool,
        /// Whether the order attribute is the position itself.
        indexed: bool,
    },
    /// Links keyed by an attribute value.
    KeyedMap {
        /// Attribute holding the map key.
        key_attribute: Arc<str>,
    },
}

/// A registered association query.
pub struct AssociationQuery {
    cache_key: Arc<str>,
    expected_type: Option<Arc<str>>,
    association_type: Arc<TypeDef>,
    reference: Arc<str>,
    reference_column: usize,
    opposite_column: Option<usize>,
    shape: ContainerShape,
    shape_column: Option<usize>,
    filters: Vec<(usize, Value)>,
}

impl fmt::Debug for AssociationQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationQuery")
            .field("cache_key", &self.cache_key)
            .field("association_type", self.association_type.name())
            .field("reference", &self.reference)
            .field("shape", &self.shape)
            .field("filters", &self.filters)
            .finish()
    }
}

impl AssociationQuery {
    /// Starts a query for links whose `reference` attribute points at the
    /// base item.
    pub fn builder(
        cache_key: impl Into<Arc<str>>,
        association_type: impl Into<Arc<str>>,
        reference: impl Into<Arc<str>>,
    ) -> AssociationQueryBuilder {
        AssociationQueryBuilder {
            cache_key: cache_key.into(),
            expected_type: None,
            association_type: association_type.into(),
            reference: reference.into(),
            shape: ShapeSpec::Set,
            filters: Vec::new(),
        }
    }

    /// Links starting at the base item.
    pub fn outgoing(
        cache_key: impl Into<Arc<str>>,
        association_type: impl Into<Arc<str>>,
    ) -> AssociationQueryBuilder {
        Self::builder(cache_key, association_type, SOURCE)
    }

    /// Links ending at the base item.
    pub fn incoming(
        cache_key: impl Into<Arc<str>>,
        association_type: impl Into<Arc<str>>,
    ) -> AssociationQueryBuilder {
        Self::builder(cache_key, association_type, DEST)
    }

    /// Identity of the query; one cache per base item and cache key.
    pub fn cache_key(&self) -> &Arc<str> {
        &self.cache_key
    }

    /// Required type of the opposite endpoints.
    pub fn expected_type(&self) -> Option<&Arc<str>> {
        self.expected_type.as_ref()
    }

    /// The association type.
    pub fn association_type(&self) -> &Arc<TypeDef> {
        &self.association_type
    }

    /// Name of the reference attribute pointing at the base item.
    pub fn reference(&self) -> &Arc<str> {
        &self.reference
    }

    pub(crate) fn reference_column(&self) -> usize {
        self.reference_column
    }

    /// Column of the other endpoint, for `source`/`dest` queries.
    pub(crate) fn opposite_column(&self) -> Option<usize> {
        self.opposite_column
    }

    /// The container shape.
    pub fn shape(&self) -> &ContainerShape {
        &self.shape
    }

    /// Attribute predicates as `(column, expected value)`.
    pub(crate) fn filters(&self) -> &[(usize, Value)] {
        &self.filters
    }

    /// Returns true if links of `type_name` may match.
    pub fn covers_type(&self, type_name: &str) -> bool {
        &**self.association_type.name() == type_name
    }

    /// Tests a link against the query for the base item `base`, reading the
    /// link's stored columns only.
    ///
    /// `base` must be the current key of the base item.
    #[must_use]
    pub fn member(&self, base: &ObjectKey, link: &ObjectKey, values: &[Value]) -> Option<Member> {
        let points_at_base = matches!(
            values.get(self.reference_column),
            Some(Value::Ref(target)) if target == base
        );
        if !points_at_base {
            return None;
        }
        let passes = self
            .filters
            .iter()
            .all(|(column, expected)| values.get(*column) == Some(expected));
        if !passes {
            return None;
        }
        let sort = self
            .shape_column
            .and_then(|column| values.get(column).cloned())
            .unwrap_or(Value::Null);
        Some(Member {
            link: link.clone(),
            sort,
        })
    }
}

#[derive(Debug, Clone)]
enum ShapeSpec {
    Set,
    Ordered { attribute: Arc<str>, live: bool, indexed: bool },
    Keyed { attribute: Arc<str> },
}

/// Builder for [`AssociationQuery`].
#[derive(Debug, Clone)]
pub struct AssociationQueryBuilder {
    cache_key: Arc<str>,
    expected_type: Option<Arc<str>>,
    association_type: Arc<str>,
    reference: Arc<str>,
    shape: ShapeSpec,
    filters: Vec<(Arc<str>, Value)>,
}

impl AssociationQueryBuilder {
    /// Requires the opposite endpoints to be of `type_name`.
    #[must_use]
    pub fn expected_type(mut self, type_name: impl Into<Arc<str>>) -> Self {
        self.expected_type = Some(type_name.into());
        self
    }

    /// Keeps links sorted by `attribute`, sorted once per revision.
    #[must_use]
    pub fn ordered_by(mut self, attribute: impl Into<Arc<str>>) -> Self {
        self.shape = ShapeSpec::Ordered {
            attribute: attribute.into(),
            live: false,
            indexed: false,
        };
        self
    }

    /// Keeps links sorted by `attribute` and allows re-ordering through the
    /// list.
    #[must_use]
    pub fn live_ordered_by(mut self, attribute: impl Into<Arc<str>>) -> Self {
        self.shape = ShapeSpec::Ordered {
            attribute: attribute.into(),
            live: true,
            indexed: false,
        };
        self
    }

    /// Like [`Self::live_ordered_by`], with `attribute` holding the list
    /// position itself.
    #[must_use]
    pub fn indexed_by(mut self, attribute: impl Into<Arc<str>>) -> Self {
        self.shape = ShapeSpec::Ordered {
            attribute: attribute.into(),
            live: true,
            indexed: true,
        };
        self
    }

    /// Keys links by `attribute`.
    #[must_use]
    pub fn keyed_by(mut self, attribute: impl Into<Arc<str>>) -> Self {
        self.shape = ShapeSpec::Keyed {
            attribute: attribute.into(),
        };
        self
    }

    /// Restricts links to those whose `attribute` equals `value`.
    #[must_use]
    pub fn filter(mut self, attribute: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        self.filters.push((attribute.into(), value.into()));
        self
    }

    /// Resolves attribute names against the schema.
    ///
    /// # Errors
    ///
    /// Fails with `UnknownType`/`NoSuchAttribute` for unknown names and with
    /// `TypeMismatch` if the reference attribute is not a reference.
    pub fn build(self, schema: &Schema) -> CoreResult<Arc<AssociationQuery>> {
        let association_type = Arc::clone(schema.type_def(&self.association_type)?);
        if let Some(expected) = &self.expected_type {
            schema.type_def(expected)?;
        }
        let reference_column = association_type.column(&self.reference)?;
        if !association_type.attributes()[reference_column].is_reference() {
            return Err(CoreError::type_mismatch(format!(
                "{}.{} is not a reference attribute",
                association_type.name(),
                self.reference
            )));
        }
        let opposite_column = match &*self.reference {
            SOURCE => association_type.column_opt(DEST),
            DEST => association_type.column_opt(SOURCE),
            _ => None,
        };

        let (shape, shape_column) = match self.shape {
            ShapeSpec::Set => (ContainerShape::Set, None),
            ShapeSpec::Ordered {
                attribute,
                live,
                indexed,
            } => {
                let column = association_type.column(&attribute)?;
                (
                    ContainerShape::OrderedList {
                        order_attribute: attribute,
                        live,
                        indexed,
                    },
                    Some(column),
                )
            }
            ShapeSpec::Keyed { attribute } => {
                let column = association_type.column(&attribute)?;
                (
                    ContainerShape::KeyedMap {
                        key_attribute: attribute,
                    },
                    Some(column),
                )
            }
        };

        let filters = self
            .filters
            .into_iter()
            .map(|(attribute, value)| Ok((association_type.column(&attribute)?, value)))
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(Arc::new(AssociationQuery {
            cache_key: self.cache_key,
            expected_type: self.expected_type,
            association_type,
            reference: self.reference,
            reference_column,
            opposite_column,
            shape,
            shape_column,
            filters,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revkb_codec::TRUNK;

    fn schema() -> Schema {
        Schema::new()
            .with_type(TypeDef::object("Person").value("name"))
            .unwrap()
            .with_type(TypeDef::object("Group").value("title"))
            .unwrap()
            .with_type(
                TypeDef::association("hasMember")
                    .endpoint_type(SOURCE, "Group")
                    .endpoint_type(DEST, "Person")
                    .value("order")
                    .value("role"),
            )
            .unwrap()
    }

    #[test]
    fn member_requires_reference_and_filters() {
        let schema = schema();
        let query = AssociationQuery::outgoing("editors", "hasMember")
            .filter("role", "editor")
            .build(&schema)
            .unwrap();
        let group = ObjectKey::current(TRUNK, "Group", 1);
        let person = ObjectKey::current(TRUNK, "Person", 2);
        let link = ObjectKey::current(TRUNK, "hasMember", 3);

        let values = vec![
            Value::Ref(group.clone()),
            Value::Ref(person.clone()),
            Value::Null,
            Value::from("editor"),
        ];
        assert!(query.member(&group, &link, &values).is_some());
        assert!(query.member(&person, &link, &values).is_none());

        let mut reader = values.clone();
        reader[3] = Value::from("reader");
        assert!(query.member(&group, &link, &reader).is_none());
    }

    #[test]
    fn ordered_member_carries_sort_value() {
        let schema = schema();
        let query = AssociationQuery::outgoing("members", "hasMember")
            .ordered_by("order")
            .build(&schema)
            .unwrap();
        assert_eq!(query.opposite_column(), Some(1));
        let group = ObjectKey::current(TRUNK, "Group", 1);
        let link = ObjectKey::current(TRUNK, "hasMember", 3);
        let values = vec![Value::Ref(group.clone()), Value::Null, Value::from(7), Value::Null];
        assert_eq!(query.member(&group, &link, &values).unwrap().sort, Value::from(7));
    }

    #[test]
    fn build_rejects_unknown_names() {
        let schema = schema();
        assert!(matches!(
            AssociationQuery::outgoing("x", "isFriend").build(&schema),
            Err(CoreError::UnknownType(_))
        ));
        assert!(matches!(
            AssociationQuery::outgoing("x", "hasMember")
                .keyed_by("nickname")
                .build(&schema),
            Err(CoreError::NoSuchAttribute { .. })
        ));
        assert!(matches!(
            AssociationQuery::builder("x", "hasMember", "role").build(&schema),
            Err(CoreError::TypeMismatch { .. })
        ));
    }
}
