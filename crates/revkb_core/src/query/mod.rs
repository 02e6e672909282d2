//! Compiled searches and their caches.
//!
//! Compiling search expressions is not this crate's business. Whatever
//! compiles them hands over a [`CompiledQuery`]: something that can run the
//! search against storage at a revision, and that can decide for a single
//! row of column values whether it matches. The second half is what lets a
//! [`QueryCache`] follow local edits and commits without searching again.
//!
//! [`SimpleQuery`] is a ready-made conjunction of column tests.

mod cache;

use std::fmt;
use std::sync::Arc;

use revkb_codec::{BranchId, ObjectKey, RevisionNumber, Value};
use revkb_storage::{ColumnFilter, StorageBackend};

use crate::error::{CoreError, CoreResult};
use crate::schema::{Schema, TypeDef};

pub use cache::QueryCache;

/// Where a search runs.
#[derive(Debug, Clone, Copy)]
pub struct SearchScope<'a> {
    /// Row storage.
    pub backend: &'a dyn StorageBackend,
    /// Registered types.
    pub schema: &'a Schema,
    /// Branch to search.
    pub branch: BranchId,
    /// Revision to search at.
    pub revision: RevisionNumber,
}

/// An executable search over one result type.
pub trait CompiledQuery: Send + Sync + fmt::Debug {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Type of every result.
    fn result_type(&self) -> &str;

    /// Keys of all matching objects alive in `scope`, in key order.
    ///
    /// # Errors
    ///
    /// Fails on storage errors or unusable arguments.
    fn search(&self, scope: &SearchScope<'_>, args: &[Value]) -> CoreResult<Vec<ObjectKey>>;

    /// Whether an object of the result type with column `values` matches.
    ///
    /// Must agree with [`Self::search`] for every row.
    ///
    /// # Errors
    ///
    /// Fails on unusable arguments.
    fn matches(&self, type_def: &TypeDef, values: &[Value], args: &[Value]) -> CoreResult<bool>;
}

/// A test value: fixed, or taken from the search arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Fixed value.
    Literal(Value),
    /// Argument at this position.
    Param(usize),
}

impl Operand {
    fn value<'a>(&'a self, args: &'a [Value]) -> CoreResult<&'a Value> {
        match self {
            Self::Literal(value) => Ok(value),
            Self::Param(index) => args.get(*index).ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "query parameter {index} missing, {} given",
                    args.len()
                ))
            }),
        }
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Test {
    Equals(Operand),
    NotNull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Condition {
    column: usize,
    test: Test,
}

/// Conjunction of column tests over one type.
#[derive(Debug, Clone)]
pub struct SimpleQuery {
    name: String,
    result_type: Arc<str>,
    conditions: Vec<Condition>,
}

impl SimpleQuery {
    /// Starts a query over `result_type`.
    pub fn builder(name: impl Into<String>, result_type: impl Into<Arc<str>>) -> SimpleQueryBuilder {
        SimpleQueryBuilder {
            name: name.into(),
            result_type: result_type.into(),
            tests: Vec::new(),
        }
    }

    fn filters(&self, args: &[Value]) -> CoreResult<Vec<ColumnFilter>> {
        self.conditions
            .iter()
            .filter_map(|condition| match &condition.test {
                Test::Equals(operand) => Some(
                    operand
                        .value(args)
                        .map(|value| ColumnFilter::new(condition.column, value.clone())),
                ),
                Test::NotNull => None,
            })
            .collect()
    }
}

impl CompiledQuery for SimpleQuery {
    fn name(&self) -> &str {
        &self.name
    }

    fn result_type(&self) -> &str {
        &self.result_type
    }

    fn search(&self, scope: &SearchScope<'_>, args: &[Value]) -> CoreResult<Vec<ObjectKey>> {
        let type_def = scope.schema.type_def(&self.result_type)?;
        let rows = scope.backend.scan(
            &self.result_type,
            scope.branch,
            scope.revision,
            &self.filters(args)?,
        )?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            if self.matches(type_def, &row.values, args)? {
                keys.push(ObjectKey::current(scope.branch, Arc::clone(&self.result_type), row.id));
            }
        }
        Ok(keys)
    }

    fn matches(&self, type_def: &TypeDef, values: &[Value], args: &[Value]) -> CoreResult<bool> {
        if **type_def.name() != *self.result_type {
            return Ok(false);
        }
        for condition in &self.conditions {
            let value = values.get(condition.column);
            let passes = match &condition.test {
                Test::Equals(operand) => {
                    let expected = operand.value(args)?;
                    value.map_or(expected.is_null(), |value| value == expected)
                }
                Test::NotNull => value.is_some_and(|value| !value.is_null()),
            };
            if !passes {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Builder for [`SimpleQuery`].
#[derive(Debug)]
pub struct SimpleQueryBuilder {
    name: String,
    result_type: Arc<str>,
    tests: Vec<(String, Test)>,
}

impl SimpleQueryBuilder {
    /// Requires `attribute == operand`.
    #[must_use]
    pub fn equals(mut self, attribute: impl Into<String>, operand: impl Into<Operand>) -> Self {
        self.tests.push((attribute.into(), Test::Equals(operand.into())));
        self
    }

    /// Requires `attribute` to be set.
    #[must_use]
    pub fn not_null(mut self, attribute: impl Into<String>) -> Self {
        self.tests.push((attribute.into(), Test::NotNull));
        self
    }

    /// Resolves attribute names against `schema`.
    ///
    /// # Errors
    ///
    /// `UnknownType`, or `NoSuchAttribute` for attributes that are not
    /// declared columns.
    pub fn build(self, schema: &Schema) -> CoreResult<Arc<SimpleQuery>> {
        let type_def = schema.type_def(&self.result_type)?;
        let conditions = self
            .tests
            .into_iter()
            .map(|(attribute, test)| {
                let column = type_def.column(&attribute)?;
                Ok(Condition { column, test })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Arc::new(SimpleQuery {
            name: self.name,
            result_type: Arc::clone(type_def.name()),
            conditions,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revkb_codec::TRUNK;
    use revkb_storage::{CommitBatch, InMemoryBackend, RevisionRow, RowChange};

    fn schema() -> Schema {
        Schema::new()
            .with_type(TypeDef::object("Person").value("name").value("city"))
            .unwrap()
    }

    fn backend() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        let people = [("ada", "paris"), ("bob", "rome"), ("cy", "paris")];
        backend
            .commit(CommitBatch {
                revision: RevisionRow {
                    number: 1,
                    author: "test".into(),
                    date_millis: 0,
                    log: String::new(),
                },
                base: None,
                changes: people
                    .iter()
                    .enumerate()
                    .map(|(i, (name, city))| RowChange::Create {
                        table: "Person".into(),
                        branch: TRUNK,
                        id: i as u64 + 1,
                        values: vec![Value::from(*name), Value::from(*city)],
                    })
                    .collect(),
            })
            .unwrap();
        backend
    }

    #[test]
    fn search_and_matches_agree() {
        let schema = schema();
        let backend = backend();
        let query = SimpleQuery::builder("by_city", "Person")
            .equals("city", Operand::Param(0))
            .build(&schema)
            .unwrap();
        let scope = SearchScope {
            backend: &backend,
            schema: &schema,
            branch: TRUNK,
            revision: 1,
        };
        let args = [Value::from("paris")];
        let keys = query.search(&scope, &args).unwrap();
        assert_eq!(
            keys,
            vec![
                ObjectKey::current(TRUNK, "Person", 1),
                ObjectKey::current(TRUNK, "Person", 3)
            ]
        );

        let person = schema.type_def("Person").unwrap();
        assert!(query
            .matches(person, &[Value::from("x"), Value::from("paris")], &args)
            .unwrap());
        assert!(!query
            .matches(person, &[Value::from("x"), Value::from("rome")], &args)
            .unwrap());
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let schema = schema();
        let query = SimpleQuery::builder("by_city", "Person")
            .equals("city", Operand::Param(1))
            .build(&schema)
            .unwrap();
        let person = schema.type_def("Person").unwrap();
        let err = query
            .matches(person, &[Value::Null, Value::Null], &[Value::from("paris")])
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let err = SimpleQuery::builder("q", "Person")
            .not_null("age")
            .build(&schema())
            .unwrap_err();
        assert!(matches!(err, CoreError::NoSuchAttribute { .. }));
    }
}
