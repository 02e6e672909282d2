//! Type repository.
//!
//! Types are registered when a knowledge base is opened and never change
//! afterwards. Each type maps to one storage table; its declared attributes
//! are the table's value columns in declaration order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use revkb_codec::{ObjectKey, Value};

use crate::error::{CoreError, CoreResult};

/// Reference attribute of an association pointing at its source.
pub const SOURCE: &str = "source";

/// Reference attribute of an association pointing at its destination.
pub const DEST: &str = "dest";

/// Kind of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Plain object type.
    Object,
    /// Link type with `source` and `dest` references.
    Association,
}

/// Kind of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    /// Plain value column.
    Value,
    /// Reference to another object, optionally restricted to one type.
    Reference {
        /// Required type of the referenced object.
        target: Option<Arc<str>>,
    },
}

/// One declared attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDef {
    /// Attribute name.
    pub name: Arc<str>,
    /// Value or reference.
    pub kind: AttributeKind,
    /// Whether committed objects must have a non-null value.
    pub mandatory: bool,
}

impl AttributeDef {
    /// Returns true for reference attributes.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, AttributeKind::Reference { .. })
    }
}

/// Where an attribute lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeSlot {
    /// A declared column.
    Column(usize),
    /// A dynamic attribute of a flex type.
    Flex,
}

/// A registered type.
#[derive(Debug)]
pub struct TypeDef {
    name: Arc<str>,
    kind: TypeKind,
    attributes: Vec<AttributeDef>,
    columns: HashMap<Arc<str>, usize>,
    flex: bool,
    immutable: bool,
}

impl TypeDef {
    /// Starts a plain object type.
    pub fn object(name: impl Into<Arc<str>>) -> TypeBuilder {
        TypeBuilder::new(name.into(), TypeKind::Object)
    }

    /// Starts an association type; `source` and `dest` are pre-declared.
    pub fn association(name: impl Into<Arc<str>>) -> TypeBuilder {
        TypeBuilder::new(name.into(), TypeKind::Association)
            .mandatory_reference(SOURCE, None)
            .mandatory_reference(DEST, None)
    }

    /// Type name.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Object or association.
    #[must_use]
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Returns true for association types.
    #[must_use]
    pub fn is_association(&self) -> bool {
        self.kind == TypeKind::Association
    }

    /// Whether undeclared attributes are stored as flex data.
    #[must_use]
    pub fn is_flex(&self) -> bool {
        self.flex
    }

    /// Whether current objects of this type reject writes.
    #[must_use]
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Declared attributes in column order.
    #[must_use]
    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    /// Number of columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.attributes.len()
    }

    /// Column index of a declared attribute.
    #[must_use]
    pub fn column_opt(&self, attribute: &str) -> Option<usize> {
        self.columns.get(attribute).copied()
    }

    /// Column index of a declared attribute.
    ///
    /// # Errors
    ///
    /// Fails with `NoSuchAttribute` if the attribute is not declared.
    pub fn column(&self, attribute: &str) -> CoreResult<usize> {
        self.column_opt(attribute)
            .ok_or_else(|| CoreError::no_such_attribute(&self.name, attribute))
    }

    /// Declared attribute by name.
    #[must_use]
    pub fn attribute(&self, attribute: &str) -> Option<&AttributeDef> {
        self.column_opt(attribute).map(|i| &self.attributes[i])
    }

    /// Locates an attribute: a declared column, or flex data for flex types.
    ///
    /// # Errors
    ///
    /// Fails with `NoSuchAttribute` for undeclared attributes of non-flex
    /// types.
    pub fn resolve(&self, attribute: &str) -> CoreResult<AttributeSlot> {
        match self.column_opt(attribute) {
            Some(column) => Ok(AttributeSlot::Column(column)),
            None if self.flex => Ok(AttributeSlot::Flex),
            None => Err(CoreError::no_such_attribute(&self.name, attribute)),
        }
    }

    /// Reference columns with their definitions.
    pub fn reference_columns(&self) -> impl Iterator<Item = (usize, &AttributeDef)> {
        self.attributes
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_reference())
    }

    /// Column array with every attribute unset.
    #[must_use]
    pub fn empty_values(&self) -> Vec<Value> {
        vec![Value::Null; self.width()]
    }

    /// Checks that `value` may be stored in `column` of an object of
    /// `owner`.
    ///
    /// # Errors
    ///
    /// Fails with `TypeMismatch` if a reference column receives a non-key,
    /// a historic key, a key of another branch or a key of the wrong type.
    pub fn check_value(&self, owner: &ObjectKey, column: usize, value: &Value) -> CoreResult<()> {
        let def = &self.attributes[column];
        let AttributeKind::Reference { target } = &def.kind else {
            if matches!(value, Value::Ref(_)) {
                return Err(CoreError::type_mismatch(format!(
                    "{}.{} is not a reference attribute",
                    self.name, def.name
                )));
            }
            return Ok(());
        };
        let key = match value {
            Value::Null => return Ok(()),
            Value::Ref(key) => key,
            other => {
                return Err(CoreError::type_mismatch(format!(
                    "{}.{} expects a reference, got {}",
                    self.name,
                    def.name,
                    other.kind()
                )))
            }
        };
        if !key.is_current() {
            return Err(CoreError::type_mismatch(format!(
                "{}.{} cannot store historic key {key}",
                self.name, def.name
            )));
        }
        if key.branch != owner.branch {
            return Err(CoreError::type_mismatch(format!(
                "{}.{} cannot reference {key} from branch {}",
                self.name, def.name, owner.branch
            )));
        }
        if let Some(target) = target {
            if key.type_name != *target {
                return Err(CoreError::type_mismatch(format!(
                    "{}.{} expects {target}, got {}",
                    self.name, def.name, key.type_name
                )));
            }
        }
        Ok(())
    }

    /// Names of mandatory attributes that are null in `values`.
    #[must_use]
    pub fn missing_mandatory(&self, values: &[Value]) -> Vec<Arc<str>> {
        self.attributes
            .iter()
            .enumerate()
            .filter(|(i, a)| a.mandatory && values.get(*i).map_or(true, Value::is_null))
            .map(|(_, a)| Arc::clone(&a.name))
            .collect()
    }
}

/// Builder for [`TypeDef`].
#[derive(Debug)]
pub struct TypeBuilder {
    name: Arc<str>,
    kind: TypeKind,
    attributes: Vec<AttributeDef>,
    flex: bool,
    immutable: bool,
}

impl TypeBuilder {
    fn new(name: Arc<str>, kind: TypeKind) -> Self {
        Self {
            name,
            kind,
            attributes: Vec::new(),
            flex: false,
            immutable: false,
        }
    }

    fn push(mut self, name: &str, kind: AttributeKind, mandatory: bool) -> Self {
        self.attributes.push(AttributeDef {
            name: name.into(),
            kind,
            mandatory,
        });
        self
    }

    /// Declares an optional value attribute.
    #[must_use]
    pub fn value(self, name: &str) -> Self {
        self.push(name, AttributeKind::Value, false)
    }

    /// Declares a mandatory value attribute.
    #[must_use]
    pub fn mandatory_value(self, name: &str) -> Self {
        self.push(name, AttributeKind::Value, true)
    }

    /// Declares an optional reference attribute.
    #[must_use]
    pub fn reference(self, name: &str, target: Option<&str>) -> Self {
        let target = target.map(Arc::from);
        self.push(name, AttributeKind::Reference { target }, false)
    }

    /// Declares a mandatory reference attribute.
    #[must_use]
    pub fn mandatory_reference(self, name: &str, target: Option<&str>) -> Self {
        let target = target.map(Arc::from);
        self.push(name, AttributeKind::Reference { target }, true)
    }

    /// Restricts the `source` or `dest` reference of an association.
    #[must_use]
    pub fn endpoint_type(mut self, reference: &str, target: &str) -> Self {
        if let Some(def) = self.attributes.iter_mut().find(|a| &*a.name == reference) {
            if def.is_reference() {
                def.kind = AttributeKind::Reference {
                    target: Some(target.into()),
                };
            }
        }
        self
    }

    /// Allows undeclared attributes.
    #[must_use]
    pub const fn flex(mut self, value: bool) -> Self {
        self.flex = value;
        self
    }

    /// Rejects writes on current objects.
    #[must_use]
    pub const fn immutable(mut self, value: bool) -> Self {
        self.immutable = value;
        self
    }

    /// Finishes the type.
    ///
    /// # Errors
    ///
    /// Fails if an attribute name is declared twice.
    pub fn build(self) -> CoreResult<TypeDef> {
        let mut columns = HashMap::with_capacity(self.attributes.len());
        for (i, attribute) in self.attributes.iter().enumerate() {
            if columns.insert(Arc::clone(&attribute.name), i).is_some() {
                return Err(CoreError::invalid_operation(format!(
                    "attribute {} declared twice on {}",
                    attribute.name, self.name
                )));
            }
        }
        Ok(TypeDef {
            name: self.name,
            kind: self.kind,
            attributes: self.attributes,
            columns,
            flex: self.flex,
            immutable: self.immutable,
        })
    }
}

/// The set of registered types.
#[derive(Debug, Default)]
pub struct Schema {
    types: BTreeMap<Arc<str>, Arc<TypeDef>>,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a type.
    ///
    /// # Errors
    ///
    /// Fails if the type cannot be built or its name is taken.
    pub fn with_type(mut self, builder: TypeBuilder) -> CoreResult<Self> {
        let def = builder.build()?;
        let name = Arc::clone(def.name());
        if self.types.contains_key(&name) {
            return Err(CoreError::invalid_operation(format!(
                "type {name} registered twice"
            )));
        }
        self.types.insert(name, Arc::new(def));
        Ok(self)
    }

    /// Looks up a type.
    ///
    /// # Errors
    ///
    /// Fails with `UnknownType` if it is not registered.
    pub fn type_def(&self, name: &str) -> CoreResult<&Arc<TypeDef>> {
        self.types
            .get(name)
            .ok_or_else(|| CoreError::UnknownType(name.to_string()))
    }

    /// All types by name.
    pub fn types(&self) -> impl Iterator<Item = &Arc<TypeDef>> {
        self.types.values()
    }

    /// Names of all types; these are also the storage table names.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.types.keys().map(ToString::to_string).collect()
    }
}
