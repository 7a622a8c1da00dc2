//! Static model descriptors and the entity/row mapping
//!
//! Every persisted type declares a [`Model`]: its table, columns, primary key,
//! soft-delete and tenancy settings, and the relations that include paths may
//! name. Descriptors are plain `static` items, read-only after startup.
//!
//! Entities move to and from the store as JSON objects ([`Row`]) through
//! explicit serde mapping. Relations are owned value fields on the entity
//! (`Option<Group>`, `Option<Vec<Phone>>`) and are stripped from rows before
//! they are written.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;

use crate::repository::{RepositoryError, RepositoryOperation, RepositoryResult};

/// A row as exchanged with the store: column name to JSON value
pub type Row = serde_json::Map<String, Value>;

/// Column written on insert when the model keeps timestamps
pub const CREATED_AT: &str = "created_at";
/// Column written on every insert and update when the model keeps timestamps
pub const UPDATED_AT: &str = "updated_at";
/// Soft-delete marker for paranoid models
pub const DELETED_AT: &str = "deleted_at";

/// Current time as stored in timestamp columns (RFC 3339, microseconds, UTC)
pub fn timestamp_now() -> Value {
    Value::String(
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
    )
}

/// Storage type of a column, used to cast bound values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Uuid,
    Text,
    Bool,
    Int,
    BigInt,
    Float,
    Numeric,
    Timestamp,
    Date,
    Json,
}

impl ColumnType {
    /// PostgreSQL type name used in `CAST($n AS ...)`
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::Text => "text",
            Self::Bool => "boolean",
            Self::Int => "integer",
            Self::BigInt => "bigint",
            Self::Float => "double precision",
            Self::Numeric => "numeric",
            Self::Timestamp => "timestamptz",
            Self::Date => "date",
            Self::Json => "jsonb",
        }
    }
}

/// A declared column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

impl Column {
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self { name, ty }
    }
}

/// How a relation joins its target to the declaring model
#[derive(Debug, Clone, Copy)]
pub enum RelationKind {
    /// The declaring model holds `foreign_key` pointing at the target's primary key
    BelongsTo { foreign_key: &'static str },
    /// The target holds `foreign_key` pointing at the declaring model; at most one row
    HasOne { foreign_key: &'static str },
    /// The target holds `foreign_key` pointing at the declaring model
    HasMany { foreign_key: &'static str },
    /// Rows are linked through a pivot model
    BelongsToMany {
        through: &'static Model,
        /// Pivot column referencing the declaring model
        source_key: &'static str,
        /// Pivot column referencing the target model
        target_key: &'static str,
    },
}

impl RelationKind {
    /// Whether the hydrated value is a list rather than a single object
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::HasMany { .. } | Self::BelongsToMany { .. })
    }
}

/// A named relation that include paths resolve against
#[derive(Clone, Copy)]
pub struct Relation {
    pub name: &'static str,
    pub target: &'static Model,
    pub kind: RelationKind,
    /// Relations of the target reachable one level further down
    pub nested: &'static [Relation],
}

impl Relation {
    pub fn nested_relation(&self, name: &str) -> Option<&'static Relation> {
        self.nested.iter().find(|r| r.name == name)
    }
}

// Models reference each other through relations; print names only.
impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("name", &self.name)
            .field("target", &self.target.name)
            .field("nested", &self.nested.iter().map(|r| r.name).collect::<Vec<_>>())
            .finish()
    }
}

/// Static description of a persisted type
#[derive(Debug)]
pub struct Model {
    /// Entity name used in diagnostics
    pub name: &'static str,
    pub table: &'static str,
    pub primary_key: &'static str,
    pub columns: &'static [Column],
    pub relations: &'static [Relation],
    /// Column sets that must be unique, besides the primary key
    pub unique_keys: &'static [&'static [&'static str]],
    /// Soft delete through `deleted_at` instead of removing rows
    pub paranoid: bool,
    /// Maintain `created_at` / `updated_at`
    pub timestamps: bool,
    /// Column holding the tenant (license) id, when rows are tenant-scoped
    pub tenant_column: Option<&'static str>,
}

impl Model {
    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn relation(&self, name: &str) -> Option<&'static Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.to_string()).collect()
    }

    /// Type of the primary key column, `Uuid` when undeclared
    pub fn primary_key_type(&self) -> ColumnType {
        self.column(self.primary_key)
            .map(|c| c.ty)
            .unwrap_or(ColumnType::Uuid)
    }

    /// Reduce a serialized entity to the columns this model stores.
    ///
    /// A `BelongsTo` relation field holding an object with an identifier fills
    /// the relation's foreign key when that key is absent or null.
    pub fn writable_row(&self, mut row: Row) -> Row {
        for relation in self.relations {
            if let RelationKind::BelongsTo { foreign_key } = relation.kind {
                let nested_id = row
                    .get(relation.name)
                    .and_then(Value::as_object)
                    .and_then(|obj| obj.get(relation.target.primary_key))
                    .filter(|id| !id.is_null())
                    .cloned();
                let missing = row.get(foreign_key).map_or(true, Value::is_null);
                if let (Some(id), true) = (nested_id, missing) {
                    row.insert(foreign_key.to_string(), id);
                }
            }
        }
        row.retain(|key, _| self.has_column(key));
        row
    }
}

/// A persisted record type bound to a static [`Model`]
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Group {
///     id: Option<Uuid>,
///     license_id: Option<Uuid>,
///     name: String,
/// }
///
/// impl Entity for Group {
///     fn model() -> &'static Model {
///         &GROUP
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn model() -> &'static Model;

    /// Serialize into a row, relations included
    fn to_row(&self) -> RepositoryResult<Row> {
        match serde_json::to_value(self) {
            Ok(Value::Object(row)) => Ok(row),
            Ok(other) => Err(RepositoryError::serialization_error(
                RepositoryOperation::Create,
                format!("{} must serialize to an object, got {}", Self::model().name, other),
            )),
            Err(e) => Err(RepositoryError::serialization_error(
                RepositoryOperation::Create,
                e.to_string(),
            )),
        }
    }

    /// Rebuild an entity from a (possibly hydrated) row
    fn from_row(row: Row) -> RepositoryResult<Self> {
        serde_json::from_value(Value::Object(row)).map_err(|e| {
            RepositoryError::serialization_error(
                RepositoryOperation::Query,
                format!("Failed to map {} row: {}", Self::model().name, e),
            )
        })
    }

    /// The primary key value, `None` when unset
    fn identifier(&self) -> RepositoryResult<Option<Value>> {
        let row = self.to_row()?;
        Ok(row
            .get(Self::model().primary_key)
            .filter(|v| !v.is_null())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Register, GROUP, REGISTER};
    use serde_json::json;

    #[test]
    fn test_model_lookups() {
        assert!(REGISTER.has_column("name"));
        assert!(!REGISTER.has_column("phones"));
        assert_eq!(REGISTER.relation("group").map(|r| r.target.table), Some("groups"));
        assert!(REGISTER.relation("unknown").is_none());
        assert_eq!(REGISTER.primary_key_type(), ColumnType::Uuid);
    }

    #[test]
    fn test_writable_row_strips_relations_and_sets_foreign_key() {
        let group_id = "0190f0c4-0000-7000-8000-000000000001";
        let row = json!({
            "id": null,
            "name": "Ada",
            "group_id": null,
            "group": { "id": group_id, "name": "Admins" },
            "phones": [{ "number": "555" }]
        });
        let Value::Object(row) = row else { unreachable!() };

        let written = REGISTER.writable_row(row);
        assert_eq!(written.get("group_id"), Some(&json!(group_id)));
        assert!(!written.contains_key("group"));
        assert!(!written.contains_key("phones"));
        assert_eq!(written.get("name"), Some(&json!("Ada")));
    }

    #[test]
    fn test_writable_row_keeps_explicit_foreign_key() {
        let Value::Object(row) = json!({
            "group_id": "explicit",
            "group": { "id": "nested" }
        }) else {
            unreachable!()
        };
        let written = REGISTER.writable_row(row);
        assert_eq!(written.get("group_id"), Some(&json!("explicit")));
    }

    #[test]
    fn test_entity_identifier() {
        let register = Register::named("Ada");
        assert_eq!(register.identifier().unwrap(), None);

        let id = uuid::Uuid::now_v7();
        let register = Register {
            id: Some(id),
            ..Register::named("Ada")
        };
        assert_eq!(register.identifier().unwrap(), Some(json!(id)));
    }

    #[test]
    fn test_relation_debug_prints_target_name() {
        let relation = GROUP.relation("registers").unwrap();
        let debug = format!("{:?}", relation);
        assert!(debug.contains("Register"));
    }
}
