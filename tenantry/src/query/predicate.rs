//! Engine-neutral predicate tree
//!
//! [`Predicate`] is what the where-clause compiler produces and what stores
//! consume. Callers may also build predicates directly (see
//! `Repository::find_by`), bypassing the filter matrix.

use serde::Serialize;
use serde_json::Value;

use super::filter::DatePart;

/// A column, optionally qualified by an include path
///
/// `group.license.name` parses to path `group.license` and column `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ColumnRef {
    pub path: Option<String>,
    pub name: String,
}

impl ColumnRef {
    /// Split on the last `.`
    pub fn parse(reference: &str) -> Self {
        match reference.rsplit_once('.') {
            Some((path, name)) => Self {
                path: Some(path.to_string()),
                name: name.to_string(),
            },
            None => Self::root(reference),
        }
    }

    /// A column of the queried model itself
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            path: None,
            name: name.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.path.is_none()
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}.{}", path, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One condition on a column
///
/// Comparisons against `null` follow SQL `IS [NOT] NULL` semantics for
/// `Eq`/`Ne` and are false for ordering operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Constraint {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    /// Case-sensitive `LIKE` pattern, wildcards already applied
    Like(String),
    /// Case-insensitive `ILIKE` pattern, wildcards already applied
    #[serde(rename = "ilike")]
    ILike(String),
    Between(Value, Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Any(Vec<Value>),
    IsNull,
    DatePart { part: DatePart, value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every row
    All,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Every constraint must hold for the column
    Column {
        column: ColumnRef,
        constraints: Vec<Constraint>,
    },
}

impl Predicate {
    pub fn column(column: ColumnRef, constraint: Constraint) -> Self {
        Self::Column {
            column,
            constraints: vec![constraint],
        }
    }

    /// Root-column equality, the shape used for identifier lookups
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::column(ColumnRef::root(column), Constraint::Eq(value.into()))
    }

    /// Root-column set membership
    pub fn is_in(column: &str, values: Vec<Value>) -> Self {
        Self::column(ColumnRef::root(column), Constraint::In(values))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Conjunction that drops `All` and flattens nested `And`s
    #[must_use]
    pub fn and(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Self::All, p) | (p, Self::All) => p,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), p) => {
                left.push(p);
                Self::And(left)
            }
            (p, Self::And(mut right)) => {
                right.insert(0, p);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }

    /// Every column referenced, in tree order
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a ColumnRef>) {
        match self {
            Self::All => {}
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.collect_columns(out);
                }
            }
            Self::Column { column, .. } => out.push(column),
        }
    }
}
