//! Filter conditions and the OR-of-ANDs filter matrix
//!
//! A [`QueryFilter`] is the wire-safe `{ col, op, value }` triple. A
//! [`FilterMatrix`] combines filters: the outer list is OR-combined and each
//! inner list is AND-combined.
//!
//! # Example
//!
//! ```rust
//! use tenantry::query::{FilterMatrix, QueryFilter};
//!
//! // (age >= 18 AND age < 65) OR active = true
//! let matrix: FilterMatrix = vec![
//!     vec![QueryFilter::gte("age", 18), QueryFilter::lt("age", 65)],
//!     vec![QueryFilter::eq("active", true)],
//! ];
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::repository::{RepositoryError, RepositoryOperation, RepositoryResult};

/// Comparison operators accepted on the wire
///
/// Date-part operators accept both the `date_` prefixed token and the bare
/// part name (`date_year` or `year`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    /// Case-sensitive substring match
    #[serde(rename = "like")]
    Like,
    /// Case-insensitive substring match
    #[serde(rename = "ilike")]
    ILike,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "notin")]
    NotIn,
    #[serde(rename = "any")]
    Any,
    /// Ignores the value
    #[serde(rename = "isnull")]
    IsNull,
    #[serde(rename = "date_year", alias = "year")]
    DateYear,
    #[serde(rename = "date_isoyear", alias = "isoyear")]
    DateIsoYear,
    #[serde(rename = "date_month", alias = "month")]
    DateMonth,
    #[serde(rename = "date_day", alias = "day")]
    DateDay,
    #[serde(rename = "date_dow", alias = "dow")]
    DateDow,
    #[serde(rename = "date_isodow", alias = "isodow")]
    DateIsoDow,
    #[serde(rename = "date_doy", alias = "doy")]
    DateDoy,
}

impl Operator {
    /// Wire token
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Like => "like",
            Self::ILike => "ilike",
            Self::Between => "between",
            Self::In => "in",
            Self::NotIn => "notin",
            Self::Any => "any",
            Self::IsNull => "isnull",
            Self::DateYear => "date_year",
            Self::DateIsoYear => "date_isoyear",
            Self::DateMonth => "date_month",
            Self::DateDay => "date_day",
            Self::DateDow => "date_dow",
            Self::DateIsoDow => "date_isodow",
            Self::DateDoy => "date_doy",
        }
    }

    /// Operators whose value must be an array
    pub fn takes_list(&self) -> bool {
        matches!(self, Self::Between | Self::In | Self::NotIn | Self::Any)
    }

    pub fn date_part(&self) -> Option<DatePart> {
        match self {
            Self::DateYear => Some(DatePart::Year),
            Self::DateIsoYear => Some(DatePart::IsoYear),
            Self::DateMonth => Some(DatePart::Month),
            Self::DateDay => Some(DatePart::Day),
            Self::DateDow => Some(DatePart::Dow),
            Self::DateIsoDow => Some(DatePart::IsoDow),
            Self::DateDoy => Some(DatePart::Doy),
            _ => None,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Date or timestamp component extracted by the date-part operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatePart {
    Year,
    IsoYear,
    Month,
    Day,
    /// Day of week, Sunday = 0
    Dow,
    /// ISO day of week, Monday = 1 .. Sunday = 7
    IsoDow,
    /// Day of year, 1-based
    Doy,
}

impl DatePart {
    /// Field name understood by PostgreSQL `date_part`
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::IsoYear => "isoyear",
            Self::Month => "month",
            Self::Day => "day",
            Self::Dow => "dow",
            Self::IsoDow => "isodow",
            Self::Doy => "doy",
        }
    }
}

/// A single `{ col, op, value }` condition
///
/// `col` may be dotted (`group.name`) to reference a column of an included
/// relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub col: String,
    pub op: Operator,
    #[serde(default)]
    pub value: Value,
}

/// OR of AND-groups
pub type FilterMatrix = Vec<Vec<QueryFilter>>;

impl QueryFilter {
    pub fn new(col: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            col: col.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(col: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(col, Operator::Eq, value)
    }

    pub fn ne(col: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(col, Operator::Ne, value)
    }

    pub fn lt(col: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(col, Operator::Lt, value)
    }

    pub fn lte(col: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(col, Operator::Lte, value)
    }

    pub fn gt(col: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(col, Operator::Gt, value)
    }

    pub fn gte(col: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(col, Operator::Gte, value)
    }

    pub fn like(col: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(col, Operator::Like, value)
    }

    pub fn ilike(col: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(col, Operator::ILike, value)
    }

    pub fn between(col: impl Into<String>, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self::new(
            col,
            Operator::Between,
            Value::Array(vec![low.into(), high.into()]),
        )
    }

    pub fn is_in<V: Into<Value>>(col: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(
            col,
            Operator::In,
            Value::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn not_in<V: Into<Value>>(
        col: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(
            col,
            Operator::NotIn,
            Value::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn is_null(col: impl Into<String>) -> Self {
        Self::new(col, Operator::IsNull, Value::Null)
    }

    /// Check the value shape against the operator
    ///
    /// `between` needs exactly two elements, the other list operators any
    /// array, and every remaining operator except `isnull` a scalar.
    pub fn validate(&self) -> RepositoryResult<()> {
        if self.col.trim().is_empty() {
            return Err(self.invalid("column name is empty"));
        }
        if self.col.split('.').any(str::is_empty) {
            return Err(self.invalid("column path has an empty segment"));
        }
        match (&self.op, &self.value) {
            (Operator::IsNull, _) => Ok(()),
            (Operator::Between, Value::Array(items)) if items.len() == 2 => Ok(()),
            (Operator::Between, _) => Err(self.invalid("between expects a two-element array")),
            (op, Value::Array(_)) if op.takes_list() => Ok(()),
            (op, _) if op.takes_list() => Err(self.invalid("expects an array value")),
            (_, Value::Array(_) | Value::Object(_)) => Err(self.invalid("expects a scalar value")),
            _ => Ok(()),
        }
    }

    fn invalid(&self, reason: &str) -> RepositoryError {
        RepositoryError::configuration(
            RepositoryOperation::Parse,
            format!("filter `{} {}`: {}", self.col, self.op, reason),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_wire_tokens() {
        let ops: Vec<Operator> =
            serde_json::from_str(r#"["=","!=","<","<=",">",">=","like","ilike","between","in","notin","any","isnull"]"#)
                .unwrap();
        assert_eq!(ops.len(), 13);
        for op in ops {
            assert_eq!(serde_json::to_value(op).unwrap(), json!(op.as_str()));
        }
    }

    #[test]
    fn test_date_part_aliases() {
        let prefixed: Operator = serde_json::from_str(r#""date_isodow""#).unwrap();
        let bare: Operator = serde_json::from_str(r#""isodow""#).unwrap();
        assert_eq!(prefixed, Operator::DateIsoDow);
        assert_eq!(bare, Operator::DateIsoDow);
        assert_eq!(bare.date_part(), Some(DatePart::IsoDow));
        assert_eq!(DatePart::IsoYear.as_sql(), "isoyear");
    }

    #[test]
    fn test_unknown_operator_is_rejected() {
        let result = serde_json::from_str::<QueryFilter>(r#"{"col":"name","op":"~~","value":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_value_defaults_to_null() {
        let filter: QueryFilter = serde_json::from_str(r#"{"col":"deleted_at","op":"isnull"}"#).unwrap();
        assert_eq!(filter.value, Value::Null);
        assert!(filter.validate().is_ok());
    }

    #[test]
    fn test_validate_value_shapes() {
        assert!(QueryFilter::between("age", 18, 65).validate().is_ok());
        assert!(QueryFilter::new("age", Operator::Between, json!([1])).validate().is_err());
        assert!(QueryFilter::is_in("id", ["a", "b"]).validate().is_ok());
        assert!(QueryFilter::new("id", Operator::In, "a").validate().is_err());
        assert!(QueryFilter::new("name", Operator::Eq, json!(["a"])).validate().is_err());
        assert!(QueryFilter::eq("", "x").validate().is_err());
        assert!(QueryFilter::eq("group..name", "x").validate().is_err());
    }
}
