//! Query-string wire format
//!
//! Every field travels as its own URL parameter whose value is a JSON
//! document, decoded independently of the others:
//!
//! ```text
//! select=["name","id"]&include={"group":{"required":true}}&sort={"name":"ASC"}
//! &where=[[{"col":"name","op":"=","value":"X"}]]&page=1&limit=10&includeDeleted=false
//! ```
//!
//! `page` and `limit` are plain numbers and `includeDeleted` a boolean
//! (`true`/`false`/`1`/`0`). Unknown parameters are ignored.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::filter::FilterMatrix;
use super::options::{CountOptions, QueryOptions};
use crate::repository::{RepositoryError, RepositoryOperation, RepositoryResult};

impl QueryOptions {
    /// Decode options from a URL-encoded query string
    ///
    /// # Example
    ///
    /// ```rust
    /// use tenantry::query::QueryOptions;
    ///
    /// let options = QueryOptions::from_query_string("limit=10&page=3").unwrap();
    /// assert_eq!(options.pagination().unwrap().offset, 20);
    /// ```
    pub fn from_query_string(query: &str) -> RepositoryResult<Self> {
        let mut options = Self::default();
        for (key, value) in pairs(query)? {
            match key.as_str() {
                "select" => options.select = field(&key, &value)?,
                "include" => options.include = field(&key, &value)?,
                "where" => options.filter = filter_field(&key, &value)?,
                "sort" => options.sort = field(&key, &value)?,
                "page" => options.page = Some(number(&key, &value)?),
                "limit" => options.limit = Some(number(&key, &value)?),
                "includeDeleted" => options.include_deleted = flag(&key, &value)?,
                other => tracing::debug!(parameter = other, "ignoring unknown query parameter"),
            }
        }
        Ok(options)
    }

    /// Encode back to the per-field JSON query string
    ///
    /// Empty fields are omitted.
    pub fn to_query_string(&self) -> RepositoryResult<String> {
        let mut out: Vec<(&str, String)> = Vec::new();
        if !self.select.is_empty() {
            out.push(("select", encode(&self.select)?));
        }
        if !self.include.is_empty() {
            out.push(("include", encode(&self.include)?));
        }
        if !self.filter.is_empty() {
            out.push(("where", encode(&self.filter)?));
        }
        if !self.sort.is_empty() {
            out.push(("sort", encode(&self.sort)?));
        }
        if let Some(page) = self.page {
            out.push(("page", page.to_string()));
        }
        if let Some(limit) = self.limit {
            out.push(("limit", limit.to_string()));
        }
        if self.include_deleted {
            out.push(("includeDeleted", "true".to_string()));
        }
        serde_urlencoded::to_string(out).map_err(|e| {
            RepositoryError::serialization_error(RepositoryOperation::Parse, e.to_string())
        })
    }
}

impl CountOptions {
    /// Decode count options from a URL-encoded query string
    pub fn from_query_string(query: &str) -> RepositoryResult<Self> {
        let mut options = Self::default();
        for (key, value) in pairs(query)? {
            match key.as_str() {
                "include" => options.include = field(&key, &value)?,
                "where" => options.filter = filter_field(&key, &value)?,
                "includeDeleted" => options.include_deleted = flag(&key, &value)?,
                "distinct" => options.distinct = flag(&key, &value)?,
                "col" => options.col = Some(text(&key, &value)?),
                "group" => options.group = field(&key, &value)?,
                other => tracing::debug!(parameter = other, "ignoring unknown query parameter"),
            }
        }
        Ok(options)
    }
}

fn pairs(query: &str) -> RepositoryResult<Vec<(String, String)>> {
    let query = query.strip_prefix('?').unwrap_or(query);
    serde_urlencoded::from_str(query).map_err(|e| {
        RepositoryError::configuration(
            RepositoryOperation::Parse,
            format!("malformed query string: {}", e),
        )
    })
}

fn field<T: DeserializeOwned>(key: &str, value: &str) -> RepositoryResult<T> {
    serde_json::from_str(value).map_err(|e| invalid(key, e))
}

fn filter_field(key: &str, value: &str) -> RepositoryResult<FilterMatrix> {
    let matrix: FilterMatrix = field(key, value)?;
    for filter in matrix.iter().flatten() {
        filter.validate()?;
    }
    Ok(matrix)
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> RepositoryResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .trim_matches('"')
        .parse()
        .map_err(|e| invalid(key, e))
}

fn flag(key: &str, value: &str) -> RepositoryResult<bool> {
    match value.trim().trim_matches('"') {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(invalid(key, format!("expected a boolean, got `{}`", other))),
    }
}

/// Bare text or a JSON string
fn text(key: &str, value: &str) -> RepositoryResult<String> {
    if value.trim_start().starts_with('"') {
        field(key, value)
    } else {
        Ok(value.to_string())
    }
}

fn encode<T: Serialize>(value: &T) -> RepositoryResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn invalid(key: &str, reason: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::configuration(
        RepositoryOperation::Parse,
        format!("query parameter `{}` is invalid: {}", key, reason),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{IncludeEntry, OrderDirection, Pagination, QueryFilter};
    use crate::repository::RepositoryErrorKind;

    fn encoded(pairs: &[(&str, &str)]) -> String {
        serde_urlencoded::to_string(pairs).unwrap()
    }

    #[test]
    fn test_parse_full_wire_shape() {
        let query = encoded(&[
            ("select", r#"["name","id"]"#),
            ("include", r#"{"group":{"required":true}}"#),
            ("sort", r#"{"name":"ASC","id":"DESC"}"#),
            ("where", r#"[[{"col":"name","op":"=","value":"X"}],[{"col":"active","op":"=","value":true}]]"#),
            ("page", "1"),
            ("limit", "10"),
            ("includeDeleted", "false"),
        ]);

        let options = QueryOptions::from_query_string(&query).unwrap();
        assert_eq!(options.select, vec!["name", "id"]);
        assert_eq!(options.include.entries(), &[IncludeEntry::required("group")]);
        assert_eq!(options.sort.0[1], ("id".to_string(), OrderDirection::Descending));
        assert_eq!(options.filter.len(), 2);
        assert_eq!(options.filter[1][0], QueryFilter::eq("active", true));
        assert_eq!(options.pagination(), Some(Pagination::new(0, 10)));
        assert!(!options.include_deleted);
    }

    #[test]
    fn test_fields_decode_independently() {
        let options = QueryOptions::from_query_string("limit=5&includeDeleted=1&utm_source=x").unwrap();
        assert_eq!(options.limit, Some(5));
        assert!(options.include_deleted);
        assert!(options.select.is_empty());
        assert!(options.filter.is_empty());
    }

    #[test]
    fn test_bad_field_names_parameter() {
        let err = QueryOptions::from_query_string("limit=ten").unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Configuration);
        assert!(err.message.contains("limit"));

        let query = encoded(&[("where", r#"[[{"col":"id","op":"in","value":"x"}]]"#)]);
        let err = QueryOptions::from_query_string(&query).unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Configuration);
    }

    #[test]
    fn test_page_bounds_decode() {
        let options = QueryOptions::from_query_string("page=9223372036854775807&limit=10").unwrap();
        assert_eq!(options.page, Some(i64::MAX));
        assert_eq!(options.pagination(), Some(Pagination::new(u64::MAX, 10)));

        let options = QueryOptions::from_query_string("page=-3&limit=10").unwrap();
        assert_eq!(options.page_number(), 1);
        assert_eq!(options.pagination(), Some(Pagination::new(0, 10)));

        let options = QueryOptions::from_query_string("page=4&limit=0").unwrap();
        assert_eq!(options.pagination(), Some(Pagination::new(0, 0)));

        let options = QueryOptions::from_query_string("page=4").unwrap();
        assert_eq!(options.pagination(), None);

        let err = QueryOptions::from_query_string("limit=-1").unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Configuration);
        let err = QueryOptions::from_query_string("page=99999999999999999999&limit=1").unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Configuration);
    }

    #[test]
    fn test_round_trip_through_query_string() {
        let options = QueryOptions::new()
            .with_select(["name"])
            .with_where(vec![vec![QueryFilter::gte("age", 18), QueryFilter::lt("age", 65)]])
            .with_page(2)
            .with_limit(25);

        let query = options.to_query_string().unwrap();
        assert_eq!(QueryOptions::from_query_string(&query).unwrap(), options);
    }

    #[test]
    fn test_count_options_from_query_string() {
        let query = encoded(&[
            ("group", r#"["group_id"]"#),
            ("distinct", "true"),
            ("col", "name"),
        ]);
        let options = CountOptions::from_query_string(&query).unwrap();
        assert_eq!(options.group, vec!["group_id"]);
        assert!(options.distinct);
        assert_eq!(options.col.as_deref(), Some("name"));
    }
}
