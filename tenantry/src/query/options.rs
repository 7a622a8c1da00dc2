//! Query, find and count option types
//!
//! These are the caller-facing descriptions of a read. Each field maps to one
//! independently decoded query-string parameter (see [`super::wire`]).

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use super::filter::{FilterMatrix, QueryFilter};
use super::pagination::Pagination;

/// Direction for ordering results
///
/// Accepted case-insensitively on the wire, written as `ASC` / `DESC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl Serialize for OrderDirection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_sql())
    }
}

impl<'de> Deserialize<'de> for OrderDirection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Ascending),
            "desc" => Ok(Self::Descending),
            other => Err(de::Error::invalid_value(
                de::Unexpected::Str(other),
                &"ASC or DESC",
            )),
        }
    }
}

/// Ordered mapping from column path to direction
///
/// Serialized as a JSON object whose key order is the sort priority.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortSpec(pub Vec<(String, OrderDirection)>);

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the direction for a column, keeping its position
    #[must_use]
    pub fn then(mut self, column: impl Into<String>, direction: OrderDirection) -> Self {
        self.set(column.into(), direction);
        self
    }

    pub fn set(&mut self, column: String, direction: OrderDirection) {
        match self.0.iter_mut().find(|(c, _)| *c == column) {
            Some(entry) => entry.1 = direction,
            None => self.0.push((column, direction)),
        }
    }

    /// Merge another spec; its directions win for shared columns
    pub fn merge(&mut self, other: SortSpec) {
        for (column, direction) in other.0 {
            self.set(column, direction);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, OrderDirection)> {
        self.0.iter()
    }
}

impl Serialize for SortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (column, direction) in &self.0 {
            map.serialize_entry(column, direction)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SortVisitor;

        impl<'de> Visitor<'de> for SortVisitor {
            type Value = SortSpec;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping columns to ASC or DESC")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<SortSpec, A::Error> {
                let mut spec = SortSpec::new();
                while let Some((column, direction)) =
                    access.next_entry::<String, OrderDirection>()?
                {
                    spec.set(column, direction);
                }
                Ok(spec)
            }
        }

        deserializer.deserialize_map(SortVisitor)
    }
}

/// One include path and whether its join is required (inner)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeEntry {
    pub path: String,
    pub required: bool,
}

impl IncludeEntry {
    pub fn optional(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            required: false,
        }
    }

    pub fn required(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            required: true,
        }
    }
}

/// Relations to eager-load
///
/// Accepts a list of dotted paths (`["group", "group.license"]`) or a map
/// keyed by relation name or dotted path, whose values may flag `required`
/// and nest further relations under `nested` (or `include`):
///
/// ```json
/// {"group": {"required": true, "nested": {"license": {}}}}
/// ```
///
/// Both forms normalize to a flat, ordered list of [`IncludeEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncludeSpec {
    entries: Vec<IncludeEntry>,
}

impl IncludeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = Self::new();
        for path in paths {
            spec.push(IncludeEntry::optional(path));
        }
        spec
    }

    /// Add an entry; a repeated path keeps its position and ORs `required`
    pub fn push(&mut self, entry: IncludeEntry) {
        match self.entries.iter_mut().find(|e| e.path == entry.path) {
            Some(existing) => existing.required |= entry.required,
            None => self.entries.push(entry),
        }
    }

    #[must_use]
    pub fn with(mut self, entry: IncludeEntry) -> Self {
        self.push(entry);
        self
    }

    pub fn merge(&mut self, other: IncludeSpec) {
        for entry in other.entries {
            self.push(entry);
        }
    }

    pub fn entries(&self) -> &[IncludeEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn from_map(prefix: Option<&str>, map: serde_json::Map<String, Value>) -> Result<Self, String> {
        let mut spec = Self::new();
        for (name, settings) in map {
            let path = match prefix {
                Some(prefix) => format!("{}.{}", prefix, name),
                None => name,
            };
            let (required, nested) = match settings {
                Value::Object(mut settings) => {
                    let required = match settings.remove("required") {
                        None | Some(Value::Null) => false,
                        Some(Value::Bool(flag)) => flag,
                        Some(other) => {
                            return Err(format!("`{}.required` must be a boolean, got {}", path, other))
                        }
                    };
                    let nested = settings.remove("nested").or_else(|| settings.remove("include"));
                    (required, nested)
                }
                Value::Bool(required) => (required, None),
                Value::Null => (false, None),
                other => return Err(format!("include `{}` has invalid settings {}", path, other)),
            };
            spec.push(IncludeEntry {
                path: path.clone(),
                required,
            });
            match nested {
                None | Some(Value::Null) => {}
                Some(Value::Object(children)) => spec.merge(Self::from_map(Some(&path), children)?),
                Some(Value::Array(children)) => {
                    for child in children {
                        match child {
                            Value::String(child) => {
                                spec.push(IncludeEntry::optional(format!("{}.{}", path, child)))
                            }
                            other => return Err(format!("nested include must be a string, got {}", other)),
                        }
                    }
                }
                Some(other) => return Err(format!("nested include of `{}` is invalid: {}", path, other)),
            }
        }
        Ok(spec)
    }
}

impl Serialize for IncludeSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.entries.iter().any(|e| e.required) {
            let mut map = serializer.serialize_map(Some(self.entries.len()))?;
            for entry in &self.entries {
                map.serialize_entry(&entry.path, &serde_json::json!({ "required": entry.required }))?;
            }
            map.end()
        } else {
            let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
            for entry in &self.entries {
                seq.serialize_element(&entry.path)?;
            }
            seq.end()
        }
    }
}

impl<'de> Deserialize<'de> for IncludeSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IncludeVisitor;

        impl<'de> Visitor<'de> for IncludeVisitor {
            type Value = IncludeSpec;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of relation paths or a map of relation settings")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<IncludeSpec, A::Error> {
                let mut spec = IncludeSpec::new();
                while let Some(path) = access.next_element::<String>()? {
                    spec.push(IncludeEntry::optional(path));
                }
                Ok(spec)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<IncludeSpec, A::Error> {
                let mut map = serde_json::Map::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    map.insert(key, value);
                }
                IncludeSpec::from_map(None, map).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(IncludeVisitor)
    }
}

/// Full description of a multi-row read
///
/// `page` is 1-based and only meaningful together with `limit`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    #[serde(default, skip_serializing_if = "IncludeSpec::is_empty")]
    pub include: IncludeSpec,
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub filter: FilterMatrix,
    #[serde(default, skip_serializing_if = "SortSpec::is_empty")]
    pub sort: SortSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default)]
    pub include_deleted: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append projected columns
    #[must_use]
    pub fn with_select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if !self.select.contains(&column) {
                self.select.push(column);
            }
        }
        self
    }

    /// Append list includes or merge map includes
    #[must_use]
    pub fn with_include(mut self, include: IncludeSpec) -> Self {
        self.include.merge(include);
        self
    }

    /// Append OR-groups to the filter matrix
    #[must_use]
    pub fn with_where(mut self, groups: FilterMatrix) -> Self {
        self.filter.extend(groups);
        self
    }

    /// Append a single AND-group
    #[must_use]
    pub fn with_group(mut self, group: Vec<QueryFilter>) -> Self {
        self.filter.push(group);
        self
    }

    /// Merge sort directions; later values win for shared columns
    #[must_use]
    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.merge(sort);
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: i64) -> Self {
        self.page = Some(page);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_include_deleted(mut self, include_deleted: bool) -> Self {
        self.include_deleted = include_deleted;
        self
    }

    /// Page number after normalization (`< 1` and unset become 1)
    pub fn page_number(&self) -> u64 {
        match self.page {
            Some(page) if page >= 1 => page as u64,
            _ => 1,
        }
    }

    /// Offset/limit window, only when a limit is set
    pub fn pagination(&self) -> Option<Pagination> {
        self.limit
            .map(|limit| Pagination::page(self.page_number(), limit))
    }

    /// The subset used by single-row lookups
    pub fn find_options(&self) -> FindOptions {
        FindOptions {
            select: self.select.clone(),
            include: self.include.clone(),
            sort: self.sort.clone(),
            include_deleted: self.include_deleted,
        }
    }
}

/// Options for identifier and predicate lookups (no filter matrix, no paging)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub select: Vec<String>,
    #[serde(default, skip_serializing_if = "IncludeSpec::is_empty")]
    pub include: IncludeSpec,
    #[serde(default, skip_serializing_if = "SortSpec::is_empty")]
    pub sort: SortSpec,
    #[serde(default)]
    pub include_deleted: bool,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_include(mut self, include: IncludeSpec) -> Self {
        self.include.merge(include);
        self
    }

    #[must_use]
    pub fn with_include_deleted(mut self, include_deleted: bool) -> Self {
        self.include_deleted = include_deleted;
        self
    }
}

/// Aggregate count description
///
/// `group` columns without a path are qualified by the base table. When
/// `distinct` is set and `col` is absent, distinct root rows are counted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountOptions {
    #[serde(default, skip_serializing_if = "IncludeSpec::is_empty")]
    pub include: IncludeSpec,
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub filter: FilterMatrix,
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default)]
    pub distinct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group: Vec<String>,
}

impl CountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_include(mut self, include: IncludeSpec) -> Self {
        self.include.merge(include);
        self
    }

    #[must_use]
    pub fn with_where(mut self, groups: FilterMatrix) -> Self {
        self.filter.extend(groups);
        self
    }

    #[must_use]
    pub fn with_distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    #[must_use]
    pub fn with_col(mut self, col: impl Into<String>) -> Self {
        self.col = Some(col.into());
        self
    }

    #[must_use]
    pub fn with_group<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group.extend(columns.into_iter().map(Into::into));
        self
    }
}

impl From<&QueryOptions> for CountOptions {
    fn from(options: &QueryOptions) -> Self {
        Self {
            include: options.include.clone(),
            filter: options.filter.clone(),
            include_deleted: options.include_deleted,
            distinct: !options.include.is_empty(),
            col: None,
            group: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sort_spec_preserves_order() {
        let spec: SortSpec = serde_json::from_str(r#"{"name":"ASC","id":"desc","age":"Asc"}"#).unwrap();
        assert_eq!(
            spec.0,
            vec![
                ("name".to_string(), OrderDirection::Ascending),
                ("id".to_string(), OrderDirection::Descending),
                ("age".to_string(), OrderDirection::Ascending),
            ]
        );
        assert_eq!(
            serde_json::to_string(&spec).unwrap(),
            r#"{"name":"ASC","id":"DESC","age":"ASC"}"#
        );
    }

    #[test]
    fn test_sort_direction_rejects_unknown() {
        assert!(serde_json::from_str::<SortSpec>(r#"{"name":"sideways"}"#).is_err());
    }

    #[test]
    fn test_sort_merge_keeps_position() {
        let mut spec = SortSpec::new()
            .then("name", OrderDirection::Ascending)
            .then("id", OrderDirection::Ascending);
        spec.merge(SortSpec::new().then("name", OrderDirection::Descending));
        assert_eq!(spec.0[0], ("name".to_string(), OrderDirection::Descending));
        assert_eq!(spec.0.len(), 2);
    }

    #[test]
    fn test_include_list_form() {
        let spec: IncludeSpec = serde_json::from_str(r#"["group","phones"]"#).unwrap();
        assert_eq!(
            spec.entries(),
            &[IncludeEntry::optional("group"), IncludeEntry::optional("phones")]
        );
    }

    #[test]
    fn test_include_map_form_with_nesting() {
        let spec: IncludeSpec = serde_json::from_str(
            r#"{"group":{"required":true,"nested":{"license":{"required":false}}},"phones":{}}"#,
        )
        .unwrap();
        assert_eq!(
            spec.entries(),
            &[
                IncludeEntry::required("group"),
                IncludeEntry::optional("group.license"),
                IncludeEntry::optional("phones"),
            ]
        );
    }

    #[test]
    fn test_include_map_with_dotted_keys_and_include_alias() {
        let spec: IncludeSpec = serde_json::from_str(
            r#"{"group.license":{"required":true},"groups":{"include":["license"]}}"#,
        )
        .unwrap();
        assert_eq!(
            spec.entries(),
            &[
                IncludeEntry::required("group.license"),
                IncludeEntry::optional("groups"),
                IncludeEntry::optional("groups.license"),
            ]
        );
    }

    #[test]
    fn test_include_serializes_list_unless_required() {
        let plain = IncludeSpec::paths(["group"]);
        assert_eq!(serde_json::to_value(&plain).unwrap(), json!(["group"]));

        let flagged = plain.with(IncludeEntry::required("phones"));
        assert_eq!(
            serde_json::to_value(&flagged).unwrap(),
            json!({"group": {"required": false}, "phones": {"required": true}})
        );
    }

    #[test]
    fn test_query_options_merge_setters() {
        let options = QueryOptions::new()
            .with_select(["name"])
            .with_select(["id", "name"])
            .with_include(IncludeSpec::paths(["group"]))
            .with_include(IncludeSpec::paths(["phones"]))
            .with_where(vec![vec![QueryFilter::eq("name", "X")]])
            .with_where(vec![vec![QueryFilter::eq("active", true)]])
            .with_sort(SortSpec::new().then("name", OrderDirection::Ascending))
            .with_sort(SortSpec::new().then("id", OrderDirection::Descending));

        assert_eq!(options.select, vec!["name", "id"]);
        assert_eq!(options.include.entries().len(), 2);
        assert_eq!(options.filter.len(), 2);
        assert_eq!(options.sort.0.len(), 2);
    }

    #[test]
    fn test_page_normalization() {
        assert_eq!(QueryOptions::new().pagination(), None);
        assert_eq!(
            QueryOptions::new().with_limit(10).pagination(),
            Some(Pagination::new(0, 10))
        );
        assert_eq!(
            QueryOptions::new().with_limit(10).with_page(0).pagination(),
            Some(Pagination::new(0, 10))
        );
        assert_eq!(
            QueryOptions::new().with_limit(10).with_page(-4).pagination(),
            Some(Pagination::new(0, 10))
        );
        assert_eq!(
            QueryOptions::new().with_limit(10).with_page(3).pagination(),
            Some(Pagination::new(20, 10))
        );
    }

    #[test]
    fn test_query_options_json_shape() {
        let options: QueryOptions = serde_json::from_value(json!({
            "select": ["name", "id"],
            "include": {"group": {"required": true}},
            "where": [[{"col": "name", "op": "=", "value": "X"}]],
            "sort": {"name": "ASC"},
            "page": 2,
            "limit": 10,
            "includeDeleted": true
        }))
        .unwrap();

        assert_eq!(options.select, vec!["name", "id"]);
        assert_eq!(options.include.entries(), &[IncludeEntry::required("group")]);
        assert_eq!(options.filter[0][0], QueryFilter::eq("name", "X"));
        assert_eq!(options.pagination(), Some(Pagination::new(10, 10)));
        assert!(options.include_deleted);
    }

    #[test]
    fn test_count_options_from_query_counts_distinct_with_includes() {
        let query = QueryOptions::new().with_include(IncludeSpec::paths(["phones"]));
        assert!(CountOptions::from(&query).distinct);
        assert!(!CountOptions::from(&QueryOptions::new()).distinct);
    }
}
