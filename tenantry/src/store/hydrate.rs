//! Fold flat joined rows into nested entity rows
//!
//! Stores return one flat row per join combination: slot 0 is the root row,
//! slots 1.. follow [`flatten`] order and are `None` where a left join found
//! nothing. Hydration groups flat rows by root primary key (first appearance
//! wins the position) and nests each joined row under its parent, as an
//! object for single-valued relations and a de-duplicated array for
//! collections.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::model::{Model, Row};
use crate::query::{flatten, FlatJoin, JoinNode};

/// A flat result row, one entry per slot
pub type FlatRow = Vec<Option<Row>>;

/// Identity of a row for grouping and de-duplication
pub(crate) fn identity(row: &Row, primary_key: &str) -> Option<String> {
    row.get(primary_key)
        .filter(|v| !v.is_null())
        .map(Value::to_string)
}

#[derive(Default)]
struct Bucket {
    seen: HashSet<String>,
    rows: Vec<Row>,
}

/// Nest flat rows into one row per distinct root
pub fn hydrate(model: &Model, joins: &[JoinNode], flat_rows: Vec<FlatRow>) -> Vec<Row> {
    let flat = flatten(joins);
    let mut roots: Vec<(String, Row)> = Vec::new();
    let mut root_index: HashMap<String, usize> = HashMap::new();
    // (slot, parent identity) -> joined rows
    let mut buckets: HashMap<(usize, String), Bucket> = HashMap::new();

    for (position, mut slots) in flat_rows.into_iter().enumerate() {
        let Some(root) = slots.first_mut().and_then(Option::take) else {
            continue;
        };
        let root_key =
            identity(&root, model.primary_key).unwrap_or_else(|| format!("#{}", position));
        if !root_index.contains_key(&root_key) {
            root_index.insert(root_key.clone(), roots.len());
            roots.push((root_key.clone(), root));
        }

        let mut keys: Vec<Option<String>> = vec![Some(root_key)];
        for join in &flat {
            let row = slots.get_mut(join.slot).and_then(Option::take);
            let parent_key = keys.get(join.parent).cloned().flatten();
            let key = row
                .as_ref()
                .and_then(|r| identity(r, join.node.target().primary_key));
            if let (Some(row), Some(parent_key), Some(key)) = (row, parent_key, key.clone()) {
                let bucket = buckets.entry((join.slot, parent_key)).or_default();
                if bucket.seen.insert(key) {
                    bucket.rows.push(row);
                }
            }
            keys.push(key);
        }
    }

    roots
        .into_iter()
        .map(|(key, mut row)| {
            attach(&mut row, 0, &key, &flat, &buckets);
            row
        })
        .collect()
}

fn attach(
    row: &mut Row,
    slot: usize,
    key: &str,
    flat: &[FlatJoin<'_>],
    buckets: &HashMap<(usize, String), Bucket>,
) {
    for join in flat.iter().filter(|j| j.parent == slot) {
        let children: Vec<Value> = buckets
            .get(&(join.slot, key.to_string()))
            .map(|bucket| {
                bucket
                    .rows
                    .iter()
                    .map(|child| {
                        let mut child = child.clone();
                        if let Some(child_key) = identity(&child, join.node.target().primary_key) {
                            attach(&mut child, join.slot, &child_key, flat, buckets);
                        }
                        Value::Object(child)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let value = if join.node.relation.kind.is_collection() {
            Value::Array(children)
        } else {
            children.into_iter().next().unwrap_or(Value::Null)
        };
        row.insert(join.node.relation.name.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{resolve, IncludeSpec, ProjectionGroups};
    use crate::test_support::REGISTER;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(row) => row,
            _ => panic!("expected object"),
        }
    }

    fn joins(paths: &[&str]) -> Vec<JoinNode> {
        resolve(
            &IncludeSpec::paths(paths.iter().copied()),
            &REGISTER,
            &ProjectionGroups::default(),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_no_joins_passes_rows_through() {
        let rows = hydrate(
            &REGISTER,
            &[],
            vec![
                vec![Some(row(json!({"id": "a"})))],
                vec![Some(row(json!({"id": "b"})))],
            ],
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["id"], json!("b"));
    }

    #[test]
    fn test_collection_is_grouped_and_deduplicated() {
        let joins = joins(&["phones"]);
        let rows = hydrate(
            &REGISTER,
            &joins,
            vec![
                vec![Some(row(json!({"id": "a"}))), Some(row(json!({"id": "p1"})))],
                vec![Some(row(json!({"id": "a"}))), Some(row(json!({"id": "p2"})))],
                vec![Some(row(json!({"id": "a"}))), Some(row(json!({"id": "p1"})))],
                vec![Some(row(json!({"id": "b"}))), None],
            ],
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["phones"], json!([{"id": "p1"}, {"id": "p2"}]));
        assert_eq!(rows[1]["phones"], json!([]));
    }

    #[test]
    fn test_single_relation_and_nested_child() {
        let joins = joins(&["group", "group.license"]);
        let rows = hydrate(
            &REGISTER,
            &joins,
            vec![
                vec![
                    Some(row(json!({"id": "a"}))),
                    Some(row(json!({"id": "g1"}))),
                    Some(row(json!({"id": "l1"}))),
                ],
                vec![Some(row(json!({"id": "b"}))), None, None],
            ],
        );
        assert_eq!(rows[0]["group"], json!({"id": "g1", "license": {"id": "l1"}}));
        assert_eq!(rows[1]["group"], Value::Null);
    }
}
