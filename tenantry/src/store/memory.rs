//! In-process store
//!
//! Tables live behind one async mutex. A transaction holds the lock for its
//! whole lifetime and works on a private copy of every table; commit writes
//! the copy back, rollback or drop discards it. Transactions are therefore
//! fully serialized, which is plenty for tests and tooling.
//!
//! Query semantics follow PostgreSQL where it matters to callers: `NULL`
//! never compares equal, ascending order puts nulls last, soft-deleted join
//! targets are invisible, and unique keys are enforced across all rows.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::hydrate::{hydrate, identity, FlatRow};
use super::plan::{CountPlan, CountRow, SelectPlan};
use super::{Store, StoreTx};
use crate::model::{timestamp_now, ColumnType, Model, Relation, RelationKind, Row, DELETED_AT};
use crate::query::{flatten, ColumnRef, Constraint, DatePart, JoinNode, OrderDirection, Predicate};
use crate::repository::{RepositoryError, RepositoryOperation, RepositoryResult};

type Tables = HashMap<&'static str, Vec<Row>>;

/// Shared in-memory tables
///
/// Cloning is cheap and every clone sees the same data.
///
/// # Example
///
/// ```rust,ignore
/// let store = MemoryStore::new();
/// let registers = Repository::<Register, _>::new(store.clone());
/// registers.create(&ctx, Register::named("Ada")).await?;
/// assert_eq!(store.rows(&REGISTER).await.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a table, soft-deleted rows included, in insertion order
    pub async fn rows(&self, model: &Model) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(model.table)
            .cloned()
            .unwrap_or_default()
    }

    /// Insert rows directly, bypassing unique checks
    pub async fn seed(&self, model: &'static Model, rows: impl IntoIterator<Item = Row>) {
        let mut tables = self.tables.lock().await;
        let table = tables.entry(model.table).or_default();
        for row in rows {
            table.push(complete(model, row));
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> RepositoryResult<MemoryTx> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTx { guard, working })
    }
}

/// A serialized transaction over a private copy of the tables
pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

impl MemoryTx {
    fn table(&self, model: &Model) -> &[Row] {
        self.working
            .get(model.table)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn table_mut(&mut self, model: &'static Model) -> &mut Vec<Row> {
        self.working.entry(model.table).or_default()
    }

    fn put(&mut self, model: &'static Model, row: Row, ignore_conflict: bool) -> RepositoryResult<Option<Row>> {
        let mut row = complete(model, row);
        let table = self.table_mut(model);
        if row.get(model.primary_key).map_or(true, Value::is_null) {
            row.insert(model.primary_key.to_string(), next_key(model, table));
        }
        if let Some(conflict) = conflict(model, table, &row, None) {
            if ignore_conflict {
                return Ok(None);
            }
            return Err(RepositoryError::already_exists(model.name, conflict));
        }
        table.push(row.clone());
        Ok(Some(row))
    }

    /// Every join combination of the root rows that passes the predicate
    fn combinations(
        &self,
        model: &'static Model,
        joins: &[JoinNode],
        predicate: &Predicate,
        include_deleted: bool,
    ) -> Vec<FlatRow> {
        let flat = flatten(joins);
        let paths = slot_paths(model, joins);
        let mut out = Vec::new();

        for root in self.table(model) {
            if !include_deleted && !is_live(model, root) {
                continue;
            }
            let mut combos: Vec<FlatRow> = vec![vec![Some(root.clone())]];
            for join in &flat {
                let parent_model = match join.parent {
                    0 => model,
                    parent => flat[parent - 1].node.target(),
                };
                let mut next = Vec::new();
                for combo in combos {
                    let related = match &combo[join.parent] {
                        Some(parent) => self.related(join.node.relation, parent_model, parent),
                        None => Vec::new(),
                    };
                    if related.is_empty() {
                        if !join.node.required {
                            let mut combo = combo;
                            combo.push(None);
                            next.push(combo);
                        }
                        continue;
                    }
                    for row in related {
                        let mut combo = combo.clone();
                        combo.push(Some(row.clone()));
                        next.push(combo);
                    }
                }
                combos = next;
            }
            out.extend(
                combos
                    .into_iter()
                    .filter(|combo| matches(predicate, &|c| lookup(&paths, combo, c))),
            );
        }
        out
    }

    fn related(&self, relation: &Relation, parent_model: &Model, parent: &Row) -> Vec<&Row> {
        let target = relation.target;
        let live_targets = self.table(target).iter().filter(|r| is_live(target, r));
        let parent_key = parent.get(parent_model.primary_key).cloned().unwrap_or(Value::Null);

        match relation.kind {
            RelationKind::BelongsTo { foreign_key } => {
                let fk = parent.get(foreign_key).cloned().unwrap_or(Value::Null);
                live_targets
                    .filter(|t| loose_eq(t.get(target.primary_key), &fk))
                    .collect()
            }
            RelationKind::HasOne { foreign_key } | RelationKind::HasMany { foreign_key } => {
                live_targets
                    .filter(|t| loose_eq(t.get(foreign_key), &parent_key))
                    .collect()
            }
            RelationKind::BelongsToMany {
                through,
                source_key,
                target_key,
            } => {
                let linked: Vec<Value> = self
                    .table(through)
                    .iter()
                    .filter(|p| is_live(through, p) && loose_eq(p.get(source_key), &parent_key))
                    .filter_map(|p| p.get(target_key).cloned())
                    .collect();
                live_targets
                    .filter(|t| linked.iter().any(|id| loose_eq(t.get(target.primary_key), id)))
                    .collect()
            }
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert(&mut self, model: &'static Model, row: Row) -> RepositoryResult<Row> {
        self.put(model, row, false)?.ok_or_else(|| {
            RepositoryError::database_error(RepositoryOperation::Create, "insert returned no row")
        })
    }

    async fn insert_if_absent(
        &mut self,
        model: &'static Model,
        row: Row,
    ) -> RepositoryResult<Option<Row>> {
        self.put(model, row, true)
    }

    async fn update(
        &mut self,
        model: &'static Model,
        values: Row,
        predicate: &Predicate,
    ) -> RepositoryResult<Vec<Row>> {
        let mut table = std::mem::take(self.table_mut(model));
        let mut updated = Vec::new();
        let mut failure = None;

        for index in 0..table.len() {
            let row = &table[index];
            if !is_live(model, row) || !matches(predicate, &|c| root_lookup(row, c)) {
                continue;
            }
            let mut candidate = row.clone();
            for (column, value) in &values {
                if model.has_column(column) {
                    candidate.insert(column.clone(), value.clone());
                }
            }
            if let Some(conflict) = conflict(model, &table, &candidate, Some(index)) {
                failure = Some(
                    RepositoryError::already_exists(model.name, conflict)
                        .with_operation(RepositoryOperation::Update),
                );
                break;
            }
            table[index] = candidate.clone();
            updated.push(candidate);
        }

        *self.table_mut(model) = table;
        match failure {
            Some(err) => Err(err),
            None => Ok(updated),
        }
    }

    async fn delete(
        &mut self,
        model: &'static Model,
        predicate: &Predicate,
        soft: bool,
    ) -> RepositoryResult<u64> {
        let table = self.table_mut(model);
        let mut affected = 0u64;
        if soft {
            let now = timestamp_now();
            for row in table.iter_mut() {
                if is_live(model, row) && matches(predicate, &|c| root_lookup(row, c)) {
                    row.insert(DELETED_AT.to_string(), now.clone());
                    affected += 1;
                }
            }
        } else {
            table.retain(|row| {
                let hit = matches(predicate, &|c| root_lookup(row, c));
                if hit {
                    affected += 1;
                }
                !hit
            });
        }
        Ok(affected)
    }

    async fn select(&mut self, plan: &SelectPlan) -> RepositoryResult<Vec<Row>> {
        let paths = slot_paths(plan.model, &plan.joins);
        let mut combos =
            self.combinations(plan.model, &plan.joins, &plan.predicate, plan.include_deleted);

        if !plan.order.is_empty() {
            combos.sort_by(|a, b| {
                for term in &plan.order {
                    let left = lookup(&paths, a, &term.column);
                    let right = lookup(&paths, b, &term.column);
                    let ordering = order_values(&left, &right, term.direction);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some(window) = plan.window {
            let mut seen = HashSet::new();
            let keep: HashSet<String> = combos
                .iter()
                .filter_map(|combo| root_key(plan.model, combo))
                .filter(|key| seen.insert(key.clone()))
                .skip(usize::try_from(window.offset).unwrap_or(usize::MAX))
                .take(usize::try_from(window.limit).unwrap_or(usize::MAX))
                .collect();
            combos.retain(|combo| root_key(plan.model, combo).is_some_and(|k| keep.contains(&k)));
        }

        let flat = flatten(&plan.joins);
        let projected: Vec<FlatRow> = combos
            .into_iter()
            .map(|combo| {
                combo
                    .into_iter()
                    .enumerate()
                    .map(|(slot, row)| {
                        let columns = match slot {
                            0 => &plan.columns,
                            slot => &flat[slot - 1].node.columns,
                        };
                        row.map(|row| project(&row, columns))
                    })
                    .collect()
            })
            .collect();

        Ok(hydrate(plan.model, &plan.joins, projected))
    }

    async fn count(&mut self, plan: &CountPlan) -> RepositoryResult<Vec<CountRow>> {
        let paths = slot_paths(plan.model, &plan.joins);
        let combos =
            self.combinations(plan.model, &plan.joins, &plan.predicate, plan.include_deleted);

        struct Group {
            values: Row,
            rows: u64,
            distinct: HashSet<String>,
        }
        let mut groups: Vec<(String, Group)> = Vec::new();

        for combo in &combos {
            let mut values = Row::new();
            for (label, column) in &plan.group {
                values.insert(label.clone(), lookup(&paths, combo, column));
            }
            let key = Value::Object(values.clone()).to_string();
            let index = match groups.iter().position(|(k, _)| *k == key) {
                Some(index) => index,
                None => {
                    groups.push((
                        key,
                        Group {
                            values,
                            rows: 0,
                            distinct: HashSet::new(),
                        },
                    ));
                    groups.len() - 1
                }
            };
            let group = &mut groups[index].1;

            let counted = match &plan.column {
                Some(column) => Some(lookup(&paths, combo, column)).filter(|v| !v.is_null()),
                None => combo[0]
                    .as_ref()
                    .and_then(|root| root.get(plan.model.primary_key).cloned()),
            };
            if let Some(value) = counted {
                group.rows += 1;
                group.distinct.insert(value.to_string());
            }
        }

        if groups.is_empty() && plan.group.is_empty() {
            return Ok(vec![CountRow {
                group: Row::new(),
                count: 0,
            }]);
        }

        Ok(groups
            .into_iter()
            .map(|(_, group)| CountRow {
                count: if plan.distinct {
                    group.distinct.len() as u64
                } else {
                    group.rows
                },
                group: group.values,
            })
            .collect())
    }

    async fn commit(self) -> RepositoryResult<()> {
        let MemoryTx { mut guard, working } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> RepositoryResult<()> {
        Ok(())
    }
}

/// Fill undeclared columns with null and drop unknown keys
fn complete(model: &Model, mut row: Row) -> Row {
    row.retain(|key, _| model.has_column(key));
    for column in model.columns {
        row.entry(column.name.to_string()).or_insert(Value::Null);
    }
    row
}

fn next_key(model: &Model, table: &[Row]) -> Value {
    match model.primary_key_type() {
        ColumnType::Int | ColumnType::BigInt => {
            let max = table
                .iter()
                .filter_map(|r| r.get(model.primary_key).and_then(Value::as_i64))
                .max()
                .unwrap_or(0);
            Value::from(max + 1)
        }
        _ => Value::String(uuid::Uuid::now_v7().to_string()),
    }
}

/// Describe the first unique key `row` would duplicate
fn conflict(model: &Model, table: &[Row], row: &Row, skip: Option<usize>) -> Option<String> {
    let primary: &[&str] = &[model.primary_key];
    std::iter::once(primary)
        .chain(model.unique_keys.iter().copied())
        .find_map(|key| {
            let values: Vec<&Value> = key
                .iter()
                .map(|c| row.get(*c).unwrap_or(&Value::Null))
                .collect();
            if values.iter().any(|v| v.is_null()) {
                return None;
            }
            let taken = table.iter().enumerate().any(|(index, other)| {
                Some(index) != skip
                    && key
                        .iter()
                        .zip(&values)
                        .all(|(c, v)| other.get(*c) == Some(*v))
            });
            taken.then(|| {
                key.iter()
                    .zip(&values)
                    .map(|(c, v)| format!("{}={}", c, v))
                    .collect::<Vec<_>>()
                    .join(",")
            })
        })
}

fn is_live(model: &Model, row: &Row) -> bool {
    !model.paranoid || row.get(DELETED_AT).map_or(true, Value::is_null)
}

fn root_key(model: &Model, combo: &FlatRow) -> Option<String> {
    combo
        .first()
        .and_then(Option::as_ref)
        .and_then(|root| identity(root, model.primary_key))
}

fn project(row: &Row, columns: &[String]) -> Row {
    columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Join path to slot index, root included under both `None` and its table
fn slot_paths(model: &Model, joins: &[JoinNode]) -> HashMap<Option<String>, usize> {
    let mut paths = HashMap::new();
    paths.insert(None, 0);
    paths.insert(Some(model.table.to_string()), 0);
    for join in flatten(joins) {
        paths.insert(Some(join.node.path.clone()), join.slot);
    }
    paths
}

fn lookup(paths: &HashMap<Option<String>, usize>, combo: &FlatRow, column: &ColumnRef) -> Value {
    paths
        .get(&column.path)
        .and_then(|slot| combo.get(*slot))
        .and_then(Option::as_ref)
        .and_then(|row| row.get(&column.name))
        .cloned()
        .unwrap_or(Value::Null)
}

fn root_lookup(row: &Row, column: &ColumnRef) -> Value {
    row.get(&column.name).cloned().unwrap_or(Value::Null)
}

fn matches(predicate: &Predicate, lookup: &dyn Fn(&ColumnRef) -> Value) -> bool {
    match predicate {
        Predicate::All => true,
        Predicate::And(items) => items.iter().all(|p| matches(p, lookup)),
        Predicate::Or(items) => items.iter().any(|p| matches(p, lookup)),
        Predicate::Column {
            column,
            constraints,
        } => {
            let value = lookup(column);
            constraints.iter().all(|c| satisfies(&value, c))
        }
    }
}

fn satisfies(value: &Value, constraint: &Constraint) -> bool {
    match constraint {
        Constraint::Eq(Value::Null) | Constraint::IsNull => value.is_null(),
        Constraint::Ne(Value::Null) => !value.is_null(),
        Constraint::Eq(other) => compare(value, other) == Some(Ordering::Equal),
        Constraint::Ne(other) => compare(value, other).is_some_and(|o| o != Ordering::Equal),
        Constraint::Lt(other) => compare(value, other) == Some(Ordering::Less),
        Constraint::Lte(other) => {
            compare(value, other).is_some_and(|o| o != Ordering::Greater)
        }
        Constraint::Gt(other) => compare(value, other) == Some(Ordering::Greater),
        Constraint::Gte(other) => compare(value, other).is_some_and(|o| o != Ordering::Less),
        Constraint::Like(pattern) => {
            text(value).is_some_and(|t| like(&t, pattern))
        }
        Constraint::ILike(pattern) => {
            text(value).is_some_and(|t| like(&t.to_lowercase(), &pattern.to_lowercase()))
        }
        Constraint::Between(low, high) => {
            compare(value, low).is_some_and(|o| o != Ordering::Less)
                && compare(value, high).is_some_and(|o| o != Ordering::Greater)
        }
        Constraint::In(items) | Constraint::Any(items) => {
            items.iter().any(|item| compare(value, item) == Some(Ordering::Equal))
        }
        Constraint::NotIn(items) => {
            !value.is_null()
                && items
                    .iter()
                    .all(|item| compare(value, item).is_some_and(|o| o != Ordering::Equal))
        }
        Constraint::DatePart { part, value: expected } => {
            let actual = value.as_str().and_then(instant).map(|t| date_part(&t, *part));
            match (actual, number(expected)) {
                (Some(actual), Some(expected)) => actual == expected,
                _ => false,
            }
        }
    }
}

/// SQL-style comparison; `None` when either side is null or the types clash
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => match (instant(a), instant(b)) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => Some(a.cmp(b)),
        },
        (a, b) => match (number(a), number(b)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    }
}

fn loose_eq(left: Option<&Value>, right: &Value) -> bool {
    left.is_some_and(|l| compare(l, right) == Some(Ordering::Equal))
}

fn order_values(left: &Value, right: &Value, direction: OrderDirection) -> Ordering {
    // PostgreSQL default: nulls sort as the largest value
    let ordering = match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => compare(left, right).unwrap_or(Ordering::Equal),
    };
    match direction {
        OrderDirection::Ascending => ordering,
        OrderDirection::Descending => ordering.reverse(),
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Parse a timestamp or date string as naive UTC
fn instant(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.naive_utc());
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(t);
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(t);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn date_part(t: &NaiveDateTime, part: DatePart) -> f64 {
    let value = match part {
        DatePart::Year => t.year(),
        DatePart::IsoYear => t.iso_week().year(),
        DatePart::Month => t.month() as i32,
        DatePart::Day => t.day() as i32,
        DatePart::Dow => t.weekday().num_days_from_sunday() as i32,
        DatePart::IsoDow => t.weekday().number_from_monday() as i32,
        DatePart::Doy => t.ordinal() as i32,
    };
    f64::from(value)
}

/// `LIKE` matching with `%` (any run) and `_` (one character)
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some('_') => {
                t += 1;
                p += 1;
            }
            Some(c) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}
