//! PostgreSQL store on sqlx
//!
//! Statements are assembled with [`QueryBuilder`]. Identifiers come from the
//! static model declarations and are always quoted; values are bound as text
//! and cast to the declared column type, so one code path serves every
//! column type.
//!
//! Rows travel as `jsonb`: inserts and updates return `to_jsonb(t.*)`, and
//! selects return one `jsonb_build_object(...)` per join slot, which
//! [`hydrate`] folds into nested rows.
//!
//! A paginated select with joins runs in two phases: the first picks the
//! window of root keys (grouped, so join fan-out cannot shrink a page), the
//! second loads those roots with their relations.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Row as SqlRow, Transaction};

use super::hydrate::{hydrate, identity, FlatRow};
use super::plan::{CountPlan, CountRow, OrderTerm, PlanScope, SelectPlan};
use super::{Store, StoreTx};
use crate::config::DatabaseConfig;
use crate::model::{ColumnType, Model, RelationKind, Row, DELETED_AT};
use crate::query::{flatten, ColumnRef, Constraint, JoinNode, OrderDirection, Predicate};
use crate::repository::{RepositoryError, RepositoryOperation, RepositoryResult};

type Query = QueryBuilder<'static, Postgres>;

/// Store backed by a PostgreSQL connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the pool from configuration, retrying with backoff
    pub async fn connect(config: &DatabaseConfig) -> crate::error::Result<Self> {
        Ok(Self::new(crate::database::create_pool(config).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> RepositoryResult<PgTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(store_error(RepositoryOperation::Query))?;
        Ok(PgTx { tx })
    }
}

/// An open PostgreSQL transaction
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn fetch_rows(
        &mut self,
        mut query: Query,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Vec<Row>> {
        tracing::debug!(sql = query.sql(), "executing");
        let rows = query
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_error(operation))?;
        rows.iter()
            .map(|row| {
                let Json(value) = row
                    .try_get::<Json<Value>, _>(0)
                    .map_err(store_error(operation))?;
                into_row(value, operation)
            })
            .collect()
    }

    async fn fetch_slots(&mut self, mut query: Query, slots: usize) -> RepositoryResult<Vec<FlatRow>> {
        tracing::debug!(sql = query.sql(), "executing");
        let rows = query
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_error(RepositoryOperation::Query))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut flat = Vec::with_capacity(slots);
            for slot in 0..slots {
                let value = row
                    .try_get::<Option<Json<Value>>, _>(slot)
                    .map_err(store_error(RepositoryOperation::Query))?;
                flat.push(match value {
                    Some(Json(value)) => Some(into_row(value, RepositoryOperation::Query)?),
                    None => None,
                });
            }
            out.push(flat);
        }
        Ok(out)
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert(&mut self, model: &'static Model, row: Row) -> RepositoryResult<Row> {
        let query = insert_query(model, &row, false);
        self.fetch_rows(query, RepositoryOperation::Create)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                RepositoryError::database_error(RepositoryOperation::Create, "insert returned no row")
            })
    }

    async fn insert_if_absent(
        &mut self,
        model: &'static Model,
        row: Row,
    ) -> RepositoryResult<Option<Row>> {
        let query = insert_query(model, &row, true);
        Ok(self
            .fetch_rows(query, RepositoryOperation::FindOrCreate)
            .await?
            .into_iter()
            .next())
    }

    async fn update(
        &mut self,
        model: &'static Model,
        values: Row,
        predicate: &Predicate,
    ) -> RepositoryResult<Vec<Row>> {
        let query = update_query(model, &values, predicate);
        self.fetch_rows(query, RepositoryOperation::Update).await
    }

    async fn delete(
        &mut self,
        model: &'static Model,
        predicate: &Predicate,
        soft: bool,
    ) -> RepositoryResult<u64> {
        let mut query = delete_query(model, predicate, soft);
        tracing::debug!(sql = query.sql(), "executing");
        let result = query
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(store_error(RepositoryOperation::Delete))?;
        Ok(result.rows_affected())
    }

    async fn select(&mut self, plan: &SelectPlan) -> RepositoryResult<Vec<Row>> {
        let slots = flatten(&plan.joins).len() + 1;

        if plan.joins.is_empty() || plan.window.is_none() {
            let rows = self.fetch_slots(select_query(plan, None), slots).await?;
            return Ok(hydrate(plan.model, &plan.joins, rows));
        }

        let mut window = window_query(plan);
        tracing::debug!(sql = window.sql(), "selecting root window");
        let ids: Vec<String> = window
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_error(RepositoryOperation::Query))?
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<Result<_, _>>()
            .map_err(store_error(RepositoryOperation::Query))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self
            .fetch_slots(select_query(plan, Some(ids.clone())), slots)
            .await?;
        let mut rows = hydrate(plan.model, &plan.joins, rows);
        rows.sort_by_key(|row| {
            let key = row.get(plan.model.primary_key).map(key_text);
            ids.iter()
                .position(|id| Some(id.as_str()) == key.as_deref())
                .unwrap_or(usize::MAX)
        });
        Ok(rows)
    }

    async fn count(&mut self, plan: &CountPlan) -> RepositoryResult<Vec<CountRow>> {
        let mut query = count_query(plan);
        tracing::debug!(sql = query.sql(), "executing");
        let rows = query
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_error(RepositoryOperation::Count))?;
        rows.iter()
            .map(|row| {
                let Json(group) = row
                    .try_get::<Json<Value>, _>(0)
                    .map_err(store_error(RepositoryOperation::Count))?;
                let count = row
                    .try_get::<i64, _>(1)
                    .map_err(store_error(RepositoryOperation::Count))?;
                Ok(CountRow {
                    group: into_row(group, RepositoryOperation::Count)?,
                    count: u64::try_from(count).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn commit(self) -> RepositoryResult<()> {
        self.tx
            .commit()
            .await
            .map_err(store_error(RepositoryOperation::Query))
    }

    async fn rollback(self) -> RepositoryResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(store_error(RepositoryOperation::Query))
    }
}

fn store_error(operation: RepositoryOperation) -> impl Fn(sqlx::Error) -> RepositoryError {
    move |err| RepositoryError::from(err).with_operation(operation)
}

fn into_row(value: Value, operation: RepositoryOperation) -> RepositoryResult<Row> {
    match value {
        Value::Object(row) => Ok(row),
        other => Err(RepositoryError::serialization_error(
            operation,
            format!("expected a row object, got {}", other),
        )),
    }
}

/// Root key as the text form returned by the window query
fn key_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn column_sql(alias: &str, column: &str) -> String {
    format!("{}.{}", quote(alias), quote(column))
}

fn literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Bound value as text, cast server-side to the column type
fn bind_text(value: &Value, ty: ColumnType) -> Option<String> {
    match (value, ty) {
        (Value::Null, _) => None,
        (_, ColumnType::Json) => Some(value.to_string()),
        (Value::String(s), _) => Some(s.clone()),
        (other, _) => Some(other.to_string()),
    }
}

fn push_value(query: &mut Query, value: &Value, ty: ColumnType) {
    query
        .push("CAST(")
        .push_bind(bind_text(value, ty))
        .push(format!(" AS {})", ty.sql_type()));
}

fn push_list(query: &mut Query, values: &[Value], ty: ColumnType) {
    let values: Vec<String> = values.iter().filter_map(|v| bind_text(v, ty)).collect();
    query
        .push("CAST(")
        .push_bind(values)
        .push(format!(" AS {}[])", ty.sql_type()));
}

struct Render<'a> {
    model: &'static Model,
    scope: PlanScope<'a>,
}

impl<'a> Render<'a> {
    fn new(model: &'static Model, joins: &'a [JoinNode]) -> Self {
        Self {
            model,
            scope: PlanScope::new(model, joins),
        }
    }

    fn column(&self, column: &ColumnRef) -> String {
        column_sql(column.path.as_deref().unwrap_or(self.model.table), &column.name)
    }

    fn column_type(&self, column: &ColumnRef) -> ColumnType {
        self.scope
            .model_for(column.path.as_deref())
            .and_then(|m| m.column(&column.name))
            .map(|c| c.ty)
            .unwrap_or(ColumnType::Text)
    }

    fn root_key(&self) -> String {
        column_sql(self.model.table, self.model.primary_key)
    }

    fn push_predicate(&self, query: &mut Query, predicate: &Predicate) {
        match predicate {
            Predicate::All => {
                query.push("TRUE");
            }
            Predicate::And(items) => self.push_joined(query, items, " AND ", "TRUE"),
            Predicate::Or(items) => self.push_joined(query, items, " OR ", "FALSE"),
            Predicate::Column {
                column,
                constraints,
            } => {
                if constraints.is_empty() {
                    query.push("TRUE");
                    return;
                }
                let sql = self.column(column);
                let ty = self.column_type(column);
                if constraints.len() > 1 {
                    query.push("(");
                }
                for (index, constraint) in constraints.iter().enumerate() {
                    if index > 0 {
                        query.push(" AND ");
                    }
                    push_constraint(query, &sql, ty, constraint);
                }
                if constraints.len() > 1 {
                    query.push(")");
                }
            }
        }
    }

    fn push_joined(&self, query: &mut Query, items: &[Predicate], separator: &str, empty: &str) {
        if items.is_empty() {
            query.push(empty);
            return;
        }
        query.push("(");
        for (index, item) in items.iter().enumerate() {
            if index > 0 {
                query.push(separator);
            }
            self.push_predicate(query, item);
        }
        query.push(")");
    }

    fn push_where(&self, query: &mut Query, predicate: &Predicate, include_deleted: bool) {
        query.push(" WHERE ");
        self.push_predicate(query, predicate);
        if self.model.paranoid && !include_deleted {
            query.push(format!(
                " AND {} IS NULL",
                column_sql(self.model.table, DELETED_AT)
            ));
        }
    }

    fn order(&self, order: &[OrderTerm], aggregate: bool) -> String {
        let mut terms: Vec<String> = order
            .iter()
            .map(|term| {
                let column = self.column(&term.column);
                match (aggregate, term.direction) {
                    (false, direction) => format!("{} {}", column, direction),
                    (true, OrderDirection::Ascending) => format!("MIN({}) ASC", column),
                    (true, OrderDirection::Descending) => format!("MAX({}) DESC", column),
                }
            })
            .collect();
        terms.push(format!("{} ASC", self.root_key()));
        format!(" ORDER BY {}", terms.join(", "))
    }
}

fn push_constraint(query: &mut Query, column: &str, ty: ColumnType, constraint: &Constraint) {
    let compare = |query: &mut Query, op: &str, value: &Value| {
        query.push(format!("{} {} ", column, op));
        push_value(query, value, ty);
    };
    match constraint {
        Constraint::Eq(Value::Null) | Constraint::IsNull => {
            query.push(format!("{} IS NULL", column));
        }
        Constraint::Ne(Value::Null) => {
            query.push(format!("{} IS NOT NULL", column));
        }
        Constraint::Eq(value) => compare(query, "=", value),
        Constraint::Ne(value) => compare(query, "<>", value),
        Constraint::Lt(value) => compare(query, "<", value),
        Constraint::Lte(value) => compare(query, "<=", value),
        Constraint::Gt(value) => compare(query, ">", value),
        Constraint::Gte(value) => compare(query, ">=", value),
        Constraint::Like(pattern) => {
            query
                .push(format!("CAST({} AS text) LIKE ", column))
                .push_bind(pattern.clone());
        }
        Constraint::ILike(pattern) => {
            query
                .push(format!("CAST({} AS text) ILIKE ", column))
                .push_bind(pattern.clone());
        }
        Constraint::Between(low, high) => {
            query.push(format!("{} BETWEEN ", column));
            push_value(query, low, ty);
            query.push(" AND ");
            push_value(query, high, ty);
        }
        Constraint::In(values) | Constraint::Any(values) => {
            if values.is_empty() {
                query.push("FALSE");
            } else {
                query.push(format!("{} = ANY(", column));
                push_list(query, values, ty);
                query.push(")");
            }
        }
        Constraint::NotIn(values) => {
            if values.is_empty() {
                query.push(format!("{} IS NOT NULL", column));
            } else {
                query.push(format!("{} <> ALL(", column));
                push_list(query, values, ty);
                query.push(")");
            }
        }
        Constraint::DatePart { part, value } => {
            query.push(format!("date_part('{}', {}) = ", part.as_sql(), column));
            push_value(query, value, ColumnType::Float);
        }
    }
}

fn json_object(alias: &str, columns: &[String]) -> String {
    let pairs: Vec<String> = columns
        .iter()
        .map(|c| format!("{}, {}", literal(c), column_sql(alias, c)))
        .collect();
    format!("jsonb_build_object({})", pairs.join(", "))
}

fn join_clause(model: &'static Model, joins: &[JoinNode]) -> String {
    let flat = flatten(joins);
    let mut sql = String::new();
    for join in &flat {
        let node = join.node;
        let (parent_alias, parent_model) = match join.parent {
            0 => (model.table, model),
            parent => (flat[parent - 1].node.path.as_str(), flat[parent - 1].node.target()),
        };
        let kind = if node.required { " INNER JOIN " } else { " LEFT JOIN " };
        let target = node.target();
        let alias = node.path.as_str();

        match node.relation.kind {
            RelationKind::BelongsTo { foreign_key } => {
                sql.push_str(&format!(
                    "{}{} AS {} ON {} = {}",
                    kind,
                    quote(target.table),
                    quote(alias),
                    column_sql(alias, target.primary_key),
                    column_sql(parent_alias, foreign_key)
                ));
            }
            RelationKind::HasOne { foreign_key } | RelationKind::HasMany { foreign_key } => {
                sql.push_str(&format!(
                    "{}{} AS {} ON {} = {}",
                    kind,
                    quote(target.table),
                    quote(alias),
                    column_sql(alias, foreign_key),
                    column_sql(parent_alias, parent_model.primary_key)
                ));
            }
            RelationKind::BelongsToMany {
                through,
                source_key,
                target_key,
            } => {
                let pivot = format!("{}__pivot", alias);
                sql.push_str(&format!(
                    "{}{} AS {} ON {} = {}",
                    kind,
                    quote(through.table),
                    quote(&pivot),
                    column_sql(&pivot, source_key),
                    column_sql(parent_alias, parent_model.primary_key)
                ));
                if through.paranoid {
                    sql.push_str(&format!(" AND {} IS NULL", column_sql(&pivot, DELETED_AT)));
                }
                sql.push_str(&format!(
                    "{}{} AS {} ON {} = {}",
                    kind,
                    quote(target.table),
                    quote(alias),
                    column_sql(alias, target.primary_key),
                    column_sql(&pivot, target_key)
                ));
            }
        }
        if target.paranoid {
            sql.push_str(&format!(" AND {} IS NULL", column_sql(alias, DELETED_AT)));
        }
    }
    sql
}

fn insert_query(model: &'static Model, row: &Row, ignore_conflict: bool) -> Query {
    let columns: Vec<_> = model
        .columns
        .iter()
        .filter(|c| match row.get(c.name) {
            None => false,
            Some(Value::Null) => c.name != model.primary_key,
            Some(_) => true,
        })
        .collect();

    let mut query = Query::new(format!("INSERT INTO {}", quote(model.table)));
    if columns.is_empty() {
        query.push(" DEFAULT VALUES");
    } else {
        let names: Vec<String> = columns.iter().map(|c| quote(c.name)).collect();
        query.push(format!(" ({}) VALUES (", names.join(", ")));
        for (index, column) in columns.iter().enumerate() {
            if index > 0 {
                query.push(", ");
            }
            push_value(&mut query, row.get(column.name).unwrap_or(&Value::Null), column.ty);
        }
        query.push(")");
    }
    if ignore_conflict {
        query.push(" ON CONFLICT DO NOTHING");
    }
    query.push(format!(" RETURNING to_jsonb({}.*)", quote(model.table)));
    query
}

fn update_query(model: &'static Model, values: &Row, predicate: &Predicate) -> Query {
    let render = Render::new(model, &[]);
    let assignments: Vec<_> = model
        .columns
        .iter()
        .filter(|c| values.contains_key(c.name))
        .collect();

    if assignments.is_empty() {
        let mut query = Query::new(format!(
            "SELECT to_jsonb({}.*) FROM {}",
            quote(model.table),
            quote(model.table)
        ));
        render.push_where(&mut query, predicate, false);
        return query;
    }

    let mut query = Query::new(format!("UPDATE {} SET ", quote(model.table)));
    for (index, column) in assignments.iter().enumerate() {
        if index > 0 {
            query.push(", ");
        }
        query.push(format!("{} = ", quote(column.name)));
        push_value(&mut query, values.get(column.name).unwrap_or(&Value::Null), column.ty);
    }
    render.push_where(&mut query, predicate, false);
    query.push(format!(" RETURNING to_jsonb({}.*)", quote(model.table)));
    query
}

fn delete_query(model: &'static Model, predicate: &Predicate, soft: bool) -> Query {
    let render = Render::new(model, &[]);
    if soft {
        let mut query = Query::new(format!(
            "UPDATE {} SET {} = NOW()",
            quote(model.table),
            quote(DELETED_AT)
        ));
        render.push_where(&mut query, predicate, false);
        query
    } else {
        let mut query = Query::new(format!("DELETE FROM {}", quote(model.table)));
        render.push_where(&mut query, predicate, true);
        query
    }
}

/// Full select; `ids` restricts to a precomputed root window
fn select_query(plan: &SelectPlan, ids: Option<Vec<String>>) -> Query {
    let render = Render::new(plan.model, &plan.joins);
    let mut slots = vec![json_object(plan.model.table, &plan.columns)];
    for join in flatten(&plan.joins) {
        let target = join.node.target();
        slots.push(format!(
            "CASE WHEN {} IS NULL THEN NULL ELSE {} END",
            column_sql(&join.node.path, target.primary_key),
            json_object(&join.node.path, &join.node.columns)
        ));
    }

    let mut query = Query::new(format!(
        "SELECT {} FROM {}{}",
        slots.join(", "),
        quote(plan.model.table),
        join_clause(plan.model, &plan.joins)
    ));
    render.push_where(&mut query, &plan.predicate, plan.include_deleted);

    if let Some(ids) = ids {
        query.push(format!(" AND {} = ANY(CAST(", render.root_key()));
        query.push_bind(ids);
        query.push(format!(" AS {}[]))", plan.model.primary_key_type().sql_type()));
    }

    query.push(render.order(&plan.order, false));
    if let (Some(window), true) = (plan.window, plan.joins.is_empty()) {
        push_window(&mut query, window.limit, window.offset);
    }
    query
}

/// Root keys of one page, ordered by the plan's sort over joined rows
fn window_query(plan: &SelectPlan) -> Query {
    let render = Render::new(plan.model, &plan.joins);
    let mut query = Query::new(format!(
        "SELECT CAST({} AS text) FROM {}{}",
        render.root_key(),
        quote(plan.model.table),
        join_clause(plan.model, &plan.joins)
    ));
    render.push_where(&mut query, &plan.predicate, plan.include_deleted);
    query.push(format!(" GROUP BY {}", render.root_key()));
    query.push(render.order(&plan.order, true));
    if let Some(window) = plan.window {
        push_window(&mut query, window.limit, window.offset);
    }
    query
}

fn push_window(query: &mut Query, limit: u64, offset: u64) {
    query
        .push(" LIMIT ")
        .push_bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .push(" OFFSET ")
        .push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
}

fn count_query(plan: &CountPlan) -> Query {
    let render = Render::new(plan.model, &plan.joins);
    let labels: Vec<String> = plan
        .group
        .iter()
        .map(|(label, column)| format!("{}, {}", literal(label), render.column(column)))
        .collect();
    let counted = match (&plan.column, plan.distinct) {
        (Some(column), true) => format!("DISTINCT {}", render.column(column)),
        (Some(column), false) => render.column(column),
        (None, true) => format!("DISTINCT {}", render.root_key()),
        (None, false) => "*".to_string(),
    };

    let mut query = Query::new(format!(
        "SELECT jsonb_build_object({}), COUNT({}) FROM {}{}",
        labels.join(", "),
        counted,
        quote(plan.model.table),
        join_clause(plan.model, &plan.joins)
    ));
    render.push_where(&mut query, &plan.predicate, plan.include_deleted);
    if !plan.group.is_empty() {
        let grouped: Vec<String> = plan.group.iter().map(|(_, c)| render.column(c)).collect();
        query.push(format!(" GROUP BY {}", grouped.join(", ")));
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{resolve, DatePart, IncludeSpec, Pagination, ProjectionGroups};
    use crate::test_support::{PHONE, REGISTER};
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

    fn where_sql(predicate: Predicate) -> String {
        let render = Render::new(&REGISTER, &[]);
        let mut query = Query::new("");
        render.push_predicate(&mut query, &predicate);
        query.sql().to_string()
    }

    #[test]
    fn test_quote_escapes_identifiers() {
        assert_eq!(quote("name"), "\"name\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(literal("it's"), "'it''s'");
    }

    #[test]
    fn test_insert_sql() {
        let values = row(json!({"id": "p", "register_id": "r", "number": "555"}));
        let query = insert_query(&PHONE, &values, false);
        assert_eq!(
            query.sql(),
            "INSERT INTO \"register_phones\" (\"id\", \"register_id\", \"number\") \
             VALUES (CAST($1 AS uuid), CAST($2 AS uuid), CAST($3 AS text)) \
             RETURNING to_jsonb(\"register_phones\".*)"
        );

        let query = insert_query(&PHONE, &values, true);
        assert!(query.sql().contains(") ON CONFLICT DO NOTHING RETURNING"));
    }

    #[test]
    fn test_update_sql_excludes_soft_deleted() {
        let query = update_query(&REGISTER, &row(json!({"name": "Ada"})), &Predicate::eq("id", "r"));
        assert_eq!(
            query.sql(),
            "UPDATE \"registers\" SET \"name\" = CAST($1 AS text) \
             WHERE \"registers\".\"id\" = CAST($2 AS uuid) AND \"registers\".\"deleted_at\" IS NULL \
             RETURNING to_jsonb(\"registers\".*)"
        );
    }

    #[test]
    fn test_delete_sql() {
        let soft = delete_query(&REGISTER, &Predicate::eq("id", "r"), true);
        assert_eq!(
            soft.sql(),
            "UPDATE \"registers\" SET \"deleted_at\" = NOW() \
             WHERE \"registers\".\"id\" = CAST($1 AS uuid) AND \"registers\".\"deleted_at\" IS NULL"
        );

        let hard = delete_query(&REGISTER, &Predicate::eq("id", "r"), false);
        assert_eq!(
            hard.sql(),
            "DELETE FROM \"registers\" WHERE \"registers\".\"id\" = CAST($1 AS uuid)"
        );
    }

    #[test]
    fn test_constraint_rendering() {
        assert_eq!(
            where_sql(Predicate::column(ColumnRef::root("group_id"), Constraint::IsNull)),
            "\"registers\".\"group_id\" IS NULL"
        );
        assert_eq!(
            where_sql(Predicate::column(ColumnRef::root("group_id"), Constraint::Ne(Value::Null))),
            "\"registers\".\"group_id\" IS NOT NULL"
        );
        assert_eq!(
            where_sql(Predicate::column(ColumnRef::root("id"), Constraint::In(vec![]))),
            "FALSE"
        );
        assert_eq!(
            where_sql(Predicate::column(ColumnRef::root("id"), Constraint::In(vec![json!("a")]))),
            "\"registers\".\"id\" = ANY(CAST($1 AS uuid[]))"
        );
        assert_eq!(
            where_sql(Predicate::column(ColumnRef::root("name"), Constraint::ILike("%a%".into()))),
            "CAST(\"registers\".\"name\" AS text) ILIKE $1"
        );
        assert_eq!(
            where_sql(Predicate::column(
                ColumnRef::root("created_at"),
                Constraint::DatePart {
                    part: DatePart::IsoDow,
                    value: json!(1)
                }
            )),
            "date_part('isodow', \"registers\".\"created_at\") = CAST($1 AS double precision)"
        );
    }

    #[test]
    fn test_composite_predicate_rendering() {
        let predicate = Predicate::Or(vec![
            Predicate::Column {
                column: ColumnRef::root("age"),
                constraints: vec![Constraint::Gte(json!(18)), Constraint::Lt(json!(65))],
            },
            Predicate::eq("active", true),
        ]);
        assert_eq!(
            where_sql(predicate),
            "((\"registers\".\"age\" >= CAST($1 AS integer) AND \"registers\".\"age\" < CAST($2 AS integer)) \
             OR \"registers\".\"active\" = CAST($3 AS boolean))"
        );
        assert_eq!(where_sql(Predicate::All), "TRUE");
    }

    #[test]
    fn test_select_sql_with_joins() {
        let mut plan = SelectPlan::new(
            &REGISTER,
            Predicate::column(ColumnRef::parse("group.name"), Constraint::Eq(json!("Admins"))),
        );
        plan.columns = vec!["id".into(), "name".into()];
        plan.joins = joins(&["group", "groups"]);
        let sql = select_query(&plan, None).sql().to_string();

        assert!(sql.starts_with(
            "SELECT jsonb_build_object('id', \"registers\".\"id\", 'name', \"registers\".\"name\"), \
             CASE WHEN \"group\".\"id\" IS NULL THEN NULL ELSE jsonb_build_object("
        ));
        assert!(sql.contains(
            " LEFT JOIN \"groups\" AS \"group\" ON \"group\".\"id\" = \"registers\".\"group_id\" \
             AND \"group\".\"deleted_at\" IS NULL"
        ));
        assert!(sql.contains(
            " LEFT JOIN \"register_groups\" AS \"groups__pivot\" \
             ON \"groups__pivot\".\"register_id\" = \"registers\".\"id\" \
             LEFT JOIN \"groups\" AS \"groups\" ON \"groups\".\"id\" = \"groups__pivot\".\"group_id\""
        ));
        assert!(sql.contains(
            " WHERE \"group\".\"name\" = CAST($1 AS text) AND \"registers\".\"deleted_at\" IS NULL"
        ));
        assert!(sql.ends_with(" ORDER BY \"registers\".\"id\" ASC"));
    }

    #[test]
    fn test_required_join_is_inner() {
        let mut plan = SelectPlan::new(&REGISTER, Predicate::All);
        let mut nodes = joins(&["phones"]);
        nodes[0].required = true;
        plan.joins = nodes;
        let sql = select_query(&plan, None).sql().to_string();
        assert!(sql.contains(
            " INNER JOIN \"register_phones\" AS \"phones\" ON \"phones\".\"register_id\" = \"registers\".\"id\""
        ));
    }

    #[test]
    fn test_window_without_joins_uses_limit() {
        let mut plan = SelectPlan::new(&REGISTER, Predicate::All)
            .with_window(Some(Pagination::new(20, 10)));
        plan.order = vec![OrderTerm {
            column: ColumnRef::root("name"),
            direction: OrderDirection::Descending,
        }];
        let sql = select_query(&plan, None).sql().to_string();
        assert!(sql.ends_with(
            " ORDER BY \"registers\".\"name\" DESC, \"registers\".\"id\" ASC LIMIT $1 OFFSET $2"
        ));
    }

    #[test]
    fn test_window_with_joins_groups_root_keys() {
        let mut plan = SelectPlan::new(&REGISTER, Predicate::All)
            .with_window(Some(Pagination::new(0, 10)));
        plan.joins = joins(&["phones"]);
        plan.order = vec![OrderTerm {
            column: ColumnRef::parse("phones.number"),
            direction: OrderDirection::Descending,
        }];

        let window = window_query(&plan).sql().to_string();
        assert!(window.starts_with("SELECT CAST(\"registers\".\"id\" AS text) FROM \"registers\" LEFT JOIN"));
        assert!(window.ends_with(
            " GROUP BY \"registers\".\"id\" ORDER BY MAX(\"phones\".\"number\") DESC, \
             \"registers\".\"id\" ASC LIMIT $1 OFFSET $2"
        ));

        let page = select_query(&plan, Some(vec!["a".into()])).sql().to_string();
        assert!(page.contains(" AND \"registers\".\"id\" = ANY(CAST($1 AS uuid[])) ORDER BY"));
        assert!(!page.contains("LIMIT"));
    }

    #[test]
    fn test_count_sql() {
        let distinct = CountPlan {
            model: &REGISTER,
            joins: joins(&["phones"]),
            predicate: Predicate::All,
            include_deleted: false,
            distinct: true,
            column: None,
            group: Vec::new(),
        };
        assert_eq!(
            count_query(&distinct).sql(),
            "SELECT jsonb_build_object(), COUNT(DISTINCT \"registers\".\"id\") FROM \"registers\" \
             LEFT JOIN \"register_phones\" AS \"phones\" ON \"phones\".\"register_id\" = \"registers\".\"id\" \
             WHERE TRUE AND \"registers\".\"deleted_at\" IS NULL"
        );

        let grouped = CountPlan {
            model: &REGISTER,
            joins: Vec::new(),
            predicate: Predicate::All,
            include_deleted: true,
            distinct: false,
            column: None,
            group: vec![("registers.group_id".into(), ColumnRef::root("group_id"))],
        };
        assert_eq!(
            count_query(&grouped).sql(),
            "SELECT jsonb_build_object('registers.group_id', \"registers\".\"group_id\"), COUNT(*) \
             FROM \"registers\" WHERE TRUE GROUP BY \"registers\".\"group_id\""
        );
    }

    #[test]
    fn test_key_text_matches_window_output() {
        assert_eq!(key_text(&json!("abc")), "abc");
        assert_eq!(key_text(&json!(42)), "42");
    }
}
