//! The generic CRUD engine
//!
//! Every mutating call opens exactly one store transaction. In-transaction
//! hooks and all rows of a batch share it, so a failure anywhere rolls the
//! whole call back. Reads also run inside a (read-only in practice)
//! transaction so that a page and its total see the same snapshot.
//!
//! Preconditions (identifier present, tenant context available, match
//! criteria given) are checked before the store is touched.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use super::hooks::{CommitEvent, NoHooks, RepositoryHooks};
use super::tenancy::{self, Scope, TenancyPolicy, TenantContext};
use super::{RepositoryError, RepositoryOperation, RepositoryResult};
use crate::config::RepositoryConfig;
use crate::model::{
    timestamp_now, ColumnType, Entity, Model, Row, CREATED_AT, DELETED_AT, UPDATED_AT,
};
use crate::query::{
    compile, group_select, resolve, root_columns, ColumnRef, Constraint, CountOptions,
    FilterMatrix, FindOptions, Paginated, Pagination, Predicate, ProjectionGroups, QueryOptions,
    SortSpec,
};
use crate::store::{CountPlan, CountRow, PlanScope, SelectPlan, Store, StoreTx};

/// How [`Repository::find_or_create`] avoids duplicate inserts
///
/// - `Atomic`: find, `INSERT ... ON CONFLICT DO NOTHING`, find again, all in
///   one transaction. Requires a unique key covering the match criteria.
/// - `FindCreateFind`: find; create in a separate transaction; on a unique
///   violation read the row the concurrent writer inserted. A row deleted
///   between the failed insert and the second read surfaces the violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindOrCreateStrategy {
    /// Lookup and insert share one transaction
    #[default]
    Atomic,
    /// Not atomic: the lookup and the insert run in separate transactions
    FindCreateFind,
}

/// Options for [`Repository::update`]
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Field identifying the row; the primary key when unset
    pub identifier: Option<String>,
    /// Replaces the default `identifier = value` predicate
    pub predicate: Option<Predicate>,
}

impl UpdateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn by(mut self, field: impl Into<String>) -> Self {
        self.identifier = Some(field.into());
        self
    }

    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

/// Options for [`Repository::delete`] and [`Repository::delete_many`]
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Extra condition ANDed with the identifier
    pub predicate: Option<Predicate>,
    /// Remove rows even when the model is paranoid
    pub force: bool,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    #[must_use]
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// What to delete: an identifier, or an entity whose identifier is read
#[derive(Debug, Clone)]
pub enum Target<E> {
    Id(Value),
    Entity(E),
}

impl<E: Entity> Target<E> {
    fn identifier(&self) -> RepositoryResult<Option<Value>> {
        match self {
            Self::Id(Value::Null) => Ok(None),
            Self::Id(id) => Ok(Some(id.clone())),
            Self::Entity(entity) => entity.identifier(),
        }
    }
}

impl<E> From<Uuid> for Target<E> {
    fn from(id: Uuid) -> Self {
        Self::Id(Value::String(id.to_string()))
    }
}

/// Commit on success, roll back on failure
pub(crate) async fn settle<T, X: StoreTx>(tx: X, result: RepositoryResult<T>) -> RepositoryResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

async fn select_and_count<X: StoreTx>(
    tx: &mut X,
    plan: &SelectPlan,
    count: &CountPlan,
) -> RepositoryResult<(Vec<Row>, u64)> {
    let rows = tx.select(plan).await?;
    let total = tx.count(count).await?.first().map_or(0, |row| row.count);
    Ok((rows, total))
}

fn is_unset(row: &Row, key: &str) -> bool {
    row.get(key).map_or(true, Value::is_null)
}

fn describe(predicate: &Predicate) -> String {
    format!("{:?}", predicate)
}

/// Repository for one entity type over a store
pub struct Repository<E, S, H = NoHooks> {
    store: S,
    hooks: H,
    tenancy: TenancyPolicy,
    config: RepositoryConfig,
    default_order: SortSpec,
    entity: PhantomData<fn() -> E>,
}

impl<E: Entity, S: Store> Repository<E, S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            hooks: NoHooks,
            tenancy: TenancyPolicy::default(),
            config: RepositoryConfig::default(),
            default_order: SortSpec::default(),
            entity: PhantomData,
        }
    }
}

impl<E, S, H> Repository<E, S, H>
where
    E: Entity,
    S: Store,
    H: RepositoryHooks<E>,
{
    #[must_use]
    pub fn with_hooks<H2: RepositoryHooks<E>>(self, hooks: H2) -> Repository<E, S, H2> {
        Repository {
            store: self.store,
            hooks,
            tenancy: self.tenancy,
            config: self.config,
            default_order: self.default_order,
            entity: PhantomData,
        }
    }

    #[must_use]
    pub fn with_tenancy(mut self, policy: TenancyPolicy) -> Self {
        self.tenancy = policy;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Sort used by reads that do not specify one
    #[must_use]
    pub fn with_default_order(mut self, order: SortSpec) -> Self {
        self.default_order = order;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn model(&self) -> &'static Model {
        E::model()
    }

    pub(crate) async fn begin(&self) -> RepositoryResult<S::Tx> {
        self.store.begin().await
    }

    pub(crate) async fn committed(&self, ctx: &TenantContext, event: CommitEvent<'_, E>) {
        tracing::debug!(model = E::model().name, event = event.kind(), "committed");
        self.hooks.after_commit(ctx, event).await;
    }

    fn tenant(
        &self,
        scope: Scope,
        operation: RepositoryOperation,
        ctx: &TenantContext,
    ) -> RepositoryResult<Predicate> {
        tenancy::predicate(E::model(), &self.tenancy, scope, operation, ctx)
    }

    // ---- create ----------------------------------------------------------

    fn insert_row(&self, ctx: &TenantContext, entity: &E) -> RepositoryResult<Row> {
        let model = E::model();
        let mut row = model.writable_row(entity.to_row()?);
        if is_unset(&row, model.primary_key) && model.primary_key_type() == ColumnType::Uuid {
            row.insert(
                model.primary_key.to_string(),
                Value::String(Uuid::now_v7().to_string()),
            );
        }
        if model.timestamps {
            let now = timestamp_now();
            if is_unset(&row, CREATED_AT) {
                row.insert(CREATED_AT.to_string(), now.clone());
            }
            row.insert(UPDATED_AT.to_string(), now);
        }
        row.remove(DELETED_AT);
        tenancy::stamp(
            model,
            &self.tenancy,
            Scope::Save,
            RepositoryOperation::Create,
            ctx,
            &mut row,
        )?;
        Ok(row)
    }

    pub(crate) async fn create_in(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        mut entity: E,
    ) -> RepositoryResult<E> {
        self.hooks.before_create(ctx, &mut entity).await?;
        let row = self.insert_row(ctx, &entity)?;
        let created = E::from_row(tx.insert(E::model(), row).await?)?;
        self.hooks.after_create(ctx, &created).await?;
        Ok(created)
    }

    pub(crate) async fn create_many_in(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        entities: Vec<E>,
    ) -> RepositoryResult<Vec<E>> {
        let mut created = Vec::with_capacity(entities.len());
        for entity in entities {
            created.push(self.create_in(tx, ctx, entity).await?);
        }
        Ok(created)
    }

    /// Insert one entity
    #[instrument(skip_all, fields(model = E::model().name), err)]
    pub async fn create(&self, ctx: &TenantContext, entity: E) -> RepositoryResult<E> {
        self.tenant(Scope::Save, RepositoryOperation::Create, ctx)?;
        let mut tx = self.begin().await?;
        let result = self.create_in(&mut tx, ctx, entity).await;
        let created = settle(tx, result).await?;
        self.committed(ctx, CommitEvent::Created(std::slice::from_ref(&created)))
            .await;
        Ok(created)
    }

    /// Insert a batch in one transaction; any failure inserts nothing
    #[instrument(skip_all, fields(model = E::model().name, count = entities.len()), err)]
    pub async fn create_many(&self, ctx: &TenantContext, entities: Vec<E>) -> RepositoryResult<Vec<E>> {
        self.tenant(Scope::Save, RepositoryOperation::CreateMany, ctx)?;
        let mut tx = self.begin().await?;
        let result = self.create_many_in(&mut tx, ctx, entities).await;
        let created = settle(tx, result)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::CreateMany))?;
        self.committed(ctx, CommitEvent::Created(&created)).await;
        Ok(created)
    }

    /// Find the row matching `fields` of `entity`, inserting it when absent
    ///
    /// Returns the entity and whether it was created. Uses the configured
    /// [`FindOrCreateStrategy`].
    pub async fn find_or_create(
        &self,
        ctx: &TenantContext,
        entity: E,
        fields: &[&str],
    ) -> RepositoryResult<(E, bool)> {
        self.find_or_create_with(ctx, entity, fields, self.config.find_or_create)
            .await
    }

    #[instrument(skip(self, ctx, entity), fields(model = E::model().name), err)]
    pub async fn find_or_create_with(
        &self,
        ctx: &TenantContext,
        entity: E,
        fields: &[&str],
        strategy: FindOrCreateStrategy,
    ) -> RepositoryResult<(E, bool)> {
        let model = E::model();
        if fields.is_empty() {
            return Err(RepositoryError::configuration(
                RepositoryOperation::FindOrCreate,
                "find_or_create requires match criteria",
            ));
        }
        self.tenant(Scope::Save, RepositoryOperation::FindOrCreate, ctx)?;

        let row = model.writable_row(entity.to_row()?);
        let criteria = fields
            .iter()
            .map(|field| {
                let constraint = match row.get(*field) {
                    None | Some(Value::Null) => Constraint::IsNull,
                    Some(value) => Constraint::Eq(value.clone()),
                };
                Predicate::column(ColumnRef::root(*field), constraint)
            })
            .fold(Predicate::All, Predicate::and);
        let plan = self.select_plan(
            ctx,
            Scope::Find,
            RepositoryOperation::FindOrCreate,
            criteria,
            &FindOptions::default(),
            Some(Pagination::first_page(1)),
        )?;

        match strategy {
            FindOrCreateStrategy::Atomic => {
                let mut tx = self.begin().await?;
                let result = self.find_or_insert_in(&mut tx, ctx, entity, &plan).await;
                let (found, created) = settle(tx, result)
                    .await
                    .map_err(|e| e.with_operation(RepositoryOperation::FindOrCreate))?;
                if created {
                    self.committed(ctx, CommitEvent::Created(std::slice::from_ref(&found)))
                        .await;
                }
                Ok((found, created))
            }
            FindOrCreateStrategy::FindCreateFind => {
                if let Some(found) = self.select(plan.clone()).await?.into_iter().next() {
                    return Ok((found, false));
                }
                match self.create(ctx, entity).await {
                    Ok(created) => Ok((created, true)),
                    Err(err) if err.is_unique_violation() => {
                        tracing::debug!(model = model.name, "insert lost a race, reading the winner");
                        match self.select(plan).await?.into_iter().next() {
                            Some(found) => Ok((found, false)),
                            None => Err(err.with_operation(RepositoryOperation::FindOrCreate)),
                        }
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn find_or_insert_in(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        mut entity: E,
        plan: &SelectPlan,
    ) -> RepositoryResult<(E, bool)> {
        if let Some(row) = tx.select(plan).await?.into_iter().next() {
            return Ok((E::from_row(row)?, false));
        }
        self.hooks.before_create(ctx, &mut entity).await?;
        let row = self.insert_row(ctx, &entity)?;
        match tx.insert_if_absent(E::model(), row).await? {
            Some(stored) => {
                let created = E::from_row(stored)?;
                self.hooks.after_create(ctx, &created).await?;
                Ok((created, true))
            }
            None => match tx.select(plan).await?.into_iter().next() {
                Some(row) => Ok((E::from_row(row)?, false)),
                None => Err(RepositoryError::already_exists(
                    E::model().name,
                    describe(&plan.predicate),
                )),
            },
        }
    }

    // ---- update ----------------------------------------------------------

    /// Run the before-update hook and read the identifier it leaves behind
    pub(crate) async fn prepare_update(
        &self,
        ctx: &TenantContext,
        mut entity: E,
        field: &str,
        operation: RepositoryOperation,
    ) -> RepositoryResult<(E, Value)> {
        self.hooks.before_update(ctx, &mut entity).await?;
        let id = entity
            .to_row()?
            .get(field)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                RepositoryError::not_found(E::model().name, format!("{} is not set", field))
                    .with_operation(operation)
            })?;
        Ok((entity, id))
    }

    /// Write an entity into the rows matching `predicate` (tenant scope added)
    pub(crate) async fn update_in(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        entity: E,
        predicate: Predicate,
    ) -> RepositoryResult<E> {
        let model = E::model();
        let mut values = model.writable_row(entity.to_row()?);
        values.remove(model.primary_key);
        values.remove(CREATED_AT);
        values.remove(DELETED_AT);
        if model.timestamps {
            values.insert(UPDATED_AT.to_string(), timestamp_now());
        }
        tenancy::stamp(
            model,
            &self.tenancy,
            Scope::Update,
            RepositoryOperation::Update,
            ctx,
            &mut values,
        )?;

        let tenant = self.tenant(Scope::Update, RepositoryOperation::Update, ctx)?;
        let predicate = PlanScope::new(model, &[]).validate(predicate.and(tenant))?;
        let Some(row) = tx.update(model, values, &predicate).await?.into_iter().next() else {
            return Err(RepositoryError::not_found(model.name, describe(&predicate))
                .with_operation(RepositoryOperation::Update));
        };

        let row = if self.config.refetch_after_update {
            let key = row.get(model.primary_key).cloned().unwrap_or(Value::Null);
            let plan = SelectPlan::new(model, Predicate::eq(model.primary_key, key.clone()));
            tx.select(&plan).await?.into_iter().next().ok_or_else(|| {
                RepositoryError::not_found(model.name, format!("{}={}", model.primary_key, key))
                    .with_operation(RepositoryOperation::Update)
            })?
        } else {
            row
        };

        let updated = E::from_row(row)?;
        self.hooks.after_update(ctx, &updated).await?;
        Ok(updated)
    }

    fn identifier_field<'a>(&self, options: &'a UpdateOptions) -> RepositoryResult<&'a str> {
        match options.identifier.as_deref() {
            Some("") => Err(RepositoryError::configuration(
                RepositoryOperation::Update,
                "update requires a non-empty identifier field",
            )),
            Some(field) => Ok(field),
            None => Ok(E::model().primary_key),
        }
    }

    /// Update one entity identified by `options.identifier` (primary key by default)
    ///
    /// Fails with `NotFound` before touching the store when the identifier is
    /// unset, and after the write when no row matched.
    #[instrument(skip_all, fields(model = E::model().name), err)]
    pub async fn update(
        &self,
        ctx: &TenantContext,
        entity: E,
        options: &UpdateOptions,
    ) -> RepositoryResult<E> {
        let field = self.identifier_field(options)?;
        let (entity, id) = self
            .prepare_update(ctx, entity, field, RepositoryOperation::Update)
            .await?;
        self.tenant(Scope::Update, RepositoryOperation::Update, ctx)?;
        let predicate = options
            .predicate
            .clone()
            .unwrap_or_else(|| Predicate::eq(field, id));

        let mut tx = self.begin().await?;
        let result = self.update_in(&mut tx, ctx, entity, predicate).await;
        let updated = settle(tx, result).await?;
        self.committed(ctx, CommitEvent::Updated(std::slice::from_ref(&updated)))
            .await;
        Ok(updated)
    }

    /// Update a batch by primary key in one transaction
    ///
    /// A missing identifier or a row that no longer matches aborts the batch
    /// with `NotFound` and nothing is written.
    #[instrument(skip_all, fields(model = E::model().name, count = entities.len()), err)]
    pub async fn update_many(&self, ctx: &TenantContext, entities: Vec<E>) -> RepositoryResult<Vec<E>> {
        let key = E::model().primary_key;
        let mut prepared = Vec::with_capacity(entities.len());
        for entity in entities {
            prepared.push(
                self.prepare_update(ctx, entity, key, RepositoryOperation::UpdateMany)
                    .await?,
            );
        }
        self.tenant(Scope::Update, RepositoryOperation::UpdateMany, ctx)?;

        let mut tx = self.begin().await?;
        let result = self.update_each_in(&mut tx, ctx, prepared).await;
        let updated = settle(tx, result)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::UpdateMany))?;
        self.committed(ctx, CommitEvent::Updated(&updated)).await;
        Ok(updated)
    }

    pub(crate) async fn update_each_in(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        prepared: Vec<(E, Value)>,
    ) -> RepositoryResult<Vec<E>> {
        let key = E::model().primary_key;
        let mut updated = Vec::with_capacity(prepared.len());
        for (entity, id) in prepared {
            updated.push(self.update_in(tx, ctx, entity, Predicate::eq(key, id)).await?);
        }
        Ok(updated)
    }

    /// Apply `patch` to every row matching `filter`, one row at a time
    ///
    /// Each row goes through the same hooks and tenancy as a single update.
    #[instrument(skip_all, fields(model = E::model().name), err)]
    pub async fn update_all(
        &self,
        ctx: &TenantContext,
        patch: Row,
        filter: &FilterMatrix,
    ) -> RepositoryResult<Vec<E>> {
        let plan = self.select_plan(
            ctx,
            Scope::Update,
            RepositoryOperation::UpdateAll,
            compile(filter)?,
            &FindOptions::default(),
            None,
        )?;

        let mut tx = self.begin().await?;
        let result = self.update_all_in(&mut tx, ctx, &plan, &patch).await;
        let updated = settle(tx, result)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::UpdateAll))?;
        if !updated.is_empty() {
            self.committed(ctx, CommitEvent::Updated(&updated)).await;
        }
        Ok(updated)
    }

    async fn update_all_in(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        plan: &SelectPlan,
        patch: &Row,
    ) -> RepositoryResult<Vec<E>> {
        let key = E::model().primary_key;
        let mut prepared = Vec::new();
        for mut row in tx.select(plan).await? {
            row.extend(patch.clone());
            let entity = E::from_row(row)?;
            prepared.push(
                self.prepare_update(ctx, entity, key, RepositoryOperation::UpdateAll)
                    .await?,
            );
        }
        self.update_each_in(tx, ctx, prepared).await
    }

    // ---- delete ----------------------------------------------------------

    /// Delete rows matching `predicate` (tenant scope added); soft for
    /// paranoid models unless `force`
    pub(crate) async fn delete_where_in(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        predicate: Predicate,
        force: bool,
        strict: bool,
    ) -> RepositoryResult<u64> {
        let model = E::model();
        let tenant = self.tenant(Scope::Delete, RepositoryOperation::Delete, ctx)?;
        let predicate = PlanScope::new(model, &[]).validate(predicate.and(tenant))?;
        self.hooks.before_delete(ctx, &predicate).await?;
        let deleted = tx.delete(model, &predicate, model.paranoid && !force).await?;
        if deleted == 0 && strict {
            return Err(RepositoryError::not_found(model.name, describe(&predicate))
                .with_operation(RepositoryOperation::Delete));
        }
        self.hooks.after_delete(ctx, &predicate, deleted).await?;
        Ok(deleted)
    }

    fn target_predicate(target: &Target<E>, options: &DeleteOptions) -> RepositoryResult<Option<Predicate>> {
        let Some(id) = target.identifier()? else {
            tracing::debug!(model = E::model().name, "skipping delete target without identifier");
            return Ok(None);
        };
        let predicate = Predicate::eq(E::model().primary_key, id);
        Ok(Some(match &options.predicate {
            Some(extra) => predicate.and(extra.clone()),
            None => predicate,
        }))
    }

    /// Delete one row; returns the number of rows affected
    ///
    /// A target without an identifier is skipped and returns 0. Otherwise,
    /// with `strict`, deleting nothing is `NotFound`; without it returns 0.
    #[instrument(skip_all, fields(model = E::model().name, strict = strict), err)]
    pub async fn delete(
        &self,
        ctx: &TenantContext,
        target: Target<E>,
        options: &DeleteOptions,
        strict: bool,
    ) -> RepositoryResult<u64> {
        self.tenant(Scope::Delete, RepositoryOperation::Delete, ctx)?;
        let Some(predicate) = Self::target_predicate(&target, options)? else {
            return Ok(0);
        };

        let mut tx = self.begin().await?;
        let result = self
            .delete_where_in(&mut tx, ctx, predicate, options.force, strict)
            .await;
        let deleted = settle(tx, result).await?;
        if deleted > 0 {
            self.committed(ctx, CommitEvent::Deleted { count: deleted }).await;
        }
        Ok(deleted)
    }

    /// Delete a batch in one transaction; targets without an identifier are skipped
    #[instrument(skip_all, fields(model = E::model().name, count = targets.len(), strict = strict), err)]
    pub async fn delete_many(
        &self,
        ctx: &TenantContext,
        targets: Vec<Target<E>>,
        options: &DeleteOptions,
        strict: bool,
    ) -> RepositoryResult<u64> {
        self.tenant(Scope::Delete, RepositoryOperation::DeleteMany, ctx)?;
        let mut predicates = Vec::with_capacity(targets.len());
        for target in &targets {
            if let Some(predicate) = Self::target_predicate(target, options)? {
                predicates.push(predicate);
            }
        }
        if predicates.is_empty() {
            return Ok(0);
        }

        let mut tx = self.begin().await?;
        let result = self
            .delete_each_in(&mut tx, ctx, predicates, options.force, strict)
            .await;
        let deleted = settle(tx, result)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::DeleteMany))?;
        if deleted > 0 {
            self.committed(ctx, CommitEvent::Deleted { count: deleted }).await;
        }
        Ok(deleted)
    }

    async fn delete_each_in(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        predicates: Vec<Predicate>,
        force: bool,
        strict: bool,
    ) -> RepositoryResult<u64> {
        let mut deleted = 0;
        for predicate in predicates {
            deleted += self.delete_where_in(tx, ctx, predicate, force, strict).await?;
        }
        Ok(deleted)
    }

    // ---- read ------------------------------------------------------------

    fn select_plan(
        &self,
        ctx: &TenantContext,
        scope: Scope,
        operation: RepositoryOperation,
        predicate: Predicate,
        options: &FindOptions,
        window: Option<Pagination>,
    ) -> RepositoryResult<SelectPlan> {
        let model = E::model();
        let projections = group_select(&options.select)?;
        let joins = resolve(&options.include, model, &projections, self.config.strict_includes)?;
        let columns = root_columns(model, &projections)?;
        let tenant = self.tenant(scope, operation, ctx)?;

        let plan_scope = PlanScope::new(model, &joins);
        let predicate = plan_scope.validate(predicate.and(tenant))?;
        let sort = if options.sort.is_empty() {
            &self.default_order
        } else {
            &options.sort
        };
        let order = plan_scope.order(sort)?;
        tracing::debug!(model = model.name, predicate = ?predicate, "compiled select");

        Ok(SelectPlan {
            model,
            columns,
            joins,
            predicate,
            order,
            window,
            include_deleted: options.include_deleted,
        })
    }

    async fn select(&self, plan: SelectPlan) -> RepositoryResult<Vec<E>> {
        let mut tx = self.begin().await?;
        let result = tx.select(&plan).await;
        settle(tx, result)
            .await?
            .into_iter()
            .map(E::from_row)
            .collect()
    }

    async fn first(
        &self,
        plan: SelectPlan,
        strict: bool,
        criteria: impl FnOnce() -> String,
    ) -> RepositoryResult<Option<E>> {
        match self.select(plan).await?.into_iter().next() {
            Some(found) => Ok(Some(found)),
            None if strict => Err(RepositoryError::not_found(E::model().name, criteria())),
            None => Ok(None),
        }
    }

    /// Look up by primary key; `NotFound` when absent and `strict`
    #[instrument(skip_all, fields(model = E::model().name, strict = strict), err)]
    pub async fn find_one_or_fail(
        &self,
        ctx: &TenantContext,
        id: impl Serialize,
        options: &FindOptions,
        strict: bool,
    ) -> RepositoryResult<Option<E>> {
        let key = E::model().primary_key;
        let id = serde_json::to_value(id)?;
        let plan = self.select_plan(
            ctx,
            Scope::Find,
            RepositoryOperation::Find,
            Predicate::eq(key, id.clone()),
            options,
            Some(Pagination::first_page(1)),
        )?;
        self.first(plan, strict, || format!("{}={}", key, id)).await
    }

    /// Look up by an engine-native predicate, bypassing the filter matrix
    #[instrument(skip_all, fields(model = E::model().name, strict = strict), err)]
    pub async fn find_by(
        &self,
        ctx: &TenantContext,
        predicate: Predicate,
        options: &FindOptions,
        strict: bool,
    ) -> RepositoryResult<Option<E>> {
        let criteria = describe(&predicate);
        let plan = self.select_plan(
            ctx,
            Scope::Find,
            RepositoryOperation::Find,
            predicate,
            options,
            Some(Pagination::first_page(1)),
        )?;
        self.first(plan, strict, || criteria).await
    }

    /// First row matching the query
    #[instrument(skip_all, fields(model = E::model().name, strict = strict), err)]
    pub async fn find(
        &self,
        ctx: &TenantContext,
        query: &QueryOptions,
        strict: bool,
    ) -> RepositoryResult<Option<E>> {
        let predicate = compile(&query.filter)?;
        let criteria = describe(&predicate);
        let plan = self.select_plan(
            ctx,
            Scope::Find,
            RepositoryOperation::Find,
            predicate,
            &query.find_options(),
            Some(Pagination::first_page(1)),
        )?;
        self.first(plan, strict, || criteria).await
    }

    /// All rows matching the query, paged when `limit` is set
    #[instrument(skip_all, fields(model = E::model().name), err)]
    pub async fn query(&self, ctx: &TenantContext, query: &QueryOptions) -> RepositoryResult<Vec<E>> {
        let plan = self.select_plan(
            ctx,
            Scope::Find,
            RepositoryOperation::Query,
            compile(&query.filter)?,
            &query.find_options(),
            query.pagination(),
        )?;
        self.select(plan).await
    }

    /// One page plus the total over the unpaged filter
    ///
    /// With includes, the total counts distinct root rows.
    #[instrument(skip_all, fields(model = E::model().name), err)]
    pub async fn paginated_query(
        &self,
        ctx: &TenantContext,
        query: &QueryOptions,
    ) -> RepositoryResult<Paginated<E>> {
        let plan = self.select_plan(
            ctx,
            Scope::Find,
            RepositoryOperation::Query,
            compile(&query.filter)?,
            &query.find_options(),
            query.pagination(),
        )?;
        let count = CountPlan {
            model: plan.model,
            joins: plan.joins.clone(),
            predicate: plan.predicate.clone(),
            include_deleted: plan.include_deleted,
            distinct: !plan.joins.is_empty(),
            column: None,
            group: Vec::new(),
        };

        let mut tx = self.begin().await?;
        let result = select_and_count(&mut tx, &plan, &count).await;
        let (rows, total_count) = settle(tx, result).await?;
        Ok(Paginated {
            rows: rows
                .into_iter()
                .map(E::from_row)
                .collect::<RepositoryResult<_>>()?,
            total_count,
        })
    }

    /// Count of the first group, or the plain count when ungrouped
    pub async fn count(&self, ctx: &TenantContext, options: &CountOptions) -> RepositoryResult<u64> {
        Ok(self
            .count_grouped(ctx, options)
            .await?
            .first()
            .map_or(0, |row| row.count))
    }

    /// Every group of a count
    ///
    /// Unqualified group columns are labelled with the base table
    /// (`registers.group_id`).
    #[instrument(skip_all, fields(model = E::model().name), err)]
    pub async fn count_grouped(
        &self,
        ctx: &TenantContext,
        options: &CountOptions,
    ) -> RepositoryResult<Vec<CountRow>> {
        let model = E::model();
        let joins = resolve(
            &options.include,
            model,
            &ProjectionGroups::default(),
            self.config.strict_includes,
        )?;
        let tenant = self.tenant(Scope::Find, RepositoryOperation::Count, ctx)?;

        let scope = PlanScope::new(model, &joins);
        let predicate = scope.validate(compile(&options.filter)?.and(tenant))?;
        let column = options
            .col
            .as_deref()
            .map(|col| scope.check(&ColumnRef::parse(col)))
            .transpose()?;
        let group = options
            .group
            .iter()
            .map(|name| {
                let column = ColumnRef::parse(name);
                let label = if column.is_root() {
                    format!("{}.{}", model.table, column.name)
                } else {
                    name.clone()
                };
                Ok((label, scope.check(&column)?))
            })
            .collect::<RepositoryResult<Vec<_>>>()?;

        let plan = CountPlan {
            model,
            joins,
            predicate,
            include_deleted: options.include_deleted,
            distinct: options.distinct,
            column,
            group,
        };
        let mut tx = self.begin().await?;
        let result = tx.count(&plan).await;
        settle(tx, result).await
    }
}
