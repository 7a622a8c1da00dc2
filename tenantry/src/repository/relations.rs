//! Keeping related rows in step with a parent
//!
//! [`PivotRepository`] maintains a many-to-many pivot (attach, detach, sync)
//! and [`DependentRepository`] maintains one-to-many children owned by a
//! parent. Both delegate to [`Repository`] so hooks and tenancy apply, and
//! each sync runs in a single transaction.
//!
//! The set arithmetic lives in [`diff_attachments`] and [`diff_children`].

use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

use super::core::{settle, Repository};
use super::hooks::{CommitEvent, NoHooks, RepositoryHooks};
use super::tenancy::TenantContext;
use super::{RepositoryError, RepositoryOperation, RepositoryResult};
use crate::model::{Entity, Relation, RelationKind, Row};
use crate::query::Predicate;
use crate::store::Store;

/// Pivot changes that turn `current` into `expected`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentDiff {
    pub attach: Vec<Value>,
    pub detach: Vec<Value>,
}

/// Compare two identifier sets, keeping first-appearance order
pub fn diff_attachments(current: &[Value], expected: &[Value]) -> AttachmentDiff {
    let current_keys: HashSet<String> = current.iter().map(Value::to_string).collect();
    let expected_keys: HashSet<String> = expected.iter().map(Value::to_string).collect();

    let mut seen = HashSet::new();
    let detach = current
        .iter()
        .filter(|id| !expected_keys.contains(&id.to_string()) && seen.insert(id.to_string()))
        .cloned()
        .collect();
    let attach = expected
        .iter()
        .filter(|id| !current_keys.contains(&id.to_string()) && seen.insert(id.to_string()))
        .cloned()
        .collect();
    AttachmentDiff { attach, detach }
}

/// Child changes that turn `current` into `expected`
#[derive(Debug, Clone, PartialEq)]
pub struct ChildrenDiff<T> {
    /// Expected children without an identifier or with one not in `current`
    pub create: Vec<T>,
    /// Expected children whose identifier is in `current`
    pub update: Vec<T>,
    /// Current children whose identifier is not expected
    pub delete: Vec<T>,
}

/// Partition children by identity; items of `current` without one are ignored
pub fn diff_children<T, K>(current: &[T], expected: &[T], key: K) -> ChildrenDiff<T>
where
    T: Clone,
    K: Fn(&T) -> Option<Value>,
{
    let current_keys: HashSet<String> = current
        .iter()
        .filter_map(|c| key(c).map(|k| k.to_string()))
        .collect();
    let expected_keys: HashSet<String> = expected
        .iter()
        .filter_map(|c| key(c).map(|k| k.to_string()))
        .collect();

    let delete = current
        .iter()
        .filter(|c| key(c).is_some_and(|k| !expected_keys.contains(&k.to_string())))
        .cloned()
        .collect();

    let (update, create): (Vec<T>, Vec<T>) = expected
        .iter()
        .cloned()
        .partition(|c| key(c).is_some_and(|k| current_keys.contains(&k.to_string())));

    ChildrenDiff {
        create,
        update,
        delete,
    }
}

fn identifiers<R: Serialize>(items: &[R], field: &str) -> RepositoryResult<Vec<Value>> {
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        if let Some(id) = serde_json::to_value(item)?
            .get(field)
            .filter(|id| !id.is_null())
        {
            ids.push(id.clone());
        }
    }
    Ok(ids)
}

/// Result of [`PivotRepository::sync`]
#[derive(Debug, Clone, PartialEq)]
pub struct PivotSync<P> {
    pub attached: Vec<P>,
    pub detached: u64,
}

/// Attach, detach and sync rows of a many-to-many pivot for one owner
pub struct PivotRepository<P, S, H = NoHooks> {
    repository: Repository<P, S, H>,
    /// Pivot column holding the owner id
    source_key: &'static str,
    /// Pivot column holding the related id
    target_key: &'static str,
    /// Field read from related items
    identifier: &'static str,
}

impl<P, S, H> PivotRepository<P, S, H>
where
    P: Entity,
    S: Store,
    H: RepositoryHooks<P>,
{
    pub fn new(
        repository: Repository<P, S, H>,
        source_key: &'static str,
        target_key: &'static str,
    ) -> Self {
        Self {
            repository,
            source_key,
            target_key,
            identifier: "id",
        }
    }

    /// Pivot for a `BelongsToMany` relation declared on the owner model
    pub fn for_relation(
        repository: Repository<P, S, H>,
        relation: &'static Relation,
    ) -> RepositoryResult<Self> {
        match relation.kind {
            RelationKind::BelongsToMany {
                through,
                source_key,
                target_key,
            } if through.table == P::model().table => {
                Ok(Self::new(repository, source_key, target_key))
            }
            _ => Err(RepositoryError::configuration(
                RepositoryOperation::Sync,
                format!(
                    "relation `{}` is not a many-to-many through {}",
                    relation.name,
                    P::model().name
                ),
            )),
        }
    }

    /// Read related identities from `field` instead of `id`
    #[must_use]
    pub fn with_identifier(mut self, field: &'static str) -> Self {
        self.identifier = field;
        self
    }

    fn pivot(&self, owner: &Value, related: Value) -> RepositoryResult<P> {
        let mut row = Row::new();
        row.insert(self.source_key.to_string(), owner.clone());
        row.insert(self.target_key.to_string(), related);
        P::from_row(row)
    }

    fn scope(&self, owner: &Value, related: Vec<Value>) -> Predicate {
        Predicate::eq(self.source_key, owner.clone()).and(Predicate::is_in(self.target_key, related))
    }

    /// Link `related` items to the owner
    pub async fn attach<R: Serialize>(
        &self,
        ctx: &TenantContext,
        owner_id: impl Serialize,
        related: &[R],
    ) -> RepositoryResult<Vec<P>> {
        let owner = serde_json::to_value(owner_id)?;
        let pivots = identifiers(related, self.identifier)?
            .into_iter()
            .map(|id| self.pivot(&owner, id))
            .collect::<RepositoryResult<Vec<_>>>()?;
        if pivots.is_empty() {
            return Ok(Vec::new());
        }
        self.repository.create_many(ctx, pivots).await
    }

    /// Unlink `related` items from the owner
    pub async fn detach<R: Serialize>(
        &self,
        ctx: &TenantContext,
        owner_id: impl Serialize,
        related: &[R],
    ) -> RepositoryResult<u64> {
        let owner = serde_json::to_value(owner_id)?;
        let ids = identifiers(related, self.identifier)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.repository.begin().await?;
        let result = self
            .repository
            .delete_where_in(&mut tx, ctx, self.scope(&owner, ids), false, false)
            .await;
        let detached = settle(tx, result).await?;
        if detached > 0 {
            self.repository
                .committed(ctx, CommitEvent::Deleted { count: detached })
                .await;
        }
        Ok(detached)
    }

    async fn sync_in(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        owner: &Value,
        detach: Vec<Value>,
        pivots: Vec<P>,
    ) -> RepositoryResult<PivotSync<P>> {
        let detached = if detach.is_empty() {
            0
        } else {
            self.repository
                .delete_where_in(tx, ctx, self.scope(owner, detach), false, false)
                .await?
        };
        let attached = self.repository.create_many_in(tx, ctx, pivots).await?;
        Ok(PivotSync { attached, detached })
    }

    /// Make the owner's links equal `expected`, detaching before attaching
    pub async fn sync<R: Serialize>(
        &self,
        ctx: &TenantContext,
        owner_id: impl Serialize,
        current: &[R],
        expected: &[R],
    ) -> RepositoryResult<PivotSync<P>> {
        let owner = serde_json::to_value(owner_id)?;
        let AttachmentDiff { attach, detach } = diff_attachments(
            &identifiers(current, self.identifier)?,
            &identifiers(expected, self.identifier)?,
        );
        tracing::debug!(
            pivot = P::model().name,
            attach = attach.len(),
            detach = detach.len(),
            "syncing pivot"
        );
        let pivots = attach
            .into_iter()
            .map(|id| self.pivot(&owner, id))
            .collect::<RepositoryResult<Vec<_>>>()?;

        let mut tx = self.repository.begin().await?;
        let result = self.sync_in(&mut tx, ctx, &owner, detach, pivots).await;
        let synced = settle(tx, result)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::Sync))?;

        if synced.detached > 0 {
            self.repository
                .committed(ctx, CommitEvent::Deleted { count: synced.detached })
                .await;
        }
        if !synced.attached.is_empty() {
            self.repository
                .committed(ctx, CommitEvent::Created(&synced.attached))
                .await;
        }
        Ok(synced)
    }
}

/// Result of [`DependentRepository::sync_children`]
#[derive(Debug, Clone, PartialEq)]
pub struct ChildrenSync<C> {
    pub created: Vec<C>,
    pub updated: Vec<C>,
    pub deleted: u64,
}

/// Create, update, delete and sync children owned by one parent
pub struct DependentRepository<C, S, H = NoHooks> {
    repository: Repository<C, S, H>,
    /// Child column holding the parent id
    foreign_key: &'static str,
}

impl<C, S, H> DependentRepository<C, S, H>
where
    C: Entity,
    S: Store,
    H: RepositoryHooks<C>,
{
    pub fn new(repository: Repository<C, S, H>, foreign_key: &'static str) -> Self {
        Self {
            repository,
            foreign_key,
        }
    }

    /// Dependent for a `HasMany`/`HasOne` relation declared on the parent model
    pub fn for_relation(
        repository: Repository<C, S, H>,
        relation: &'static Relation,
    ) -> RepositoryResult<Self> {
        match relation.kind {
            RelationKind::HasMany { foreign_key } | RelationKind::HasOne { foreign_key }
                if relation.target.table == C::model().table =>
            {
                Ok(Self::new(repository, foreign_key))
            }
            _ => Err(RepositoryError::configuration(
                RepositoryOperation::Sync,
                format!(
                    "relation `{}` does not own {} rows",
                    relation.name,
                    C::model().name
                ),
            )),
        }
    }

    pub fn repository(&self) -> &Repository<C, S, H> {
        &self.repository
    }

    /// Re-parent a child, optionally clearing its identifier
    fn adopt(&self, parent: &Value, child: C, fresh: bool) -> RepositoryResult<C> {
        let mut row = child.to_row()?;
        if fresh {
            row.insert(C::model().primary_key.to_string(), Value::Null);
        }
        row.insert(self.foreign_key.to_string(), parent.clone());
        C::from_row(row)
    }

    fn adopt_all(&self, parent: &Value, children: Vec<C>, fresh: bool) -> RepositoryResult<Vec<C>> {
        children
            .into_iter()
            .map(|child| self.adopt(parent, child, fresh))
            .collect()
    }

    fn owned_by(&self, parent: &Value, ids: Vec<Value>) -> Predicate {
        Predicate::eq(self.foreign_key, parent.clone())
            .and(Predicate::is_in(C::model().primary_key, ids))
    }

    /// Insert new children of `parent_id`; given identifiers are discarded
    pub async fn create_children(
        &self,
        ctx: &TenantContext,
        parent_id: impl Serialize,
        children: Vec<C>,
    ) -> RepositoryResult<Vec<C>> {
        let parent = serde_json::to_value(parent_id)?;
        let children = self.adopt_all(&parent, children, true)?;
        self.repository.create_many(ctx, children).await
    }

    /// Update existing children, keeping them attached to `parent_id`
    pub async fn update_children(
        &self,
        ctx: &TenantContext,
        parent_id: impl Serialize,
        children: Vec<C>,
    ) -> RepositoryResult<Vec<C>> {
        let parent = serde_json::to_value(parent_id)?;
        let children = self.adopt_all(&parent, children, false)?;
        self.repository.update_many(ctx, children).await
    }

    /// Delete children of `parent_id`; children of other parents are untouched
    pub async fn delete_children(
        &self,
        ctx: &TenantContext,
        parent_id: impl Serialize,
        children: &[C],
    ) -> RepositoryResult<u64> {
        let parent = serde_json::to_value(parent_id)?;
        let ids = identifiers(children, C::model().primary_key)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.repository.begin().await?;
        let result = self
            .repository
            .delete_where_in(&mut tx, ctx, self.owned_by(&parent, ids), false, false)
            .await;
        let deleted = settle(tx, result).await?;
        if deleted > 0 {
            self.repository
                .committed(ctx, CommitEvent::Deleted { count: deleted })
                .await;
        }
        Ok(deleted)
    }

    async fn sync_in(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        parent: &Value,
        doomed: Vec<Value>,
        updates: Vec<(C, Value)>,
        creates: Vec<C>,
    ) -> RepositoryResult<ChildrenSync<C>> {
        let deleted = if doomed.is_empty() {
            0
        } else {
            self.repository
                .delete_where_in(tx, ctx, self.owned_by(parent, doomed), false, false)
                .await?
        };
        let updated = self.repository.update_each_in(tx, ctx, updates).await?;
        let created = self.repository.create_many_in(tx, ctx, creates).await?;
        Ok(ChildrenSync {
            created,
            updated,
            deleted,
        })
    }

    /// Make the children of `parent_id` equal `expected` in one transaction
    ///
    /// Deletes run first, then updates, then creates.
    pub async fn sync_children(
        &self,
        ctx: &TenantContext,
        parent_id: impl Serialize,
        current: Vec<C>,
        expected: Vec<C>,
    ) -> RepositoryResult<ChildrenSync<C>> {
        let parent = serde_json::to_value(parent_id)?;
        let key = C::model().primary_key;
        let current_ids = current
            .iter()
            .map(|c| c.identifier())
            .collect::<RepositoryResult<Vec<_>>>()?;
        let expected_ids = expected
            .iter()
            .map(|c| c.identifier())
            .collect::<RepositoryResult<Vec<_>>>()?;

        let keyed = |ids: Vec<Option<Value>>, items: Vec<C>| -> Vec<(Option<Value>, C)> {
            ids.into_iter().zip(items).collect()
        };
        let diff = diff_children(
            &keyed(current_ids, current),
            &keyed(expected_ids, expected),
            |(id, _)| id.clone(),
        );
        tracing::debug!(
            model = C::model().name,
            create = diff.create.len(),
            update = diff.update.len(),
            delete = diff.delete.len(),
            "syncing children"
        );

        let doomed: Vec<Value> = diff.delete.into_iter().filter_map(|(id, _)| id).collect();
        let creates = self.adopt_all(&parent, diff.create.into_iter().map(|(_, c)| c).collect(), true)?;
        let mut updates = Vec::with_capacity(diff.update.len());
        for (_, child) in diff.update {
            let child = self.adopt(&parent, child, false)?;
            updates.push(
                self.repository
                    .prepare_update(ctx, child, key, RepositoryOperation::Sync)
                    .await?,
            );
        }

        let mut tx = self.repository.begin().await?;
        let result = self.sync_in(&mut tx, ctx, &parent, doomed, updates, creates).await;
        let synced = settle(tx, result)
            .await
            .map_err(|e| e.with_operation(RepositoryOperation::Sync))?;

        if synced.deleted > 0 {
            self.repository
                .committed(ctx, CommitEvent::Deleted { count: synced.deleted })
                .await;
        }
        if !synced.updated.is_empty() {
            self.repository
                .committed(ctx, CommitEvent::Updated(&synced.updated))
                .await;
        }
        if !synced.created.is_empty() {
            self.repository
                .committed(ctx, CommitEvent::Created(&synced.created))
                .await;
        }
        Ok(synced)
    }
}
