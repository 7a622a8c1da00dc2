//! Lifecycle hooks around repository mutations
//!
//! Hooks come in three stages:
//!
//! - `before_*` runs ahead of the store call and may adjust the entity or
//!   abort the operation
//! - `after_*` runs inside the open transaction; an error rolls the whole
//!   operation back
//! - [`RepositoryHooks::after_commit`] runs once the transaction committed and
//!   cannot fail the operation
//!
//! Every method has a no-op default, so implementations override only the
//! stages they care about.
//!
//! # Example
//!
//! ```rust,ignore
//! struct AuditHooks;
//!
//! #[async_trait]
//! impl RepositoryHooks<Register> for AuditHooks {
//!     async fn before_create(&self, _ctx: &TenantContext, register: &mut Register) -> RepositoryResult<()> {
//!         register.name = register.name.trim().to_string();
//!         Ok(())
//!     }
//!
//!     async fn after_commit(&self, _ctx: &TenantContext, event: CommitEvent<'_, Register>) {
//!         tracing::info!(event = event.kind(), "register changed");
//!     }
//! }
//! ```

use async_trait::async_trait;

use super::tenancy::TenantContext;
use super::RepositoryResult;
use crate::model::Entity;
use crate::query::Predicate;

/// What a committed operation changed
#[derive(Debug)]
pub enum CommitEvent<'a, E> {
    Created(&'a [E]),
    Updated(&'a [E]),
    Deleted { count: u64 },
}

impl<E> CommitEvent<'_, E> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Deleted { .. } => "deleted",
        }
    }
}

/// Hooks invoked by [`Repository`](super::Repository) around each mutation
#[async_trait]
pub trait RepositoryHooks<E: Entity>: Send + Sync {
    async fn before_create(&self, _ctx: &TenantContext, _entity: &mut E) -> RepositoryResult<()> {
        Ok(())
    }

    async fn after_create(&self, _ctx: &TenantContext, _entity: &E) -> RepositoryResult<()> {
        Ok(())
    }

    async fn before_update(&self, _ctx: &TenantContext, _entity: &mut E) -> RepositoryResult<()> {
        Ok(())
    }

    async fn after_update(&self, _ctx: &TenantContext, _entity: &E) -> RepositoryResult<()> {
        Ok(())
    }

    /// Receives the full delete predicate, tenant scope included
    async fn before_delete(&self, _ctx: &TenantContext, _predicate: &Predicate) -> RepositoryResult<()> {
        Ok(())
    }

    async fn after_delete(
        &self,
        _ctx: &TenantContext,
        _predicate: &Predicate,
        _deleted: u64,
    ) -> RepositoryResult<()> {
        Ok(())
    }

    async fn after_commit(&self, _ctx: &TenantContext, _event: CommitEvent<'_, E>) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<E: Entity> RepositoryHooks<E> for NoHooks {}
