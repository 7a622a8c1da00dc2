//! # tenantry
//!
//! Multi-tenant repository layer with a wire-safe query model.
//!
//! Clients describe what they want as a [`QueryOptions`](query::QueryOptions)
//! value: filters, includes, projections, sort and pages. It travels as JSON
//! or a query string and is compiled into a relational plan against static
//! [`Model`](model::Model) metadata. Anything that does not match the model
//! is rejected before SQL is built, and every value is bound, never spliced.
//!
//! ## Features
//!
//! - **Query model**: filter matrices (OR of AND groups), dotted paths into
//!   included relations, date-part and set operators
//! - **Includes**: nested eager loading with per-relation projections,
//!   required (inner) joins and a depth limit
//! - **Repository**: create, update, delete, find, query, paginate and
//!   count, each mutation in one transaction, with lifecycle hooks
//! - **Tenancy**: every row of a tenant-scoped model is stamped with and
//!   filtered by the caller's tenant
//! - **Relations**: pivot and dependent-child synchronization
//! - **Storage**: PostgreSQL via sqlx (feature `postgres`) and an
//!   in-memory engine with the same semantics
//!
//! ## Example
//!
//! ```rust,ignore
//! use tenantry::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let db = config
//!         .database
//!         .as_ref()
//!         .ok_or_else(|| Error::Internal("no database configured".into()))?;
//!     let registers = Repository::<Register, _>::new(PgStore::connect(db).await?)
//!         .with_config(config.repository.clone());
//!
//!     let ctx = TenantContext::new(license_id);
//!     let query = QueryOptions::from_query_string("include=group&limit=20&page=1")?;
//!     let page = registers.paginated_query(&ctx, &query).await?;
//!     tracing::info!(total = page.total_count, "loaded registers");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod query;
pub mod repository;
pub mod store;

#[cfg(feature = "postgres")]
pub mod database;

#[cfg(feature = "observability")]
pub mod observability;

#[cfg(test)]
mod test_support;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, DatabaseConfig, RepositoryConfig};
    pub use crate::error::{Error, Result};
    pub use crate::model::{Column, ColumnType, Entity, Model, Relation, RelationKind, Row};
    pub use crate::query::{
        CountOptions, FilterMatrix, FindOptions, IncludeSpec, Operator, OrderDirection,
        Paginated, Pagination, Predicate, QueryFilter, QueryOptions, QueryResponse, SortSpec,
    };
    pub use crate::repository::{
        CommitEvent, DeleteOptions, DependentRepository, FindOrCreateStrategy, NoHooks,
        PivotRepository, Repository, RepositoryError, RepositoryErrorKind, RepositoryHooks,
        RepositoryResult, Target, TenancyPolicy, TenantAccessor, TenantContext, UpdateOptions,
    };
    pub use crate::store::{MemoryStore, Store, StoreTx};

    #[cfg(feature = "observability")]
    pub use crate::observability::init_tracing;

    #[cfg(feature = "postgres")]
    pub use crate::database::create_pool;

    #[cfg(feature = "postgres")]
    pub use crate::store::PgStore;

    pub use async_trait::async_trait;
}
