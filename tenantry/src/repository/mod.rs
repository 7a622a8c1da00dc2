//! Generic repository over a transactional store
//!
//! [`Repository`] is the CRUD engine for one [`Entity`](crate::model::Entity)
//! type. It compiles [`QueryOptions`](crate::query::QueryOptions) into store
//! plans, scopes every call to the caller's tenant, runs each mutation in a
//! single transaction, and calls [`RepositoryHooks`] around it.
//!
//! # Features
//!
//! - **CRUD**: create, update, delete and their batch variants, where a
//!   failure anywhere in a batch rolls back the whole batch
//! - **Queries**: filter matrices, includes, projections, sort and pages
//! - **Counting**: plain, distinct and grouped counts
//! - **Tenancy**: license scoping controlled by [`TenancyPolicy`]
//! - **Relations**: [`PivotRepository`] and [`DependentRepository`] keep
//!   many-to-many pivots and owned children in step with a parent
//!
//! # Example
//!
//! ```rust,ignore
//! use tenantry::prelude::*;
//!
//! let registers = Repository::<Register, _>::new(PgStore::connect(&db).await?);
//! let ctx = TenantContext::new(license_id);
//!
//! let created = registers.create(&ctx, Register::named("Ada")).await?;
//! let page = registers
//!     .paginated_query(&ctx, &QueryOptions::new().with_limit(20).with_page(2))
//!     .await?;
//! ```

mod core;
mod error;
mod hooks;
mod relations;
mod tenancy;

pub use self::core::{
    DeleteOptions, FindOrCreateStrategy, Repository, Target, UpdateOptions,
};
pub use error::{RepositoryError, RepositoryErrorKind, RepositoryOperation};
pub use hooks::{CommitEvent, NoHooks, RepositoryHooks};
pub use relations::{
    diff_attachments, diff_children, AttachmentDiff, ChildrenDiff, ChildrenSync,
    DependentRepository, PivotRepository, PivotSync,
};
pub use tenancy::{TenancyPolicy, TenantAccessor, TenantContext};

/// Result type for repository operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;
