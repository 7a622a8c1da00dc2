//! Relational execution engines
//!
//! The repository talks to storage only through [`Store`] and its
//! transaction type [`StoreTx`]. Every call, reads included, happens inside a
//! transaction so that multi-step operations see one consistent snapshot and
//! commit or roll back as a unit.
//!
//! Two engines ship with the crate:
//!
//! - [`PgStore`]: PostgreSQL through sqlx (feature `postgres`)
//! - [`MemoryStore`]: an in-process engine with the same observable
//!   semantics, used by tests and tooling
//!
//! A transaction dropped without [`StoreTx::commit`] is rolled back.

use async_trait::async_trait;

use crate::model::{Model, Row};
use crate::query::Predicate;
use crate::repository::RepositoryResult;

mod hydrate;
mod memory;
mod plan;
#[cfg(feature = "postgres")]
mod postgres;

pub use hydrate::{hydrate, FlatRow};
pub use memory::MemoryStore;
pub use plan::{CountPlan, CountRow, OrderTerm, PlanScope, SelectPlan};
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, PgTx};

pub(crate) use hydrate::identity;

/// A transactional row store
#[async_trait]
pub trait Store: Send + Sync {
    type Tx: StoreTx;

    /// Open a transaction
    async fn begin(&self) -> RepositoryResult<Self::Tx>;
}

/// Operations available inside one store transaction
///
/// Rows cross this boundary as JSON objects keyed by column name. Predicates
/// passed to `update` and `delete` reference root columns only.
#[async_trait]
pub trait StoreTx: Send {
    /// Insert one row and return it as stored
    async fn insert(&mut self, model: &'static Model, row: Row) -> RepositoryResult<Row>;

    /// Insert unless a unique key already holds the values; `None` on conflict
    async fn insert_if_absent(
        &mut self,
        model: &'static Model,
        row: Row,
    ) -> RepositoryResult<Option<Row>>;

    /// Write `values` into every live row matching `predicate`
    async fn update(
        &mut self,
        model: &'static Model,
        values: Row,
        predicate: &Predicate,
    ) -> RepositoryResult<Vec<Row>>;

    /// Remove matching live rows, or stamp `deleted_at` when `soft`
    async fn delete(
        &mut self,
        model: &'static Model,
        predicate: &Predicate,
        soft: bool,
    ) -> RepositoryResult<u64>;

    /// Run a read and return hydrated rows
    async fn select(&mut self, plan: &SelectPlan) -> RepositoryResult<Vec<Row>>;

    /// Run an aggregate count
    async fn count(&mut self, plan: &CountPlan) -> RepositoryResult<Vec<CountRow>>;

    async fn commit(self) -> RepositoryResult<()>;

    async fn rollback(self) -> RepositoryResult<()>;
}
