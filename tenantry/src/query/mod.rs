//! Declarative query descriptions and their compilation
//!
//! A caller describes a read with [`QueryOptions`] (or [`CountOptions`]): a
//! filter matrix, includes, projection, sort and pagination. The repository
//! compiles the matrix with [`compile`] into a [`Predicate`] and resolves the
//! includes with [`resolve`] into a join tree before handing both to a store.

mod compiler;
mod filter;
mod include;
mod options;
mod pagination;
mod predicate;
mod wire;

pub use compiler::compile;
pub use filter::{DatePart, FilterMatrix, Operator, QueryFilter};
pub use include::{
    flatten, group_select, resolve, root_columns, FlatJoin, JoinNode, ProjectionGroups,
    MAX_INCLUDE_DEPTH,
};
pub use options::{
    CountOptions, FindOptions, IncludeEntry, IncludeSpec, OrderDirection, QueryOptions, SortSpec,
};
pub use pagination::{Paginated, Pagination, QueryResponse};
pub use predicate::{ColumnRef, Constraint, Predicate};
