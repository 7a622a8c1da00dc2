//! Store-facing read plans
//!
//! A plan is the fully resolved form of a read: the join tree, the validated
//! predicate and the ordering, all checked against the model declarations so
//! that stores can render them without further lookups.

use crate::model::{Model, Row};
use crate::query::{
    flatten, ColumnRef, JoinNode, OrderDirection, Pagination, Predicate, SortSpec,
};
use crate::repository::{RepositoryError, RepositoryOperation, RepositoryResult};

/// One resolved ORDER BY term
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: ColumnRef,
    pub direction: OrderDirection,
}

/// A row-returning read
#[derive(Debug, Clone)]
pub struct SelectPlan {
    pub model: &'static Model,
    /// Root projection, primary key first
    pub columns: Vec<String>,
    pub joins: Vec<JoinNode>,
    pub predicate: Predicate,
    pub order: Vec<OrderTerm>,
    /// Applied to distinct root rows, never to joined fan-out
    pub window: Option<Pagination>,
    pub include_deleted: bool,
}

impl SelectPlan {
    /// Whole-row read of the root model, no joins
    pub fn new(model: &'static Model, predicate: Predicate) -> Self {
        Self {
            model,
            columns: model.column_names(),
            joins: Vec::new(),
            predicate,
            order: Vec::new(),
            window: None,
            include_deleted: false,
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: Option<Pagination>) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_include_deleted(mut self, include_deleted: bool) -> Self {
        self.include_deleted = include_deleted;
        self
    }
}

/// An aggregate count
#[derive(Debug, Clone)]
pub struct CountPlan {
    pub model: &'static Model,
    pub joins: Vec<JoinNode>,
    pub predicate: Predicate,
    pub include_deleted: bool,
    /// Count distinct values (of `column`, or of root rows when unset)
    pub distinct: bool,
    pub column: Option<ColumnRef>,
    /// Output label and grouped column
    pub group: Vec<(String, ColumnRef)>,
}

/// One group of a count, with its grouped column values keyed by label
#[derive(Debug, Clone, PartialEq)]
pub struct CountRow {
    pub group: Row,
    pub count: u64,
}

/// Join paths addressable from a plan
///
/// The root answers to no path and to its own table name, so `registers.name`
/// and `name` name the same column.
pub struct PlanScope<'a> {
    model: &'static Model,
    joins: Vec<(&'a str, &'static Model)>,
}

impl<'a> PlanScope<'a> {
    pub fn new(model: &'static Model, joins: &'a [JoinNode]) -> Self {
        let joins = flatten(joins)
            .into_iter()
            .map(|flat| (flat.node.path.as_str(), flat.node.target()))
            .collect();
        Self { model, joins }
    }

    /// Model addressed by a column path
    pub fn model_for(&self, path: Option<&str>) -> Option<&'static Model> {
        match path {
            None => Some(self.model),
            Some(path) if path == self.model.table => Some(self.model),
            Some(path) => self
                .joins
                .iter()
                .find(|(p, _)| *p == path)
                .map(|(_, model)| *model),
        }
    }

    /// Normalize a reference to the root table back to an unqualified column
    pub fn normalize(&self, column: &ColumnRef) -> ColumnRef {
        match column.path.as_deref() {
            Some(path) if path == self.model.table => ColumnRef::root(column.name.clone()),
            _ => column.clone(),
        }
    }

    /// Check a column reference against the join tree and declared columns
    pub fn check(&self, column: &ColumnRef) -> RepositoryResult<ColumnRef> {
        let Some(model) = self.model_for(column.path.as_deref()) else {
            return Err(RepositoryError::configuration(
                RepositoryOperation::Query,
                format!(
                    "`{}` references a relation that is not included",
                    column
                ),
            ));
        };
        if !model.has_column(&column.name) {
            return Err(RepositoryError::configuration(
                RepositoryOperation::Query,
                format!("{} has no column `{}`", model.name, column.name),
            ));
        }
        Ok(self.normalize(column))
    }

    /// Validate every column of a predicate, rewriting root-table references
    pub fn validate(&self, predicate: Predicate) -> RepositoryResult<Predicate> {
        Ok(match predicate {
            Predicate::All => Predicate::All,
            Predicate::And(items) => Predicate::And(
                items
                    .into_iter()
                    .map(|p| self.validate(p))
                    .collect::<RepositoryResult<_>>()?,
            ),
            Predicate::Or(items) => Predicate::Or(
                items
                    .into_iter()
                    .map(|p| self.validate(p))
                    .collect::<RepositoryResult<_>>()?,
            ),
            Predicate::Column {
                column,
                constraints,
            } => Predicate::Column {
                column: self.check(&column)?,
                constraints,
            },
        })
    }

    /// Resolve a sort spec; terms on relations outside the join tree are dropped
    pub fn order(&self, sort: &SortSpec) -> RepositoryResult<Vec<OrderTerm>> {
        let mut terms = Vec::new();
        for (path, direction) in sort.iter() {
            let column = ColumnRef::parse(path);
            if self.model_for(column.path.as_deref()).is_none() {
                tracing::debug!(
                    model = self.model.name,
                    sort = %path,
                    "ignoring sort on relation outside the join tree"
                );
                continue;
            }
            terms.push(OrderTerm {
                column: self.check(&column)?,
                direction: *direction,
            });
        }
        Ok(terms)
    }
}
