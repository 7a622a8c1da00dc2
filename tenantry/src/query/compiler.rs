//! Where-clause compiler: filter matrix to [`Predicate`]
//!
//! Each inner AND-group becomes a conjunction of per-column predicates, the
//! outer list a disjunction. Repeated filters on one column inside a group
//! merge into a single [`Predicate::Column`] carrying several constraints,
//! in first-appearance order.

use serde_json::Value;

use super::filter::{Operator, QueryFilter};
use super::predicate::{ColumnRef, Constraint, Predicate};
use crate::repository::{RepositoryError, RepositoryOperation, RepositoryResult};

/// Compile an OR-of-ANDs filter matrix
///
/// An empty matrix, or an empty group, matches every row.
///
/// # Example
///
/// ```rust
/// use tenantry::query::{compile, Predicate, QueryFilter};
///
/// assert_eq!(compile(&[]).unwrap(), Predicate::All);
///
/// let predicate = compile(&[vec![QueryFilter::eq("name", "X")]]).unwrap();
/// assert_eq!(predicate, Predicate::eq("name", "X"));
/// ```
pub fn compile(matrix: &[Vec<QueryFilter>]) -> RepositoryResult<Predicate> {
    let mut groups = matrix
        .iter()
        .map(|group| compile_group(group))
        .collect::<RepositoryResult<Vec<_>>>()?;

    let predicate = match groups.len() {
        0 => Predicate::All,
        1 => groups.remove(0),
        _ if groups.iter().any(Predicate::is_all) => Predicate::All,
        _ => Predicate::Or(groups),
    };
    tracing::trace!(?predicate, "compiled filter matrix");
    Ok(predicate)
}

fn compile_group(group: &[QueryFilter]) -> RepositoryResult<Predicate> {
    let mut columns: Vec<(String, Vec<Constraint>)> = Vec::new();
    for filter in group {
        filter.validate()?;
        let constraint = constraint_for(filter)?;
        match columns.iter_mut().find(|(col, _)| *col == filter.col) {
            Some((_, constraints)) => constraints.push(constraint),
            None => columns.push((filter.col.clone(), vec![constraint])),
        }
    }

    let mut predicates: Vec<Predicate> = columns
        .into_iter()
        .map(|(col, constraints)| Predicate::Column {
            column: ColumnRef::parse(&col),
            constraints,
        })
        .collect();

    Ok(match predicates.len() {
        0 => Predicate::All,
        1 => predicates.remove(0),
        _ => Predicate::And(predicates),
    })
}

fn constraint_for(filter: &QueryFilter) -> RepositoryResult<Constraint> {
    let value = filter.value.clone();
    let constraint = match filter.op {
        Operator::Eq => Constraint::Eq(value),
        Operator::Ne => Constraint::Ne(value),
        Operator::Lt => Constraint::Lt(value),
        Operator::Lte => Constraint::Lte(value),
        Operator::Gt => Constraint::Gt(value),
        Operator::Gte => Constraint::Gte(value),
        Operator::Like => Constraint::Like(substring_pattern(filter)?),
        Operator::ILike => Constraint::ILike(substring_pattern(filter)?),
        Operator::Between => {
            let mut bounds = into_list(value).into_iter();
            match (bounds.next(), bounds.next()) {
                (Some(low), Some(high)) => Constraint::Between(low, high),
                _ => {
                    return Err(RepositoryError::configuration(
                        RepositoryOperation::Parse,
                        format!("filter `{} between` expects two bounds", filter.col),
                    ))
                }
            }
        }
        Operator::In => Constraint::In(into_list(value)),
        Operator::NotIn => Constraint::NotIn(into_list(value)),
        Operator::Any => Constraint::Any(into_list(value)),
        Operator::IsNull => Constraint::IsNull,
        op => match op.date_part() {
            Some(part) => Constraint::DatePart { part, value },
            None => {
                return Err(RepositoryError::configuration(
                    RepositoryOperation::Parse,
                    format!("operator `{}` has no compiled form", op),
                ))
            }
        },
    };
    Ok(constraint)
}

fn into_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn substring_pattern(filter: &QueryFilter) -> RepositoryResult<String> {
    let text = match &filter.value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => {
            return Err(RepositoryError::configuration(
                RepositoryOperation::Parse,
                format!("filter `{} {}` expects a text value", filter.col, filter.op),
            ))
        }
    };
    Ok(format!("%{}%", text))
}
