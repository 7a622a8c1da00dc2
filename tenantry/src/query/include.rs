//! Include/projection resolver
//!
//! Turns an [`IncludeSpec`] plus the grouped `select` list into a join tree
//! bounded to two levels: a relation of the queried model, and optionally one
//! relation of that relation's target.

use std::collections::HashMap;

use super::options::IncludeSpec;
use crate::model::{Model, Relation};
use crate::repository::{RepositoryError, RepositoryOperation, RepositoryResult};

/// Deepest include path, counted in relation segments
pub const MAX_INCLUDE_DEPTH: usize = 2;

/// `select` entries grouped by the path they project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectionGroups {
    /// Root columns; `None` projects every column
    pub root: Option<Vec<String>>,
    /// Dotted relation path to its projected columns
    pub relations: HashMap<String, Vec<String>>,
}

impl ProjectionGroups {
    pub fn for_path(&self, path: &str) -> Option<&[String]> {
        self.relations.get(path).map(Vec::as_slice)
    }
}

/// Group `select` entries by dotted path prefix
///
/// `name` projects the root, `group.name` the `group` relation and
/// `group.license.name` the `group.license` relation.
///
/// # Example
///
/// ```rust
/// use tenantry::query::group_select;
///
/// let groups = group_select(&["id".into(), "group.name".into()]).unwrap();
/// assert_eq!(groups.root, Some(vec!["id".to_string()]));
/// assert_eq!(groups.for_path("group"), Some(&["name".to_string()][..]));
/// ```
pub fn group_select(select: &[String]) -> RepositoryResult<ProjectionGroups> {
    let mut groups = ProjectionGroups::default();
    for entry in select {
        match entry.rsplit_once('.') {
            None => groups.root.get_or_insert_with(Vec::new).push(entry.clone()),
            Some((path, column)) => {
                if path.split('.').count() > MAX_INCLUDE_DEPTH {
                    return Err(RepositoryError::configuration(
                        RepositoryOperation::Parse,
                        format!(
                            "select `{}` is nested deeper than {} relations",
                            entry, MAX_INCLUDE_DEPTH
                        ),
                    ));
                }
                groups
                    .relations
                    .entry(path.to_string())
                    .or_default()
                    .push(column.to_string());
            }
        }
    }
    Ok(groups)
}

/// One eager-loaded relation
#[derive(Debug, Clone)]
pub struct JoinNode {
    /// Dotted path from the root, also the join alias
    pub path: String,
    pub relation: &'static Relation,
    /// Projected target columns, primary key first
    pub columns: Vec<String>,
    /// Inner join when set, left join otherwise
    pub required: bool,
    pub children: Vec<JoinNode>,
}

impl JoinNode {
    pub fn target(&self) -> &'static Model {
        self.relation.target
    }
}

/// A join node with its position in a flattened row
///
/// Slot 0 is the root model; joins take slots 1.. in depth-first order.
#[derive(Debug, Clone, Copy)]
pub struct FlatJoin<'a> {
    pub slot: usize,
    pub parent: usize,
    pub node: &'a JoinNode,
}

/// Depth-first slot numbering of a join tree
pub fn flatten(nodes: &[JoinNode]) -> Vec<FlatJoin<'_>> {
    fn walk<'a>(nodes: &'a [JoinNode], parent: usize, out: &mut Vec<FlatJoin<'a>>) {
        for node in nodes {
            let slot = out.len() + 1;
            out.push(FlatJoin { slot, parent, node });
            walk(&node.children, slot, out);
        }
    }

    let mut out = Vec::new();
    walk(nodes, 0, &mut out);
    out
}

/// Resolve include paths against a model's relation declarations
///
/// Unknown relation names are skipped with a warning, or rejected when
/// `strict` is set. Paths deeper than two segments are always rejected.
pub fn resolve(
    include: &IncludeSpec,
    model: &'static Model,
    projections: &ProjectionGroups,
    strict: bool,
) -> RepositoryResult<Vec<JoinNode>> {
    let mut nodes: Vec<JoinNode> = Vec::new();

    for entry in include.entries() {
        let segments: Vec<&str> = entry.path.split('.').collect();
        if segments.len() > MAX_INCLUDE_DEPTH || segments.iter().any(|s| s.is_empty()) {
            return Err(RepositoryError::configuration(
                RepositoryOperation::Parse,
                format!(
                    "include `{}` must name a relation or a relation of a relation",
                    entry.path
                ),
            ));
        }

        let Some(relation) = model.relation(segments[0]) else {
            unknown_relation(model, &entry.path, strict)?;
            continue;
        };

        let index = match nodes.iter().position(|n| n.path == segments[0]) {
            Some(index) => index,
            None => {
                nodes.push(node_for(segments[0].to_string(), relation, projections)?);
                nodes.len() - 1
            }
        };
        let parent = &mut nodes[index];

        if segments.len() == 1 {
            parent.required |= entry.required;
            continue;
        }

        let Some(nested) = relation.nested_relation(segments[1]) else {
            unknown_relation(relation.target, &entry.path, strict)?;
            continue;
        };
        let child = match parent.children.iter().position(|c| c.path == entry.path) {
            Some(index) => &mut parent.children[index],
            None => {
                parent
                    .children
                    .push(node_for(entry.path.clone(), nested, projections)?);
                let last = parent.children.len() - 1;
                &mut parent.children[last]
            }
        };
        child.required |= entry.required;
        // An inner-joined child cannot sit under a left-joined parent.
        if entry.required {
            parent.required = true;
        }
    }

    tracing::debug!(
        model = model.name,
        joins = ?nodes.iter().map(|n| n.path.as_str()).collect::<Vec<_>>(),
        "resolved includes"
    );
    Ok(nodes)
}

/// Validated root projection, primary key first
pub fn root_columns(model: &Model, projections: &ProjectionGroups) -> RepositoryResult<Vec<String>> {
    project(model, projections.root.as_deref(), model.table)
}

fn node_for(
    path: String,
    relation: &'static Relation,
    projections: &ProjectionGroups,
) -> RepositoryResult<JoinNode> {
    let columns = project(relation.target, projections.for_path(&path), &path)?;
    Ok(JoinNode {
        path,
        relation,
        columns,
        required: false,
        children: Vec::new(),
    })
}

fn project(model: &Model, requested: Option<&[String]>, path: &str) -> RepositoryResult<Vec<String>> {
    let Some(requested) = requested else {
        return Ok(model.column_names());
    };
    let mut columns = vec![model.primary_key.to_string()];
    for column in requested {
        if !model.has_column(column) {
            return Err(RepositoryError::configuration(
                RepositoryOperation::Parse,
                format!("`{}` has no column `{}`", path, column),
            ));
        }
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }
    Ok(columns)
}

fn unknown_relation(model: &Model, path: &str, strict: bool) -> RepositoryResult<()> {
    if strict {
        return Err(RepositoryError::configuration(
            RepositoryOperation::Parse,
            format!("{} declares no relation for include `{}`", model.name, path),
        ));
    }
    tracing::warn!(model = model.name, include = path, "skipping unknown relation");
    Ok(())
}
