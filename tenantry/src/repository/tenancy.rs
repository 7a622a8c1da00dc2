//! License-scoped row isolation
//!
//! Models declaring a `tenant_column` are scoped to the tenant of the calling
//! context. The repository consults [`TenancyPolicy`] at every entry point:
//! creates are stamped with the tenant id, and updates, deletes and reads
//! get `tenant_column = <tenant>` ANDed into their predicate.
//!
//! | Operation        | Skipped by        | Missing tenant                         |
//! |------------------|-------------------|----------------------------------------|
//! | create           | `skip_for_save`   | error                                  |
//! | update           | `skip_for_update` | error unless `update_is_optional`      |
//! | delete           | `skip_for_delete` | error                                  |
//! | find/query/count | `skip_for_find`   | error unless `find_is_optional`        |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{RepositoryError, RepositoryOperation, RepositoryResult};
use crate::model::{Model, Row};
use crate::query::Predicate;

/// Source of the current tenant id
pub trait TenantAccessor {
    fn current_tenant_id(&self) -> Option<Uuid>;
}

/// Per-call tenant context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: Option<Uuid>,
}

impl TenantContext {
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            tenant_id: Some(tenant_id),
        }
    }

    /// Context with no tenant, for system tasks on unscoped models
    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl TenantAccessor for TenantContext {
    fn current_tenant_id(&self) -> Option<Uuid> {
        self.tenant_id
    }
}

/// Which tenancy rules apply to a repository
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenancyPolicy {
    pub skip_for_save: bool,
    pub skip_for_update: bool,
    pub update_is_optional: bool,
    pub skip_for_delete: bool,
    pub skip_for_find: bool,
    pub find_is_optional: bool,
}

impl TenancyPolicy {
    /// Policy that never scopes, for shared reference data
    pub fn disabled() -> Self {
        Self {
            skip_for_save: true,
            skip_for_update: true,
            skip_for_delete: true,
            skip_for_find: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_optional_find(mut self) -> Self {
        self.find_is_optional = true;
        self
    }

    #[must_use]
    pub fn with_optional_update(mut self) -> Self {
        self.update_is_optional = true;
        self
    }
}

/// The operation a tenant rule is being applied for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Save,
    Update,
    Delete,
    Find,
}

impl Scope {
    fn skipped(self, policy: &TenancyPolicy) -> bool {
        match self {
            Self::Save => policy.skip_for_save,
            Self::Update => policy.skip_for_update,
            Self::Delete => policy.skip_for_delete,
            Self::Find => policy.skip_for_find,
        }
    }

    fn optional(self, policy: &TenancyPolicy) -> bool {
        match self {
            Self::Update => policy.update_is_optional,
            Self::Find => policy.find_is_optional,
            Self::Save | Self::Delete => false,
        }
    }
}

/// Tenant id the operation must be scoped to, if any
fn tenant_for(
    model: &Model,
    policy: &TenancyPolicy,
    scope: Scope,
    operation: RepositoryOperation,
    ctx: &dyn TenantAccessor,
) -> RepositoryResult<Option<(&'static str, Uuid)>> {
    let Some(column) = model.tenant_column else {
        return Ok(None);
    };
    if scope.skipped(policy) {
        return Ok(None);
    }
    match ctx.current_tenant_id() {
        Some(tenant) => Ok(Some((column, tenant))),
        None if scope.optional(policy) => Ok(None),
        None => Err(RepositoryError::configuration(
            operation,
            format!("{} requires a tenant context", model.name),
        )
        .with_entity(model.name, column)),
    }
}

/// Tenant predicate to AND into a query, `All` when not applicable
pub(crate) fn predicate(
    model: &Model,
    policy: &TenancyPolicy,
    scope: Scope,
    operation: RepositoryOperation,
    ctx: &dyn TenantAccessor,
) -> RepositoryResult<Predicate> {
    Ok(match tenant_for(model, policy, scope, operation, ctx)? {
        Some((column, tenant)) => Predicate::eq(column, tenant.to_string()),
        None => Predicate::All,
    })
}

/// Write the tenant id into a row about to be stored
///
/// When no tenant applies, a null tenant column is dropped from the row so
/// that an update never clears the stored value.
pub(crate) fn stamp(
    model: &Model,
    policy: &TenancyPolicy,
    scope: Scope,
    operation: RepositoryOperation,
    ctx: &dyn TenantAccessor,
    row: &mut Row,
) -> RepositoryResult<()> {
    match tenant_for(model, policy, scope, operation, ctx)? {
        Some((column, tenant)) => {
            row.insert(column.to_string(), Value::String(tenant.to_string()));
        }
        None => {
            if let Some(column) = model.tenant_column {
                if scope == Scope::Update && row.get(column).is_some_and(Value::is_null) {
                    row.remove(column);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Constraint;
    use crate::repository::RepositoryErrorKind;
    use crate::test_support::{PHONE, REGISTER};
    use serde_json::json;

    fn tenant() -> Uuid {
        Uuid::parse_str("0190f0c4-0000-7000-8000-0000000000aa").unwrap()
    }

    #[test]
    fn test_find_predicate_uses_tenant_column() {
        let ctx = TenantContext::new(tenant());
        let predicate = predicate(
            &REGISTER,
            &TenancyPolicy::default(),
            Scope::Find,
            RepositoryOperation::Query,
            &ctx,
        )
        .unwrap();
        assert_eq!(predicate, Predicate::eq("license_id", tenant().to_string()));
    }

    #[test]
    fn test_missing_tenant_is_rejected_unless_optional() {
        let ctx = TenantContext::anonymous();
        let err = predicate(
            &REGISTER,
            &TenancyPolicy::default(),
            Scope::Find,
            RepositoryOperation::Query,
            &ctx,
        )
        .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Configuration);

        let optional = TenancyPolicy::default().with_optional_find();
        assert!(predicate(&REGISTER, &optional, Scope::Find, RepositoryOperation::Query, &ctx)
            .unwrap()
            .is_all());

        // optional reads never make deletes optional
        assert!(predicate(&REGISTER, &optional, Scope::Delete, RepositoryOperation::Delete, &ctx).is_err());
    }

    #[test]
    fn test_unscoped_models_and_skips() {
        let ctx = TenantContext::anonymous();
        assert!(predicate(
            &PHONE,
            &TenancyPolicy::default(),
            Scope::Delete,
            RepositoryOperation::Delete,
            &ctx
        )
        .unwrap()
        .is_all());
        assert!(predicate(
            &REGISTER,
            &TenancyPolicy::disabled(),
            Scope::Delete,
            RepositoryOperation::Delete,
            &ctx
        )
        .unwrap()
        .is_all());
    }

    #[test]
    fn test_stamp_sets_tenant_on_save() {
        let ctx = TenantContext::new(tenant());
        let mut row = Row::new();
        stamp(
            &REGISTER,
            &TenancyPolicy::default(),
            Scope::Save,
            RepositoryOperation::Create,
            &ctx,
            &mut row,
        )
        .unwrap();
        assert_eq!(row.get("license_id"), Some(&json!(tenant().to_string())));
    }

    #[test]
    fn test_optional_update_keeps_stored_tenant() {
        let ctx = TenantContext::anonymous();
        let mut row = Row::new();
        row.insert("license_id".into(), Value::Null);
        row.insert("name".into(), json!("Ada"));
        stamp(
            &REGISTER,
            &TenancyPolicy::default().with_optional_update(),
            Scope::Update,
            RepositoryOperation::Update,
            &ctx,
            &mut row,
        )
        .unwrap();
        assert!(!row.contains_key("license_id"));
        assert!(row.contains_key("name"));
    }

    #[test]
    fn test_tenant_predicate_is_a_root_equality() {
        let ctx = TenantContext::new(tenant());
        let Predicate::Column { column, constraints } = predicate(
            &REGISTER,
            &TenancyPolicy::default(),
            Scope::Update,
            RepositoryOperation::Update,
            &ctx,
        )
        .unwrap() else {
            panic!("expected a column predicate");
        };
        assert!(column.is_root());
        assert_eq!(constraints, vec![Constraint::Eq(json!(tenant().to_string()))]);
    }
}
