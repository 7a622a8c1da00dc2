//! Shared fixtures: a licensed group/register schema with phones and a
//! group membership pivot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::model::{Column, ColumnType as T, Entity, Model, Relation, RelationKind};
use crate::repository::{CommitEvent, RepositoryError, RepositoryHooks, RepositoryResult, TenantContext};
use crate::query::Predicate;
use crate::store::{MemoryStore, Store};

pub fn license(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

pub static LICENSE: Model = Model {
    name: "License",
    table: "licenses",
    primary_key: "id",
    columns: &[
        Column::new("id", T::Uuid),
        Column::new("name", T::Text),
        Column::new("created_at", T::Timestamp),
        Column::new("updated_at", T::Timestamp),
    ],
    relations: &[],
    unique_keys: &[],
    paranoid: false,
    timestamps: true,
    tenant_column: None,
};

pub static GROUP: Model = Model {
    name: "Group",
    table: "groups",
    primary_key: "id",
    columns: &[
        Column::new("id", T::Uuid),
        Column::new("license_id", T::Uuid),
        Column::new("name", T::Text),
        Column::new("created_at", T::Timestamp),
        Column::new("updated_at", T::Timestamp),
        Column::new("deleted_at", T::Timestamp),
    ],
    relations: &[
        Relation {
            name: "license",
            target: &LICENSE,
            kind: RelationKind::BelongsTo {
                foreign_key: "license_id",
            },
            nested: &[],
        },
        Relation {
            name: "registers",
            target: &REGISTER,
            kind: RelationKind::BelongsToMany {
                through: &REGISTER_GROUP,
                source_key: "group_id",
                target_key: "register_id",
            },
            nested: &[],
        },
    ],
    unique_keys: &[],
    paranoid: true,
    timestamps: true,
    tenant_column: Some("license_id"),
};

pub static REGISTER: Model = Model {
    name: "Register",
    table: "registers",
    primary_key: "id",
    columns: &[
        Column::new("id", T::Uuid),
        Column::new("license_id", T::Uuid),
        Column::new("name", T::Text),
        Column::new("age", T::Int),
        Column::new("active", T::Bool),
        Column::new("group_id", T::Uuid),
        Column::new("created_at", T::Timestamp),
        Column::new("updated_at", T::Timestamp),
        Column::new("deleted_at", T::Timestamp),
    ],
    relations: &[
        Relation {
            name: "group",
            target: &GROUP,
            kind: RelationKind::BelongsTo {
                foreign_key: "group_id",
            },
            nested: &[Relation {
                name: "license",
                target: &LICENSE,
                kind: RelationKind::BelongsTo {
                    foreign_key: "license_id",
                },
                nested: &[],
            }],
        },
        Relation {
            name: "phones",
            target: &PHONE,
            kind: RelationKind::HasMany {
                foreign_key: "register_id",
            },
            nested: &[],
        },
        Relation {
            name: "groups",
            target: &GROUP,
            kind: RelationKind::BelongsToMany {
                through: &REGISTER_GROUP,
                source_key: "register_id",
                target_key: "group_id",
            },
            nested: &[],
        },
    ],
    unique_keys: &[],
    paranoid: true,
    timestamps: true,
    tenant_column: Some("license_id"),
};

pub static PHONE: Model = Model {
    name: "Phone",
    table: "register_phones",
    primary_key: "id",
    columns: &[
        Column::new("id", T::Uuid),
        Column::new("register_id", T::Uuid),
        Column::new("number", T::Text),
        Column::new("created_at", T::Timestamp),
        Column::new("updated_at", T::Timestamp),
    ],
    relations: &[],
    unique_keys: &[],
    paranoid: false,
    timestamps: true,
    tenant_column: None,
};

pub static REGISTER_GROUP: Model = Model {
    name: "RegisterGroup",
    table: "register_groups",
    primary_key: "id",
    columns: &[
        Column::new("id", T::Uuid),
        Column::new("register_id", T::Uuid),
        Column::new("group_id", T::Uuid),
        Column::new("created_at", T::Timestamp),
        Column::new("updated_at", T::Timestamp),
    ],
    relations: &[],
    unique_keys: &[&["register_id", "group_id"]],
    paranoid: false,
    timestamps: true,
    tenant_column: None,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Option<Uuid>,
    pub license_id: Option<Uuid>,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registers: Option<Vec<Register>>,
}

impl Group {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            license_id: None,
            name: name.to_string(),
            created_at: None,
            updated_at: None,
            deleted_at: None,
            registers: None,
        }
    }
}

impl Entity for Group {
    fn model() -> &'static Model {
        &GROUP
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub id: Option<Uuid>,
    pub license_id: Option<Uuid>,
    pub name: String,
    pub age: Option<i32>,
    pub active: Option<bool>,
    pub group_id: Option<Uuid>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phones: Option<Vec<Phone>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<Group>>,
}

impl Register {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            license_id: None,
            name: name.to_string(),
            age: None,
            active: None,
            group_id: None,
            created_at: None,
            updated_at: None,
            deleted_at: None,
            group: None,
            phones: None,
            groups: None,
        }
    }
}

impl Entity for Register {
    fn model() -> &'static Model {
        &REGISTER
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phone {
    pub id: Option<Uuid>,
    pub register_id: Option<Uuid>,
    pub number: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Phone {
    pub fn new(register_id: Option<Uuid>, number: &str) -> Self {
        Self {
            id: None,
            register_id,
            number: number.to_string(),
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Phone {
    fn model() -> &'static Model {
        &PHONE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterGroup {
    pub id: Option<Uuid>,
    pub register_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for RegisterGroup {
    fn model() -> &'static Model {
        &REGISTER_GROUP
    }
}

/// Memory store that counts opened transactions
#[derive(Clone)]
pub struct CountingStore {
    inner: MemoryStore,
    pub begins: Arc<AtomicUsize>,
}

impl CountingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            begins: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Store for CountingStore {
    type Tx = <MemoryStore as Store>::Tx;

    async fn begin(&self) -> RepositoryResult<Self::Tx> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        self.inner.begin().await
    }
}

/// Hooks that record every call and can be told to fail one stage
#[derive(Clone, Default)]
pub struct RecordingHooks {
    events: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<Option<&'static str>>>,
}

impl RecordingHooks {
    fn record(&self, event: &str) -> RepositoryResult<()> {
        self.events.lock().unwrap().push(event.to_string());
        if *self.failing.lock().unwrap() == Some(event) {
            return Err(RepositoryError::validation_failed(format!("{} rejected", event)));
        }
        Ok(())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    pub fn fail_after(&self, event: &'static str) {
        *self.failing.lock().unwrap() = Some(event);
    }
}

#[async_trait]
impl RepositoryHooks<Register> for RecordingHooks {
    async fn before_create(&self, _ctx: &TenantContext, _entity: &mut Register) -> RepositoryResult<()> {
        self.record("before_create")
    }

    async fn after_create(&self, _ctx: &TenantContext, _entity: &Register) -> RepositoryResult<()> {
        self.record("after_create")
    }

    async fn before_update(&self, _ctx: &TenantContext, _entity: &mut Register) -> RepositoryResult<()> {
        self.record("before_update")
    }

    async fn after_update(&self, _ctx: &TenantContext, _entity: &Register) -> RepositoryResult<()> {
        self.record("after_update")
    }

    async fn before_delete(&self, _ctx: &TenantContext, _predicate: &Predicate) -> RepositoryResult<()> {
        self.record("before_delete")
    }

    async fn after_delete(
        &self,
        _ctx: &TenantContext,
        _predicate: &Predicate,
        _deleted: u64,
    ) -> RepositoryResult<()> {
        self.record("after_delete")
    }

    async fn after_commit(&self, _ctx: &TenantContext, event: CommitEvent<'_, Register>) {
        let _ = self.record(&format!("after_commit:{}", event.kind()));
    }
}
