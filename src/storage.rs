//! Persistence for groups and identities.
//!
//! The engine only talks to the [`PermissionStore`] trait. [`SeaOrmStore`] is the
//! SQL implementation used in production; it runs permission-row replacement inside
//! a transaction. Other implementations are not required to, and a failure between
//! the delete and the re-insert can then leave a partial permission set behind.

use std::collections::HashMap;

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use uuid::Uuid;

use crate::entities;
use crate::errors::PermError;
use crate::perms::types::{Group, Identity, Membership, PermissionMap};
use crate::settings::Database as DbCfg;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRow {
    pub name: String,
    pub display_name: String,
    pub prefix: String,
    pub suffix: String,
    pub weight: i64,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRow {
    pub id: Uuid,
    pub display_name: String,
    pub primary_group: String,
    pub prefix: String,
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRow {
    pub group_name: String,
    pub expires_at: Option<i64>,
}

impl GroupRow {
    pub fn from_group(group: &Group) -> Self {
        Self {
            name: group.name.clone(),
            display_name: group.display_name.clone(),
            prefix: group.prefix.clone(),
            suffix: group.suffix.clone(),
            weight: group.weight,
            parent: group.parent.clone(),
        }
    }

    pub fn into_group(self, permissions: PermissionMap) -> Group {
        Group {
            name: self.name,
            display_name: self.display_name,
            prefix: self.prefix,
            suffix: self.suffix,
            weight: self.weight,
            parent: self.parent,
            permissions,
        }
    }
}

impl IdentityRow {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            display_name: identity.display_name.clone(),
            primary_group: identity.primary_group.clone(),
            prefix: identity.prefix.clone(),
            suffix: identity.suffix.clone(),
        }
    }

    pub fn into_identity(
        self,
        memberships: Vec<MembershipRow>,
        permissions: PermissionMap,
    ) -> Identity {
        Identity {
            id: self.id,
            display_name: self.display_name,
            primary_group: self.primary_group,
            additional_groups: memberships.into_iter().map(Membership::from).collect(),
            prefix: self.prefix,
            suffix: self.suffix,
            permissions,
        }
    }
}

impl From<MembershipRow> for Membership {
    fn from(row: MembershipRow) -> Self {
        Membership {
            group: row.group_name,
            expires_at: row.expires_at,
        }
    }
}

impl From<&Membership> for MembershipRow {
    fn from(m: &Membership) -> Self {
        MembershipRow {
            group_name: m.group.clone(),
            expires_at: m.expires_at,
        }
    }
}

/// Contract the engine needs from a backing store. Rows are keyed by group name or
/// identity id; the engine composes them itself.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn load_groups(&self) -> Result<Vec<GroupRow>, PermError>;

    /// All group permission rows, keyed by group name.
    async fn load_group_permissions(&self) -> Result<HashMap<String, PermissionMap>, PermError>;

    async fn upsert_group(&self, row: &GroupRow) -> Result<(), PermError>;

    /// Removes the group row together with its permission rows.
    async fn delete_group(&self, name: &str) -> Result<(), PermError>;

    async fn replace_group_permissions(
        &self,
        name: &str,
        permissions: &PermissionMap,
    ) -> Result<(), PermError>;

    async fn load_identity(&self, id: Uuid) -> Result<Option<IdentityRow>, PermError>;

    async fn upsert_identity(&self, row: &IdentityRow) -> Result<(), PermError>;

    async fn load_identity_groups(&self, id: Uuid) -> Result<Vec<MembershipRow>, PermError>;

    async fn replace_identity_groups(
        &self,
        id: Uuid,
        memberships: &[MembershipRow],
    ) -> Result<(), PermError>;

    async fn load_identity_permissions(&self, id: Uuid) -> Result<PermissionMap, PermError>;

    async fn replace_identity_permissions(
        &self,
        id: Uuid,
        permissions: &PermissionMap,
    ) -> Result<(), PermError>;

    /// Delete memberships that expired at or before `now`, for one identity or for all
    /// of them. Returns the number of rows removed.
    async fn delete_expired_memberships(
        &self,
        now: i64,
        identity: Option<Uuid>,
    ) -> Result<u64, PermError>;
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, PermError> {
    let db = Database::connect(&cfg.url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

#[derive(Debug, Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn flag(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

async fn insert_group_permissions<C: ConnectionTrait>(
    conn: &C,
    name: &str,
    permissions: &PermissionMap,
) -> Result<(), PermError> {
    use entities::group_permission::{ActiveModel, Entity};

    if permissions.is_empty() {
        return Ok(());
    }
    let rows = permissions.iter().map(|(node, value)| ActiveModel {
        group_name: Set(name.to_string()),
        node: Set(node.clone()),
        value: Set(flag(*value)),
    });
    Entity::insert_many(rows).exec_without_returning(conn).await?;
    Ok(())
}

async fn insert_identity_permissions<C: ConnectionTrait>(
    conn: &C,
    id: &str,
    permissions: &PermissionMap,
) -> Result<(), PermError> {
    use entities::identity_permission::{ActiveModel, Entity};

    if permissions.is_empty() {
        return Ok(());
    }
    let rows = permissions.iter().map(|(node, value)| ActiveModel {
        identity_id: Set(id.to_string()),
        node: Set(node.clone()),
        value: Set(flag(*value)),
    });
    Entity::insert_many(rows).exec_without_returning(conn).await?;
    Ok(())
}

#[async_trait]
impl PermissionStore for SeaOrmStore {
    async fn load_groups(&self) -> Result<Vec<GroupRow>, PermError> {
        use entities::group::Entity;

        Ok(Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|model| GroupRow {
                name: model.name,
                display_name: model.display_name,
                prefix: model.prefix,
                suffix: model.suffix,
                weight: model.weight,
                parent: model.parent,
            })
            .collect())
    }

    async fn load_group_permissions(&self) -> Result<HashMap<String, PermissionMap>, PermError> {
        use entities::group_permission::Entity;

        let mut by_group: HashMap<String, PermissionMap> = HashMap::new();
        for model in Entity::find().all(&self.db).await? {
            by_group
                .entry(model.group_name)
                .or_default()
                .insert(model.node, model.value != 0);
        }
        Ok(by_group)
    }

    async fn upsert_group(&self, row: &GroupRow) -> Result<(), PermError> {
        use entities::group::{ActiveModel, Column, Entity};

        let group = ActiveModel {
            name: Set(row.name.clone()),
            display_name: Set(row.display_name.clone()),
            prefix: Set(row.prefix.clone()),
            suffix: Set(row.suffix.clone()),
            weight: Set(row.weight),
            parent: Set(row.parent.clone()),
        };

        Entity::insert(group)
            .on_conflict(
                OnConflict::column(Column::Name)
                    .update_columns([
                        Column::DisplayName,
                        Column::Prefix,
                        Column::Suffix,
                        Column::Weight,
                        Column::Parent,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        Ok(())
    }

    async fn delete_group(&self, name: &str) -> Result<(), PermError> {
        use entities::{group, group_permission};

        let txn = self.db.begin().await?;
        group_permission::Entity::delete_many()
            .filter(group_permission::Column::GroupName.eq(name))
            .exec(&txn)
            .await?;
        group::Entity::delete_many()
            .filter(group::Column::Name.eq(name))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        Ok(())
    }

    async fn replace_group_permissions(
        &self,
        name: &str,
        permissions: &PermissionMap,
    ) -> Result<(), PermError> {
        use entities::group_permission::{Column, Entity};

        let txn = self.db.begin().await?;
        Entity::delete_many()
            .filter(Column::GroupName.eq(name))
            .exec(&txn)
            .await?;
        insert_group_permissions(&txn, name, permissions).await?;
        txn.commit().await?;

        Ok(())
    }

    async fn load_identity(&self, id: Uuid) -> Result<Option<IdentityRow>, PermError> {
        use entities::identity::{Column, Entity};

        if let Some(model) = Entity::find()
            .filter(Column::Id.eq(id.to_string()))
            .one(&self.db)
            .await?
        {
            Ok(Some(IdentityRow {
                id,
                display_name: model.display_name,
                primary_group: model.primary_group,
                prefix: model.prefix,
                suffix: model.suffix,
            }))
        } else {
            Ok(None)
        }
    }

    async fn upsert_identity(&self, row: &IdentityRow) -> Result<(), PermError> {
        use entities::identity::{ActiveModel, Column, Entity};

        let identity = ActiveModel {
            id: Set(row.id.to_string()),
            display_name: Set(row.display_name.clone()),
            primary_group: Set(row.primary_group.clone()),
            prefix: Set(row.prefix.clone()),
            suffix: Set(row.suffix.clone()),
        };

        Entity::insert(identity)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::DisplayName,
                        Column::PrimaryGroup,
                        Column::Prefix,
                        Column::Suffix,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        Ok(())
    }

    async fn load_identity_groups(&self, id: Uuid) -> Result<Vec<MembershipRow>, PermError> {
        use entities::identity_group::{Column, Entity};

        Ok(Entity::find()
            .filter(Column::IdentityId.eq(id.to_string()))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|model| MembershipRow {
                group_name: model.group_name,
                expires_at: model.expires_at,
            })
            .collect())
    }

    async fn replace_identity_groups(
        &self,
        id: Uuid,
        memberships: &[MembershipRow],
    ) -> Result<(), PermError> {
        use entities::identity_group::{ActiveModel, Column, Entity};

        let key = id.to_string();
        let txn = self.db.begin().await?;
        Entity::delete_many()
            .filter(Column::IdentityId.eq(key.clone()))
            .exec(&txn)
            .await?;
        if !memberships.is_empty() {
            let rows = memberships.iter().map(|m| ActiveModel {
                identity_id: Set(key.clone()),
                group_name: Set(m.group_name.clone()),
                expires_at: Set(m.expires_at),
            });
            Entity::insert_many(rows).exec_without_returning(&txn).await?;
        }
        txn.commit().await?;

        Ok(())
    }

    async fn load_identity_permissions(&self, id: Uuid) -> Result<PermissionMap, PermError> {
        use entities::identity_permission::{Column, Entity};

        Ok(Entity::find()
            .filter(Column::IdentityId.eq(id.to_string()))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|model| (model.node, model.value != 0))
            .collect())
    }

    async fn replace_identity_permissions(
        &self,
        id: Uuid,
        permissions: &PermissionMap,
    ) -> Result<(), PermError> {
        use entities::identity_permission::{Column, Entity};

        let key = id.to_string();
        let txn = self.db.begin().await?;
        Entity::delete_many()
            .filter(Column::IdentityId.eq(key.clone()))
            .exec(&txn)
            .await?;
        insert_identity_permissions(&txn, &key, permissions).await?;
        txn.commit().await?;

        Ok(())
    }

    async fn delete_expired_memberships(
        &self,
        now: i64,
        identity: Option<Uuid>,
    ) -> Result<u64, PermError> {
        use entities::identity_group::{Column, Entity};

        let mut query = Entity::delete_many().filter(Column::ExpiresAt.lte(now));
        if let Some(id) = identity {
            query = query.filter(Column::IdentityId.eq(id.to_string()));
        }
        let result = query.exec(&self.db).await?;

        Ok(result.rows_affected)
    }
}
