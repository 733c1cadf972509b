use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::errors::PermError;
use crate::perms::types::PermissionMap;
use crate::storage::{GroupRow, IdentityRow, MembershipRow, PermissionStore, SeaOrmStore};

/// SQLite database in a temp file with migrations applied.
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    pub async fn new() -> Self {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    pub fn store(&self) -> Arc<dyn PermissionStore> {
        Arc::new(SeaOrmStore::new(self.connection.clone()))
    }
}

/// Store wrapper that counts identity loads and can slow them down, fail the
/// next few of them, or fail every call.
pub struct CountingStore {
    inner: Arc<dyn PermissionStore>,
    identity_loads: AtomicUsize,
    failing_identity_loads: AtomicUsize,
    delay: Option<Duration>,
    fail: bool,
}

impl CountingStore {
    pub fn slow(inner: Arc<dyn PermissionStore>) -> Self {
        Self {
            inner,
            identity_loads: AtomicUsize::new(0),
            failing_identity_loads: AtomicUsize::new(0),
            delay: Some(Duration::from_millis(50)),
            fail: false,
        }
    }

    pub fn failing(inner: Arc<dyn PermissionStore>) -> Self {
        Self {
            inner,
            identity_loads: AtomicUsize::new(0),
            failing_identity_loads: AtomicUsize::new(0),
            delay: None,
            fail: true,
        }
    }

    pub fn identity_loads(&self) -> usize {
        self.identity_loads.load(Ordering::SeqCst)
    }

    /// Make the next `count` identity loads fail.
    pub fn fail_next_identity_loads(&self, count: usize) {
        self.failing_identity_loads.store(count, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.identity_loads.store(0, Ordering::SeqCst);
    }

    fn gate(&self) -> Result<(), PermError> {
        if self.fail {
            Err(PermError::Db(DbErr::Custom("store unavailable".into())))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PermissionStore for CountingStore {
    async fn load_groups(&self) -> Result<Vec<GroupRow>, PermError> {
        self.gate()?;
        self.inner.load_groups().await
    }

    async fn load_group_permissions(&self) -> Result<HashMap<String, PermissionMap>, PermError> {
        self.gate()?;
        self.inner.load_group_permissions().await
    }

    async fn upsert_group(&self, row: &GroupRow) -> Result<(), PermError> {
        self.gate()?;
        self.inner.upsert_group(row).await
    }

    async fn delete_group(&self, name: &str) -> Result<(), PermError> {
        self.gate()?;
        self.inner.delete_group(name).await
    }

    async fn replace_group_permissions(
        &self,
        name: &str,
        permissions: &PermissionMap,
    ) -> Result<(), PermError> {
        self.gate()?;
        self.inner.replace_group_permissions(name, permissions).await
    }

    async fn load_identity(&self, id: Uuid) -> Result<Option<IdentityRow>, PermError> {
        self.identity_loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.gate()?;
        let failing = self
            .failing_identity_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(PermError::Db(DbErr::Custom("identity load failed".into())));
        }
        self.inner.load_identity(id).await
    }

    async fn upsert_identity(&self, row: &IdentityRow) -> Result<(), PermError> {
        self.gate()?;
        self.inner.upsert_identity(row).await
    }

    async fn load_identity_groups(&self, id: Uuid) -> Result<Vec<MembershipRow>, PermError> {
        self.gate()?;
        self.inner.load_identity_groups(id).await
    }

    async fn replace_identity_groups(
        &self,
        id: Uuid,
        memberships: &[MembershipRow],
    ) -> Result<(), PermError> {
        self.gate()?;
        self.inner.replace_identity_groups(id, memberships).await
    }

    async fn load_identity_permissions(&self, id: Uuid) -> Result<PermissionMap, PermError> {
        self.gate()?;
        self.inner.load_identity_permissions(id).await
    }

    async fn replace_identity_permissions(
        &self,
        id: Uuid,
        permissions: &PermissionMap,
    ) -> Result<(), PermError> {
        self.gate()?;
        self.inner.replace_identity_permissions(id, permissions).await
    }

    async fn delete_expired_memberships(
        &self,
        now: i64,
        identity: Option<Uuid>,
    ) -> Result<u64, PermError> {
        self.gate()?;
        self.inner.delete_expired_memberships(now, identity).await
    }
}
