use std::sync::Arc;

use paladin::perms::PermissionEngine;
use paladin::settings;
use paladin::storage::{PermissionStore, SeaOrmStore};
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        // Connect to database
        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        // Run migrations
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

    /// Engine over this database using the built-in resolver
    pub async fn engine(&self) -> Arc<PermissionEngine> {
        Arc::new(
            PermissionEngine::start(self.store(), None, &settings::Resolver::default())
                .await
                .expect("Failed to start permission engine"),
        )
    }
}
