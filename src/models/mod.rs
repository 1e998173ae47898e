use std::path::Path;

use anyhow::{Context, Result};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

pub mod call;
pub mod call_msn_indexes;
pub mod migration;

const DATABASE_FILE: &str = "fritz2mqtt.db";

/// Builds the SQLite URL for the bridge database under `<data_dir>/database/`.
pub fn database_url(data_dir: &str) -> String {
    format!(
        "sqlite://{}?mode=rwc",
        Path::new(data_dir)
            .join("database")
            .join(DATABASE_FILE)
            .display()
    )
}

pub fn prepare_sqlite_database(database_url: &str) -> Result<()> {
    let Some(path_part) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };

    let (path_str, _) = path_part.split_once('?').unwrap_or((path_part, ""));
    if path_str.is_empty() || path_str.starts_with(':') {
        return Ok(());
    }

    let path = Path::new(path_str);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database directory at {}",
                    parent.display()
                )
            })?;
        }
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to create database file at {}", path.display()))?;
    }

    Ok(())
}

/// Opens the database and brings the schema up to date.
pub async fn create_db(database_url: &str) -> Result<DatabaseConnection> {
    prepare_sqlite_database(database_url)?;
    let db = Database::connect(database_url)
        .await
        .with_context(|| format!("failed to connect to database: {}", database_url))?;

    if database_url.starts_with("sqlite://") {
        // Concurrent readers with a single writer.
        db.execute_unprepared("PRAGMA journal_mode=WAL")
            .await
            .context("failed to enable WAL journal mode")?;
    }

    migration::Migrator::up(&db, None)
        .await
        .context("failed to run database migrations")?;
    Ok(db)
}
