//! SQLite connection pool management for statecache
//!
//! This module provides connection pooling using SQLx. File-backed databases
//! run in WAL mode with a busy timeout so the HTTP readers do not block the
//! consumer loop's writes; in-memory databases are pinned to a single
//! connection because every connection to `sqlite::memory:` is its own
//! database.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::{SqliteLocation, StorageConfig};
use crate::error::{Error, Result};

/// Type alias for the database connection pool
pub type DbPool = SqlitePool;

/// Create a new database connection pool and run migrations
pub async fn create_pool(config: &StorageConfig) -> Result<DbPool> {
    let mut connect_options = SqliteConnectOptions::from_str(&config.sqlite_url())
        .map_err(|e| Error::config(format!("Invalid SQLite location: {}", e)))?
        .busy_timeout(Duration::from_secs(5));

    if config.sqlite_location == SqliteLocation::File {
        if let Some(parent) = std::path::Path::new(&config.sqlite_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        connect_options = connect_options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
    }

    let max_connections = config.effective_pool_size();
    let pool = pool_options(max_connections)
        .connect_with(connect_options)
        .await
        .map_err(|e| Error::storage(format!("Failed to create connection pool: {}", e)))?;

    super::run_migrations(&pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to run migrations: {}", e)))?;

    tracing::info!(
        url = %config.sqlite_url(),
        max_connections,
        "SQLite connection pool created"
    );

    Ok(pool)
}

/// Create a migrated in-memory pool
pub async fn create_memory_pool() -> Result<DbPool> {
    let pool = pool_options(1)
        .connect("sqlite::memory:")
        .await
        .map_err(|e| Error::storage(format!("Failed to create in-memory pool: {}", e)))?;

    super::run_migrations(&pool)
        .await
        .map_err(|e| Error::storage(format!("Failed to run migrations: {}", e)))?;

    Ok(pool)
}

fn pool_options(max_connections: u32) -> SqlitePoolOptions {
    let options = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10));

    // An idle in-memory connection must never be reaped, it holds the data
    if max_connections == 1 {
        options
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        options
            .idle_timeout(Some(Duration::from_secs(600)))
            .max_lifetime(Some(Duration::from_secs(3600)))
    }
}
