//! Database module for statecache
//!
//! This module provides the storage capabilities behind the service: the
//! offset ledger, the materialized store and the outbox queue, each with a
//! SQLite backend and an in-memory backend.

pub mod memory_outbox;
pub mod memory_store;
pub mod pool;
pub mod repository;
pub mod sqlite_outbox;
pub mod sqlite_store;
pub mod watermarks;

// Re-export commonly used types
pub use memory_outbox::MemoryOutbox;
pub use memory_store::MemoryMaterializedStore;
pub use pool::{create_memory_pool, create_pool, DbPool};
pub use repository::{
    ApplyOutcome, DeleteOutcome, MaterializedStore, OffsetLedger, OutboxQueue, RepositoryError,
    RepositoryResult, RetryConfig,
};
pub use sqlite_outbox::SqliteOutbox;
pub use sqlite_store::SqliteMaterializedStore;
pub use watermarks::WatermarkCell;

use backoff::future::retry;
use futures::future::BoxFuture;
use sqlx::migrate::Migrator;
use std::sync::Arc;

use crate::config::{QueryConfig, StorageBackend, StorageConfig};
use crate::error::Result;

/// Database migrator for running schema migrations
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Run database migrations
pub async fn run_migrations(pool: &DbPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

/// The store and outbox selected by configuration
#[derive(Clone)]
pub struct Storage {
    pub store: Arc<dyn MaterializedStore>,
    pub outbox: Arc<dyn OutboxQueue>,
}

impl Storage {
    /// Build the configured backends
    pub async fn open(config: &StorageConfig, query: QueryConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Sqlite => {
                let pool = create_pool(config).await?;
                Ok(Self {
                    store: Arc::new(SqliteMaterializedStore::new(pool.clone(), query)),
                    outbox: Arc::new(SqliteOutbox::new(pool)),
                })
            },
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; state is lost on restart");
                Ok(Self::in_memory(query))
            },
        }
    }

    pub fn in_memory(query: QueryConfig) -> Self {
        Self {
            store: Arc::new(MemoryMaterializedStore::new(query)),
            outbox: Arc::new(MemoryOutbox::new()),
        }
    }
}

/// Execute a database operation, retrying transient failures
pub(crate) async fn execute_with_retry<F, T>(
    config: &RetryConfig,
    operation: F,
) -> RepositoryResult<T>
where
    F: Fn() -> BoxFuture<'static, RepositoryResult<T>>,
{
    retry(config.backoff(), || {
        let attempt = operation();
        async move {
            match attempt.await {
                Ok(value) => Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = ?e, "Retrying database operation");
                    Err(backoff::Error::transient(e))
                },
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}

/// Resolves once `deadline` has passed; never resolves without one
pub(crate) async fn deadline_reached(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: RepositoryResult<()> = execute_with_retry(&RetryConfig::default(), || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RepositoryError::EmptyQueue)
            })
        })
        .await;

        assert!(matches!(result, Err(RepositoryError::EmptyQueue)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let config = RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..RetryConfig::default()
        };

        let result = execute_with_retry(&config, || {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RepositoryError::Database(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(7)
                }
            })
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_memory_storage_selected() {
        let config = StorageConfig {
            backend: StorageBackend::Memory,
            sqlite_location: crate::config::SqliteLocation::File,
            sqlite_path: String::new(),
            pool_max_size: 1,
        };
        let storage = Storage::open(&config, QueryConfig::default()).await.unwrap();
        assert_eq!(storage.store.count().await.unwrap(), 0);
        assert_eq!(storage.outbox.pending_count().await.unwrap(), 0);
    }
}
