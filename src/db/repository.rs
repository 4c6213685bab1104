//! Repository abstractions for statecache
//!
//! This module defines the storage capabilities shared by every backend: the
//! offset ledger, the materialized store built on top of it, and the outbox
//! queue. Each capability has a durable SQLite implementation and an
//! in-memory implementation selected at process start.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    ConsumedRecord, OutboxEntry, Query, QueryOutcome, Record, StoredItem, TopicPartitionOffset,
};
use crate::shutdown::Shutdown;

/// Result type for repository operations
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Repository error types
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// A write changed a different number of rows than it must
    #[error("{operation} affected {actual} rows, expected {expected}")]
    RowCountMismatch {
        operation: &'static str,
        expected: u64,
        actual: u64,
    },

    /// The outbox has no entry to operate on
    #[error("Outbox queue is empty")]
    EmptyQueue,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A lock guarding in-memory state was poisoned by a panicking writer
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    /// Invalid query
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RepositoryError {
    pub(crate) fn row_count(operation: &'static str, expected: u64, actual: u64) -> Self {
        RepositoryError::RowCountMismatch {
            operation,
            expected,
            actual,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RepositoryError::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
                // SQLITE_BUSY and SQLITE_LOCKED
                sqlx::Error::Database(db_err) => {
                    matches!(db_err.code().as_deref(), Some("5") | Some("6"))
                },
                _ => false,
            },
            _ => false,
        }
    }

    /// Structural errors are logged and reported, never fatal on their own
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            RepositoryError::RowCountMismatch { .. } | RepositoryError::EmptyQueue
        )
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

/// Convert repository errors to application errors
impl From<RepositoryError> for crate::error::Error {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::InvalidQuery(msg) => crate::error::Error::Validation(msg),
            _ => crate::error::Error::storage(err.to_string()),
        }
    }
}

/// Outcome of deleting a key from the materialized store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Progress bookkeeping for a consumed log
#[async_trait]
pub trait OffsetLedger: Send + Sync {
    /// Every (topic, partition) with recorded progress
    async fn last_consumed(&self) -> RepositoryResult<Vec<TopicPartitionOffset>>;

    /// Upsert progress for one (topic, partition); durable before returning
    async fn update_last_consumed(&self, position: &TopicPartitionOffset) -> RepositoryResult<()>;

    /// Replace the whole startup watermark set
    async fn set_startup_watermarks(
        &self,
        watermarks: Vec<TopicPartitionOffset>,
    ) -> RepositoryResult<()>;

    /// Startup watermarks, or `None` before they were captured
    async fn startup_watermarks(&self) -> RepositoryResult<Option<Vec<TopicPartitionOffset>>>;
}

/// Key/value view of a log, composed with its own offset ledger
#[async_trait]
pub trait MaterializedStore: OffsetLedger {
    /// Insert or overwrite an item by key
    async fn upsert(&self, item: &StoredItem) -> RepositoryResult<()>;

    /// Remove an item by key; a missing key is not an error
    async fn delete(&self, key: &str) -> RepositoryResult<DeleteOutcome>;

    async fn get(&self, key: &str) -> RepositoryResult<Option<StoredItem>>;

    /// Run a closed-field query, stopping early on deadline or shutdown
    async fn query(&self, query: &Query, shutdown: &Shutdown) -> RepositoryResult<QueryOutcome>;

    /// Number of items currently stored
    async fn count(&self) -> RepositoryResult<u64>;

    /// Health check for the store
    async fn health_check(&self) -> RepositoryResult<()>;

    /// Apply a consumed record and advance the ledger in one step
    ///
    /// On error neither the item nor the ledger changes.
    async fn apply(&self, consumed: &ConsumedRecord) -> RepositoryResult<ApplyOutcome>;
}

/// What applying a record did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Upserted,
    Deleted,
    /// Tombstone for a key that was not present
    AlreadyAbsent,
}

/// Durable FIFO of records waiting to be published
#[async_trait]
pub trait OutboxQueue: Send + Sync {
    /// Append a record; durable before returning
    async fn enqueue(&self, record: &Record) -> RepositoryResult<()>;

    /// Oldest entry by insertion sequence, without removing it
    async fn peek_oldest(&self) -> RepositoryResult<Option<OutboxEntry>>;

    /// Remove the oldest entry, which must be the one with `sequence`
    ///
    /// Fails with a row count mismatch when the head of the queue is some
    /// other entry.
    async fn delete_oldest(&self, sequence: i64) -> RepositoryResult<()>;

    /// Move the oldest entry into quarantine
    ///
    /// If the copy into quarantine fails the entry stays in the live queue.
    async fn mark_oldest_failed(&self) -> RepositoryResult<()>;

    async fn pending_count(&self) -> RepositoryResult<u64>;

    async fn failed_count(&self) -> RepositoryResult<u64>;
}

/// Retry configuration for repository operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff duration in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds
    pub max_backoff_ms: u64,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Give up after this many milliseconds
    pub max_elapsed_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 20,
            max_backoff_ms: 1000,
            multiplier: 2.0,
            max_elapsed_ms: 5000,
        }
    }
}

impl RetryConfig {
    pub(crate) fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(self.initial_backoff_ms),
            max_interval: std::time::Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
            max_elapsed_time: Some(std::time::Duration::from_millis(self.max_elapsed_ms)),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_count_mismatch_is_structural() {
        let err = RepositoryError::row_count("upsert", 1, 0);
        assert!(err.is_structural());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "upsert affected 0 rows, expected 1");
    }

    #[test]
    fn test_database_errors_are_not_structural() {
        let err = RepositoryError::Database(sqlx::Error::PoolTimedOut);
        assert!(!err.is_structural());
        assert!(err.is_retryable());
        assert!(!RepositoryError::Database(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn test_invalid_query_maps_to_validation() {
        let err: crate::error::Error = RepositoryError::InvalidQuery("bad".into()).into();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);

        let err: crate::error::Error = RepositoryError::EmptyQueue.into();
        assert_eq!(
            err.status_code(),
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retry_config_backoff() {
        let config = RetryConfig {
            initial_backoff_ms: 5,
            max_backoff_ms: 50,
            multiplier: 2.0,
            max_elapsed_ms: 100,
        };
        let backoff = config.backoff();
        assert_eq!(backoff.initial_interval.as_millis(), 5);
        assert_eq!(backoff.max_interval.as_millis(), 50);
        assert_eq!(backoff.max_elapsed_time.map(|d| d.as_millis()), Some(100));
    }
}
