//! SQLite implementation of the outbox queue

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::db::repository::{OutboxQueue, RepositoryError, RepositoryResult};
use crate::db::DbPool;
use crate::models::record::{decode_headers, encode_headers};
use crate::models::{OutboxEntry, Record};

const OLDEST: &str = "(SELECT MIN(sequence) FROM outbox)";

/// SQLite-backed outbox; entries are ordered by their autoincrement sequence
pub struct SqliteOutbox {
    pool: DbPool,
}

impl SqliteOutbox {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &SqliteRow) -> RepositoryResult<OutboxEntry> {
        let headers: Option<String> = row.try_get("item_headers")?;
        Ok(OutboxEntry {
            sequence: row.try_get("sequence")?,
            record: Record {
                key: row.try_get("item_key")?,
                value: row.try_get("item_value")?,
                headers: decode_headers(headers.as_deref())?,
            },
        })
    }
}

#[async_trait]
impl OutboxQueue for SqliteOutbox {
    async fn enqueue(&self, record: &Record) -> RepositoryResult<()> {
        let headers = encode_headers(&record.headers)?;
        let result =
            sqlx::query("INSERT INTO outbox (item_key, item_value, item_headers) VALUES (?, ?, ?)")
                .bind(&record.key)
                .bind(record.value.as_deref())
                .bind(headers)
                .execute(&self.pool)
                .await?;

        match result.rows_affected() {
            1 => Ok(()),
            n => Err(RepositoryError::row_count("enqueue", 1, n)),
        }
    }

    async fn peek_oldest(&self) -> RepositoryResult<Option<OutboxEntry>> {
        let row = sqlx::query(
            "SELECT sequence, item_key, item_value, item_headers FROM outbox ORDER BY sequence LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn delete_oldest(&self, sequence: i64) -> RepositoryResult<()> {
        let result = sqlx::query(&format!(
            "DELETE FROM outbox WHERE sequence = ? AND sequence = {}",
            OLDEST
        ))
        .bind(sequence)
        .execute(&self.pool)
        .await?;

        match result.rows_affected() {
            1 => Ok(()),
            n => Err(RepositoryError::row_count("delete_oldest", 1, n)),
        }
    }

    async fn mark_oldest_failed(&self) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await?;

        // Copied as stored, so an entry that cannot be decoded is still quarantined
        let copied = sqlx::query(&format!(
            "INSERT INTO outbox_failed (sequence, item_key, item_value, item_headers, failed_at) \
             SELECT sequence, item_key, item_value, item_headers, ? FROM outbox WHERE sequence = {}",
            OLDEST
        ))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        if copied.rows_affected() == 0 {
            return Err(RepositoryError::EmptyQueue);
        }

        let deleted = sqlx::query(&format!("DELETE FROM outbox WHERE sequence = {}", OLDEST))
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() != 1 {
            return Err(RepositoryError::row_count(
                "mark_oldest_failed",
                1,
                deleted.rows_affected(),
            ));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn pending_count(&self) -> RepositoryResult<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn failed_count(&self) -> RepositoryResult<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outbox_failed")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;

    #[tokio::test]
    async fn test_undecodable_entry_can_be_quarantined() {
        let pool = create_memory_pool().await.unwrap();
        let outbox = SqliteOutbox::new(pool.clone());

        sqlx::query("INSERT INTO outbox (item_key, item_value, item_headers) VALUES ('k', x'00', 'not json')")
            .execute(&pool)
            .await
            .unwrap();

        assert!(matches!(
            outbox.peek_oldest().await,
            Err(RepositoryError::Serialization(_))
        ));

        outbox.mark_oldest_failed().await.unwrap();
        assert_eq!(outbox.pending_count().await.unwrap(), 0);
        assert_eq!(outbox.failed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_round_trips_as_null() {
        let pool = create_memory_pool().await.unwrap();
        let outbox = SqliteOutbox::new(pool);

        outbox.enqueue(&Record::tombstone("gone")).await.unwrap();
        let entry = outbox.peek_oldest().await.unwrap().unwrap();
        assert!(entry.record.is_tombstone());
        assert_eq!(entry.record.key, "gone");
    }
}
