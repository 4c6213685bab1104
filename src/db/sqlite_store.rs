//! SQLite implementation of the materialized store
//!
//! Items and last-consumed offsets live in the same database, and a consumed
//! record is applied together with its offset in one transaction.

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::config::QueryConfig;
use crate::db::repository::{
    ApplyOutcome, DeleteOutcome, MaterializedStore, OffsetLedger, RepositoryError,
    RepositoryResult, RetryConfig,
};
use crate::db::watermarks::WatermarkCell;
use crate::db::{deadline_reached, execute_with_retry, DbPool};
use crate::models::record::{decode_headers, encode_headers};
use crate::models::{
    ConsumedRecord, FilterCriteria, ProjectedItem, Query, QueryOutcome, RequestableField,
    StoredItem, TopicPartitionOffset,
};
use crate::shutdown::Shutdown;

/// SQLite-backed materialized store
pub struct SqliteMaterializedStore {
    pool: DbPool,
    watermarks: WatermarkCell,
    query_config: QueryConfig,
    retry_config: RetryConfig,
}

impl SqliteMaterializedStore {
    /// Create a store over an already migrated pool
    pub fn new(pool: DbPool, query_config: QueryConfig) -> Self {
        Self {
            pool,
            watermarks: WatermarkCell::new(),
            query_config,
            retry_config: RetryConfig::default(),
        }
    }

    fn row_to_item(row: &SqliteRow) -> RepositoryResult<StoredItem> {
        let headers: Option<String> = row.try_get("item_headers")?;
        Ok(StoredItem {
            key: row.try_get("item_key")?,
            value: row.try_get("item_value")?,
            headers: decode_headers(headers.as_deref())?,
        })
    }

    fn row_to_projected(
        row: &SqliteRow,
        fields: &[RequestableField],
    ) -> RepositoryResult<ProjectedItem> {
        let mut projected = ProjectedItem::default();
        for field in fields {
            match field {
                RequestableField::Key => projected.key = Some(row.try_get(field.column())?),
                RequestableField::Value => {
                    let value: Vec<u8> = row.try_get(field.column())?;
                    projected.value = Some(String::from_utf8_lossy(&value).into_owned());
                },
                RequestableField::Headers => {
                    let raw: Option<String> = row.try_get(field.column())?;
                    let headers = decode_headers(raw.as_deref())?;
                    if !headers.is_empty() {
                        projected.headers = Some(headers);
                    }
                },
            }
        }
        Ok(projected)
    }

    fn row_to_offset(row: &SqliteRow) -> RepositoryResult<TopicPartitionOffset> {
        Ok(TopicPartitionOffset {
            topic: row.try_get("topic")?,
            partition: row.try_get("partition_id")?,
            offset: row.try_get("last_offset")?,
        })
    }
}

/// Build the SELECT for a query along with its bound parameters
///
/// Column names come only from the field enumerations; every caller value is
/// returned as a parameter.
pub(crate) fn build_select(
    query: &Query,
    fields: &[RequestableField],
    limit: Option<usize>,
) -> (String, Vec<String>) {
    let columns: Vec<&str> = fields.iter().map(|f| f.column()).collect();
    let mut sql = format!("SELECT {} FROM items", columns.join(", "));
    let mut params = Vec::new();

    let mut predicates = Vec::with_capacity(query.filters.len());
    for clause in &query.filters {
        let expr = clause.field.column_expr();
        let value = clause.value.clone().unwrap_or_default();
        let predicate = match clause.criteria {
            FilterCriteria::Equals => {
                params.push(value);
                format!("{} = ?", expr)
            },
            FilterCriteria::DoesntEqual => {
                params.push(value);
                format!("{} != ?", expr)
            },
            FilterCriteria::Contains => {
                params.push(like_pattern(&value));
                format!("{} LIKE ? ESCAPE '\\'", expr)
            },
            FilterCriteria::DoesntContain => {
                params.push(like_pattern(&value));
                format!("{} NOT LIKE ? ESCAPE '\\'", expr)
            },
            FilterCriteria::IsNull => format!("{} IS NULL", expr),
            FilterCriteria::IsEmpty => format!("{} = ''", expr),
        };
        predicates.push(predicate);
    }

    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    sql.push_str(" ORDER BY rowid");

    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    (sql, params)
}

fn like_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('%');
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

const UPSERT_ITEM: &str = r#"
    INSERT INTO items (item_key, item_value, item_headers)
    VALUES (?, ?, ?)
    ON CONFLICT (item_key) DO UPDATE SET
        item_value = excluded.item_value,
        item_headers = excluded.item_headers
"#;

const UPSERT_OFFSET: &str = r#"
    INSERT INTO topic_partition_offsets (topic, partition_id, last_offset)
    VALUES (?, ?, ?)
    ON CONFLICT (topic, partition_id) DO UPDATE SET last_offset = excluded.last_offset
"#;

const DELETE_ITEM: &str = "DELETE FROM items WHERE item_key = ?";

fn expect_one(operation: &'static str, affected: u64) -> RepositoryResult<()> {
    if affected == 1 {
        Ok(())
    } else {
        Err(RepositoryError::row_count(operation, 1, affected))
    }
}

fn delete_outcome(key: &str, affected: u64) -> RepositoryResult<DeleteOutcome> {
    match affected {
        0 => {
            tracing::warn!(key = %key, "Delete requested for key that is not stored");
            Ok(DeleteOutcome::NotFound)
        },
        1 => Ok(DeleteOutcome::Deleted),
        n => Err(RepositoryError::row_count("delete", 1, n)),
    }
}

#[async_trait]
impl OffsetLedger for SqliteMaterializedStore {
    async fn last_consumed(&self) -> RepositoryResult<Vec<TopicPartitionOffset>> {
        let rows = sqlx::query(
            "SELECT topic, partition_id, last_offset FROM topic_partition_offsets ORDER BY topic, partition_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_offset).collect()
    }

    async fn update_last_consumed(&self, position: &TopicPartitionOffset) -> RepositoryResult<()> {
        let pool = self.pool.clone();
        let position = position.clone();

        execute_with_retry(&self.retry_config, || {
            let pool = pool.clone();
            let position = position.clone();
            Box::pin(async move {
                let result = sqlx::query(UPSERT_OFFSET)
                    .bind(&position.topic)
                    .bind(position.partition)
                    .bind(position.offset)
                    .execute(&pool)
                    .await?;
                expect_one("update_last_consumed", result.rows_affected())
            })
        })
        .await
    }

    async fn set_startup_watermarks(
        &self,
        watermarks: Vec<TopicPartitionOffset>,
    ) -> RepositoryResult<()> {
        self.watermarks.set(watermarks)
    }

    async fn startup_watermarks(&self) -> RepositoryResult<Option<Vec<TopicPartitionOffset>>> {
        self.watermarks.get()
    }
}

#[async_trait]
impl MaterializedStore for SqliteMaterializedStore {
    async fn upsert(&self, item: &StoredItem) -> RepositoryResult<()> {
        let headers = encode_headers(&item.headers)?;
        let result = sqlx::query(UPSERT_ITEM)
            .bind(&item.key)
            .bind(&item.value)
            .bind(headers)
            .execute(&self.pool)
            .await?;

        expect_one("upsert", result.rows_affected())
    }

    async fn delete(&self, key: &str) -> RepositoryResult<DeleteOutcome> {
        let result = sqlx::query(DELETE_ITEM)
            .bind(key)
            .execute(&self.pool)
            .await?;

        delete_outcome(key, result.rows_affected())
    }

    async fn get(&self, key: &str) -> RepositoryResult<Option<StoredItem>> {
        let row = sqlx::query("SELECT item_key, item_value, item_headers FROM items WHERE item_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn query(&self, query: &Query, shutdown: &Shutdown) -> RepositoryResult<QueryOutcome> {
        let fields = query.projection();
        if fields.is_empty() {
            return Err(RepositoryError::InvalidQuery(
                "at least one field must be requested".to_string(),
            ));
        }

        let limit = query.effective_limit(self.query_config.result_limit);
        let (sql, params) = build_select(query, &fields, limit);
        let deadline = self
            .query_config
            .timeout()
            .map(|timeout| tokio::time::Instant::now() + timeout);

        let mut select = sqlx::query(&sql);
        for param in params {
            select = select.bind(param);
        }

        let mut rows = select.fetch(&self.pool);
        let mut items = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    tracing::warn!(collected = items.len(), "Query canceled");
                    return Ok(QueryOutcome::canceled(items));
                },
                _ = deadline_reached(deadline) => {
                    tracing::warn!(collected = items.len(), "Query timed out");
                    return Ok(QueryOutcome::timed_out(items));
                },
                row = rows.try_next() => row?,
            };

            match next {
                Some(row) => items.push(Self::row_to_projected(&row, &fields)?),
                None => break,
            }
        }

        Ok(QueryOutcome::success(items))
    }

    async fn count(&self) -> RepositoryResult<u64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn health_check(&self) -> RepositoryResult<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(RepositoryError::from)
    }

    async fn apply(&self, consumed: &ConsumedRecord) -> RepositoryResult<ApplyOutcome> {
        let pool = self.pool.clone();
        let consumed = consumed.clone();
        let headers = encode_headers(&consumed.record.headers)?;

        execute_with_retry(&self.retry_config, || {
            let pool = pool.clone();
            let consumed = consumed.clone();
            let headers = headers.clone();
            Box::pin(async move {
                let mut tx = pool.begin().await?;
                let record = &consumed.record;

                let outcome = match &record.value {
                    Some(value) => {
                        let result = sqlx::query(UPSERT_ITEM)
                            .bind(&record.key)
                            .bind(value)
                            .bind(headers)
                            .execute(&mut *tx)
                            .await?;
                        expect_one("upsert", result.rows_affected())?;
                        ApplyOutcome::Upserted
                    },
                    None => {
                        let result = sqlx::query(DELETE_ITEM)
                            .bind(&record.key)
                            .execute(&mut *tx)
                            .await?;
                        match delete_outcome(&record.key, result.rows_affected())? {
                            DeleteOutcome::Deleted => ApplyOutcome::Deleted,
                            DeleteOutcome::NotFound => ApplyOutcome::AlreadyAbsent,
                        }
                    },
                };

                let position = &consumed.position;
                let result = sqlx::query(UPSERT_OFFSET)
                    .bind(&position.topic)
                    .bind(position.partition)
                    .bind(position.offset)
                    .execute(&mut *tx)
                    .await?;
                expect_one("update_last_consumed", result.rows_affected())?;

                tx.commit().await?;
                Ok(outcome)
            })
        })
        .await
    }
}
