//! Applies consumed records to the materialized store

use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::db::{ApplyOutcome, MaterializedStore, RepositoryResult};
use crate::models::{ConsumedRecord, TopicPartitionOffset};

/// Processing result for a consumed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Record applied and its offset recorded
    Applied(ApplyOutcome),

    /// Record could not be applied; its offset was still recorded
    Skipped(String),
}

/// Progress since the last heartbeat
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Heartbeat {
    pub applied: u64,
    pub skipped: u64,
    pub last_position: Option<TopicPartitionOffset>,
}

/// Record processor that handles the store-side work of consumption
///
/// Errors returned from [`RecordProcessor::process`] are fatal for the
/// consumer: the ledger can no longer be trusted to match the store.
pub struct RecordProcessor {
    store: Arc<dyn MaterializedStore>,
    progress: Heartbeat,
}

impl RecordProcessor {
    pub fn new(store: Arc<dyn MaterializedStore>) -> Self {
        Self {
            store,
            progress: Heartbeat::default(),
        }
    }

    /// Apply one record and advance the ledger
    pub async fn process(&mut self, consumed: &ConsumedRecord) -> RepositoryResult<ProcessingResult> {
        match self.store.apply(consumed).await {
            Ok(outcome) => {
                debug!(
                    position = %consumed.position,
                    key = %consumed.record.key,
                    outcome = ?outcome,
                    "Applied record"
                );
                self.progress.applied += 1;
                self.progress.last_position = Some(consumed.position.clone());
                Ok(ProcessingResult::Applied(outcome))
            },
            Err(e) if e.is_structural() => {
                error!(
                    position = %consumed.position,
                    key = %consumed.record.key,
                    error = %e,
                    "Failed to apply record, continuing"
                );
                self.skip(&consumed.position, e.to_string()).await
            },
            Err(e) => {
                error!(position = %consumed.position, error = %e, "Store write failed");
                Err(e)
            },
        }
    }

    /// Record the offset of a record that carries nothing to apply
    pub async fn skip(
        &mut self,
        position: &TopicPartitionOffset,
        reason: impl Into<String>,
    ) -> RepositoryResult<ProcessingResult> {
        let reason = reason.into();
        warn!(position = %position, reason = %reason, "Skipping record");

        self.store.update_last_consumed(position).await?;
        self.progress.skipped += 1;
        self.progress.last_position = Some(position.clone());
        Ok(ProcessingResult::Skipped(reason))
    }

    /// Return the progress since the previous call and reset it
    pub fn take_heartbeat(&mut self) -> Heartbeat {
        std::mem::take(&mut self.progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryMaterializedStore, OffsetLedger};
    use crate::models::Record;

    fn consumed(offset: i64, record: Record) -> ConsumedRecord {
        ConsumedRecord {
            position: TopicPartitionOffset::new("items", 0, offset),
            record,
        }
    }

    #[tokio::test]
    async fn test_process_applies_and_counts() {
        let store = Arc::new(MemoryMaterializedStore::default());
        let mut processor = RecordProcessor::new(store.clone());

        let result = processor
            .process(&consumed(3, Record::new("k", b"v".to_vec())))
            .await
            .unwrap();
        assert_eq!(result, ProcessingResult::Applied(ApplyOutcome::Upserted));

        let result = processor.process(&consumed(4, Record::tombstone("missing"))).await.unwrap();
        assert_eq!(result, ProcessingResult::Applied(ApplyOutcome::AlreadyAbsent));

        let heartbeat = processor.take_heartbeat();
        assert_eq!(heartbeat.applied, 2);
        assert_eq!(heartbeat.last_position.unwrap().offset, 4);
        assert_eq!(processor.take_heartbeat(), Heartbeat::default());
    }

    #[tokio::test]
    async fn test_skip_advances_ledger() {
        let store = Arc::new(MemoryMaterializedStore::default());
        let mut processor = RecordProcessor::new(store.clone());
        let position = TopicPartitionOffset::new("items", 1, 9);

        let result = processor.skip(&position, "record has no key").await.unwrap();
        assert!(matches!(result, ProcessingResult::Skipped(_)));
        assert_eq!(store.last_consumed().await.unwrap(), vec![position]);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
