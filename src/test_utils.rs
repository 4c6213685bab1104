//! Test utilities for statecache
//!
//! This module provides scripted broker fakes and a store wrapper that can be
//! told to fail, so the consumer and outbox loops run without Kafka.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::db::{
    ApplyOutcome, DeleteOutcome, MaterializedStore, MemoryMaterializedStore, OffsetLedger,
    RepositoryError, RepositoryResult,
};
use crate::kafka::{
    ConsumerEvent, KafkaIntegrationError, LogPublisher, LogReader, PartitionAssignment,
    PublishError, PublishOutcome,
};
use crate::models::{
    ConsumedRecord, Query, QueryOutcome, Record, StoredItem, TopicPartitionOffset,
};
use crate::shutdown::Shutdown;

/// Scripted log reader
///
/// Events are handed out in the order they were pushed. Once the script is
/// exhausted `next_event` never resolves, like a quiet broker.
#[derive(Debug, Default)]
pub struct FakeLogReader {
    topic_partitions: Vec<i32>,
    bounds: HashMap<i32, (i64, i64)>,
    watermark_failures: AtomicU32,
    events: Mutex<VecDeque<Result<ConsumerEvent, KafkaIntegrationError>>>,
    assigned: Mutex<Vec<PartitionAssignment>>,
    closed: AtomicBool,
}

impl FakeLogReader {
    /// Create a reader for a topic with `partitions`, all empty
    pub fn new(partitions: &[i32]) -> Self {
        Self {
            topic_partitions: partitions.to_vec(),
            ..Default::default()
        }
    }

    /// Set the low and high watermark of a partition
    pub fn with_watermarks(mut self, partition: i32, low: i64, high: i64) -> Self {
        self.bounds.insert(partition, (low, high));
        self
    }

    /// Fail the next `count` watermark queries
    pub fn fail_watermarks(self, count: u32) -> Self {
        self.watermark_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn push_record(&self, topic: &str, partition: i32, offset: i64, record: Record) {
        self.push_event(ConsumerEvent::Record(ConsumedRecord {
            position: TopicPartitionOffset::new(topic, partition, offset),
            record,
        }));
    }

    pub fn push_event(&self, event: ConsumerEvent) {
        self.events.lock().unwrap().push_back(Ok(event));
    }

    pub fn push_error(&self, error: KafkaIntegrationError) {
        self.events.lock().unwrap().push_back(Err(error));
    }

    /// Number of scripted events not yet consumed
    pub fn remaining(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// The most recent assignment
    pub fn assigned(&self) -> Vec<PartitionAssignment> {
        self.assigned.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogReader for FakeLogReader {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, KafkaIntegrationError> {
        if self.topic_partitions.is_empty() {
            return Err(KafkaIntegrationError::TopicNotFound(topic.to_string()));
        }
        Ok(self.topic_partitions.clone())
    }

    async fn watermarks(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<(i64, i64), KafkaIntegrationError> {
        let failing = self
            .watermark_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(KafkaIntegrationError::Watermarks {
                topic: topic.to_string(),
                partition,
                reason: "scripted failure".to_string(),
            });
        }
        Ok(self.bounds.get(&partition).copied().unwrap_or((0, 0)))
    }

    async fn assign(&self, assignments: &[PartitionAssignment]) -> Result<(), KafkaIntegrationError> {
        *self.assigned.lock().unwrap() = assignments.to_vec();
        Ok(())
    }

    async fn next_event(&self) -> Result<ConsumerEvent, KafkaIntegrationError> {
        let next = self.events.lock().unwrap().pop_front();
        match next {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Publisher that records what it was given
///
/// Reports a full send buffer for the first `buffer_full_times` attempts,
/// then answers every publish with the configured outcome.
#[derive(Debug)]
pub struct FakePublisher {
    buffer_full_remaining: AtomicU32,
    outcome: PublishOutcome,
    failure: Option<String>,
    attempts: AtomicU32,
    published: Mutex<Vec<Record>>,
}

impl Default for FakePublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePublisher {
    pub fn new() -> Self {
        Self {
            buffer_full_remaining: AtomicU32::new(0),
            outcome: PublishOutcome::Persisted,
            failure: None,
            attempts: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_full_times(self, count: u32) -> Self {
        self.buffer_full_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_outcome(mut self, outcome: PublishOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Fail every publish with a terminal error
    pub fn failing(mut self, reason: &str) -> Self {
        self.failure = Some(reason.to_string());
        self
    }

    /// Total publish calls, including ones rejected for backpressure
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Records the broker accepted
    pub fn published(&self) -> Vec<Record> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogPublisher for FakePublisher {
    async fn publish(&self, record: &Record) -> Result<PublishOutcome, PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let backpressure = self
            .buffer_full_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if backpressure {
            return Err(PublishError::BufferFull);
        }
        if let Some(reason) = &self.failure {
            return Err(PublishError::Failed(reason.clone()));
        }

        if self.outcome != PublishOutcome::NotPersisted {
            self.published.lock().unwrap().push(record.clone());
        }
        Ok(self.outcome)
    }
}

/// Memory store that fails ledger writes on demand
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryMaterializedStore,
    fail_ledger: AtomicBool,
    fail_apply_structural: AtomicBool,
    fail_watermarks: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every ledger write (including record application) fail
    pub fn fail_ledger_writes(&self) {
        self.fail_ledger.store(true, Ordering::SeqCst);
    }

    /// Make the next record application report a row count mismatch
    pub fn fail_next_apply_structurally(&self) {
        self.fail_apply_structural.store(true, Ordering::SeqCst);
    }

    /// Make recording startup watermarks fail
    pub fn fail_watermark_writes(&self) {
        self.fail_watermarks.store(true, Ordering::SeqCst);
    }

    fn check_ledger(&self) -> RepositoryResult<()> {
        if self.fail_ledger.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl OffsetLedger for FlakyStore {
    async fn last_consumed(&self) -> RepositoryResult<Vec<TopicPartitionOffset>> {
        self.inner.last_consumed().await
    }

    async fn update_last_consumed(&self, position: &TopicPartitionOffset) -> RepositoryResult<()> {
        self.check_ledger()?;
        self.inner.update_last_consumed(position).await
    }

    async fn set_startup_watermarks(
        &self,
        watermarks: Vec<TopicPartitionOffset>,
    ) -> RepositoryResult<()> {
        if self.fail_watermarks.load(Ordering::SeqCst) {
            return Err(RepositoryError::LockPoisoned("watermarks".to_string()));
        }
        self.inner.set_startup_watermarks(watermarks).await
    }

    async fn startup_watermarks(&self) -> RepositoryResult<Option<Vec<TopicPartitionOffset>>> {
        self.inner.startup_watermarks().await
    }
}

#[async_trait]
impl MaterializedStore for FlakyStore {
    async fn upsert(&self, item: &StoredItem) -> RepositoryResult<()> {
        self.inner.upsert(item).await
    }

    async fn delete(&self, key: &str) -> RepositoryResult<DeleteOutcome> {
        self.inner.delete(key).await
    }

    async fn get(&self, key: &str) -> RepositoryResult<Option<StoredItem>> {
        self.inner.get(key).await
    }

    async fn query(&self, query: &Query, shutdown: &Shutdown) -> RepositoryResult<QueryOutcome> {
        self.inner.query(query, shutdown).await
    }

    async fn count(&self) -> RepositoryResult<u64> {
        self.inner.count().await
    }

    async fn health_check(&self) -> RepositoryResult<()> {
        self.inner.health_check().await
    }

    async fn apply(&self, consumed: &ConsumedRecord) -> RepositoryResult<ApplyOutcome> {
        if self.fail_apply_structural.swap(false, Ordering::SeqCst) {
            return Err(RepositoryError::row_count("apply", 1, 0));
        }
        self.check_ledger()?;
        self.inner.apply(consumed).await
    }
}
