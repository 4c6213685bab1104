//! Kafka integration module
//!
//! This module provides:
//! - A partition-assigned reader that rebuilds the materialized view from the
//!   source topic, tracking offsets in the local ledger
//! - The outbox publisher and the worker that drains the outbox into the log
//! - Broker-facing traits so both loops can run against scripted fakes

mod config;
mod consumer;
mod outbox_worker;
mod processor;
mod producer;
mod reader;

pub use config::KafkaConfig;
pub use consumer::{plan_assignment, AssignmentPlan, ConsumerSettings, ConsumerState, StateConsumer};
pub use outbox_worker::{DrainSummary, OutboxSettings, OutboxWorker};
pub use processor::{Heartbeat, ProcessingResult, RecordProcessor};
pub use producer::KafkaPublisher;
pub use reader::KafkaLogReader;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use std::fmt;
use thiserror::Error;

use crate::models::{ConsumedRecord, Record, TopicPartitionOffset};

/// Kafka-specific error types
#[derive(Debug, Error)]
pub enum KafkaIntegrationError {
    #[error("Kafka connection error: {0}")]
    ConnectionError(#[from] KafkaError),

    #[error("Topic not found or has no partitions: {0}")]
    TopicNotFound(String),

    #[error("Watermark query failed for {topic}[{partition}]: {reason}")]
    Watermarks {
        topic: String,
        partition: i32,
        reason: String,
    },

    #[error("Partition assignment failed: {0}")]
    Assignment(String),

    #[error("Consume failed: {0}")]
    Consume(String),
}

impl From<KafkaIntegrationError> for crate::error::Error {
    fn from(err: KafkaIntegrationError) -> Self {
        crate::error::Error::kafka(err.to_string())
    }
}

/// Where reading starts for an assigned partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Beginning,
    Offset(i64),
}

/// One partition of the source topic together with its start position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub topic: String,
    pub partition: i32,
    pub start: StartOffset,
}

impl PartitionAssignment {
    pub fn beginning(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            start: StartOffset::Beginning,
        }
    }

    /// Resume at a saved ledger position
    pub fn resume(position: &TopicPartitionOffset) -> Self {
        Self {
            topic: position.topic.clone(),
            partition: position.partition,
            start: StartOffset::Offset(position.offset),
        }
    }
}

impl fmt::Display for PartitionAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            StartOffset::Beginning => write!(f, "{}[{}]@beginning", self.topic, self.partition),
            StartOffset::Offset(offset) => {
                write!(f, "{}[{}]@{}", self.topic, self.partition, offset)
            },
        }
    }
}

/// What the reader handed back from one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Record(ConsumedRecord),
    /// A record without a key; it cannot be applied but its offset still counts
    Unkeyed(TopicPartitionOffset),
    /// The reader reached the current end of a partition
    EndOfPartition { partition: i32 },
}

/// Source side of the log
#[async_trait]
pub trait LogReader: Send + Sync {
    /// Partition ids of `topic`
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, KafkaIntegrationError>;

    /// Low and high watermarks of a partition; high is the next offset to be written
    async fn watermarks(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<(i64, i64), KafkaIntegrationError>;

    /// Assign partitions explicitly, replacing any previous assignment
    async fn assign(&self, assignments: &[PartitionAssignment]) -> Result<(), KafkaIntegrationError>;

    /// Wait for the next record or end-of-partition marker
    async fn next_event(&self) -> Result<ConsumerEvent, KafkaIntegrationError>;

    /// Release the assignment
    async fn close(&self);
}

/// Delivery verdict reported by the broker for one publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Persisted,
    /// Delivery timed out; the record may or may not be in the log
    PossiblyPersisted,
    NotPersisted,
}

/// Publish failures raised before a delivery verdict exists
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The local send buffer is full; the same record should be retried later
    #[error("producer queue is full")]
    BufferFull,

    #[error("publish failed: {0}")]
    Failed(String),
}

/// Destination side of the log, used by the outbox worker
#[async_trait]
pub trait LogPublisher: Send + Sync {
    async fn publish(&self, record: &Record) -> Result<PublishOutcome, PublishError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_display() {
        let resumed = PartitionAssignment::resume(&TopicPartitionOffset::new("items", 2, 41));
        assert_eq!(resumed.to_string(), "items[2]@41");
        assert_eq!(
            PartitionAssignment::beginning("items", 0).to_string(),
            "items[0]@beginning"
        );
    }

    #[test]
    fn test_kafka_error_maps_to_app_error() {
        let err: crate::error::Error = KafkaIntegrationError::TopicNotFound("items".into()).into();
        assert!(matches!(err, crate::error::Error::Kafka(_)));
    }
}
