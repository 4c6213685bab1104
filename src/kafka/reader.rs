//! rdkafka-backed log reader with explicit partition assignment

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    ConsumerEvent, KafkaConfig, KafkaIntegrationError, LogReader, PartitionAssignment, StartOffset,
};
use crate::models::{ConsumedRecord, Header, Record, TopicPartitionOffset};

/// Reads the source topic through a manually assigned `StreamConsumer`
///
/// The consumer never subscribes, so no group rebalance ever moves
/// partitions away from it.
pub struct KafkaLogReader {
    consumer: Arc<StreamConsumer>,
    metadata_timeout: Duration,
}

impl KafkaLogReader {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaIntegrationError> {
        let consumer: StreamConsumer = config.build_consumer_config().create()?;

        Ok(Self {
            consumer: Arc::new(consumer),
            metadata_timeout: config.metadata_timeout(),
        })
    }

    fn decode(message: &BorrowedMessage<'_>) -> ConsumerEvent {
        let position =
            TopicPartitionOffset::new(message.topic(), message.partition(), message.offset());

        let key = match message.key().map(std::str::from_utf8) {
            Some(Ok(key)) => key.to_string(),
            Some(Err(_)) => {
                warn!(position = %position, "Record key is not valid UTF-8");
                return ConsumerEvent::Unkeyed(position);
            },
            None => return ConsumerEvent::Unkeyed(position),
        };

        let mut headers = Vec::new();
        if let Some(raw) = message.headers() {
            for header in raw.iter() {
                let value = match header.value.map(std::str::from_utf8) {
                    Some(Ok(value)) => value,
                    Some(Err(_)) => {
                        warn!(position = %position, header = header.key, "Skipping non UTF-8 header");
                        continue;
                    },
                    None => "",
                };
                headers.push(Header::new(header.key, value));
            }
        }

        ConsumerEvent::Record(ConsumedRecord {
            position,
            record: Record {
                key,
                value: message.payload().map(|p| p.to_vec()),
                headers,
            },
        })
    }
}

#[async_trait]
impl LogReader for KafkaLogReader {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, KafkaIntegrationError> {
        let consumer = Arc::clone(&self.consumer);
        let name = topic.to_string();
        let timeout = self.metadata_timeout;

        // Metadata requests block the calling thread
        let metadata = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(Some(&name), timeout)
        })
        .await
        .map_err(|e| KafkaIntegrationError::Consume(format!("metadata task failed: {}", e)))??;

        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|t| t.name() == topic && t.error().is_none())
            .flat_map(|t| t.partitions().iter().map(|p| p.id()))
            .collect();

        if partitions.is_empty() {
            return Err(KafkaIntegrationError::TopicNotFound(topic.to_string()));
        }

        debug!(topic = %topic, count = partitions.len(), "Fetched topic partitions");
        Ok(partitions)
    }

    async fn watermarks(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<(i64, i64), KafkaIntegrationError> {
        let consumer = Arc::clone(&self.consumer);
        let name = topic.to_string();
        let timeout = self.metadata_timeout;

        tokio::task::spawn_blocking(move || consumer.fetch_watermarks(&name, partition, timeout))
            .await
            .map_err(|e| KafkaIntegrationError::Watermarks {
                topic: topic.to_string(),
                partition,
                reason: e.to_string(),
            })?
            .map_err(|e| KafkaIntegrationError::Watermarks {
                topic: topic.to_string(),
                partition,
                reason: e.to_string(),
            })
    }

    async fn assign(&self, assignments: &[PartitionAssignment]) -> Result<(), KafkaIntegrationError> {
        let mut tpl = TopicPartitionList::new();
        for assignment in assignments {
            let offset = match assignment.start {
                StartOffset::Beginning => Offset::Beginning,
                StartOffset::Offset(offset) => Offset::Offset(offset),
            };
            tpl.add_partition_offset(&assignment.topic, assignment.partition, offset)
                .map_err(|e| KafkaIntegrationError::Assignment(e.to_string()))?;
        }

        self.consumer
            .assign(&tpl)
            .map_err(|e| KafkaIntegrationError::Assignment(e.to_string()))?;

        info!(partitions = assignments.len(), "Assigned source partitions");
        Ok(())
    }

    async fn next_event(&self) -> Result<ConsumerEvent, KafkaIntegrationError> {
        match self.consumer.recv().await {
            Ok(message) => Ok(Self::decode(&message)),
            Err(KafkaError::PartitionEOF(partition)) => {
                Ok(ConsumerEvent::EndOfPartition { partition })
            },
            Err(e) => Err(KafkaIntegrationError::Consume(e.to_string())),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.consumer.unassign() {
            warn!(error = %e, "Failed to release partition assignment");
        }
        info!("Source reader closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_creation_does_not_connect() {
        let config = KafkaConfig {
            brokers: "localhost:9092".to_string(),
            ..Default::default()
        };
        assert!(KafkaLogReader::new(&config).is_ok());
    }

    // Integration test would require a running Kafka instance
    #[ignore]
    #[tokio::test]
    async fn test_fetch_partitions() {
        let reader = KafkaLogReader::new(&KafkaConfig::default()).unwrap();
        let partitions = reader.partitions("statecache-items").await.unwrap();
        assert!(!partitions.is_empty());
    }
}
