//! Outbox publisher for the destination topic

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header as KafkaHeader, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::time::Duration;
use tracing::{debug, warn};

use super::{KafkaConfig, KafkaIntegrationError, LogPublisher, PublishError, PublishOutcome};
use crate::models::Record;

/// Publishes outbox records and reports the broker's delivery verdict
pub struct KafkaPublisher {
    /// Kafka producer instance
    producer: FutureProducer,

    /// Destination topic name
    topic: String,
}

impl KafkaPublisher {
    /// Create a new publisher for `config.destination_topic`
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaIntegrationError> {
        let producer: FutureProducer = config.build_producer_config().create()?;

        Ok(Self {
            producer,
            topic: config.destination_topic.clone(),
        })
    }

    /// Flush any pending messages
    pub fn flush(&self, timeout: Duration) {
        if let Err(e) = self.producer.flush(timeout) {
            warn!(error = %e, "Producer flush did not complete");
        }
    }
}

/// Map a failed delivery report onto a persistence verdict
pub(crate) fn classify_delivery_error(error: &KafkaError) -> PublishOutcome {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut,
        ) => PublishOutcome::PossiblyPersisted,
        _ => PublishOutcome::NotPersisted,
    }
}

fn is_queue_full(error: &KafkaError) -> bool {
    error.rdkafka_error_code() == Some(RDKafkaErrorCode::QueueFull)
}

#[async_trait]
impl LogPublisher for KafkaPublisher {
    async fn publish(&self, record: &Record) -> Result<PublishOutcome, PublishError> {
        let mut message: FutureRecord<'_, str, [u8]> =
            FutureRecord::to(&self.topic).key(record.key.as_str());

        if let Some(value) = &record.value {
            message = message.payload(value.as_slice());
        }

        if !record.headers.is_empty() {
            let headers = record.headers.iter().fold(
                OwnedHeaders::new_with_capacity(record.headers.len()),
                |headers, h| {
                    headers.insert(KafkaHeader {
                        key: &h.name,
                        value: Some(h.value.as_str()),
                    })
                },
            );
            message = message.headers(headers);
        }

        let delivery = match self.producer.send_result(message) {
            Ok(delivery) => delivery,
            Err((e, _)) if is_queue_full(&e) => return Err(PublishError::BufferFull),
            Err((e, _)) => return Err(PublishError::Failed(e.to_string())),
        };

        match delivery.await {
            Ok(Ok(_)) => {
                debug!(key = %record.key, topic = %self.topic, "Published record");
                Ok(PublishOutcome::Persisted)
            },
            Ok(Err((e, _))) => {
                warn!(key = %record.key, error = %e, "Delivery failed");
                Ok(classify_delivery_error(&e))
            },
            Err(_) => Err(PublishError::Failed("delivery report was dropped".to_string())),
        }
    }
}
