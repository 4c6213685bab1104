//! Kafka configuration module

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kafka configuration settings
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct KafkaConfig {
    /// Kafka broker addresses (comma-separated)
    #[serde(default = "default_brokers")]
    #[envconfig(from = "KAFKA_BROKERS", default = "localhost:9092")]
    pub brokers: String,

    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "statecache")]
    pub consumer_group: String,

    /// Topic the materialized view is built from
    #[serde(default = "default_source_topic")]
    #[envconfig(from = "KAFKA_SOURCE_TOPIC", default = "statecache-items")]
    pub source_topic: String,

    /// Topic the outbox publishes to
    #[serde(default = "default_source_topic")]
    #[envconfig(from = "KAFKA_DESTINATION_TOPIC", default = "statecache-items")]
    pub destination_topic: String,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "30000")]
    pub session_timeout_ms: u32,

    /// Timeout for metadata and watermark requests in milliseconds
    #[serde(default = "default_metadata_timeout")]
    #[envconfig(from = "KAFKA_METADATA_TIMEOUT_MS", default = "5000")]
    pub metadata_timeout_ms: u64,

    /// How long to keep retrying watermark queries at startup
    #[serde(default = "default_watermark_retry_max_secs")]
    #[envconfig(from = "KAFKA_WATERMARK_RETRY_MAX_SECS", default = "60")]
    pub watermark_retry_max_secs: u64,

    /// Enable idempotent producer
    #[serde(default = "default_idempotent_producer")]
    #[envconfig(from = "KAFKA_IDEMPOTENT_PRODUCER", default = "true")]
    pub idempotent_producer: bool,

    /// Compression type for the outbox producer
    #[serde(default = "default_compression_type")]
    #[envconfig(from = "KAFKA_COMPRESSION_TYPE", default = "snappy")]
    pub compression_type: String,

    /// Producer delivery timeout in milliseconds
    #[serde(default = "default_message_timeout")]
    #[envconfig(from = "KAFKA_MESSAGE_TIMEOUT_MS", default = "30000")]
    pub message_timeout_ms: u32,

    /// Size of the producer's local send queue
    #[serde(default = "default_queue_buffering_max_messages")]
    #[envconfig(from = "KAFKA_QUEUE_BUFFERING_MAX_MESSAGES", default = "100000")]
    pub queue_buffering_max_messages: u32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            consumer_group: default_consumer_group(),
            source_topic: default_source_topic(),
            destination_topic: default_source_topic(),
            session_timeout_ms: default_session_timeout(),
            metadata_timeout_ms: default_metadata_timeout(),
            watermark_retry_max_secs: default_watermark_retry_max_secs(),
            idempotent_producer: default_idempotent_producer(),
            compression_type: default_compression_type(),
            message_timeout_ms: default_message_timeout(),
            queue_buffering_max_messages: default_queue_buffering_max_messages(),
        }
    }
}

impl KafkaConfig {
    /// Get metadata timeout as Duration
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    /// Get the watermark retry budget as Duration
    pub fn watermark_retry_max(&self) -> Duration {
        Duration::from_secs(self.watermark_retry_max_secs)
    }

    /// Build rdkafka consumer configuration
    ///
    /// Offsets are tracked in the local ledger, so broker-side commits are
    /// disabled and end-of-partition events are enabled to drive idling.
    pub fn build_consumer_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();

        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("enable.partition.eof", "true")
            .set("auto.offset.reset", "earliest")
            .set("isolation.level", "read_committed");

        config
    }

    /// Build rdkafka producer configuration for the outbox
    pub fn build_producer_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();

        config
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", self.message_timeout_ms.to_string())
            .set(
                "queue.buffering.max.messages",
                self.queue_buffering_max_messages.to_string(),
            )
            .set("compression.type", &self.compression_type);

        if self.idempotent_producer {
            config
                .set("enable.idempotence", "true")
                .set("acks", "all")
                .set("max.in.flight.requests.per.connection", "5");
        } else {
            config.set("acks", "1");
        }

        config
    }
}

// Default value functions
fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_consumer_group() -> String {
    "statecache".to_string()
}

fn default_source_topic() -> String {
    "statecache-items".to_string()
}

fn default_session_timeout() -> u32 {
    30000 // 30 seconds
}

fn default_metadata_timeout() -> u64 {
    5000
}

fn default_watermark_retry_max_secs() -> u64 {
    60
}

fn default_idempotent_producer() -> bool {
    true
}

fn default_compression_type() -> String {
    "snappy".to_string()
}

fn default_message_timeout() -> u32 {
    30000
}

fn default_queue_buffering_max_messages() -> u32 {
    100000
}
