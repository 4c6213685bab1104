//! Configuration module for statecache
//!
//! This module handles loading and validating configuration from environment
//! variables, providing strongly-typed configuration structures for all
//! application components.

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::kafka::KafkaConfig;

/// Main configuration structure for statecache
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct Config {
    /// Server configuration
    #[serde(flatten)]
    #[envconfig(nested)]
    pub server: ServerConfig,

    /// Kafka configuration
    #[serde(flatten)]
    #[envconfig(nested)]
    pub kafka: KafkaConfig,

    /// Storage configuration
    #[serde(flatten)]
    #[envconfig(nested)]
    pub storage: StorageConfig,

    /// Consumer loop configuration
    #[serde(flatten)]
    #[envconfig(nested)]
    pub consumer: ConsumerConfig,

    /// Outbox drain loop configuration
    #[serde(flatten)]
    #[envconfig(nested)]
    pub outbox: OutboxConfig,

    /// Query limits
    #[serde(flatten)]
    #[envconfig(nested)]
    pub query: QueryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct ServerConfig {
    /// Host to bind to
    #[envconfig(from = "HOST", default = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[envconfig(from = "PORT", default = "8080")]
    pub port: u16,

    /// Log level
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Environment (development, staging, production)
    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,

    /// Request timeout in seconds
    #[envconfig(from = "REQUEST_TIMEOUT_SECS", default = "30")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[envconfig(from = "SHUTDOWN_TIMEOUT_SECS", default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Get the server address as a string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            environment: "development".to_string(),
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Which implementation backs the store and the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    /// Not crash-safe; for throwaway deployments and tests
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Sqlite => write!(f, "sqlite"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Where a SQLite database lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SqliteLocation {
    File,
    Memory,
}

impl FromStr for SqliteLocation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "disk" => Ok(SqliteLocation::File),
            "memory" => Ok(SqliteLocation::Memory),
            other => Err(format!("unknown sqlite location '{}'", other)),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct StorageConfig {
    /// Backend for the materialized store and the outbox
    #[envconfig(from = "STORAGE_BACKEND", default = "sqlite")]
    pub backend: StorageBackend,

    /// Whether the SQLite database is file-backed or in-memory
    #[envconfig(from = "SQLITE_LOCATION", default = "file")]
    pub sqlite_location: SqliteLocation,

    /// Path of the SQLite database file
    #[envconfig(from = "SQLITE_PATH", default = "./data/statecache.db")]
    pub sqlite_path: String,

    /// Maximum pool size
    #[envconfig(from = "SQLITE_POOL_MAX_SIZE", default = "5")]
    pub pool_max_size: u32,
}

impl StorageConfig {
    /// Connection URL for the configured SQLite database
    pub fn sqlite_url(&self) -> String {
        match self.sqlite_location {
            SqliteLocation::File => format!("sqlite://{}", self.sqlite_path),
            SqliteLocation::Memory => "sqlite::memory:".to_string(),
        }
    }

    /// In-memory SQLite lives per connection, so the pool is pinned to one
    pub fn effective_pool_size(&self) -> u32 {
        match self.sqlite_location {
            SqliteLocation::File => self.pool_max_size,
            SqliteLocation::Memory => 1,
        }
    }
}

/// Consumer loop configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct ConsumerConfig {
    /// Sleep after reaching the end of a partition, in milliseconds
    #[envconfig(from = "CONSUMER_IDLE_INTERVAL_MS", default = "8000")]
    pub idle_interval_ms: u64,

    /// Interval between progress heartbeats, in seconds
    #[envconfig(from = "CONSUMER_HEARTBEAT_SECS", default = "15")]
    pub heartbeat_secs: u64,
}

impl ConsumerConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 8000,
            heartbeat_secs: 15,
        }
    }
}

/// Outbox drain loop configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct OutboxConfig {
    /// Drain tick in milliseconds
    #[envconfig(from = "OUTBOX_INTERVAL_MS", default = "100")]
    pub interval_ms: u64,

    /// Sleep when the producer's send queue is full, in milliseconds
    #[envconfig(from = "OUTBOX_BACKPRESSURE_BACKOFF_MS", default = "3000")]
    pub backpressure_backoff_ms: u64,

    /// Hold draining until the materialized view has caught up
    #[envconfig(from = "OUTBOX_WAIT_FOR_READY", default = "false")]
    pub wait_for_ready: bool,
}

impl OutboxConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn backpressure_backoff(&self) -> Duration {
        Duration::from_millis(self.backpressure_backoff_ms)
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            backpressure_backoff_ms: 3000,
            wait_for_ready: false,
        }
    }
}

/// Query limits
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Envconfig)]
pub struct QueryConfig {
    /// Maximum rows returned by a query, 0 for unlimited
    #[envconfig(from = "QUERY_RESULT_LIMIT", default = "1000")]
    pub result_limit: u32,

    /// Query deadline in milliseconds, 0 for none
    #[envconfig(from = "QUERY_TIMEOUT_MS", default = "5000")]
    pub timeout_ms: u64,
}

impl QueryConfig {
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            result_limit: 1000,
            timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        // Parse configuration from environment
        Config::init_from_env().map_err(Error::from)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::config("Server port cannot be 0"));
        }

        if self.kafka.brokers.trim().is_empty() {
            return Err(Error::config("Kafka brokers cannot be empty"));
        }

        if self.kafka.source_topic.trim().is_empty() {
            return Err(Error::config("KAFKA_SOURCE_TOPIC cannot be empty"));
        }

        if self.kafka.destination_topic.trim().is_empty() {
            return Err(Error::config("KAFKA_DESTINATION_TOPIC cannot be empty"));
        }

        if self.storage.backend == StorageBackend::Sqlite
            && self.storage.sqlite_location == SqliteLocation::File
            && self.storage.sqlite_path.trim().is_empty()
        {
            return Err(Error::config("SQLITE_PATH cannot be empty for file storage"));
        }

        if self.storage.pool_max_size == 0 {
            return Err(Error::config("SQLITE_POOL_MAX_SIZE must be at least 1"));
        }

        if self.outbox.interval_ms == 0 {
            return Err(Error::config("OUTBOX_INTERVAL_MS must be at least 1"));
        }

        if self.consumer.heartbeat_secs == 0 {
            return Err(Error::config("CONSUMER_HEARTBEAT_SECS must be at least 1"));
        }

        Ok(())
    }

    /// Log configuration
    pub fn log_config(&self) {
        tracing::info!(
            server_address = %self.server.address(),
            environment = %self.server.environment,
            log_level = %self.server.log_level,
            "Server configuration"
        );

        tracing::info!(
            brokers = %self.kafka.brokers,
            consumer_group = %self.kafka.consumer_group,
            source_topic = %self.kafka.source_topic,
            destination_topic = %self.kafka.destination_topic,
            "Kafka configuration"
        );

        tracing::info!(
            backend = %self.storage.backend,
            sqlite_url = %self.storage.sqlite_url(),
            pool_size = %self.storage.effective_pool_size(),
            "Storage configuration"
        );

        tracing::info!(
            idle_interval_ms = %self.consumer.idle_interval_ms,
            outbox_interval_ms = %self.outbox.interval_ms,
            backpressure_backoff_ms = %self.outbox.backpressure_backoff_ms,
            wait_for_ready = %self.outbox.wait_for_ready,
            "Loop configuration"
        );

        tracing::info!(
            result_limit = %self.query.result_limit,
            timeout_ms = %self.query.timeout_ms,
            "Query configuration"
        );
    }
}
