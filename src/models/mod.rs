//! Data models for statecache
//!
//! This module contains the domain types shared by the storage backends, the
//! Kafka loops and the HTTP surface: log records and offsets, the closed-field
//! query model, and the validated request bodies.

pub mod query;
pub mod record;
pub mod request;

// Re-export commonly used types
pub use query::{
    FilterClause, FilterCriteria, FilterableField, ProjectedItem, Query, QueryOutcome,
    QueryStatus, QueryStatusKind, RequestableField,
};
pub use record::{ConsumedRecord, Header, OutboxEntry, Record, StoredItem, TopicPartitionOffset};
pub use request::{ItemResponse, KeyRequest, StoreItemRequest};
