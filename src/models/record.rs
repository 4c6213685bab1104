//! Log records, stored items and offset bookkeeping types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a record within a partitioned log
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl TopicPartitionOffset {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Whether both offsets refer to the same (topic, partition)
    pub fn same_partition(&self, other: &TopicPartitionOffset) -> bool {
        self.partition == other.partition && self.topic == other.topic
    }

    /// Startup watermark for a partition whose next offset would be `high`
    ///
    /// `high` is the offset the broker would assign to the next record, so
    /// the newest existing record sits one below it. Empty partitions map to 0.
    pub fn startup_watermark(topic: impl Into<String>, partition: i32, high: i64) -> Self {
        let offset = if high <= 0 { 0 } else { high - 1 };
        Self::new(topic, partition, offset)
    }
}

impl fmt::Display for TopicPartitionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A single string header carried with a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A keyed log record; a missing value is a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: Option<Vec<u8>>,
    #[serde(default)]
    pub headers: Vec<Header>,
}

impl Record {
    /// Create a record carrying a value
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            headers: Vec::new(),
        }
    }

    /// Create a deletion marker for `key`
    pub fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Convert into a stored item, or `None` for a tombstone
    pub fn into_stored(self) -> Option<StoredItem> {
        let value = self.value?;
        Some(StoredItem {
            key: self.key,
            value,
            headers: self.headers,
        })
    }
}

/// A record consumed from the log together with its position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub position: TopicPartitionOffset,
    pub record: Record,
}

/// Current state for one key in the materialized store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    pub key: String,
    pub value: Vec<u8>,
    #[serde(default)]
    pub headers: Vec<Header>,
}

impl StoredItem {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            headers: Vec::new(),
        }
    }

    /// Look up the last header named `name`
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }
}

/// A record waiting in the outbox, tagged with its insertion sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub sequence: i64,
    pub record: Record,
}

/// Encode headers for a text column; no headers is stored as NULL
pub(crate) fn encode_headers(headers: &[Header]) -> Result<Option<String>, serde_json::Error> {
    if headers.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(headers).map(Some)
}

/// Decode headers from a text column
pub(crate) fn decode_headers(raw: Option<&str>) -> Result<Vec<Header>, serde_json::Error> {
    match raw {
        Some(text) if !text.is_empty() => serde_json::from_str(text),
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_watermark_is_one_below_high() {
        assert_eq!(TopicPartitionOffset::startup_watermark("t", 0, 11).offset, 10);
        assert_eq!(TopicPartitionOffset::startup_watermark("t", 0, 1).offset, 0);
        assert_eq!(TopicPartitionOffset::startup_watermark("t", 0, 0).offset, 0);
    }

    #[test]
    fn test_same_partition_ignores_offset() {
        let a = TopicPartitionOffset::new("t", 1, 5);
        let b = TopicPartitionOffset::new("t", 1, 9);
        let c = TopicPartitionOffset::new("u", 1, 5);
        assert!(a.same_partition(&b));
        assert!(!a.same_partition(&c));
    }

    #[test]
    fn test_tombstone_has_no_stored_form() {
        assert!(Record::tombstone("k").into_stored().is_none());
        let stored = Record::new("k", b"v".to_vec()).into_stored().unwrap();
        assert_eq!(stored.value, b"v");
    }

    #[test]
    fn test_header_lookup_prefers_last() {
        let item = StoredItem {
            key: "k".into(),
            value: vec![],
            headers: vec![
                Header::new("correlationId", "first"),
                Header::new("correlationId", "second"),
            ],
        };
        assert_eq!(item.header("correlationId"), Some("second"));
        assert_eq!(item.header("missing"), None);
    }

    #[test]
    fn test_empty_headers_encode_as_null() {
        assert_eq!(encode_headers(&[]).unwrap(), None);
        let encoded = encode_headers(&[Header::new("a", "b")]).unwrap().unwrap();
        assert_eq!(decode_headers(Some(&encoded)).unwrap(), vec![Header::new("a", "b")]);
        assert!(decode_headers(None).unwrap().is_empty());
    }
}
