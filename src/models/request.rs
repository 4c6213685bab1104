//! HTTP request and response bodies for the item endpoints

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::record::{Header, Record, StoredItem};

/// Longest key accepted from callers
pub const MAX_KEY_LENGTH: u64 = 1024;

/// Body of `POST /store`
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct StoreItemRequest {
    #[validate(length(min = 1, max = 1024), custom(function = "validate_key"))]
    pub key: String,

    /// UTF-8 value to store
    pub value: String,

    #[serde(default)]
    #[validate(custom(function = "validate_headers"))]
    pub headers: Vec<Header>,
}

impl StoreItemRequest {
    pub fn into_record(self) -> Record {
        Record::new(self.key, self.value.into_bytes()).with_headers(self.headers)
    }
}

/// Body of `POST /remove` and `POST /retrieve`
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct KeyRequest {
    #[validate(length(min = 1, max = 1024), custom(function = "validate_key"))]
    pub key: String,

    #[serde(default)]
    #[validate(custom(function = "validate_headers"))]
    pub headers: Vec<Header>,
}

impl KeyRequest {
    /// Tombstone for the requested key
    pub fn into_tombstone(self) -> Record {
        Record::tombstone(self.key).with_headers(self.headers)
    }
}

/// Item as returned by `POST /retrieve`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ItemResponse {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,
}

impl From<StoredItem> for ItemResponse {
    fn from(item: StoredItem) -> Self {
        Self {
            key: item.key,
            value: String::from_utf8_lossy(&item.value).into_owned(),
            headers: item.headers,
        }
    }
}

/// Reject keys made only of whitespace or carrying control characters
pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(ValidationError::new("Key must not be blank"));
    }
    if key.chars().any(char::is_control) {
        return Err(ValidationError::new("Key must not contain control characters"));
    }
    Ok(())
}

/// Header names must be non-empty
pub fn validate_headers(headers: &[Header]) -> Result<(), ValidationError> {
    if headers.iter().any(|h| h.name.trim().is_empty()) {
        return Err(ValidationError::new("Header names must not be empty"));
    }
    Ok(())
}
