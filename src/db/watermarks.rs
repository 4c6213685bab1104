//! In-memory startup watermark set shared by the store backends

use std::sync::RwLock;

use crate::db::repository::{RepositoryError, RepositoryResult};
use crate::models::TopicPartitionOffset;

/// Holds the watermarks captured at startup
///
/// Watermarks are only meaningful for the current process, so they are never
/// persisted.
#[derive(Debug, Default)]
pub struct WatermarkCell {
    inner: RwLock<Option<Vec<TopicPartitionOffset>>>,
}

impl WatermarkCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, watermarks: Vec<TopicPartitionOffset>) -> RepositoryResult<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|e| RepositoryError::LockPoisoned(e.to_string()))?;
        *guard = Some(watermarks);
        Ok(())
    }

    pub fn get(&self) -> RepositoryResult<Option<Vec<TopicPartitionOffset>>> {
        let guard = self
            .inner
            .read()
            .map_err(|e| RepositoryError::LockPoisoned(e.to_string()))?;
        Ok(guard.clone())
    }
}
