//! In-memory implementation of the materialized store
//!
//! Items and offsets sit behind one lock, so a reader never observes an item
//! without the offset that produced it.
//!
//! **NOT suitable for production**: everything is lost when the process exits
//! and the consumer replays the whole log on the next start.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;

use crate::config::QueryConfig;
use crate::db::repository::{
    ApplyOutcome, DeleteOutcome, MaterializedStore, OffsetLedger, RepositoryError,
    RepositoryResult,
};
use crate::db::watermarks::WatermarkCell;
use crate::models::{
    ConsumedRecord, ProjectedItem, Query, QueryOutcome, StoredItem, TopicPartitionOffset,
};
use crate::shutdown::Shutdown;

#[derive(Debug, Default)]
struct StoreState {
    /// Items keyed by key, tagged with their insertion sequence
    items: HashMap<String, (u64, StoredItem)>,
    offsets: HashMap<(String, i32), i64>,
    next_sequence: u64,
}

impl StoreState {
    fn upsert(&mut self, item: StoredItem) {
        match self.items.get_mut(&item.key) {
            Some(slot) => slot.1 = item,
            None => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                self.items.insert(item.key.clone(), (sequence, item));
            },
        }
    }

    fn delete(&mut self, key: &str) -> DeleteOutcome {
        match self.items.remove(key) {
            Some(_) => DeleteOutcome::Deleted,
            None => {
                tracing::warn!(key = %key, "Delete requested for key that is not stored");
                DeleteOutcome::NotFound
            },
        }
    }

    fn record_offset(&mut self, position: &TopicPartitionOffset) {
        self.offsets
            .insert((position.topic.clone(), position.partition), position.offset);
    }
}

fn poison_err<T>(_: PoisonError<T>) -> RepositoryError {
    RepositoryError::LockPoisoned("materialized store lock poisoned".to_string())
}

/// In-memory materialized store
#[derive(Debug)]
pub struct MemoryMaterializedStore {
    state: RwLock<StoreState>,
    watermarks: WatermarkCell,
    query_config: QueryConfig,
}

impl MemoryMaterializedStore {
    pub fn new(query_config: QueryConfig) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            watermarks: WatermarkCell::new(),
            query_config,
        }
    }
}

impl Default for MemoryMaterializedStore {
    fn default() -> Self {
        Self::new(QueryConfig::default())
    }
}

#[async_trait]
impl OffsetLedger for MemoryMaterializedStore {
    async fn last_consumed(&self) -> RepositoryResult<Vec<TopicPartitionOffset>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut offsets: Vec<TopicPartitionOffset> = state
            .offsets
            .iter()
            .map(|((topic, partition), offset)| {
                TopicPartitionOffset::new(topic.clone(), *partition, *offset)
            })
            .collect();
        offsets.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        Ok(offsets)
    }

    async fn update_last_consumed(&self, position: &TopicPartitionOffset) -> RepositoryResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.record_offset(position);
        Ok(())
    }

    async fn set_startup_watermarks(
        &self,
        watermarks: Vec<TopicPartitionOffset>,
    ) -> RepositoryResult<()> {
        self.watermarks.set(watermarks)
    }

    async fn startup_watermarks(&self) -> RepositoryResult<Option<Vec<TopicPartitionOffset>>> {
        self.watermarks.get()
    }
}

#[async_trait]
impl MaterializedStore for MemoryMaterializedStore {
    async fn upsert(&self, item: &StoredItem) -> RepositoryResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.upsert(item.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> RepositoryResult<DeleteOutcome> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.delete(key))
    }

    async fn get(&self, key: &str) -> RepositoryResult<Option<StoredItem>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.items.get(key).map(|(_, item)| item.clone()))
    }

    async fn query(&self, query: &Query, shutdown: &Shutdown) -> RepositoryResult<QueryOutcome> {
        let fields = query.projection();
        if fields.is_empty() {
            return Err(RepositoryError::InvalidQuery(
                "at least one field must be requested".to_string(),
            ));
        }

        let limit = query.effective_limit(self.query_config.result_limit);
        let deadline = self.query_config.timeout().map(|t| Instant::now() + t);

        let state = self.state.read().map_err(poison_err)?;
        let mut ordered: Vec<&(u64, StoredItem)> = state.items.values().collect();
        ordered.sort_by_key(|(sequence, _)| *sequence);

        let mut items = Vec::new();
        for (_, item) in ordered {
            if shutdown.is_triggered() {
                return Ok(QueryOutcome::canceled(items));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(QueryOutcome::timed_out(items));
            }
            if limit.is_some_and(|l| items.len() >= l) {
                break;
            }
            if query.matches(item) {
                items.push(ProjectedItem::project(item, &fields));
            }
        }

        Ok(QueryOutcome::success(items))
    }

    async fn count(&self) -> RepositoryResult<u64> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.items.len() as u64)
    }

    async fn health_check(&self) -> RepositoryResult<()> {
        self.state.read().map_err(poison_err).map(|_| ())
    }

    async fn apply(&self, consumed: &ConsumedRecord) -> RepositoryResult<ApplyOutcome> {
        let mut state = self.state.write().map_err(poison_err)?;
        let record = &consumed.record;
        let outcome = match &record.value {
            Some(value) => {
                state.upsert(StoredItem {
                    key: record.key.clone(),
                    value: value.clone(),
                    headers: record.headers.clone(),
                });
                ApplyOutcome::Upserted
            },
            None => match state.delete(&record.key) {
                DeleteOutcome::Deleted => ApplyOutcome::Deleted,
                DeleteOutcome::NotFound => ApplyOutcome::AlreadyAbsent,
            },
        };
        state.record_offset(&consumed.position);
        Ok(outcome)
    }
}
