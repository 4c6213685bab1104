//! In-memory outbox queue
//!
//! **NOT suitable for production**: pending entries are lost when the process
//! exits, which breaks the outbox guarantee. Use it for throwaway deployments
//! and tests.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::db::repository::{OutboxQueue, RepositoryError, RepositoryResult};
use crate::models::{OutboxEntry, Record};

#[derive(Debug, Default)]
struct OutboxState {
    queue: VecDeque<OutboxEntry>,
    failed: Vec<OutboxEntry>,
    next_sequence: i64,
}

fn poison_err<T>(_: PoisonError<T>) -> RepositoryError {
    RepositoryError::LockPoisoned("outbox lock poisoned".to_string())
}

/// In-memory FIFO outbox with a quarantine list
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    state: RwLock<OutboxState>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quarantined entries, oldest first
    pub fn failed_entries(&self) -> RepositoryResult<Vec<OutboxEntry>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.failed.clone())
    }
}

#[async_trait]
impl OutboxQueue for MemoryOutbox {
    async fn enqueue(&self, record: &Record) -> RepositoryResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.queue.push_back(OutboxEntry {
            sequence,
            record: record.clone(),
        });
        Ok(())
    }

    async fn peek_oldest(&self) -> RepositoryResult<Option<OutboxEntry>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.front().cloned())
    }

    async fn delete_oldest(&self, sequence: i64) -> RepositoryResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        match state.queue.front() {
            Some(head) if head.sequence == sequence => {
                state.queue.pop_front();
                Ok(())
            },
            _ => Err(RepositoryError::row_count("delete_oldest", 1, 0)),
        }
    }

    async fn mark_oldest_failed(&self) -> RepositoryResult<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let entry = state.queue.pop_front().ok_or(RepositoryError::EmptyQueue)?;
        state.failed.push(entry);
        Ok(())
    }

    async fn pending_count(&self) -> RepositoryResult<u64> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.len() as u64)
    }

    async fn failed_count(&self) -> RepositoryResult<u64> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.failed.len() as u64)
    }
}
