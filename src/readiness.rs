//! Startup readiness for the materialized view
//!
//! The view is ready once every partition has been consumed up to the
//! watermark captured at startup. [`evaluate`] and [`snapshot`] are pure
//! functions over ledger state; [`ReadinessGate`] reads the ledger and stays
//! open once it has opened.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::db::{MaterializedStore, RepositoryResult};
use crate::models::TopicPartitionOffset;
use crate::shutdown::Shutdown;

/// Progress of one partition towards its startup watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionProgress {
    pub topic: String,
    pub partition: i32,
    /// Last applied offset, unknown until the partition produced something
    pub current_offset: Option<i64>,
    pub target_offset: i64,
    pub caught_up: bool,
}

/// Readiness verdict with per-partition diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub partitions: Vec<PartitionProgress>,
}

fn consumed_for<'a>(
    watermark: &TopicPartitionOffset,
    consumed: &'a [TopicPartitionOffset],
) -> Option<&'a TopicPartitionOffset> {
    consumed.iter().find(|c| c.same_partition(watermark))
}

fn partition_caught_up(watermark: &TopicPartitionOffset, current: Option<i64>) -> bool {
    watermark.offset == 0 || current.is_some_and(|offset| offset >= watermark.offset)
}

/// Whether the consumed offsets have reached the startup watermarks
///
/// False before watermarks are captured and for an empty watermark set.
/// Partitions whose watermark is 0 count as caught up.
pub fn evaluate(
    watermarks: Option<&[TopicPartitionOffset]>,
    consumed: &[TopicPartitionOffset],
) -> bool {
    match watermarks {
        None => false,
        Some([]) => false,
        Some(watermarks) => watermarks.iter().all(|w| {
            partition_caught_up(w, consumed_for(w, consumed).map(|c| c.offset))
        }),
    }
}

/// Pair every startup watermark with the matching consumed offset
pub fn snapshot(
    watermarks: &[TopicPartitionOffset],
    consumed: &[TopicPartitionOffset],
) -> Vec<PartitionProgress> {
    watermarks
        .iter()
        .map(|w| {
            let current_offset = consumed_for(w, consumed).map(|c| c.offset);
            PartitionProgress {
                topic: w.topic.clone(),
                partition: w.partition,
                current_offset,
                target_offset: w.offset,
                caught_up: partition_caught_up(w, current_offset),
            }
        })
        .collect()
}

/// Latching readiness check over a store's ledger
pub struct ReadinessGate {
    store: Arc<dyn MaterializedStore>,
    latched: AtomicBool,
}

impl ReadinessGate {
    pub fn new(store: Arc<dyn MaterializedStore>) -> Self {
        Self {
            store,
            latched: AtomicBool::new(false),
        }
    }

    /// Evaluate readiness and the per-partition snapshot
    pub async fn report(&self) -> RepositoryResult<ReadinessReport> {
        let watermarks = self.store.startup_watermarks().await?;
        let consumed = self.store.last_consumed().await?;

        let ready = evaluate(watermarks.as_deref(), &consumed);
        if ready && !self.latched.swap(true, Ordering::SeqCst) {
            tracing::info!("Materialized view caught up with startup watermarks");
        }

        Ok(ReadinessReport {
            ready: ready || self.latched.load(Ordering::SeqCst),
            partitions: snapshot(watermarks.as_deref().unwrap_or_default(), &consumed),
        })
    }

    /// Whether the view is ready; ledger errors count as not ready
    pub async fn is_ready(&self) -> bool {
        if self.latched.load(Ordering::SeqCst) {
            return true;
        }
        match self.report().await {
            Ok(report) => report.ready,
            Err(e) => {
                tracing::warn!(error = %e, "Readiness check failed");
                false
            },
        }
    }
}

/// Block until the gate opens; returns `false` if shutdown came first
pub async fn wait_until_ready(gate: &ReadinessGate, shutdown: &Shutdown, poll: Duration) -> bool {
    loop {
        if shutdown.is_triggered() {
            return false;
        }
        if gate.is_ready().await {
            return true;
        }
        if !shutdown.sleep(poll).await {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryMaterializedStore, OffsetLedger};
    use crate::shutdown::ShutdownReason;

    fn tpo(partition: i32, offset: i64) -> TopicPartitionOffset {
        TopicPartitionOffset::new("T", partition, offset)
    }

    #[test]
    fn test_not_ready_before_capture() {
        assert!(!evaluate(None, &[tpo(0, 100)]));
        assert!(!evaluate(Some(&[]), &[tpo(0, 100)]));
    }

    #[test]
    fn test_zero_watermark_is_vacuously_ready() {
        let watermarks = [tpo(0, 10), tpo(1, 0)];
        assert!(evaluate(Some(&watermarks), &[tpo(0, 10)]));
        assert!(evaluate(Some(&[tpo(0, 0)]), &[]));
    }

    #[test]
    fn test_behind_is_not_ready() {
        assert!(!evaluate(Some(&[tpo(0, 10)]), &[tpo(0, 9)]));
        assert!(evaluate(Some(&[tpo(0, 10)]), &[tpo(0, 11)]));
    }

    #[test]
    fn test_missing_partition_is_not_ready() {
        assert!(!evaluate(Some(&[tpo(0, 10), tpo(1, 3)]), &[tpo(0, 10)]));
    }

    #[test]
    fn test_other_topic_does_not_count() {
        let other = TopicPartitionOffset::new("U", 0, 50);
        assert!(!evaluate(Some(&[tpo(0, 10)]), &[other]));
    }

    #[test]
    fn test_snapshot_reports_unknown_current_offset() {
        let progress = snapshot(&[tpo(0, 10), tpo(1, 5)], &[tpo(0, 4)]);
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].current_offset, Some(4));
        assert!(!progress[0].caught_up);
        assert_eq!(progress[1].current_offset, None);
        assert_eq!(progress[1].target_offset, 5);
        assert!(!progress[1].caught_up);

        let json = serde_json::to_value(&progress[0]).unwrap();
        assert_eq!(json["currentOffset"], 4);
        assert_eq!(json["targetOffset"], 10);
    }

    #[tokio::test]
    async fn test_gate_latches_once_ready() {
        let store = Arc::new(MemoryMaterializedStore::default());
        let gate = ReadinessGate::new(store.clone());
        assert!(!gate.is_ready().await);

        store.set_startup_watermarks(vec![tpo(0, 2)]).await.unwrap();
        assert!(!gate.is_ready().await);

        store.update_last_consumed(&tpo(0, 2)).await.unwrap();
        assert!(gate.is_ready().await);

        // A later capture that is ahead no longer closes the gate
        store.set_startup_watermarks(vec![tpo(0, 50)]).await.unwrap();
        let report = gate.report().await.unwrap();
        assert!(report.ready);
        assert!(!report.partitions[0].caught_up);
    }

    #[tokio::test]
    async fn test_wait_until_ready_stops_on_shutdown() {
        let store = Arc::new(MemoryMaterializedStore::default());
        let gate = ReadinessGate::new(store);
        let shutdown = Shutdown::new();
        shutdown.trigger(ShutdownReason::Requested);

        assert!(!wait_until_ready(&gate, &shutdown, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_wait_until_ready_returns_when_caught_up() {
        let store = Arc::new(MemoryMaterializedStore::default());
        let gate = ReadinessGate::new(store.clone());
        let shutdown = Shutdown::new();

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set_startup_watermarks(vec![tpo(0, 1)]).await.unwrap();
            writer.update_last_consumed(&tpo(0, 1)).await.unwrap();
        });

        assert!(wait_until_ready(&gate, &shutdown, Duration::from_millis(5)).await);
    }
}
