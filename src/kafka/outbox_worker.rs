//! Drains the outbox into the destination topic
//!
//! Entries are published strictly in sequence order. An entry only leaves the
//! outbox after the broker verdict is known, so a crash between publish and
//! delete re-publishes it on the next start.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{LogPublisher, PublishError, PublishOutcome};
use crate::config::OutboxConfig;
use crate::db::OutboxQueue;
use crate::models::OutboxEntry;
use crate::readiness::{wait_until_ready, ReadinessGate};
use crate::shutdown::Shutdown;

/// Timing settings for [`OutboxWorker`]
#[derive(Debug, Clone)]
pub struct OutboxSettings {
    pub interval: Duration,
    pub backpressure_backoff: Duration,
}

impl From<&OutboxConfig> for OutboxSettings {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            interval: config.interval(),
            backpressure_backoff: config.backpressure_backoff(),
        }
    }
}

/// What one drain pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub published: u64,
    pub quarantined: u64,
}

/// Background worker that publishes outbox entries in order
pub struct OutboxWorker {
    outbox: Arc<dyn OutboxQueue>,
    publisher: Arc<dyn LogPublisher>,
    settings: OutboxSettings,
    readiness: Option<Arc<ReadinessGate>>,
    shutdown: Shutdown,
}

impl OutboxWorker {
    pub fn new(
        outbox: Arc<dyn OutboxQueue>,
        publisher: Arc<dyn LogPublisher>,
        settings: OutboxSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            outbox,
            publisher,
            settings,
            readiness: None,
            shutdown,
        }
    }

    /// Hold draining until `gate` opens
    pub fn wait_for(mut self, gate: Arc<ReadinessGate>) -> Self {
        self.readiness = Some(gate);
        self
    }

    /// Drain on every tick until shutdown
    pub async fn run(&self) {
        if let Some(gate) = &self.readiness {
            info!("Outbox worker waiting for the materialized view to catch up");
            if !wait_until_ready(gate, &self.shutdown, self.settings.interval).await {
                info!("Outbox worker stopped before the view was ready");
                return;
            }
        }

        info!(interval_ms = self.settings.interval.as_millis() as u64, "Outbox worker started");
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = ticker.tick() => {},
            }

            let summary = self.drain().await;
            if summary != DrainSummary::default() {
                debug!(
                    published = summary.published,
                    quarantined = summary.quarantined,
                    "Outbox drain pass finished"
                );
            }
        }

        info!("Outbox worker stopped");
    }

    /// Publish entries until the outbox is empty or an entry fails
    pub async fn drain(&self) -> DrainSummary {
        let mut summary = DrainSummary::default();

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            let entry = match self.outbox.peek_oldest().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to read the oldest outbox entry, quarantining it");
                    if self.quarantine().await {
                        summary.quarantined += 1;
                    }
                    break;
                },
            };

            let outcome = match self.publish_with_backpressure(&entry).await {
                Some(outcome) => outcome,
                None => break,
            };

            match outcome {
                Ok(PublishOutcome::Persisted) => {},
                Ok(PublishOutcome::PossiblyPersisted) => {
                    warn!(
                        sequence = entry.sequence,
                        key = %entry.record.key,
                        "Delivery unconfirmed, treating entry as published"
                    );
                },
                Ok(PublishOutcome::NotPersisted) => {
                    error!(
                        sequence = entry.sequence,
                        key = %entry.record.key,
                        "Broker did not persist entry, quarantining it"
                    );
                    if self.quarantine().await {
                        summary.quarantined += 1;
                    }
                    break;
                },
                Err(e) => {
                    error!(
                        sequence = entry.sequence,
                        key = %entry.record.key,
                        error = %e,
                        "Publish failed, quarantining entry"
                    );
                    if self.quarantine().await {
                        summary.quarantined += 1;
                    }
                    break;
                },
            }

            if let Err(e) = self.outbox.delete_oldest(entry.sequence).await {
                error!(sequence = entry.sequence, error = %e, "Failed to delete published entry");
                break;
            }
            summary.published += 1;
        }

        summary
    }

    /// Publish `entry`, waiting out a full send buffer
    ///
    /// Returns `None` when shutdown interrupted the attempt; the entry stays
    /// at the head of the outbox.
    async fn publish_with_backpressure(
        &self,
        entry: &OutboxEntry,
    ) -> Option<Result<PublishOutcome, PublishError>> {
        loop {
            match self.shutdown.run_until(self.publisher.publish(&entry.record)).await? {
                Err(PublishError::BufferFull) => {
                    warn!(
                        sequence = entry.sequence,
                        backoff_ms = self.settings.backpressure_backoff.as_millis() as u64,
                        "Producer queue is full, backing off"
                    );
                    if !self.shutdown.sleep(self.settings.backpressure_backoff).await {
                        return None;
                    }
                },
                outcome => return Some(outcome),
            }
        }
    }

    async fn quarantine(&self) -> bool {
        match self.outbox.mark_oldest_failed().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Failed to quarantine outbox entry");
                false
            },
        }
    }
}
