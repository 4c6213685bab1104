//! Source topic consumer that rebuilds the materialized view
//!
//! Partitions are assigned explicitly and offsets live in the local ledger,
//! so a restart resumes exactly where the store left off. The record at the
//! saved offset is read again on resume; applying it twice is harmless.

use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

use super::{ConsumerEvent, KafkaConfig, KafkaIntegrationError, LogReader, PartitionAssignment};
use super::RecordProcessor;
use crate::config::ConsumerConfig;
use crate::db::MaterializedStore;
use crate::error::Result;
use crate::kafka_span;
use crate::models::TopicPartitionOffset;
use crate::shutdown::{Shutdown, ShutdownReason};

/// Lifecycle of the consumer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Starting,
    CapturingWatermarks,
    AssigningPartitions,
    Consuming,
    Idling,
    Closing,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Starting => "starting",
            ConsumerState::CapturingWatermarks => "capturing_watermarks",
            ConsumerState::AssigningPartitions => "assigning_partitions",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Idling => "idling",
            ConsumerState::Closing => "closing",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Timing and topic settings for [`StateConsumer`]
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub topic: String,
    pub idle_interval: Duration,
    pub heartbeat_interval: Duration,
    pub watermark_retry_interval: Duration,
    pub watermark_retry_max: Duration,
}

impl ConsumerSettings {
    pub fn new(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> Self {
        Self {
            topic: kafka.source_topic.clone(),
            idle_interval: consumer.idle_interval(),
            heartbeat_interval: consumer.heartbeat_interval(),
            watermark_retry_interval: Duration::from_secs(1),
            watermark_retry_max: kafka.watermark_retry_max(),
        }
    }

    fn watermark_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.watermark_retry_interval,
            max_interval: self.watermark_retry_interval,
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_elapsed_time: Some(self.watermark_retry_max),
            ..Default::default()
        }
    }
}

/// Where each partition of the source topic starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentPlan {
    pub assignments: Vec<PartitionAssignment>,
    /// Whether saved ledger offsets are used
    pub resumed: bool,
}

/// Decide start positions for `partitions` of `topic`
///
/// Saved offsets are only trusted when they cover exactly the topic's current
/// partitions. Any other shape (partitions added, removed or renumbered)
/// rebuilds from the beginning of every partition.
pub fn plan_assignment(
    topic: &str,
    partitions: &[i32],
    saved: &[TopicPartitionOffset],
) -> AssignmentPlan {
    let mut assigned = partitions.to_vec();
    assigned.sort_unstable();
    assigned.dedup();

    let mut saved: Vec<&TopicPartitionOffset> = saved.iter().filter(|s| s.topic == topic).collect();
    saved.sort_by_key(|s| s.partition);
    let saved_ids: Vec<i32> = saved.iter().map(|s| s.partition).collect();

    if !saved.is_empty() && saved_ids == assigned {
        return AssignmentPlan {
            assignments: saved.into_iter().map(PartitionAssignment::resume).collect(),
            resumed: true,
        };
    }

    if !saved.is_empty() {
        warn!(
            topic = %topic,
            saved = ?saved_ids,
            assigned = ?assigned,
            "Saved offsets do not match the topic's partitions, consuming from the beginning"
        );
    }

    AssignmentPlan {
        assignments: assigned
            .into_iter()
            .map(|partition| PartitionAssignment::beginning(topic, partition))
            .collect(),
        resumed: false,
    }
}

enum Step {
    Stop,
    Heartbeat,
    Event(std::result::Result<ConsumerEvent, KafkaIntegrationError>),
}

/// Consumes the source topic into the materialized store
pub struct StateConsumer {
    reader: Arc<dyn LogReader>,
    store: Arc<dyn MaterializedStore>,
    processor: RecordProcessor,
    settings: ConsumerSettings,
    shutdown: Shutdown,
    state: ConsumerState,
}

impl StateConsumer {
    pub fn new(
        reader: Arc<dyn LogReader>,
        store: Arc<dyn MaterializedStore>,
        settings: ConsumerSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            reader,
            processor: RecordProcessor::new(Arc::clone(&store)),
            store,
            settings,
            shutdown,
            state: ConsumerState::Starting,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state == next {
            return;
        }
        match (self.state, next) {
            (ConsumerState::Consuming, ConsumerState::Idling)
            | (ConsumerState::Idling, ConsumerState::Consuming) => {
                debug!(from = %self.state, to = %next, "Consumer state changed")
            },
            _ => info!(from = %self.state, to = %next, "Consumer state changed"),
        }
        self.state = next;
    }

    /// Run until shutdown or a fatal error
    ///
    /// The reader is always closed on the way out and shutdown is triggered,
    /// so the rest of the process stops with the consumer.
    pub async fn run(&mut self) -> Result<()> {
        info!(topic = %self.settings.topic, "Starting state consumer");

        let result = self.consume().await;

        self.transition(ConsumerState::Closing);
        self.reader.close().await;
        self.transition(ConsumerState::Stopped);

        match &result {
            Ok(()) => info!("State consumer stopped"),
            Err(e) => error!(error = %e, "State consumer failed"),
        }
        self.shutdown.trigger(ShutdownReason::ConsumerStopped);
        result
    }

    async fn consume(&mut self) -> Result<()> {
        let topic = self.settings.topic.clone();

        self.transition(ConsumerState::CapturingWatermarks);
        let partitions = match self.shutdown.run_until(self.reader.partitions(&topic)).await {
            Some(partitions) => partitions?,
            None => return Ok(()),
        };
        if partitions.is_empty() {
            return Err(KafkaIntegrationError::TopicNotFound(topic).into());
        }
        if !self.capture_watermarks(&topic, &partitions).await? {
            return Ok(());
        }

        self.transition(ConsumerState::AssigningPartitions);
        let saved = self.store.last_consumed().await?;
        let plan = plan_assignment(&topic, &partitions, &saved);
        info!(
            resumed = plan.resumed,
            assignments = ?plan.assignments.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Assigning source partitions"
        );
        match self.shutdown.run_until(self.reader.assign(&plan.assignments)).await {
            Some(assigned) => assigned?,
            None => return Ok(()),
        }

        self.transition(ConsumerState::Consuming);
        self.consume_loop().await
    }

    /// Record startup watermarks and seed an empty ledger with low watermarks
    ///
    /// Returns `false` when shutdown interrupted the capture.
    async fn capture_watermarks(&self, topic: &str, partitions: &[i32]) -> Result<bool> {
        let mut watermarks = Vec::with_capacity(partitions.len());
        let mut lows = Vec::with_capacity(partitions.len());

        for &partition in partitions {
            let fetched = self
                .shutdown
                .run_until(self.fetch_watermarks(topic, partition))
                .await;
            let (low, high) = match fetched {
                Some(bounds) => bounds?,
                None => return Ok(false),
            };
            debug!(topic = %topic, partition, low, high, "Fetched watermarks");

            watermarks.push(TopicPartitionOffset::startup_watermark(topic, partition, high));
            lows.push(TopicPartitionOffset::new(topic, partition, low));
        }

        info!(
            watermarks = ?watermarks.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Captured startup watermarks"
        );
        if let Err(e) = self.store.set_startup_watermarks(watermarks).await {
            // Without recorded watermarks readiness never turns true
            error!(topic = %topic, error = %e, "Failed to record startup watermarks");
        }

        let saved = self.store.last_consumed().await?;
        if !saved.iter().any(|s| s.topic == topic) {
            info!(topic = %topic, "Offset ledger is empty, seeding with low watermarks");
            for low in &lows {
                self.store.update_last_consumed(low).await?;
            }
        }

        Ok(true)
    }

    async fn fetch_watermarks(
        &self,
        topic: &str,
        partition: i32,
    ) -> std::result::Result<(i64, i64), KafkaIntegrationError> {
        let reader = &self.reader;
        retry(self.settings.watermark_backoff(), || async move {
            reader.watermarks(topic, partition).await.map_err(|e| {
                warn!(topic = %topic, partition, error = %e, "Watermark query failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .await
    }

    async fn consume_loop(&mut self) -> Result<()> {
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }

            let step = tokio::select! {
                biased;
                _ = self.shutdown.wait() => Step::Stop,
                _ = heartbeat.tick() => Step::Heartbeat,
                event = self.reader.next_event() => Step::Event(event),
            };

            match step {
                Step::Stop => return Ok(()),
                Step::Heartbeat => self.log_heartbeat(),
                Step::Event(event) => {
                    if !self.handle(event?).await? {
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Handle one reader event; `false` means shutdown interrupted idling
    async fn handle(&mut self, event: ConsumerEvent) -> Result<bool> {
        match event {
            ConsumerEvent::Record(consumed) => {
                let span = kafka_span!(consumed.position);
                span.record("key", consumed.record.key.as_str());
                self.processor.process(&consumed).instrument(span).await?;
            },
            ConsumerEvent::Unkeyed(position) => {
                self.processor.skip(&position, "record has no usable key").await?;
            },
            ConsumerEvent::EndOfPartition { partition } => {
                debug!(partition, "Reached end of partition");
                self.transition(ConsumerState::Idling);
                if !self.shutdown.sleep(self.settings.idle_interval).await {
                    return Ok(false);
                }
                self.transition(ConsumerState::Consuming);
            },
        }
        Ok(true)
    }

    fn log_heartbeat(&mut self) {
        let beat = self.processor.take_heartbeat();
        match &beat.last_position {
            Some(position) => info!(
                state = %self.state,
                applied = beat.applied,
                skipped = beat.skipped,
                position = %position,
                "Consumer heartbeat"
            ),
            None => info!(state = %self.state, "Consumer heartbeat, no new records"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::StartOffset;

    fn saved(topic: &str, partition: i32, offset: i64) -> TopicPartitionOffset {
        TopicPartitionOffset::new(topic, partition, offset)
    }

    #[test]
    fn test_plan_resumes_matching_partitions() {
        let plan = plan_assignment(
            "items",
            &[1, 0],
            &[saved("items", 0, 10), saved("items", 1, 4)],
        );

        assert!(plan.resumed);
        assert_eq!(plan.assignments.len(), 2);
        assert_eq!(plan.assignments[0].partition, 0);
        assert_eq!(plan.assignments[0].start, StartOffset::Offset(10));
        assert_eq!(plan.assignments[1].start, StartOffset::Offset(4));
    }

    #[test]
    fn test_plan_falls_back_when_partition_count_changes() {
        let plan = plan_assignment("items", &[0, 1, 2], &[saved("items", 0, 10), saved("items", 1, 4)]);

        assert!(!plan.resumed);
        assert_eq!(plan.assignments.len(), 3);
        assert!(plan.assignments.iter().all(|a| a.start == StartOffset::Beginning));
    }

    #[test]
    fn test_plan_falls_back_when_partition_ids_differ() {
        let plan = plan_assignment("items", &[0, 2], &[saved("items", 0, 10), saved("items", 1, 4)]);

        assert!(!plan.resumed);
        let ids: Vec<i32> = plan.assignments.iter().map(|a| a.partition).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn test_plan_ignores_other_topics() {
        let plan = plan_assignment("items", &[0], &[saved("other", 0, 99)]);

        assert!(!plan.resumed);
        assert_eq!(plan.assignments, vec![PartitionAssignment::beginning("items", 0)]);
    }

    #[test]
    fn test_watermark_backoff_is_fixed_interval() {
        let settings = ConsumerSettings::new(&KafkaConfig::default(), &ConsumerConfig::default());
        let backoff = settings.watermark_backoff();

        assert_eq!(backoff.initial_interval, Duration::from_secs(1));
        assert_eq!(backoff.max_interval, Duration::from_secs(1));
        assert_eq!(backoff.max_elapsed_time, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConsumerState::CapturingWatermarks.to_string(), "capturing_watermarks");
        assert_eq!(ConsumerState::Stopped.to_string(), "stopped");
    }
}
