//! Integration tests for the Kafka loops
//!
//! The consumer and outbox loops run against scripted fakes from
//! `statecache::test_utils`. Tests marked `#[ignore]` need a broker on
//! localhost:9092.

use std::sync::Arc;
use std::time::Duration;

use statecache::{
    db::{MaterializedStore, MemoryMaterializedStore, MemoryOutbox, OffsetLedger, OutboxQueue},
    kafka::{
        ConsumerEvent, ConsumerSettings, KafkaConfig, KafkaIntegrationError, KafkaLogReader, KafkaPublisher, LogPublisher,
        OutboxSettings, OutboxWorker, PartitionAssignment, PublishOutcome, StartOffset,
        StateConsumer,
    },
    models::{Record, TopicPartitionOffset},
    readiness::ReadinessGate,
    shutdown::{Shutdown, ShutdownReason},
    test_utils::{FakeLogReader, FakePublisher, FlakyStore},
};

/// Poll a condition until it holds, failing the test after three seconds
macro_rules! eventually {
    ($cond:expr) => {{
        let mut reached = false;
        for _ in 0..300 {
            if $cond {
                reached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reached, "condition never held: {}", stringify!($cond));
    }};
}

const TOPIC: &str = "items";

fn settings() -> ConsumerSettings {
    ConsumerSettings {
        topic: TOPIC.to_string(),
        idle_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_secs(3600),
        watermark_retry_interval: Duration::from_millis(5),
        watermark_retry_max: Duration::from_secs(1),
    }
}

fn tpo(partition: i32, offset: i64) -> TopicPartitionOffset {
    TopicPartitionOffset::new(TOPIC, partition, offset)
}

fn consumer(
    reader: &Arc<FakeLogReader>,
    store: Arc<dyn MaterializedStore>,
    settings: ConsumerSettings,
    shutdown: &Shutdown,
) -> StateConsumer {
    StateConsumer::new(reader.clone(), store, settings, shutdown.clone())
}

#[tokio::test]
async fn test_fresh_start_seeds_ledger_and_becomes_ready() {
    let reader = Arc::new(
        FakeLogReader::new(&[0, 1])
            .with_watermarks(0, 0, 3)
            .with_watermarks(1, 5, 5),
    );
    for offset in 0..3 {
        reader.push_record(TOPIC, 0, offset, Record::new(format!("k{}", offset), b"v".to_vec()));
    }

    let store = Arc::new(MemoryMaterializedStore::default());
    let gate = ReadinessGate::new(store.clone());
    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store.clone(), settings(), &shutdown);
    let handle = tokio::spawn(async move { consumer.run().await });

    eventually!(store.count().await.unwrap() == 3);
    eventually!(gate.is_ready().await);

    assert_eq!(
        store.startup_watermarks().await.unwrap(),
        Some(vec![tpo(0, 2), tpo(1, 4)])
    );
    // Low watermarks seeded the empty ledger, so both partitions resume
    assert_eq!(
        reader.assigned(),
        vec![
            PartitionAssignment::resume(&tpo(0, 0)),
            PartitionAssignment::resume(&tpo(1, 5)),
        ]
    );
    assert_eq!(store.last_consumed().await.unwrap(), vec![tpo(0, 2), tpo(1, 5)]);

    shutdown.trigger(ShutdownReason::Requested);
    handle.await.unwrap().unwrap();

    assert!(reader.is_closed());
    assert_eq!(shutdown.reason(), Some(ShutdownReason::Requested));
}

#[tokio::test]
async fn test_saved_offsets_resume_matching_partitions() {
    let reader = Arc::new(FakeLogReader::new(&[0, 1]).with_watermarks(0, 0, 8));
    let store = Arc::new(MemoryMaterializedStore::default());
    store.update_last_consumed(&tpo(0, 7)).await.unwrap();
    store.update_last_consumed(&tpo(1, 3)).await.unwrap();

    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store.clone(), settings(), &shutdown);
    let handle = tokio::spawn(async move { consumer.run().await });

    eventually!(!reader.assigned().is_empty());
    let starts: Vec<StartOffset> = reader.assigned().iter().map(|a| a.start).collect();
    assert_eq!(starts, vec![StartOffset::Offset(7), StartOffset::Offset(3)]);

    // No seeding over an existing ledger
    assert_eq!(store.last_consumed().await.unwrap(), vec![tpo(0, 7), tpo(1, 3)]);

    shutdown.trigger(ShutdownReason::Requested);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_changed_partition_count_rebuilds_from_beginning() {
    let reader = Arc::new(FakeLogReader::new(&[0, 1, 2]));
    let store = Arc::new(MemoryMaterializedStore::default());
    store.update_last_consumed(&tpo(0, 7)).await.unwrap();
    store.update_last_consumed(&tpo(1, 3)).await.unwrap();

    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store.clone(), settings(), &shutdown);
    let handle = tokio::spawn(async move { consumer.run().await });

    eventually!(!reader.assigned().is_empty());
    assert_eq!(
        reader.assigned(),
        vec![
            PartitionAssignment::beginning(TOPIC, 0),
            PartitionAssignment::beginning(TOPIC, 1),
            PartitionAssignment::beginning(TOPIC, 2),
        ]
    );

    shutdown.trigger(ShutdownReason::Requested);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tombstones_and_keyless_records_advance_the_ledger() {
    let reader = Arc::new(FakeLogReader::new(&[0]));
    reader.push_record(TOPIC, 0, 0, Record::new("k", b"v".to_vec()));
    reader.push_record(TOPIC, 0, 1, Record::tombstone("k"));
    reader.push_event(ConsumerEvent::Unkeyed(tpo(0, 2)));
    reader.push_event(ConsumerEvent::EndOfPartition { partition: 0 });
    reader.push_record(TOPIC, 0, 3, Record::new("after-idle", b"v".to_vec()));

    let store = Arc::new(MemoryMaterializedStore::default());
    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store.clone(), settings(), &shutdown);
    let handle = tokio::spawn(async move { consumer.run().await });

    eventually!(store.last_consumed().await.unwrap() == vec![tpo(0, 3)]);
    assert!(store.get("k").await.unwrap().is_none());
    assert!(store.get("after-idle").await.unwrap().is_some());

    shutdown.trigger(ShutdownReason::Requested);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_row_count_mismatch_skips_record_and_continues() {
    let reader = Arc::new(FakeLogReader::new(&[0]));
    reader.push_record(TOPIC, 0, 0, Record::new("broken", b"v".to_vec()));
    reader.push_record(TOPIC, 0, 1, Record::new("fine", b"v".to_vec()));

    let store = Arc::new(FlakyStore::new());
    store.fail_next_apply_structurally();

    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store.clone(), settings(), &shutdown);
    let handle = tokio::spawn(async move { consumer.run().await });

    eventually!(store.get("fine").await.unwrap().is_some());
    assert!(store.get("broken").await.unwrap().is_none());
    assert_eq!(store.last_consumed().await.unwrap(), vec![tpo(0, 1)]);
    assert!(!handle.is_finished());

    shutdown.trigger(ShutdownReason::Requested);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_ledger_failure_stops_consumer_and_process() {
    let reader = Arc::new(FakeLogReader::new(&[0]));
    reader.push_record(TOPIC, 0, 4, Record::new("k", b"v".to_vec()));

    let store = Arc::new(FlakyStore::new());
    store.update_last_consumed(&tpo(0, 3)).await.unwrap();
    store.fail_ledger_writes();

    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store.clone(), settings(), &shutdown);
    let result = tokio::time::timeout(Duration::from_secs(3), consumer.run())
        .await
        .expect("consumer should stop on its own");

    assert!(result.is_err());
    assert_eq!(consumer.state().to_string(), "stopped");
    assert!(reader.is_closed());
    assert_eq!(shutdown.reason(), Some(ShutdownReason::ConsumerStopped));
    assert!(ShutdownReason::ConsumerStopped.is_failure());
    assert_eq!(store.last_consumed().await.unwrap(), vec![tpo(0, 3)]);
}

#[tokio::test]
async fn test_watermark_write_failure_keeps_consuming_but_never_ready() {
    let reader = Arc::new(FakeLogReader::new(&[0]).with_watermarks(0, 0, 1));
    reader.push_record(TOPIC, 0, 0, Record::new("k", b"v".to_vec()));

    let store = Arc::new(FlakyStore::new());
    store.fail_watermark_writes();
    let gate = ReadinessGate::new(store.clone());

    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store.clone(), settings(), &shutdown);
    let handle = tokio::spawn(async move { consumer.run().await });

    eventually!(store.get("k").await.unwrap().is_some());
    assert_eq!(store.startup_watermarks().await.unwrap(), None);
    assert!(!gate.is_ready().await);
    assert_eq!(shutdown.reason(), None);

    shutdown.trigger(ShutdownReason::Requested);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_broker_error_stops_consumer_and_process() {
    let reader = Arc::new(FakeLogReader::new(&[0]).with_watermarks(0, 0, 2));
    reader.push_record(TOPIC, 0, 0, Record::new("before", b"v".to_vec()));
    reader.push_error(KafkaIntegrationError::Consume("broker transport failure".to_string()));
    reader.push_record(TOPIC, 0, 1, Record::new("after", b"v".to_vec()));

    let store = Arc::new(MemoryMaterializedStore::default());
    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store.clone(), settings(), &shutdown);
    let result = tokio::time::timeout(Duration::from_secs(3), consumer.run())
        .await
        .expect("consumer should stop on its own");

    assert!(result.is_err());
    assert_eq!(consumer.state().to_string(), "stopped");
    assert!(reader.is_closed());
    assert_eq!(shutdown.reason(), Some(ShutdownReason::ConsumerStopped));
    assert!(store.get("before").await.unwrap().is_some());
    assert!(store.get("after").await.unwrap().is_none());
    assert_eq!(store.last_consumed().await.unwrap(), vec![tpo(0, 0)]);
}

#[tokio::test]
async fn test_watermark_queries_are_retried() {
    let reader = Arc::new(FakeLogReader::new(&[0]).with_watermarks(0, 0, 10).fail_watermarks(3));
    let store = Arc::new(MemoryMaterializedStore::default());

    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store.clone(), settings(), &shutdown);
    let handle = tokio::spawn(async move { consumer.run().await });

    eventually!(store.startup_watermarks().await.unwrap().is_some());
    assert_eq!(store.startup_watermarks().await.unwrap(), Some(vec![tpo(0, 9)]));

    shutdown.trigger(ShutdownReason::Requested);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_watermark_retry_gives_up() {
    let reader = Arc::new(FakeLogReader::new(&[0]).fail_watermarks(u32::MAX));
    let store = Arc::new(MemoryMaterializedStore::default());
    let settings = ConsumerSettings {
        watermark_retry_max: Duration::from_millis(50),
        ..settings()
    };

    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store.clone(), settings, &shutdown);
    let result = tokio::time::timeout(Duration::from_secs(3), consumer.run())
        .await
        .expect("consumer should give up");

    assert!(result.is_err());
    assert_eq!(store.startup_watermarks().await.unwrap(), None);
    assert_eq!(shutdown.reason(), Some(ShutdownReason::ConsumerStopped));
}

#[tokio::test]
async fn test_missing_topic_is_fatal() {
    let reader = Arc::new(FakeLogReader::new(&[]));
    let store = Arc::new(MemoryMaterializedStore::default());

    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store, settings(), &shutdown);

    assert!(consumer.run().await.is_err());
    assert!(reader.is_closed());
}

#[tokio::test]
async fn test_shutdown_interrupts_idle_sleep() {
    let reader = Arc::new(FakeLogReader::new(&[0]));
    reader.push_event(ConsumerEvent::EndOfPartition { partition: 0 });
    let store = Arc::new(MemoryMaterializedStore::default());
    let settings = ConsumerSettings {
        idle_interval: Duration::from_secs(3600),
        ..settings()
    };

    let shutdown = Shutdown::new();
    let mut consumer = consumer(&reader, store, settings, &shutdown);
    let handle = tokio::spawn(async move { consumer.run().await });

    eventually!(reader.remaining() == 0);
    shutdown.trigger(ShutdownReason::Terminate);

    tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("consumer should stop while idling")
        .unwrap()
        .unwrap();
    assert_eq!(shutdown.reason(), Some(ShutdownReason::Terminate));
}

#[tokio::test]
async fn test_outbox_waits_for_readiness() {
    let store = Arc::new(MemoryMaterializedStore::default());
    let outbox = Arc::new(MemoryOutbox::new());
    outbox.enqueue(&Record::new("k", b"v".to_vec())).await.unwrap();

    let publisher = Arc::new(FakePublisher::new());
    let gate = Arc::new(ReadinessGate::new(store.clone()));
    let shutdown = Shutdown::new();
    let worker = OutboxWorker::new(
        outbox.clone(),
        publisher.clone(),
        OutboxSettings {
            interval: Duration::from_millis(5),
            backpressure_backoff: Duration::from_millis(5),
        },
        shutdown.clone(),
    )
    .wait_for(gate);
    let handle = tokio::spawn(async move { worker.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(publisher.attempts(), 0);

    store.set_startup_watermarks(vec![tpo(0, 0)]).await.unwrap();

    eventually!(outbox.pending_count().await.unwrap() == 0);
    assert_eq!(publisher.published(), vec![Record::new("k", b"v".to_vec())]);

    shutdown.trigger(ShutdownReason::Requested);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_outbox_quarantines_rejected_entry() {
    let outbox = Arc::new(MemoryOutbox::new());
    outbox.enqueue(&Record::new("rejected", b"v".to_vec())).await.unwrap();
    outbox.enqueue(&Record::new("next", b"v".to_vec())).await.unwrap();

    let publisher = Arc::new(FakePublisher::new().with_outcome(PublishOutcome::NotPersisted));
    let worker = OutboxWorker::new(
        outbox.clone(),
        publisher.clone(),
        OutboxSettings {
            interval: Duration::from_millis(5),
            backpressure_backoff: Duration::from_millis(5),
        },
        Shutdown::new(),
    );

    let summary = worker.drain().await;

    assert_eq!(summary.quarantined, 1);
    assert_eq!(summary.published, 0);
    assert_eq!(outbox.failed_entries().unwrap()[0].record.key, "rejected");
    assert_eq!(outbox.peek_oldest().await.unwrap().unwrap().record.key, "next");
}

#[tokio::test]
async fn test_outbox_quarantines_failed_publish() {
    let outbox = Arc::new(MemoryOutbox::new());
    outbox.enqueue(&Record::new("doomed", b"v".to_vec())).await.unwrap();
    outbox.enqueue(&Record::new("next", b"v".to_vec())).await.unwrap();

    let publisher = Arc::new(FakePublisher::new().failing("message too large"));
    let worker = OutboxWorker::new(
        outbox.clone(),
        publisher.clone(),
        OutboxSettings {
            interval: Duration::from_millis(5),
            backpressure_backoff: Duration::from_millis(5),
        },
        Shutdown::new(),
    );

    let summary = worker.drain().await;

    assert_eq!(summary.quarantined, 1);
    assert_eq!(summary.published, 0);
    assert_eq!(publisher.attempts(), 1);
    assert!(publisher.published().is_empty());
    assert_eq!(outbox.failed_entries().unwrap()[0].record.key, "doomed");
    assert_eq!(outbox.pending_count().await.unwrap(), 1);
}

fn live_config(topic: &str) -> KafkaConfig {
    KafkaConfig {
        brokers: "localhost:9092".to_string(),
        consumer_group: format!("statecache-test-{}", uuid::Uuid::new_v4()),
        source_topic: topic.to_string(),
        destination_topic: topic.to_string(),
        ..KafkaConfig::default()
    }
}

async fn create_test_topic(topic: &str, partitions: i32) -> Result<(), Box<dyn std::error::Error>> {
    use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
    use rdkafka::client::DefaultClientContext;
    use rdkafka::config::ClientConfig;

    let admin: AdminClient<DefaultClientContext> =
        ClientConfig::new().set("bootstrap.servers", "localhost:9092").create()?;

    let topics = [NewTopic::new(topic, partitions, TopicReplication::Fixed(1))];
    for result in admin.create_topics(&topics, &AdminOptions::new()).await? {
        if let Err((topic, err)) = result {
            if !err.to_string().contains("already exists") {
                return Err(format!("Failed to create topic {}: {}", topic, err).into());
            }
        }
    }
    Ok(())
}

#[tokio::test]
#[ignore] // Requires Kafka to be running
async fn test_published_record_is_materialized() {
    let topic = format!("statecache-test-{}", uuid::Uuid::new_v4());
    create_test_topic(&topic, 2).await.expect("Failed to create topic");
    let config = live_config(&topic);

    let publisher = KafkaPublisher::new(&config).expect("Failed to create publisher");
    let outcome = publisher
        .publish(&Record::new("live-key", b"live-value".to_vec()))
        .await
        .expect("Failed to publish");
    assert_eq!(outcome, PublishOutcome::Persisted);

    let store = Arc::new(MemoryMaterializedStore::default());
    let gate = ReadinessGate::new(store.clone());
    let shutdown = Shutdown::new();
    let reader = Arc::new(KafkaLogReader::new(&config).expect("Failed to create reader"));
    let mut consumer = StateConsumer::new(
        reader,
        store.clone(),
        ConsumerSettings::new(&config, &Default::default()),
        shutdown.clone(),
    );
    let handle = tokio::spawn(async move { consumer.run().await });

    for _ in 0..100 {
        if gate.is_ready().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(gate.is_ready().await, "view should catch up with the topic");
    let item = store.get("live-key").await.unwrap().expect("item should be materialized");
    assert_eq!(item.value, b"live-value");

    shutdown.trigger(ShutdownReason::Requested);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
#[ignore] // Requires Kafka to be running
async fn test_tombstone_round_trip_through_broker() {
    let topic = format!("statecache-test-{}", uuid::Uuid::new_v4());
    create_test_topic(&topic, 1).await.expect("Failed to create topic");
    let config = live_config(&topic);

    let publisher = KafkaPublisher::new(&config).expect("Failed to create publisher");
    publisher.publish(&Record::new("gone", b"v".to_vec())).await.unwrap();
    publisher.publish(&Record::tombstone("gone")).await.unwrap();

    let store = Arc::new(MemoryMaterializedStore::default());
    let shutdown = Shutdown::new();
    let reader = Arc::new(KafkaLogReader::new(&config).expect("Failed to create reader"));
    let mut consumer = StateConsumer::new(
        reader,
        store.clone(),
        ConsumerSettings::new(&config, &Default::default()),
        shutdown.clone(),
    );
    let handle = tokio::spawn(async move { consumer.run().await });

    for _ in 0..100 {
        if store.last_consumed().await.unwrap() == vec![TopicPartitionOffset::new(&topic, 0, 1)] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(store.get("gone").await.unwrap().is_none());

    shutdown.trigger(ShutdownReason::Requested);
    handle.await.unwrap().unwrap();
}
