//! Integration tests for [`RedpandaBroker`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up a single-node Kafka and validate:
//! - Topic provisioning, including topics that already exist
//! - Publish/subscribe round-trip through the event bus
//! - Health probes against a live broker
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//! - Can be flaky due to Kafka's distributed nature and timing
//!
//! To run explicitly:
//! ```bash
//! cargo test -p waypoint-redpanda --test integration_tests -- --ignored
//! ```
//!
//! # Panics
//!
//! These tests use `expect()` and `panic!()` for setup failures, which is acceptable in test code.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};
use tokio::sync::mpsc;
use waypoint_core::config::{OffsetReset, SecurityProtocol};
use waypoint_core::{BusConfig, EventEnvelope, Retention, TopicConfig};
use waypoint_redpanda::RedpandaBroker;
use waypoint_runtime::{EventBus, ProvisionOutcome, handler_fn};

/// Start Kafka and return the container with its bootstrap address.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "false")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn config(brokers: &str, group: &str) -> BusConfig {
    // Credentials are required by validation but unused over PLAINTEXT
    BusConfig::new(brokers, "test", "test")
        .with_security_protocol(SecurityProtocol::Plaintext)
        .with_group_id(group)
        .with_auto_offset_reset(OffsetReset::Earliest)
}

/// Single-broker catalog: replication factor 1.
fn catalog() -> Vec<TopicConfig> {
    vec![
        TopicConfig::new("user-emotions", 2, 1, Retention::hours(24)),
        TopicConfig::new("system-events", 1, 1, Retention::hours(24)),
    ]
}

/// Connect, retrying while the broker finishes starting.
async fn connected_bus(brokers: &str, group: &str) -> EventBus {
    let bus = EventBus::builder(config(brokers, group), Arc::new(RedpandaBroker::new()))
        .catalog(catalog())
        .build();

    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if bus.connect().await.is_ok() {
            return bus;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
    bus
}

#[tokio::test]
#[ignore]
async fn test_provisioning_tolerates_existing_topics() {
    let (_kafka, brokers) = start_kafka().await;

    let first = connected_bus(&brokers, "provision-a").await;
    let outcome = first.create_topics().await.expect("create_topics");
    assert_eq!(outcome.created_count(), 2, "unexpected outcome: {outcome:?}");

    // Second call on the same bus makes no broker call
    let again = first.create_topics().await.expect("create_topics");
    assert_eq!(
        again,
        ProvisionOutcome::Provisioned {
            created: vec![],
            existing: vec![]
        }
    );

    // A fresh bus asks the broker again; existing topics are success, not creations
    let second = connected_bus(&brokers, "provision-b").await;
    let outcome = second.create_topics().await.expect("create_topics");
    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    assert_eq!(outcome.created_count(), 0);
    assert!(
        matches!(outcome, ProvisionOutcome::Provisioned { ref existing, .. } if existing.len() == 2),
        "unexpected outcome: {outcome:?}"
    );
    assert_eq!(second.get_metrics().await.topics.len(), 2);

    first.disconnect().await;
    second.disconnect().await;
}

#[tokio::test]
#[ignore]
async fn test_publish_and_subscribe_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = connected_bus(&brokers, "round-trip").await;
    assert!(bus.create_topics().await.expect("create_topics").is_success());

    let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();
    bus.subscribe(
        &["user-emotions"],
        handler_fn(move |event, _delivery| {
            let tx = tx.clone();
            async move {
                tx.send(event).ok();
                Ok(())
            }
        }),
    )
    .await
    .expect("Failed to subscribe");

    // Give consumer time to subscribe and rebalance
    tokio::time::sleep(Duration::from_secs(3)).await;

    let receipt = bus
        .publish_user_emotion("user-7", json!({ "emotion": "curious", "intensity": 0.4 }))
        .await
        .expect("Failed to publish");
    assert_eq!(receipt.topic, "user-emotions");
    assert_eq!(receipt.id, "user-7");

    let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Handler channel closed");

    assert_eq!(event.event_type, "user:emotion");
    assert_eq!(event.id, "user-7");
    assert_eq!(event.payload["emotion"], "curious");
    assert_eq!(event.header("event-type"), Some("user:emotion"));

    let metrics = bus.get_metrics().await;
    assert_eq!(metrics.counters.messages_produced, 1);
    assert_eq!(metrics.counters.messages_consumed, 1);

    bus.disconnect().await;
    assert!(!bus.is_connected());
}

#[tokio::test]
#[ignore]
async fn test_health_probe_against_live_broker() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = connected_bus(&brokers, "health").await;

    let report = bus.health_check().await;
    assert!(report.is_healthy(), "unexpected report: {report:?}");
    assert_eq!(report.checks.connection_healthy, Some(true));

    bus.disconnect().await;
    let report = bus.health_check().await;
    assert!(!report.is_healthy());
    assert_eq!(report.checks.connection_healthy, None);
}
