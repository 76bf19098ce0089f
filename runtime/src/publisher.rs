//! Publishing events with bounded retry.
//!
//! `publish()` seals the caller's [`EventInput`] into an [`EventEnvelope`], derives
//! the partition key and writes the JSON payload to the topic. A failed write is
//! retried with the bus's [`RetryPolicy`] (4 attempts, 1s/2s/4s apart by default).
//! Attempts never overlap, so records sharing a key keep their order.
//!
//! A publish belongs to the session it started in. Once that session ends, the
//! publish fails with [`BusError::ConnectionClosed`] straight away, even while an
//! attempt is still in flight or the bus has already reconnected.

use crate::connection::{ConnectionManager, bounded};
use crate::metrics::{BusMetrics, ErrorKind, histogram};
use crate::retry::{RetryError, RetryPolicy, retry_with_backoff};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use waypoint_core::envelope::{CONTEXT_USER_ID, EventEnvelope, EventInput};
use waypoint_core::environment::Clock;
use waypoint_core::error::BusError;
use waypoint_core::topic;
use waypoint_core::transport::OutboundRecord;

/// Event type written by [`EventBus::publish_orchestration_result`](crate::EventBus::publish_orchestration_result).
pub const ORCHESTRATION_RESULT_TYPE: &str = "orchestration:result";

/// Event type written by [`EventBus::publish_user_emotion`](crate::EventBus::publish_user_emotion).
pub const USER_EMOTION_TYPE: &str = "user:emotion";

/// Event type written by [`EventBus::publish_skill_execution`](crate::EventBus::publish_skill_execution).
pub const SKILL_EXECUTION_TYPE: &str = "skill:execution";

/// Prefix of event types written by [`EventBus::publish_system_event`](crate::EventBus::publish_system_event).
pub const SYSTEM_EVENT_PREFIX: &str = "system:";

/// Acknowledgement of a published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    /// Topic written to
    pub topic: String,
    /// Envelope id
    pub id: String,
    /// Partition the broker chose
    pub partition: i32,
    /// Offset within that partition
    pub offset: i64,
}

pub(crate) struct Publisher {
    connection: Arc<ConnectionManager>,
    metrics: Arc<BusMetrics>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
}

impl Publisher {
    pub(crate) fn new(
        connection: Arc<ConnectionManager>,
        metrics: Arc<BusMetrics>,
        clock: Arc<dyn Clock>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            connection,
            metrics,
            clock,
            retry_policy,
        }
    }

    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub(crate) async fn publish(
        &self,
        topic: &str,
        event: EventInput,
        key: Option<&str>,
    ) -> Result<PublishReceipt, BusError> {
        let closed = self.connection.closed();
        let producer = self.connection.producer().await?;

        let key = event.partition_key(key).to_string();
        let envelope = EventEnvelope::seal(event, self.clock.now());
        let payload = envelope
            .to_bytes()
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let record = OutboundRecord {
            topic: topic.to_string(),
            key,
            payload,
            headers: envelope
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        };

        let send_timeout = self.connection.config().send_timeout;
        let started = Instant::now();
        let result = retry_with_backoff(&self.retry_policy, closed, || {
            bounded(send_timeout, producer.send(record.clone()))
        })
        .await;

        match result {
            Ok(receipt) => {
                self.metrics.record_produced(topic);
                histogram!("event_bus_publish_duration_seconds", "topic" => topic.to_owned())
                    .record(started.elapsed().as_secs_f64());
                tracing::debug!(
                    id = %envelope.id,
                    partition = receipt.partition,
                    offset = receipt.offset,
                    "Event published"
                );
                Ok(PublishReceipt {
                    topic: topic.to_string(),
                    id: envelope.id,
                    partition: receipt.partition,
                    offset: receipt.offset,
                })
            }
            Err(RetryError::Exhausted { attempts, error }) => {
                self.metrics.record_error(ErrorKind::Publish);
                tracing::error!(id = %envelope.id, attempts, error = %error, "Publish failed");
                Err(BusError::Publish {
                    topic: topic.to_string(),
                    attempts,
                    source: error,
                })
            }
            Err(RetryError::Cancelled { attempts, last_error }) => {
                self.metrics.record_error(ErrorKind::Publish);
                tracing::warn!(id = %envelope.id, attempts, last_error = ?last_error, "Publish abandoned on disconnect");
                Err(BusError::ConnectionClosed)
            }
        }
    }

    /// Publish an orchestration result, keyed by its `id` field when it has one.
    pub(crate) async fn publish_orchestration_result(
        &self,
        result: Value,
        context: Option<Value>,
    ) -> Result<PublishReceipt, BusError> {
        let event = with_payload_id(EventInput::new(ORCHESTRATION_RESULT_TYPE, result), context);
        self.publish(topic::ORCHESTRATION_RESULTS, event, None).await
    }

    /// Publish a user's emotional state, keyed by the user.
    pub(crate) async fn publish_user_emotion(
        &self,
        user_id: &str,
        emotion: Value,
    ) -> Result<PublishReceipt, BusError> {
        let event = EventInput::new(USER_EMOTION_TYPE, emotion)
            .with_id(user_id)
            .with_context(Value::Object(
                std::iter::once((CONTEXT_USER_ID.to_string(), Value::from(user_id))).collect(),
            ));
        self.publish(topic::USER_EMOTIONS, event, None).await
    }

    /// Publish a skill execution record, keyed by its `id` field when it has one.
    pub(crate) async fn publish_skill_execution(
        &self,
        execution: Value,
        context: Option<Value>,
    ) -> Result<PublishReceipt, BusError> {
        let event = with_payload_id(EventInput::new(SKILL_EXECUTION_TYPE, execution), context);
        self.publish(topic::SKILL_EXECUTIONS, event, None).await
    }

    /// Publish a `system:<name>` event.
    pub(crate) async fn publish_system_event(
        &self,
        name: &str,
        payload: Value,
    ) -> Result<PublishReceipt, BusError> {
        let event = EventInput::new(format!("{SYSTEM_EVENT_PREFIX}{name}"), payload);
        self.publish(topic::SYSTEM_EVENTS, event, None).await
    }
}

fn with_payload_id(mut event: EventInput, context: Option<Value>) -> EventInput {
    event.id = event
        .payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string);
    event.context = context;
    event
}
