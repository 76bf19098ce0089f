//! # Waypoint Runtime
//!
//! The event bus: publishes structured events to named topics on a Kafka-compatible
//! broker and dispatches consumed events to registered handlers.
//!
//! ## Core Components
//!
//! - **`ConnectionManager`**: validates configuration, opens and closes the producer
//!   and consumer connections, publishes [`ConnectionStates`]
//! - **`TopicRegistry`**: the fixed topic catalog and idempotent provisioning
//! - **`Publisher`**: envelope construction, partition keys, bounded retry
//! - **`Subscriber`**: topic subscriptions and failure-isolated dispatch
//! - **`HealthMonitor`**: connection flag plus broker probe, as one verdict
//! - **Metrics**: atomic counters mirrored to the `metrics` facade
//!
//! The [`EventBus`] composes them. It is an ordinary value: construct one with the
//! broker implementation you want and share it behind an `Arc`.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use waypoint_core::BusConfig;
//! use waypoint_redpanda::RedpandaBroker;
//! use waypoint_runtime::{EventBus, handler_fn};
//!
//! let bus = Arc::new(EventBus::new(BusConfig::from_env()?, Arc::new(RedpandaBroker::new())));
//! bus.connect().await?;
//! bus.create_topics().await?;
//!
//! bus.subscribe(&["user-emotions"], handler_fn(|event, delivery| async move {
//!     tracing::info!(id = %event.id, offset = delivery.offset, "received");
//!     Ok(())
//! }))
//! .await?;
//!
//! bus.publish_user_emotion("u1", serde_json::json!({ "emotion": "calm" })).await?;
//! ```

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use waypoint_core::config::BusConfig;
use waypoint_core::envelope::EventInput;
use waypoint_core::environment::{Clock, SystemClock};
use waypoint_core::error::BusError;
use waypoint_core::topic::{TopicConfig, default_catalog};
use waypoint_core::transport::Broker;

mod connection;
mod health;
mod publisher;
mod registry;
mod subscriber;

/// Retry logic with exponential backoff
pub mod retry;

/// Bus counters and Prometheus export
pub mod metrics;

pub use connection::{ConnectionState, ConnectionStates};
pub use health::{HealthChecks, HealthReport, HealthStatus};
pub use self::metrics::{CounterSnapshot, MetricsSnapshot};
pub use publisher::{
    ORCHESTRATION_RESULT_TYPE, PublishReceipt, SKILL_EXECUTION_TYPE, SYSTEM_EVENT_PREFIX,
    USER_EMOTION_TYPE,
};
pub use registry::ProvisionOutcome;
pub use retry::RetryPolicy;
pub use subscriber::{HandlerFuture, MessageHandler, handler_fn};

use connection::{ConnectOutcome, ConnectionManager};
use health::HealthMonitor;
use self::metrics::{BusMetrics, ErrorKind};
use publisher::Publisher;
use registry::TopicRegistry;
use subscriber::Subscriber;

/// Builder for [`EventBus`].
pub struct EventBusBuilder {
    config: BusConfig,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    catalog: Vec<TopicConfig>,
}

impl EventBusBuilder {
    /// Clock used to stamp envelopes. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish retry policy. Defaults to 3 retries at 1s, 2s and 4s.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Topic catalog provisioned by `create_topics()`. Defaults to
    /// [`default_catalog`].
    #[must_use]
    pub fn catalog(mut self, catalog: Vec<TopicConfig>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Build the bus. No connection is made until [`EventBus::connect`].
    #[must_use]
    pub fn build(self) -> EventBus {
        let metrics = Arc::new(BusMetrics::new());
        let connection = Arc::new(ConnectionManager::new(
            self.config,
            self.broker,
            Arc::clone(&metrics),
        ));
        let registry = Arc::new(TopicRegistry::new(
            self.catalog,
            Arc::clone(&connection),
            Arc::clone(&metrics),
        ));

        EventBus {
            publisher: Publisher::new(
                Arc::clone(&connection),
                Arc::clone(&metrics),
                Arc::clone(&self.clock),
                self.retry_policy,
            ),
            subscriber: Subscriber::new(
                Arc::clone(&connection),
                Arc::clone(&registry),
                Arc::clone(&metrics),
            ),
            health: HealthMonitor::new(Arc::clone(&connection), self.clock),
            connection,
            registry,
            metrics,
            lifecycle: Mutex::new(()),
        }
    }
}

/// The event bus.
///
/// All methods take `&self`; wrap the bus in an `Arc` to share it between tasks.
pub struct EventBus {
    connection: Arc<ConnectionManager>,
    registry: Arc<TopicRegistry>,
    publisher: Publisher,
    subscriber: Subscriber,
    health: HealthMonitor,
    metrics: Arc<BusMetrics>,
    /// Serializes `connect()` and `disconnect()`
    lifecycle: Mutex<()>,
}

impl EventBus {
    /// Create a bus with default clock, retry policy and catalog.
    #[must_use]
    pub fn new(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        Self::builder(config, broker).build()
    }

    /// Start building a bus.
    #[must_use]
    pub fn builder(config: BusConfig, broker: Arc<dyn Broker>) -> EventBusBuilder {
        EventBusBuilder {
            config,
            broker,
            clock: Arc::new(SystemClock),
            retry_policy: RetryPolicy::default(),
            catalog: default_catalog(),
        }
    }

    /// Validate configuration and open the producer and consumer connections.
    ///
    /// Calling this while connected does nothing. After a disconnect, topics that
    /// were subscribed are subscribed again and their handlers keep receiving.
    ///
    /// # Errors
    ///
    /// - [`BusError::Configuration`] if a required parameter is missing (no network call is made)
    /// - [`BusError::Connection`] if either handshake fails
    /// - [`BusError::Subscription`] if re-subscribing after a reconnect fails
    pub async fn connect(&self) -> Result<(), BusError> {
        let _lifecycle = self.lifecycle.lock().await;

        let consumer = match self.connection.connect().await? {
            ConnectOutcome::AlreadyConnected => return Ok(()),
            ConnectOutcome::Established(consumer) => consumer,
        };

        if let Err(error) = self.subscriber.attach(consumer).await {
            self.metrics.record_error(ErrorKind::Connect);
            tracing::error!(error = %error, "Failed to start dispatcher, disconnecting");
            self.connection.disconnect().await;
            return Err(error);
        }

        self.connection.mark_established();
        Ok(())
    }

    /// Close both connections.
    ///
    /// Never fails: close errors are logged. Publishes in flight or waiting to retry fail with
    /// [`BusError::ConnectionClosed`].
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.connection.disconnect().await;
        self.subscriber
            .detach(self.connection.config().operation_timeout)
            .await;
        tracing::info!("Event bus disconnected");
    }

    /// Whether both connections are established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Watch producer and consumer connection states.
    #[must_use]
    pub fn connection_states(&self) -> watch::Receiver<ConnectionStates> {
        self.connection.states()
    }

    /// The topic catalog this bus provisions.
    #[must_use]
    pub fn catalog(&self) -> &[TopicConfig] {
        self.registry.catalog()
    }

    /// Create every catalog topic not yet known to exist.
    ///
    /// Broker failures are returned as [`ProvisionOutcome::Failed`], not as errors,
    /// and are not retried.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotConnected`] if the bus is not connected.
    pub async fn create_topics(&self) -> Result<ProvisionOutcome, BusError> {
        self.registry.create_topics().await
    }

    /// Publish one event to `topic`.
    ///
    /// The partition key is `key`, else the event id, else the context's `userId`,
    /// else `"default"`.
    ///
    /// # Errors
    ///
    /// - [`BusError::NotConnected`] if the bus is not connected
    /// - [`BusError::Publish`] once every retry has failed
    /// - [`BusError::ConnectionClosed`] if the bus is disconnected while retrying
    pub async fn publish(
        &self,
        topic: &str,
        event: EventInput,
        key: Option<&str>,
    ) -> Result<PublishReceipt, BusError> {
        self.publisher.publish(topic, event, key).await
    }

    /// Publish an `orchestration:result` event to `orchestration-results`.
    ///
    /// # Errors
    ///
    /// As for [`Self::publish`].
    pub async fn publish_orchestration_result(
        &self,
        result: Value,
        context: Option<Value>,
    ) -> Result<PublishReceipt, BusError> {
        self.publisher
            .publish_orchestration_result(result, context)
            .await
    }

    /// Publish a `user:emotion` event to `user-emotions`, keyed by `user_id`.
    ///
    /// # Errors
    ///
    /// As for [`Self::publish`].
    pub async fn publish_user_emotion(
        &self,
        user_id: &str,
        emotion: Value,
    ) -> Result<PublishReceipt, BusError> {
        self.publisher.publish_user_emotion(user_id, emotion).await
    }

    /// Publish a `skill:execution` event to `skill-executions`.
    ///
    /// # Errors
    ///
    /// As for [`Self::publish`].
    pub async fn publish_skill_execution(
        &self,
        execution: Value,
        context: Option<Value>,
    ) -> Result<PublishReceipt, BusError> {
        self.publisher
            .publish_skill_execution(execution, context)
            .await
    }

    /// Publish a `system:<name>` event to `system-events`.
    ///
    /// # Errors
    ///
    /// As for [`Self::publish`].
    pub async fn publish_system_event(
        &self,
        name: &str,
        payload: Value,
    ) -> Result<PublishReceipt, BusError> {
        self.publisher.publish_system_event(name, payload).await
    }

    /// Subscribe to `topics` and route their messages to `handler`.
    ///
    /// Subscribing a topic twice keeps both handlers; each message goes to every
    /// handler of its topic, in registration order.
    ///
    /// # Errors
    ///
    /// - [`BusError::NotConnected`] if the bus is not connected
    /// - [`BusError::Subscription`] if `topics` is empty or the consumer rejects it
    pub async fn subscribe(
        &self,
        topics: &[&str],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        self.subscriber.subscribe(topics, handler).await
    }

    /// Register the handler for an event type, replacing any previous one.
    pub async fn register_event_handler(&self, event_type: &str, handler: Arc<dyn MessageHandler>) {
        self.subscriber
            .register_event_handler(event_type, handler)
            .await;
    }

    /// The handler registered for an event type.
    pub async fn event_handler(&self, event_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.subscriber.event_handler(event_type).await
    }

    /// Connection flag, broker probe and metrics, as one verdict.
    pub async fn health_check(&self) -> HealthReport {
        let topics = self.registry.len().await;
        let event_handlers = self.subscriber.event_handler_count().await;
        let metrics = self.get_metrics().await;
        self.health.check(topics, event_handlers, metrics).await
    }

    /// Counters plus known topics, handler count and connection flag.
    pub async fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.metrics.counters(),
            topics: self.registry.topics().await,
            event_handlers: self.subscriber.event_handler_count().await,
            is_connected: self.is_connected(),
        }
    }

    /// Zero the four counters. Topics, handlers and connection state are untouched.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}
