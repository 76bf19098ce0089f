//! Producer and consumer connection lifecycle.
//!
//! The [`ConnectionManager`] owns both broker connections. `connect()` validates
//! the configuration, then runs the producer handshake followed by the consumer
//! handshake, each bounded by `operation_timeout`. The bus only reports itself
//! connected once both have completed.
//!
//! State transitions are published on a [`watch`] channel of [`ConnectionStates`]
//! so health checks and callers can observe them without polling.
//!
//! `disconnect()` never fails: close errors are logged, both handles are released
//! and the session generation is bumped so in-flight publishes give up.
//!
//! A session is only counted as a reconnect once the caller confirms it with
//! [`ConnectionManager::mark_established`], after the dispatcher is running.

use crate::metrics::{BusMetrics, ErrorKind};
use serde::Serialize;
use std::sync::Arc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use waypoint_core::config::BusConfig;
use waypoint_core::error::{BusError, TransportError};
use waypoint_core::transport::{
    AdminConnection, Broker, ConsumerConnection, ProducerConnection, TransportFuture,
};

/// Lifecycle state of one broker connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection
    #[default]
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Handshake completed
    Connected,
}

/// Producer and consumer states, tracked independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStates {
    /// Producer connection state
    pub producer: ConnectionState,
    /// Consumer connection state
    pub consumer: ConnectionState,
}

impl ConnectionStates {
    const fn new(producer: ConnectionState, consumer: ConnectionState) -> Self {
        Self { producer, consumer }
    }

    /// Both connections have completed their handshake.
    #[must_use]
    pub const fn both_connected(self) -> bool {
        matches!(
            (self.producer, self.consumer),
            (ConnectionState::Connected, ConnectionState::Connected)
        )
    }
}

/// Result of a successful `connect()`.
pub(crate) enum ConnectOutcome {
    /// The bus was already connected; nothing was done
    AlreadyConnected,
    /// Fresh connections were opened
    Established(Arc<dyn ConsumerConnection>),
}

#[derive(Default)]
struct Handles {
    producer: Option<Arc<dyn ProducerConnection>>,
    consumer: Option<Arc<dyn ConsumerConnection>>,
}

/// Await a transport operation for at most `limit`.
pub(crate) async fn bounded<T>(
    limit: Duration,
    operation: TransportFuture<'_, T>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| TransportError::Timeout(limit))?
}

/// Owns the producer and consumer connections.
pub(crate) struct ConnectionManager {
    config: BusConfig,
    broker: Arc<dyn Broker>,
    metrics: Arc<BusMetrics>,
    handles: RwLock<Handles>,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    states: watch::Sender<ConnectionStates>,
    /// Bumped by every `disconnect()`
    generation: watch::Sender<u64>,
}

impl ConnectionManager {
    pub(crate) fn new(config: BusConfig, broker: Arc<dyn Broker>, metrics: Arc<BusMetrics>) -> Self {
        let (states, _) = watch::channel(ConnectionStates::default());
        let (generation, _) = watch::channel(0);
        Self {
            config,
            broker,
            metrics,
            handles: RwLock::new(Handles::default()),
            connected: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            states,
            generation,
        }
    }

    pub(crate) const fn config(&self) -> &BusConfig {
        &self.config
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn states(&self) -> watch::Receiver<ConnectionStates> {
        self.states.subscribe()
    }

    /// Resolves once the current session ends.
    ///
    /// A disconnect followed by a fast reconnect still resolves it, because the
    /// generation seen here never comes back.
    pub(crate) fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut generation = self.generation.subscribe();
        let current = *generation.borrow_and_update();
        async move {
            // Err means the manager is gone, which ends the session too
            let _ = generation.wait_for(|seen| *seen != current).await;
        }
    }

    fn set_states(&self, producer: ConnectionState, consumer: ConnectionState) {
        self.states
            .send_replace(ConnectionStates::new(producer, consumer));
    }

    /// Validate configuration, then open the producer and the consumer.
    pub(crate) async fn connect(&self) -> Result<ConnectOutcome, BusError> {
        self.config.validate()?;

        if self.is_connected() {
            tracing::debug!("Event bus already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let limit = self.config.operation_timeout;
        self.set_states(ConnectionState::Connecting, ConnectionState::Disconnected);
        tracing::info!(brokers = %self.config.brokers, "Connecting producer");

        let producer = match bounded(limit, self.broker.connect_producer(&self.config)).await {
            Ok(producer) => producer,
            Err(error) => {
                self.set_states(ConnectionState::Disconnected, ConnectionState::Disconnected);
                self.metrics.record_error(ErrorKind::Connect);
                tracing::error!(error = %error, "Producer handshake failed");
                return Err(BusError::Connection(format!(
                    "producer handshake failed: {error}"
                )));
            }
        };

        self.set_states(ConnectionState::Connected, ConnectionState::Connecting);
        tracing::info!(group_id = %self.config.group_id, "Connecting consumer");

        let consumer = match bounded(limit, self.broker.connect_consumer(&self.config)).await {
            Ok(consumer) => consumer,
            Err(error) => {
                if let Err(close_error) = bounded(limit, producer.close()).await {
                    tracing::warn!(error = %close_error, "Failed to close producer after consumer handshake failure");
                }
                self.set_states(ConnectionState::Disconnected, ConnectionState::Disconnected);
                self.metrics.record_error(ErrorKind::Connect);
                tracing::error!(error = %error, "Consumer handshake failed");
                return Err(BusError::Connection(format!(
                    "consumer handshake failed: {error}"
                )));
            }
        };

        {
            let mut handles = self.handles.write().await;
            handles.producer = Some(producer);
            handles.consumer = Some(Arc::clone(&consumer));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.set_states(ConnectionState::Connected, ConnectionState::Connected);

        Ok(ConnectOutcome::Established(consumer))
    }

    /// Confirm a session opened by `connect()` is fully up.
    ///
    /// Every session after the first counts as a reconnect.
    pub(crate) fn mark_established(&self) {
        if self.ever_connected.swap(true, Ordering::SeqCst) {
            self.metrics.record_reconnect();
            tracing::info!("Event bus reconnected");
        } else {
            tracing::info!("Event bus connected");
        }
    }

    /// Close both connections. Close failures are logged, never returned.
    pub(crate) async fn disconnect(&self) {
        self.generation.send_modify(|generation| *generation = generation.wrapping_add(1));
        self.connected.store(false, Ordering::SeqCst);

        let (producer, consumer) = {
            let mut handles = self.handles.write().await;
            (handles.producer.take(), handles.consumer.take())
        };
        let limit = self.config.operation_timeout;

        if let Some(producer) = producer {
            match bounded(limit, producer.close()).await {
                Ok(()) => tracing::info!("Producer disconnected"),
                Err(error) => tracing::error!(error = %error, "Error disconnecting producer"),
            }
        }
        if let Some(consumer) = consumer {
            match bounded(limit, consumer.close()).await {
                Ok(()) => tracing::info!("Consumer disconnected"),
                Err(error) => tracing::error!(error = %error, "Error disconnecting consumer"),
            }
        }

        self.set_states(ConnectionState::Disconnected, ConnectionState::Disconnected);
    }

    /// The producer, if the bus is connected.
    pub(crate) async fn producer(&self) -> Result<Arc<dyn ProducerConnection>, BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.handles
            .read()
            .await
            .producer
            .clone()
            .ok_or(BusError::NotConnected)
    }

    /// The consumer, if the bus is connected.
    pub(crate) async fn consumer(&self) -> Result<Arc<dyn ConsumerConnection>, BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.handles
            .read()
            .await
            .consumer
            .clone()
            .ok_or(BusError::NotConnected)
    }

    pub(crate) async fn producer_ready(&self) -> bool {
        self.handles.read().await.producer.is_some()
    }

    pub(crate) async fn consumer_ready(&self) -> bool {
        self.handles.read().await.consumer.is_some()
    }

    /// Open a short-lived administrative connection.
    pub(crate) async fn connect_admin(&self) -> Result<Box<dyn AdminConnection>, TransportError> {
        bounded(
            self.config.operation_timeout,
            self.broker.connect_admin(&self.config),
        )
        .await
    }

    /// Metadata round-trip through the producer, bounded by `probe_timeout`.
    pub(crate) async fn probe(&self) -> Result<(), TransportError> {
        let producer = self
            .handles
            .read()
            .await
            .producer
            .clone()
            .ok_or(TransportError::Closed)?;
        let limit = self.config.probe_timeout;
        bounded(limit, producer.probe(limit)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use waypoint_testing::InMemoryBroker;

    fn manager(broker: &InMemoryBroker, config: BusConfig) -> (ConnectionManager, Arc<BusMetrics>) {
        let metrics = Arc::new(BusMetrics::new());
        let manager = ConnectionManager::new(config, Arc::new(broker.clone()), Arc::clone(&metrics));
        (manager, metrics)
    }

    fn config() -> BusConfig {
        BusConfig::new("localhost:9092", "bus", "secret")
    }

    #[tokio::test]
    async fn invalid_config_fails_before_any_handshake() {
        let broker = InMemoryBroker::new();
        let (manager, _) = manager(&broker, BusConfig::new("", "bus", " "));

        let err = manager.connect().await.err();
        assert!(matches!(
            err,
            Some(BusError::Configuration { ref missing }) if missing == &["brokers", "sasl_password"]
        ));
        assert!(!manager.is_connected());
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn connect_opens_both_sides_and_publishes_states() {
        let broker = InMemoryBroker::new();
        let (manager, _) = manager(&broker, config());
        let states = manager.states();

        assert!(matches!(
            manager.connect().await,
            Ok(ConnectOutcome::Established(_))
        ));
        assert!(manager.is_connected());
        assert!(states.borrow().both_connected());
        assert!(manager.producer_ready().await);
        assert!(manager.consumer_ready().await);

        assert!(matches!(
            manager.connect().await,
            Ok(ConnectOutcome::AlreadyConnected)
        ));
        assert_eq!(broker.producer_connects(), 1);
    }

    #[tokio::test]
    async fn consumer_failure_leaves_bus_disconnected() {
        let broker = InMemoryBroker::new();
        broker.fail_consumer_connect(true);
        let (manager, metrics) = manager(&broker, config());

        let err = manager.connect().await.err();
        assert!(matches!(err, Some(BusError::Connection(_))));
        assert!(!manager.is_connected());
        assert!(!manager.producer_ready().await);
        assert_eq!(*manager.states().borrow(), ConnectionStates::default());
        assert_eq!(metrics.counters().errors, 1);
    }

    #[tokio::test]
    async fn disconnect_swallows_close_errors_and_ends_session() {
        let broker = InMemoryBroker::new();
        broker.fail_producer_close(true);
        let (manager, _) = manager(&broker, config());

        manager.connect().await.unwrap();
        let closed = manager.closed();
        manager.disconnect().await;

        assert!(!manager.is_connected());
        assert!(!manager.producer_ready().await);
        assert!(!manager.consumer_ready().await);
        assert!(closed.now_or_never().is_some());
        assert_eq!(broker.open_consumers(), 0);
        assert!(matches!(manager.producer().await, Err(BusError::NotConnected)));
    }

    #[tokio::test]
    async fn second_established_session_counts_as_reconnect() {
        let broker = InMemoryBroker::new();
        let (manager, metrics) = manager(&broker, config());

        manager.connect().await.unwrap();
        manager.mark_established();
        assert_eq!(metrics.counters().reconnects, 0);

        manager.disconnect().await;
        manager.connect().await.unwrap();
        assert_eq!(metrics.counters().reconnects, 0);

        manager.mark_established();
        assert_eq!(metrics.counters().reconnects, 1);
        assert!(manager.closed().now_or_never().is_none());
    }

    #[tokio::test]
    async fn disconnect_then_reconnect_still_ends_the_old_session() {
        let broker = InMemoryBroker::new();
        let (manager, _) = manager(&broker, config());

        manager.connect().await.unwrap();
        let closed = manager.closed();
        manager.disconnect().await;
        manager.connect().await.unwrap();

        assert!(manager.is_connected());
        assert!(closed.now_or_never().is_some());
    }
}
