//! Redpanda broker transport for the Waypoint event bus.
//!
//! [`RedpandaBroker`] implements the `waypoint-core` transport traits on top of
//! rdkafka, so it works with Redpanda, Apache Kafka or any managed
//! Kafka-compatible service.
//!
//! # Connections
//!
//! - **Producer**: a `FutureProducer` with the configured acknowledgement mode,
//!   broker-level retries and compression. Its handshake is a metadata request.
//! - **Consumer**: one `StreamConsumer` in the configured group. A pump task
//!   forwards records into a bounded channel read by the bus's dispatcher.
//! - **Admin**: a short-lived `AdminClient` used for topic provisioning.
//!
//! Authentication is SASL/PLAIN over TLS by default (`SASL_SSL`); the SASL keys
//! are only sent when the security protocol uses SASL.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - The bus commits a record's offset AFTER every handler for it has returned
//! - If the process crashes before commit, records will be redelivered
//! - Handlers MUST be idempotent (use the envelope id to detect duplicates)
//! - Ordering is guaranteed within a partition (same partition key)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use waypoint_core::BusConfig;
//! use waypoint_redpanda::RedpandaBroker;
//! use waypoint_runtime::EventBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::new().with_property("ssl.ca.location", "/etc/ssl/certs/ca.pem");
//! let bus = EventBus::new(BusConfig::from_env()?, Arc::new(broker));
//! bus.connect().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::config::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use waypoint_core::config::BusConfig;
use waypoint_core::error::TransportError;
use waypoint_core::transport::{
    AdminConnection, Broker, ConsumerConnection, ProducerConnection, TransportFuture,
};

mod admin;
mod consumer;
mod producer;

use admin::RedpandaAdmin;
use consumer::RedpandaConsumer;
use producer::RedpandaProducer;

/// Kafka-compatible broker reached through rdkafka.
///
/// # Example
///
/// ```
/// use waypoint_redpanda::RedpandaBroker;
///
/// let broker = RedpandaBroker::new()
///     .with_property("socket.keepalive.enable", "true");
/// # let _ = broker;
/// ```
#[derive(Debug, Clone, Default)]
pub struct RedpandaBroker {
    /// Extra librdkafka properties applied to every client, last
    properties: Vec<(String, String)>,
}

impl RedpandaBroker {
    /// Create a broker transport with no extra client properties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an additional librdkafka property on every client (e.g. `ssl.ca.location`).
    ///
    /// Applied after the bus settings, so it can override them.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Settings shared by producer, consumer and admin clients.
    fn client_config(&self, config: &BusConfig) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", config.broker_list().join(","))
            .set("client.id", &config.client_id)
            .set("security.protocol", config.security_protocol.as_str());

        if config.security_protocol.uses_sasl() {
            client
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", &config.sasl_username)
                .set("sasl.password", &config.sasl_password);
        }

        for (key, value) in &self.properties {
            client.set(key, value);
        }
        client
    }
}

impl Broker for RedpandaBroker {
    fn connect_producer<'a>(
        &'a self,
        config: &'a BusConfig,
    ) -> TransportFuture<'a, Arc<dyn ProducerConnection>> {
        Box::pin(async move {
            let producer = RedpandaProducer::connect(self.client_config(config), config).await?;
            Ok(Arc::new(producer) as Arc<dyn ProducerConnection>)
        })
    }

    fn connect_consumer<'a>(
        &'a self,
        config: &'a BusConfig,
    ) -> TransportFuture<'a, Arc<dyn ConsumerConnection>> {
        Box::pin(async move {
            let consumer = RedpandaConsumer::connect(self.client_config(config), config).await?;
            Ok(Arc::new(consumer) as Arc<dyn ConsumerConnection>)
        })
    }

    fn connect_admin<'a>(
        &'a self,
        config: &'a BusConfig,
    ) -> TransportFuture<'a, Box<dyn AdminConnection>> {
        Box::pin(async move {
            let admin = RedpandaAdmin::create(self.client_config(config), config)?;
            Ok(Box::new(admin) as Box<dyn AdminConnection>)
        })
    }
}

/// Milliseconds as a librdkafka property value.
fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}

/// Run a blocking metadata request against any rdkafka client.
async fn fetch_metadata<F>(request: F) -> Result<(), TransportError>
where
    F: FnOnce() -> rdkafka::error::KafkaResult<rdkafka::metadata::Metadata> + Send + 'static,
{
    tokio::task::spawn_blocking(request)
        .await
        .map_err(|e| TransportError::Metadata(format!("metadata task failed: {e}")))?
        .map(|_| ())
        .map_err(|e| TransportError::Metadata(e.to_string()))
}
