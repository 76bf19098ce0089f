//! Broker transport traits.
//!
//! The event bus never talks to a broker client library directly. It goes through
//! these traits, which `waypoint-redpanda` implements on top of rdkafka and
//! `waypoint-testing` implements in memory.
//!
//! ```text
//!                ┌──────────┐
//!                │  Broker  │  connect_producer / connect_consumer / connect_admin
//!                └────┬─────┘
//!        ┌────────────┼─────────────┐
//!        ▼            ▼             ▼
//! ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │  Producer  │ │  Consumer  │ │   Admin    │
//! │ send/probe │ │ subscribe/ │ │ create_    │
//! │            │ │ messages   │ │ topics     │
//! └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` rather than using `async fn` so the bus
//! can hold `Arc<dyn Broker>` and swap implementations at construction time.

use crate::config::BusConfig;
use crate::error::TransportError;
use crate::topic::TopicConfig;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Stream of records read by a consumer connection.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<InboundMessage, TransportError>> + Send>>;

/// A record to write to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Target topic
    pub topic: String,
    /// Partition key
    pub key: String,
    /// Serialized envelope
    pub payload: Vec<u8>,
    /// Record headers
    pub headers: Vec<(String, String)>,
}

/// Where the broker stored a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Partition the record was written to
    pub partition: i32,
    /// Offset within that partition
    pub offset: i64,
}

/// A record read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Record key
    pub key: Option<Vec<u8>>,
    /// Record payload
    pub payload: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds since the epoch
    pub timestamp_ms: Option<i64>,
}

/// What a create-topics batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicCreation {
    /// Topics this batch created
    pub created: Vec<String>,
    /// Topics that already existed on the broker
    pub existing: Vec<String>,
}

/// Opens connections to a broker cluster.
pub trait Broker: Send + Sync {
    /// Open a producer connection. Resolves once the handshake has completed.
    fn connect_producer<'a>(
        &'a self,
        config: &'a BusConfig,
    ) -> TransportFuture<'a, Arc<dyn ProducerConnection>>;

    /// Open a consumer connection in `config.group_id`. Resolves once the handshake has completed.
    fn connect_consumer<'a>(
        &'a self,
        config: &'a BusConfig,
    ) -> TransportFuture<'a, Arc<dyn ConsumerConnection>>;

    /// Open a short-lived administrative connection.
    fn connect_admin<'a>(
        &'a self,
        config: &'a BusConfig,
    ) -> TransportFuture<'a, Box<dyn AdminConnection>>;
}

/// A connected producer.
pub trait ProducerConnection: Send + Sync {
    /// Write one record and wait for the broker's acknowledgement.
    fn send(&self, record: OutboundRecord) -> TransportFuture<'_, DeliveryReceipt>;

    /// Lightweight metadata round-trip used by health checks.
    fn probe(&self, timeout: Duration) -> TransportFuture<'_, ()>;

    /// Flush and close the connection.
    fn close(&self) -> TransportFuture<'_, ()>;
}

/// A connected consumer.
pub trait ConsumerConnection: Send + Sync {
    /// Add `topics` to this consumer's subscription.
    ///
    /// Subscriptions accumulate: topics from earlier calls stay subscribed.
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> TransportFuture<'a, ()>;

    /// Take the stream of records read by this consumer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the stream was already taken.
    fn messages(&self) -> Result<InboundStream, TransportError>;

    /// Record `offset` on `topic`/`partition` as processed.
    ///
    /// The group resumes after it on the next assignment. Called once every
    /// handler for the record has returned.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the commit could not be queued.
    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), TransportError>;

    /// Leave the group and close the connection. Ends the message stream.
    fn close(&self) -> TransportFuture<'_, ()>;
}

/// A connected administrative client.
pub trait AdminConnection: Send + Sync {
    /// Create `topics` in one batch.
    ///
    /// A topic that already exists is not an error; it is reported in
    /// [`TopicCreation::existing`].
    fn create_topics<'a>(&'a self, topics: &'a [TopicConfig]) -> TransportFuture<'a, TopicCreation>;

    /// Close the connection.
    fn close(&self) -> TransportFuture<'_, ()>;
}
