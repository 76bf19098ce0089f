//! In-memory broker for fast, deterministic bus tests.
//!
//! [`InMemoryBroker`] implements the `waypoint-core` transport traits without any
//! network. It keeps per-topic partition logs, fans produced records out to
//! subscribed consumers, and records every call so tests can assert on what the
//! bus did:
//!
//! - connection attempts (to prove nothing was attempted)
//! - send attempt instants (to measure backoff under a paused tokio clock)
//! - provisioning calls (to prove topic creation is idempotent)
//! - offset commits (to prove a record is committed after its handlers ran)
//!
//! Failures are injected with the `fail_*` methods; `stall_sends` makes sends
//! hang until the caller gives up on them.
//!
//! # Example
//!
//! ```
//! use waypoint_testing::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! broker.fail_next_sends(2);
//! assert_eq!(broker.connect_attempts(), 0);
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use futures::future;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use waypoint_core::config::BusConfig;
use waypoint_core::error::TransportError;
use waypoint_core::topic::TopicConfig;
use waypoint_core::transport::{
    AdminConnection, Broker, ConsumerConnection, DeliveryReceipt, InboundMessage, InboundStream,
    OutboundRecord, ProducerConnection, TopicCreation, TransportFuture,
};

type Delivery = Result<InboundMessage, TransportError>;

/// A record stored by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Topic
    pub topic: String,
    /// Partition chosen from the key
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Record key
    pub key: Option<String>,
    /// Record payload
    pub payload: Option<Vec<u8>>,
    /// Record headers
    pub headers: Vec<(String, String)>,
}

/// An offset committed by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Topic
    pub topic: String,
    /// Partition
    pub partition: i32,
    /// Offset of the processed record
    pub offset: i64,
}

#[derive(Default)]
struct Faults {
    producer_connect: bool,
    consumer_connect: bool,
    admin: bool,
    probe: bool,
    producer_close: bool,
    subscribe: bool,
    all_sends: bool,
    next_sends: usize,
    stall_sends: bool,
}

#[derive(Default)]
struct CallLog {
    producer_connects: usize,
    consumer_connects: usize,
    admin_connects: usize,
    send_attempts: Vec<Instant>,
    provisioning_calls: Vec<Vec<String>>,
    subscribe_calls: Vec<Vec<String>>,
    commits: Vec<Commit>,
    probes: usize,
}

struct ConsumerSlot {
    id: u64,
    topics: BTreeSet<String>,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    /// Existing topics and their partition counts
    topics: BTreeMap<String, u16>,
    offsets: HashMap<(String, i32), i64>,
    records: Vec<StoredRecord>,
    consumers: Vec<ConsumerSlot>,
    next_consumer_id: u64,
    clock_ms: i64,
    faults: Faults,
    log: CallLog,
}

impl BrokerState {
    fn append(
        &mut self,
        topic: &str,
        key: Option<String>,
        payload: Option<Vec<u8>>,
        headers: Vec<(String, String)>,
    ) -> DeliveryReceipt {
        let partitions = *self.topics.entry(topic.to_string()).or_insert(1);
        let partition = key
            .as_deref()
            .map_or(0, |key| partition_for(key, partitions));

        let next = self.offsets.entry((topic.to_string(), partition)).or_insert(0);
        let offset = *next;
        *next += 1;
        self.clock_ms += 1;

        let message = InboundMessage {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.as_ref().map(|k| k.as_bytes().to_vec()),
            payload: payload.clone(),
            timestamp_ms: Some(self.clock_ms),
        };
        for consumer in self.consumers.iter().filter(|c| c.topics.contains(topic)) {
            let _ = consumer.sender.send(Ok(message.clone()));
        }

        self.records.push(StoredRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            payload,
            headers,
        });

        DeliveryReceipt { partition, offset }
    }
}

fn partition_for(key: &str, partitions: u16) -> i32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let bucket = hasher.finish() % u64::from(partitions.max(1));
    i32::try_from(bucket).unwrap_or(0)
}

/// In-memory implementation of [`Broker`].
///
/// Cloning shares the same broker state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker with no topics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a topic, as if another service had provisioned it.
    #[must_use]
    pub fn with_topic(self, name: &str, partitions: u16) -> Self {
        self.state
            .lock()
            .unwrap()
            .topics
            .insert(name.to_string(), partitions.max(1));
        self
    }

    /// Make producer handshakes fail.
    pub fn fail_producer_connect(&self, fail: bool) {
        self.state.lock().unwrap().faults.producer_connect = fail;
    }

    /// Make consumer handshakes fail.
    pub fn fail_consumer_connect(&self, fail: bool) {
        self.state.lock().unwrap().faults.consumer_connect = fail;
    }

    /// Make the next `count` sends fail with a delivery error.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().unwrap().faults.next_sends = count;
    }

    /// Make every send fail with a delivery error.
    pub fn fail_all_sends(&self, fail: bool) {
        self.state.lock().unwrap().faults.all_sends = fail;
    }

    /// Make metadata probes fail.
    pub fn fail_probe(&self, fail: bool) {
        self.state.lock().unwrap().faults.probe = fail;
    }

    /// Make topic creation fail.
    pub fn fail_admin(&self, fail: bool) {
        self.state.lock().unwrap().faults.admin = fail;
    }

    /// Make closing a producer fail.
    pub fn fail_producer_close(&self, fail: bool) {
        self.state.lock().unwrap().faults.producer_close = fail;
    }

    /// Make consumer subscribe calls fail.
    pub fn fail_subscribe(&self, fail: bool) {
        self.state.lock().unwrap().faults.subscribe = fail;
    }

    /// Make sends never complete, like a broker that stopped acknowledging.
    pub fn stall_sends(&self, stall: bool) {
        self.state.lock().unwrap().faults.stall_sends = stall;
    }

    /// Total connection attempts of any kind.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.log.producer_connects + state.log.consumer_connects + state.log.admin_connects
    }

    /// Producer connection attempts.
    #[must_use]
    pub fn producer_connects(&self) -> usize {
        self.state.lock().unwrap().log.producer_connects
    }

    /// Consumer connection attempts.
    #[must_use]
    pub fn consumer_connects(&self) -> usize {
        self.state.lock().unwrap().log.consumer_connects
    }

    /// Instants at which each send was attempted, in order.
    #[must_use]
    pub fn send_attempts(&self) -> Vec<Instant> {
        self.state.lock().unwrap().log.send_attempts.clone()
    }

    /// Topic names requested by each create-topics call, in order.
    #[must_use]
    pub fn provisioning_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().log.provisioning_calls.clone()
    }

    /// Topics requested by each consumer subscribe call, in order.
    #[must_use]
    pub fn subscribe_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().log.subscribe_calls.clone()
    }

    /// Offsets committed by any consumer, in order.
    #[must_use]
    pub fn commits(&self) -> Vec<Commit> {
        self.state.lock().unwrap().log.commits.clone()
    }

    /// Number of metadata probes served.
    #[must_use]
    pub fn probes(&self) -> usize {
        self.state.lock().unwrap().log.probes
    }

    /// Topics that currently exist.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.state.lock().unwrap().topics.keys().cloned().collect()
    }

    /// Records stored for `topic`, in write order.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|record| record.topic == topic)
            .cloned()
            .collect()
    }

    /// Consumers that have not been closed.
    #[must_use]
    pub fn open_consumers(&self) -> usize {
        self.state.lock().unwrap().consumers.len()
    }

    /// Append a raw record, bypassing any producer (e.g. a malformed payload from another service).
    pub fn inject(&self, topic: &str, key: Option<&str>, payload: Option<Vec<u8>>) -> DeliveryReceipt {
        self.state
            .lock()
            .unwrap()
            .append(topic, key.map(str::to_string), payload, Vec::new())
    }

    /// Push a transport error into every consumer subscribed to `topic`.
    pub fn inject_consumer_error(&self, topic: &str, error: TransportError) {
        let state = self.state.lock().unwrap();
        for consumer in state.consumers.iter().filter(|c| c.topics.contains(topic)) {
            let _ = consumer.sender.send(Err(error.clone()));
        }
    }
}

impl Broker for InMemoryBroker {
    fn connect_producer<'a>(
        &'a self,
        _config: &'a BusConfig,
    ) -> TransportFuture<'a, Arc<dyn ProducerConnection>> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.log.producer_connects += 1;
            if state.faults.producer_connect {
                Err(TransportError::Connection(
                    "injected producer handshake failure".to_string(),
                ))
            } else {
                Ok(Arc::new(InMemoryProducer {
                    state: Arc::clone(&self.state),
                    closed: AtomicBool::new(false),
                }) as Arc<dyn ProducerConnection>)
            }
        };
        Box::pin(future::ready(result))
    }

    fn connect_consumer<'a>(
        &'a self,
        _config: &'a BusConfig,
    ) -> TransportFuture<'a, Arc<dyn ConsumerConnection>> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.log.consumer_connects += 1;
            if state.faults.consumer_connect {
                Err(TransportError::Connection(
                    "injected consumer handshake failure".to_string(),
                ))
            } else {
                let (sender, receiver) = mpsc::unbounded_channel();
                let id = state.next_consumer_id;
                state.next_consumer_id += 1;
                state.consumers.push(ConsumerSlot {
                    id,
                    topics: BTreeSet::new(),
                    sender,
                });
                Ok(Arc::new(InMemoryConsumer {
                    id,
                    state: Arc::clone(&self.state),
                    receiver: Mutex::new(Some(receiver)),
                }) as Arc<dyn ConsumerConnection>)
            }
        };
        Box::pin(future::ready(result))
    }

    fn connect_admin<'a>(
        &'a self,
        _config: &'a BusConfig,
    ) -> TransportFuture<'a, Box<dyn AdminConnection>> {
        self.state.lock().unwrap().log.admin_connects += 1;
        let admin: Box<dyn AdminConnection> = Box::new(InMemoryAdmin {
            state: Arc::clone(&self.state),
        });
        Box::pin(future::ready(Ok(admin)))
    }
}

struct InMemoryProducer {
    state: Arc<Mutex<BrokerState>>,
    closed: AtomicBool,
}

impl ProducerConnection for InMemoryProducer {
    fn send(&self, record: OutboundRecord) -> TransportFuture<'_, DeliveryReceipt> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.log.send_attempts.push(Instant::now());

            if state.faults.stall_sends {
                return Box::pin(future::pending());
            }
            if self.closed.load(Ordering::SeqCst) {
                Err(TransportError::Closed)
            } else if state.faults.all_sends {
                Err(TransportError::Delivery("injected send failure".to_string()))
            } else if state.faults.next_sends > 0 {
                state.faults.next_sends -= 1;
                Err(TransportError::Delivery("injected send failure".to_string()))
            } else {
                Ok(state.append(
                    &record.topic,
                    Some(record.key),
                    Some(record.payload),
                    record.headers,
                ))
            }
        };
        Box::pin(future::ready(result))
    }

    fn probe(&self, _timeout: Duration) -> TransportFuture<'_, ()> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.log.probes += 1;
            if self.closed.load(Ordering::SeqCst) {
                Err(TransportError::Closed)
            } else if state.faults.probe {
                Err(TransportError::Metadata("injected probe failure".to_string()))
            } else {
                Ok(())
            }
        };
        Box::pin(future::ready(result))
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        self.closed.store(true, Ordering::SeqCst);
        let result = if self.state.lock().unwrap().faults.producer_close {
            Err(TransportError::Connection("injected close failure".to_string()))
        } else {
            Ok(())
        };
        Box::pin(future::ready(result))
    }
}

struct InMemoryConsumer {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl ConsumerConnection for InMemoryConsumer {
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> TransportFuture<'a, ()> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.log.subscribe_calls.push(topics.to_vec());
            if state.faults.subscribe {
                return Box::pin(future::ready(Err(TransportError::Subscribe(
                    "injected subscribe failure".to_string(),
                ))));
            }
            match state.consumers.iter_mut().find(|c| c.id == self.id) {
                Some(slot) => {
                    slot.topics.extend(topics.iter().cloned());
                    Ok(())
                }
                None => Err(TransportError::Closed),
            }
        };
        Box::pin(future::ready(result))
    }

    fn messages(&self) -> Result<InboundStream, TransportError> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Connection("message stream already taken".to_string()))?;

        let stream = async_stream::stream! {
            while let Some(delivery) = receiver.recv().await {
                yield delivery;
            }
        };
        Ok(Box::pin(stream))
    }

    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), TransportError> {
        self.state.lock().unwrap().log.commits.push(Commit {
            topic: topic.to_string(),
            partition,
            offset,
        });
        Ok(())
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .retain(|consumer| consumer.id != self.id);
        Box::pin(future::ready(Ok(())))
    }
}

struct InMemoryAdmin {
    state: Arc<Mutex<BrokerState>>,
}

impl AdminConnection for InMemoryAdmin {
    fn create_topics<'a>(&'a self, topics: &'a [TopicConfig]) -> TransportFuture<'a, TopicCreation> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state
                .log
                .provisioning_calls
                .push(topics.iter().map(|t| t.name.clone()).collect());

            if state.faults.admin {
                Err(TransportError::Admin("injected create-topics failure".to_string()))
            } else {
                let mut creation = TopicCreation::default();
                for topic in topics {
                    if state.topics.contains_key(&topic.name) {
                        creation.existing.push(topic.name.clone());
                    } else {
                        state.topics.insert(topic.name.clone(), topic.partitions.max(1));
                        creation.created.push(topic.name.clone());
                    }
                }
                Ok(creation)
            }
        };
        Box::pin(future::ready(result))
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(future::ready(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt, StreamExt};
    use waypoint_core::topic::default_catalog;

    fn config() -> BusConfig {
        BusConfig::new("memory:9092", "user", "pass")
    }

    fn record(topic: &str, key: &str) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: b"{}".to_vec(),
            headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition() {
        let broker = InMemoryBroker::new().with_topic("orchestration-results", 3);
        let producer = broker.connect_producer(&config()).await.unwrap();

        let first = producer.send(record("orchestration-results", "trip-7")).await.unwrap();
        let second = producer.send(record("orchestration-results", "trip-7")).await.unwrap();

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn subscribed_consumer_receives_records() {
        let broker = InMemoryBroker::new();
        let producer = broker.connect_producer(&config()).await.unwrap();
        let consumer = broker.connect_consumer(&config()).await.unwrap();
        let mut stream = consumer.messages().unwrap();

        consumer.subscribe(&["user-emotions".to_string()]).await.unwrap();
        producer.send(record("system-events", "x")).await.unwrap();
        producer.send(record("user-emotions", "u1")).await.unwrap();

        let message = stream.next().await.unwrap().unwrap();
        assert_eq!(message.topic, "user-emotions");
        assert_eq!(message.key.as_deref(), Some(b"u1".as_slice()));

        consumer.close().await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn message_stream_can_only_be_taken_once() {
        let broker = InMemoryBroker::new();
        let consumer = broker.connect_consumer(&config()).await.unwrap();
        assert!(consumer.messages().is_ok());
        assert!(consumer.messages().is_err());
    }

    #[tokio::test]
    async fn injected_send_failures_are_consumed_in_order() {
        let broker = InMemoryBroker::new();
        broker.fail_next_sends(1);
        let producer = broker.connect_producer(&config()).await.unwrap();

        assert!(producer.send(record("system-events", "k")).await.is_err());
        assert!(producer.send(record("system-events", "k")).await.is_ok());
        assert_eq!(broker.send_attempts().len(), 2);
        assert_eq!(broker.records("system-events").len(), 1);
    }

    #[tokio::test]
    async fn admin_records_each_provisioning_call() {
        let broker = InMemoryBroker::new().with_topic("user-emotions", 6);
        let admin = broker.connect_admin(&config()).await.unwrap();

        let creation = admin.create_topics(&default_catalog()).await.unwrap();

        assert_eq!(creation.created.len(), 3);
        assert_eq!(creation.existing, ["user-emotions"]);
        assert_eq!(broker.provisioning_calls().len(), 1);
        assert_eq!(broker.topics().len(), 4);
    }

    #[tokio::test]
    async fn stalled_send_never_completes() {
        let broker = InMemoryBroker::new();
        broker.stall_sends(true);
        let producer = broker.connect_producer(&config()).await.unwrap();

        assert!(producer.send(record("system-events", "k")).now_or_never().is_none());
        assert_eq!(broker.send_attempts().len(), 1);
        assert!(broker.records("system-events").is_empty());
    }
}
