//! rdkafka consumer connection.
//!
//! One `StreamConsumer` per bus. A pump task forwards records into a bounded
//! channel. Offsets are committed through [`ConsumerConnection::commit`] once the
//! bus has run the record's handlers, never by the pump.

use crate::fetch_metadata;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use waypoint_core::config::BusConfig;
use waypoint_core::error::TransportError;
use waypoint_core::transport::{ConsumerConnection, InboundMessage, InboundStream, TransportFuture};

type Delivery = Result<InboundMessage, TransportError>;

pub(crate) struct RedpandaConsumer {
    consumer: Arc<StreamConsumer>,
    /// Union of every topic subscribed so far
    topics: Mutex<BTreeSet<String>>,
    receiver: Mutex<Option<mpsc::Receiver<Delivery>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Commit list marking `offset` as processed; the group resumes at `offset + 1`.
fn commit_list(topic: &str, partition: i32, offset: i64) -> Result<TopicPartitionList, TransportError> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(topic, partition, Offset::Offset(offset.saturating_add(1)))
        .map_err(|e| TransportError::Connection(format!("Invalid commit offset: {e}")))?;
    Ok(list)
}

/// Consumer-specific settings layered over the shared client settings.
pub(crate) fn consumer_config(mut client: ClientConfig, config: &BusConfig) -> ClientConfig {
    client
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", config.auto_offset_reset.as_str())
        .set("session.timeout.ms", "6000")
        .set("enable.partition.eof", "false");
    client
}

impl RedpandaConsumer {
    /// Create the consumer, wait for a metadata round-trip and start the pump.
    pub(crate) async fn connect(client: ClientConfig, config: &BusConfig) -> Result<Self, TransportError> {
        let consumer: StreamConsumer = consumer_config(client, config)
            .create()
            .map_err(|e| TransportError::Connection(format!("Failed to create consumer: {e}")))?;
        let consumer = Arc::new(consumer);

        let handshake = Arc::clone(&consumer);
        let timeout = config.operation_timeout;
        fetch_metadata(move || handshake.fetch_metadata(None, timeout))
            .await
            .map_err(|e| TransportError::Connection(format!("Consumer handshake failed: {e}")))?;

        let (sender, receiver) = mpsc::channel(config.buffer_size.max(1));
        let pump = tokio::spawn(pump(Arc::clone(&consumer), sender));

        tracing::info!(
            group_id = %config.group_id,
            auto_offset_reset = %config.auto_offset_reset,
            "Consumer connected"
        );

        Ok(Self {
            consumer,
            topics: Mutex::new(BTreeSet::new()),
            receiver: Mutex::new(Some(receiver)),
            pump: Mutex::new(Some(pump)),
        })
    }
}

fn inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        timestamp_ms: message.timestamp().to_millis(),
    }
}

/// Forward records until the receiver is dropped or the task is aborted.
async fn pump(consumer: Arc<StreamConsumer>, sender: mpsc::Sender<Delivery>) {
    let mut stream = consumer.stream();

    while let Some(result) = stream.next().await {
        match result {
            Ok(message) => {
                if sender.send(Ok(inbound(&message))).await.is_err() {
                    tracing::debug!("Dispatcher dropped, stopping consumer pump");
                    break;
                }
            }
            Err(e) => {
                let error = TransportError::Connection(format!("Failed to receive message: {e}"));
                if sender.send(Err(error)).await.is_err() {
                    break;
                }
            }
        }
    }
}

impl ConsumerConnection for RedpandaConsumer {
    fn subscribe<'a>(&'a self, topics: &'a [String]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut subscribed = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            let mut all = subscribed.clone();
            all.extend(topics.iter().cloned());

            let names: Vec<&str> = all.iter().map(String::as_str).collect();
            self.consumer
                .subscribe(&names)
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;

            tracing::debug!(topics = ?names, "Consumer subscription updated");
            *subscribed = all;
            Ok(())
        })
    }

    fn messages(&self) -> Result<InboundStream, TransportError> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Connection("message stream already taken".to_string()))?;

        Ok(Box::pin(async_stream::stream! {
            while let Some(delivery) = receiver.recv().await {
                yield delivery;
            }
        }))
    }

    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), TransportError> {
        let list = commit_list(topic, partition, offset)?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| TransportError::Connection(format!("Failed to commit offset: {e}")))
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.consumer.unsubscribe();
            self.topics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();

            let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(pump) = pump {
                pump.abort();
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::config::OffsetReset;

    #[test]
    fn offsets_are_committed_manually() {
        let config = BusConfig::new("localhost:9092", "bus", "secret")
            .with_group_id("orchestrators")
            .with_auto_offset_reset(OffsetReset::Earliest);
        let client = consumer_config(ClientConfig::new(), &config);

        assert_eq!(client.get("group.id"), Some("orchestrators"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("enable.partition.eof"), Some("false"));
    }

    #[test]
    fn commit_resumes_after_the_processed_record() {
        let list = commit_list("user-emotions", 2, 41).ok();
        let resume = list
            .as_ref()
            .and_then(|list| list.find_partition("user-emotions", 2))
            .map(|element| element.offset());
        assert_eq!(resume, Some(Offset::Offset(42)));
    }
}
