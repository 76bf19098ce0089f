//! rdkafka producer connection.

use crate::{fetch_metadata, millis};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use waypoint_core::config::BusConfig;
use waypoint_core::error::TransportError;
use waypoint_core::transport::{DeliveryReceipt, OutboundRecord, ProducerConnection, TransportFuture};

pub(crate) struct RedpandaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
    flush_timeout: Duration,
}

/// Producer-specific settings layered over the shared client settings.
pub(crate) fn producer_config(mut client: ClientConfig, config: &BusConfig) -> ClientConfig {
    client
        .set("acks", config.acks.as_str())
        .set("retries", config.send_retries.to_string())
        .set("retry.backoff.ms", millis(config.send_retry_backoff))
        .set("compression.type", config.compression.as_str())
        .set("message.timeout.ms", millis(config.send_timeout));
    client
}

impl RedpandaProducer {
    /// Create the producer and wait for a metadata round-trip.
    pub(crate) async fn connect(client: ClientConfig, config: &BusConfig) -> Result<Self, TransportError> {
        let producer: FutureProducer = producer_config(client, config)
            .create()
            .map_err(|e| TransportError::Connection(format!("Failed to create producer: {e}")))?;

        let handshake = producer.clone();
        let timeout = config.operation_timeout;
        fetch_metadata(move || handshake.client().fetch_metadata(None, timeout))
            .await
            .map_err(|e| TransportError::Connection(format!("Producer handshake failed: {e}")))?;

        tracing::info!(
            acks = %config.acks,
            compression = %config.compression,
            retries = config.send_retries,
            "Producer connected"
        );

        Ok(Self {
            producer,
            send_timeout: config.send_timeout,
            flush_timeout: config.operation_timeout,
        })
    }
}

impl ProducerConnection for RedpandaProducer {
    fn send(&self, record: OutboundRecord) -> TransportFuture<'_, DeliveryReceipt> {
        Box::pin(async move {
            let headers = record
                .headers
                .iter()
                .fold(OwnedHeaders::new(), |headers, (key, value)| {
                    headers.insert(Header {
                        key: key.as_str(),
                        value: Some(value.as_str()),
                    })
                });

            let kafka_record = FutureRecord::to(&record.topic)
                .key(record.key.as_str())
                .payload(record.payload.as_slice())
                .headers(headers);

            match self
                .producer
                .send(kafka_record, Timeout::After(self.send_timeout))
                .await
            {
                Ok((partition, offset)) => {
                    tracing::trace!(
                        topic = %record.topic,
                        partition = partition,
                        offset = offset,
                        "Record acknowledged"
                    );
                    Ok(DeliveryReceipt { partition, offset })
                }
                Err((kafka_error, _)) => {
                    tracing::debug!(
                        topic = %record.topic,
                        error = %kafka_error,
                        "Record not acknowledged"
                    );
                    Err(TransportError::Delivery(kafka_error.to_string()))
                }
            }
        })
    }

    fn probe(&self, timeout: Duration) -> TransportFuture<'_, ()> {
        let producer = self.producer.clone();
        Box::pin(fetch_metadata(move || {
            producer.client().fetch_metadata(None, timeout)
        }))
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        let producer = self.producer.clone();
        let timeout = self.flush_timeout;
        Box::pin(async move {
            tokio::task::spawn_blocking(move || producer.flush(timeout))
                .await
                .map_err(|e| TransportError::Connection(format!("flush task failed: {e}")))?
                .map_err(|e| TransportError::Connection(format!("Failed to flush producer: {e}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::config::{Acks, Compression};

    #[test]
    fn producer_settings_follow_bus_config() {
        let config = BusConfig::new("localhost:9092", "bus", "secret")
            .with_acks(Acks::Leader)
            .with_compression(Compression::Lz4)
            .with_send_retries(5);
        let client = producer_config(ClientConfig::new(), &config);

        assert_eq!(client.get("acks"), Some("1"));
        assert_eq!(client.get("compression.type"), Some("lz4"));
        assert_eq!(client.get("retries"), Some("5"));
        assert_eq!(client.get("retry.backoff.ms"), Some("1000"));
        assert_eq!(client.get("message.timeout.ms"), Some("30000"));
    }

    #[test]
    fn default_producer_settings_are_durable() {
        let config = BusConfig::new("localhost:9092", "bus", "secret");
        let client = producer_config(ClientConfig::new(), &config);

        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("compression.type"), Some("gzip"));
        assert_eq!(client.get("retries"), Some("3"));
    }
}
