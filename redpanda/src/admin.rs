//! rdkafka admin connection used for topic provisioning.

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::time::Duration;
use waypoint_core::config::BusConfig;
use waypoint_core::error::TransportError;
use waypoint_core::topic::TopicConfig;
use waypoint_core::transport::{AdminConnection, TopicCreation, TransportFuture};

pub(crate) struct RedpandaAdmin {
    client: AdminClient<DefaultClientContext>,
    timeout: Duration,
}

impl RedpandaAdmin {
    pub(crate) fn create(client: ClientConfig, config: &BusConfig) -> Result<Self, TransportError> {
        let client = client
            .create()
            .map_err(|e| TransportError::Admin(format!("Failed to create admin client: {e}")))?;
        Ok(Self {
            client,
            timeout: config.operation_timeout,
        })
    }
}

impl AdminConnection for RedpandaAdmin {
    /// Topics that already exist are reported separately, not as failures.
    fn create_topics<'a>(&'a self, topics: &'a [TopicConfig]) -> TransportFuture<'a, TopicCreation> {
        Box::pin(async move {
            let entries: Vec<[(&'static str, String); 2]> =
                topics.iter().map(TopicConfig::config_entries).collect();

            let new_topics: Vec<NewTopic<'_>> = topics
                .iter()
                .zip(&entries)
                .map(|(topic, entries)| {
                    let new_topic = NewTopic::new(
                        &topic.name,
                        i32::from(topic.partitions),
                        TopicReplication::Fixed(i32::from(topic.replication_factor)),
                    );
                    entries
                        .iter()
                        .fold(new_topic, |new_topic, (key, value)| new_topic.set(key, value))
                })
                .collect();

            let options = AdminOptions::new().operation_timeout(Some(Timeout::After(self.timeout)));
            let results = self
                .client
                .create_topics(&new_topics, &options)
                .await
                .map_err(|e| TransportError::Admin(e.to_string()))?;

            let mut creation = TopicCreation::default();
            for result in results {
                match result {
                    Ok(name) => creation.created.push(name),
                    Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        tracing::debug!(topic = %name, "Topic already exists");
                        creation.existing.push(name);
                    }
                    Err((name, code)) => {
                        return Err(TransportError::Admin(format!(
                            "Failed to create topic '{name}': {code}"
                        )));
                    }
                }
            }
            Ok(creation)
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        // The admin client's background thread stops when it is dropped
        Box::pin(async { Ok(()) })
    }
}
