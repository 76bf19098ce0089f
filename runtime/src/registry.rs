//! Topic catalog and idempotent provisioning.
//!
//! The registry tracks which topics are known to exist: those it has created and
//! those a subscription has named. `create_topics()` only asks the broker for the
//! catalog entries missing from that set, so repeated calls are free once every
//! topic exists.
//!
//! Provisioning is best-effort setup. A broker failure is returned as
//! [`ProvisionOutcome::Failed`] instead of an error, and is not retried.

use crate::connection::{ConnectionManager, bounded};
use crate::metrics::{BusMetrics, ErrorKind};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use waypoint_core::error::{BusError, TransportError};
use waypoint_core::topic::TopicConfig;
use waypoint_core::transport::TopicCreation;

/// Result of a `create_topics()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProvisionOutcome {
    /// The broker accepted the batch (or nothing was missing)
    Provisioned {
        /// Topics this call created
        created: Vec<String>,
        /// Topics requested that the broker already had
        existing: Vec<String>,
    },
    /// The broker rejected the batch
    Failed {
        /// Underlying error message
        reason: String,
    },
}

impl ProvisionOutcome {
    /// Whether provisioning succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Provisioned { .. })
    }

    /// Number of topics created by this call.
    #[must_use]
    pub fn created_count(&self) -> usize {
        match self {
            Self::Provisioned { created, .. } => created.len(),
            Self::Failed { .. } => 0,
        }
    }
}

/// Catalog plus the set of topics known to exist.
pub(crate) struct TopicRegistry {
    catalog: Vec<TopicConfig>,
    known: RwLock<BTreeSet<String>>,
    connection: Arc<ConnectionManager>,
    metrics: Arc<BusMetrics>,
}

impl TopicRegistry {
    pub(crate) fn new(
        catalog: Vec<TopicConfig>,
        connection: Arc<ConnectionManager>,
        metrics: Arc<BusMetrics>,
    ) -> Self {
        Self {
            catalog,
            known: RwLock::new(BTreeSet::new()),
            connection,
            metrics,
        }
    }

    pub(crate) fn catalog(&self) -> &[TopicConfig] {
        &self.catalog
    }

    /// Known topics, sorted.
    pub(crate) async fn topics(&self) -> Vec<String> {
        self.known.read().await.iter().cloned().collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.known.read().await.len()
    }

    /// Mark topics as existing.
    pub(crate) async fn add_topics(&self, topics: &[String]) {
        self.known.write().await.extend(topics.iter().cloned());
    }

    /// Create every catalog topic not yet known to exist.
    pub(crate) async fn create_topics(&self) -> Result<ProvisionOutcome, BusError> {
        if !self.connection.is_connected() {
            return Err(BusError::NotConnected);
        }

        let missing: Vec<TopicConfig> = {
            let known = self.known.read().await;
            self.catalog
                .iter()
                .filter(|topic| !known.contains(&topic.name))
                .cloned()
                .collect()
        };

        if missing.is_empty() {
            tracing::debug!("All catalog topics already exist");
            return Ok(ProvisionOutcome::Provisioned {
                created: Vec::new(),
                existing: Vec::new(),
            });
        }

        let names: Vec<&str> = missing.iter().map(|topic| topic.name.as_str()).collect();
        tracing::info!(topics = ?names, "Provisioning topics");

        let admin = match self.connection.connect_admin().await {
            Ok(admin) => admin,
            Err(error) => return Ok(self.failed(&error)),
        };

        let limit = self.connection.config().operation_timeout;
        let result = bounded(limit, admin.create_topics(&missing)).await;
        if let Err(error) = bounded(limit, admin.close()).await {
            tracing::warn!(error = %error, "Error closing admin connection");
        }

        match result {
            Ok(TopicCreation { created, existing }) => {
                self.add_topics(&created).await;
                self.add_topics(&existing).await;
                tracing::info!(
                    created = created.len(),
                    existing = existing.len(),
                    "Topics provisioned"
                );
                Ok(ProvisionOutcome::Provisioned { created, existing })
            }
            Err(error) => Ok(self.failed(&error)),
        }
    }

    fn failed(&self, error: &TransportError) -> ProvisionOutcome {
        self.metrics.record_error(ErrorKind::Transport);
        tracing::error!(error = %error, "Topic provisioning failed");
        ProvisionOutcome::Failed {
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use waypoint_core::config::BusConfig;
    use waypoint_core::topic::{self, default_catalog};
    use waypoint_testing::InMemoryBroker;

    async fn connected_registry(broker: &InMemoryBroker) -> (TopicRegistry, Arc<BusMetrics>) {
        let metrics = Arc::new(BusMetrics::new());
        let connection = Arc::new(ConnectionManager::new(
            BusConfig::new("localhost:9092", "bus", "secret"),
            Arc::new(broker.clone()),
            Arc::clone(&metrics),
        ));
        connection.connect().await.unwrap();
        (
            TopicRegistry::new(default_catalog(), connection, Arc::clone(&metrics)),
            metrics,
        )
    }

    #[tokio::test]
    async fn provisions_whole_catalog_in_one_batch() {
        let broker = InMemoryBroker::new();
        let (registry, _) = connected_registry(&broker).await;

        let outcome = registry.create_topics().await.unwrap();
        assert_eq!(outcome.created_count(), 4);
        assert_eq!(broker.provisioning_calls().len(), 1);
        assert_eq!(registry.len().await, 4);
    }

    #[tokio::test]
    async fn skips_topics_already_known() {
        let broker = InMemoryBroker::new();
        let (registry, _) = connected_registry(&broker).await;
        registry
            .add_topics(&[topic::USER_EMOTIONS.to_string()])
            .await;

        registry.create_topics().await.unwrap();
        let calls = broker.provisioning_calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].iter().any(|name| name == topic::USER_EMOTIONS));
        assert_eq!(calls[0].len(), 3);
    }

    #[tokio::test]
    async fn topics_already_on_the_broker_are_not_counted_as_created() {
        let broker = InMemoryBroker::new().with_topic(topic::SYSTEM_EVENTS, 1);
        let (registry, _) = connected_registry(&broker).await;

        let outcome = registry.create_topics().await.unwrap();
        assert_eq!(outcome.created_count(), 3);
        assert!(matches!(
            outcome,
            ProvisionOutcome::Provisioned { ref existing, .. } if existing == &[topic::SYSTEM_EVENTS]
        ));
        assert_eq!(registry.len().await, 4);
    }

    #[tokio::test]
    async fn failure_is_reported_not_raised() {
        let broker = InMemoryBroker::new();
        broker.fail_admin(true);
        let (registry, metrics) = connected_registry(&broker).await;

        let outcome = registry.create_topics().await.unwrap();
        assert!(matches!(outcome, ProvisionOutcome::Failed { ref reason } if reason.contains("injected")));
        assert_eq!(registry.len().await, 0);
        assert_eq!(metrics.counters().errors, 1);
    }
}
