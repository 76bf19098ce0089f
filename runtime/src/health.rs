//! Bus health verdict.
//!
//! A health check combines the connection flag with a metadata round-trip to the
//! broker. The probe only runs while connected, and a failed probe downgrades the
//! verdict without touching the connection state.

use crate::connection::ConnectionManager;
use crate::metrics::MetricsSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use waypoint_core::environment::Clock;

/// Overall health of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connected and the broker answered the probe
    Healthy,
    /// Disconnected, or the probe failed
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Individual checks behind a [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecks {
    /// Both connections completed their handshake
    pub connected: bool,
    /// A producer handle is held
    pub producer_ready: bool,
    /// A consumer handle is held
    pub consumer_ready: bool,
    /// Number of known topics
    pub topics_subscribed: usize,
    /// Number of event-type handlers
    pub event_handlers: usize,
    /// Probe outcome; `None` when not connected (no probe was sent)
    pub connection_healthy: Option<bool>,
}

impl HealthChecks {
    /// Healthy only when connected and the probe succeeded.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        if self.connected && self.connection_healthy == Some(true) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Result of `health_check()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Overall verdict
    pub status: HealthStatus,
    /// Individual checks
    pub checks: HealthChecks,
    /// Metrics at the time of the check
    pub metrics: MetricsSnapshot,
    /// When the report was generated
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Create a report, deriving the status from `checks`.
    #[must_use]
    pub fn new(checks: HealthChecks, metrics: MetricsSnapshot, timestamp: DateTime<Utc>) -> Self {
        Self {
            status: checks.status(),
            checks,
            metrics,
            timestamp,
        }
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

pub(crate) struct HealthMonitor {
    connection: Arc<ConnectionManager>,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub(crate) fn new(connection: Arc<ConnectionManager>, clock: Arc<dyn Clock>) -> Self {
        Self { connection, clock }
    }

    pub(crate) async fn check(
        &self,
        topics_subscribed: usize,
        event_handlers: usize,
        metrics: MetricsSnapshot,
    ) -> HealthReport {
        let connected = self.connection.is_connected();
        let connection_healthy = if connected {
            match self.connection.probe().await {
                Ok(()) => Some(true),
                Err(error) => {
                    tracing::warn!(error = %error, "Broker metadata probe failed");
                    Some(false)
                }
            }
        } else {
            None
        };

        let checks = HealthChecks {
            connected,
            producer_ready: self.connection.producer_ready().await,
            consumer_ready: self.connection.consumer_ready().await,
            topics_subscribed,
            event_handlers,
            connection_healthy,
        };
        HealthReport::new(checks, metrics, self.clock.now())
    }
}
