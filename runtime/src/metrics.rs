//! Bus counters and Prometheus export.
//!
//! [`BusMetrics`] holds the four in-process counters every component increments
//! (produced, consumed, errors, reconnects). Increments are atomic, so produce
//! callbacks, the dispatch loop and health probes can all touch them at once.
//! Callers read them through [`MetricsSnapshot`], never through the atomics.
//!
//! Every increment is mirrored to the `metrics` facade so an installed recorder
//! (see [`PrometheusMetrics`]) exports them as well:
//!
//! - `event_bus_messages_published_total{topic}`
//! - `event_bus_messages_consumed_total{topic}`
//! - `event_bus_errors_total{kind}`
//! - `event_bus_reconnects_total`
//! - `event_bus_publish_duration_seconds{topic}`
//!
//! # Example
//!
//! ```rust,no_run
//! use waypoint_runtime::metrics::PrometheusMetrics;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let exporter = PrometheusMetrics::install()?;
//! if let Some(text) = exporter.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::histogram;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Which part of the bus an error came from (`kind` label on `event_bus_errors_total`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Producer or consumer handshake
    Connect,
    /// Exhausted or cancelled publish
    Publish,
    /// Consumed message that could not be dispatched
    Dispatch,
    /// Error reported by the consumer's read loop
    Transport,
}

impl ErrorKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Publish => "publish",
            Self::Dispatch => "dispatch",
            Self::Transport => "transport",
        }
    }
}

/// Atomic bus counters.
#[derive(Debug, Default)]
pub struct BusMetrics {
    produced: AtomicU64,
    consumed: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
}

impl BusMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one successfully published message.
    pub fn record_produced(&self, topic: &str) {
        self.produced.fetch_add(1, Ordering::Relaxed);
        counter!("event_bus_messages_published_total", "topic" => topic.to_owned()).increment(1);
    }

    /// Count one successfully decoded inbound message.
    pub fn record_consumed(&self, topic: &str) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
        counter!("event_bus_messages_consumed_total", "topic" => topic.to_owned()).increment(1);
    }

    /// Count one error.
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!("event_bus_errors_total", "kind" => kind.as_str()).increment(1);
    }

    /// Count one reconnect.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        counter!("event_bus_reconnects_total").increment(1);
    }

    /// Current counter values.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages_produced: self.produced.load(Ordering::Relaxed),
            messages_consumed: self.consumed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Zero all four counters.
    pub fn reset(&self) {
        self.produced.store(0, Ordering::Relaxed);
        self.consumed.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.reconnects.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    /// Messages published successfully
    pub messages_produced: u64,
    /// Messages consumed and decoded
    pub messages_consumed: u64,
    /// Errors of any kind
    pub errors: u64,
    /// Reconnects
    pub reconnects: u64,
}

/// What `get_metrics()` returns: counters plus registry and connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Counter values
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    /// Known topics, sorted
    pub topics: Vec<String>,
    /// Number of event-type handlers registered
    pub event_handlers: usize,
    /// Whether the bus is connected
    pub is_connected: bool,
}

/// Prometheus exporter for the bus metrics.
pub struct PrometheusMetrics {
    handle: Option<PrometheusHandle>,
}

impl PrometheusMetrics {
    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// If a recorder is already installed (e.g. in tests), this succeeds without a
    /// handle and [`Self::render`] returns `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn install() -> Result<Self, MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                tracing::info!("Prometheus metrics recorder installed");
                Ok(Self {
                    handle: Some(handle),
                })
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(Self { handle: None })
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "event_bus_messages_published_total",
        "Total number of messages published to the event bus"
    );
    describe_counter!(
        "event_bus_messages_consumed_total",
        "Total number of messages consumed from the event bus"
    );
    describe_counter!("event_bus_errors_total", "Total number of event bus errors");
    describe_counter!(
        "event_bus_reconnects_total",
        "Total number of event bus reconnects"
    );
    describe_histogram!(
        "event_bus_publish_duration_seconds",
        "Time taken to publish a message, including retries"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let metrics = BusMetrics::new();
        metrics.record_produced("user-emotions");
        metrics.record_produced("user-emotions");
        metrics.record_consumed("user-emotions");
        metrics.record_error(ErrorKind::Dispatch);
        metrics.record_reconnect();

        assert_eq!(
            metrics.counters(),
            CounterSnapshot {
                messages_produced: 2,
                messages_consumed: 1,
                errors: 1,
                reconnects: 1,
            }
        );

        metrics.reset();
        assert_eq!(metrics.counters(), CounterSnapshot::default());
    }

    #[test]
    fn snapshot_serializes_flat_camel_case() {
        let snapshot = MetricsSnapshot {
            counters: CounterSnapshot {
                messages_produced: 3,
                ..CounterSnapshot::default()
            },
            topics: vec!["system-events".to_string()],
            event_handlers: 2,
            is_connected: true,
        };

        let json = serde_json::to_value(&snapshot).ok();
        let json = json.as_ref();
        assert_eq!(json.and_then(|v| v.get("messagesProduced")), Some(&serde_json::json!(3)));
        assert_eq!(json.and_then(|v| v.get("eventHandlers")), Some(&serde_json::json!(2)));
        assert_eq!(json.and_then(|v| v.get("isConnected")), Some(&serde_json::json!(true)));
    }

    #[test]
    fn prometheus_export_renders_bus_counters() {
        let exporter = PrometheusMetrics::install();
        assert!(exporter.is_ok());

        let metrics = BusMetrics::new();
        metrics.record_produced("system-events");
        metrics.record_error(ErrorKind::Publish);

        if let Some(text) = exporter.ok().and_then(|exporter| exporter.render()) {
            assert!(text.contains("event_bus_messages_published_total"));
            assert!(text.contains("kind=\"publish\""));
        }
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = std::sync::Arc::new(BusMetrics::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let metrics = std::sync::Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_consumed("skill-executions");
                    }
                })
            })
            .collect();
        for thread in threads {
            assert!(thread.join().is_ok());
        }
        assert_eq!(metrics.counters().messages_consumed, 8000);
    }
}
