//! # Waypoint Core
//!
//! Core types and traits for the Waypoint event bus.
//!
//! The bus publishes structured events to named topics on a Kafka-compatible
//! commit-log broker and dispatches consumed events to registered handlers.
//! This crate holds everything that is independent of how the bus is driven:
//!
//! - [`envelope`]: the [`EventEnvelope`](envelope::EventEnvelope) wire format and partition-key rules
//! - [`topic`]: strongly-typed [`TopicConfig`](topic::TopicConfig) records and the fixed topic catalog
//! - [`config`]: [`BusConfig`](config::BusConfig), loaded from the environment and validated up front
//! - [`error`]: the error taxonomy shared by every bus component
//! - [`transport`]: the broker connection traits implemented by `waypoint-redpanda`
//!   (production) and `waypoint-testing` (in-memory fakes)
//! - [`environment`]: injected dependencies such as the [`Clock`](environment::Clock)
//!
//! ## Architecture Principles
//!
//! - Every external dependency sits behind a trait and is injected
//! - No process-wide singletons: the bus is an explicitly constructed value
//! - Transport traits are dyn-compatible so the bus can hold `Arc<dyn Broker>`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod envelope;
pub mod error;
pub mod topic;
pub mod transport;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use config::BusConfig;
pub use envelope::{DeliveryMetadata, EventEnvelope, EventInput};
pub use error::{BusError, ConfigError, DispatchError, TransportError};
pub use topic::{CleanupPolicy, Retention, TopicConfig};

/// Environment module - Dependency injection traits
///
/// All time-dependent behaviour of the bus goes through these traits so tests
/// can pin it down.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The bus stamps every envelope with `clock.now()` at publish time.
    ///
    /// # Examples
    ///
    /// ```
    /// use waypoint_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time from the operating system.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
