//! # Waypoint Testing
//!
//! Testing utilities for the Waypoint event bus.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a broker fake implementing every transport trait, with
//!   failure injection and call recording
//! - [`FixedClock`] / [`test_clock`]: deterministic envelope timestamps
//!
//! ## Example
//!
//! ```ignore
//! use waypoint_runtime::EventBus;
//! use waypoint_testing::{InMemoryBroker, test_clock};
//!
//! #[tokio::test]
//! async fn publishes_to_the_broker() {
//!     let broker = InMemoryBroker::new();
//!     let bus = EventBus::builder(config(), Arc::new(broker.clone()))
//!         .clock(Arc::new(test_clock()))
//!         .build();
//!
//!     bus.connect().await.unwrap();
//!     bus.publish_system_event("started", json!({})).await.unwrap();
//!     assert_eq!(broker.records("system-events").len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use waypoint_core::environment::Clock;

mod broker;

pub use broker::{Commit, InMemoryBroker, StoredRecord};

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making envelope timestamps reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use waypoint_testing::mocks::FixedClock;
    /// use waypoint_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
