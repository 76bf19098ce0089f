//! Error taxonomy for the event bus.
//!
//! Errors fall into two groups:
//!
//! - **Raised** to the caller: [`BusError`] (configuration, connection,
//!   not-connected, exhausted publish retries, subscription failures).
//! - **Recovered** inside the bus: [`DispatchError`] for a consumed message that
//!   could not be handled. These are logged and counted, never returned, so the
//!   consumption loop keeps running.
//!
//! [`TransportError`] is what a broker connection reports; the bus wraps it into
//! a [`BusError`] where it surfaces.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by event bus operations.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Required connection parameters are missing. Raised before any network attempt.
    #[error("Missing required connection parameters: {}", missing.join(", "))]
    Configuration {
        /// Names of every missing parameter
        missing: Vec<String>,
    },

    /// Producer or consumer handshake failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Operation attempted while the bus is not connected
    #[error("Event bus is not connected")]
    NotConnected,

    /// The bus was disconnected while the operation was in progress
    #[error("Connection closed while operation was in progress")]
    ConnectionClosed,

    /// Every publish attempt failed
    #[error("Publish to '{topic}' failed after {attempts} attempts: {source}")]
    Publish {
        /// Target topic
        topic: String,
        /// Number of attempts made
        attempts: u32,
        /// The error from the final attempt
        #[source]
        source: TransportError,
    },

    /// The consumer rejected the subscription
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    Subscription {
        /// Topics requested
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Envelope could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<ConfigError> for BusError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::MissingParameters(missing) => Self::Configuration {
                missing: missing.into_iter().map(str::to_string).collect(),
            },
            invalid @ ConfigError::Invalid { .. } => Self::Configuration {
                missing: vec![invalid.to_string()],
            },
        }
    }
}

/// Errors raised while loading or validating [`BusConfig`](crate::config::BusConfig).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more required parameters are absent or blank
    #[error("Missing required connection parameters: {}", .0.join(", "))]
    MissingParameters(Vec<&'static str>),

    /// A value could not be parsed
    #[error("Invalid value '{value}' for {key}")]
    Invalid {
        /// Configuration key
        key: &'static str,
        /// The rejected value
        value: String,
    },
}

/// Errors reported by broker connections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not establish or use the connection
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// The broker did not acknowledge a record
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// The operation did not complete in time
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The connection has been closed
    #[error("Connection is closed")]
    Closed,

    /// Administrative request failed
    #[error("Admin operation failed: {0}")]
    Admin(String),

    /// Metadata request failed
    #[error("Metadata request failed: {0}")]
    Metadata(String),

    /// Consumer subscription request failed
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

/// A consumed message that could not be dispatched.
///
/// Never returned to callers; the dispatch loop logs it and bumps the error counter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The record carried no payload
    #[error("Message at {topic}/{partition}@{offset} has no payload")]
    MissingPayload {
        /// Source topic
        topic: String,
        /// Source partition
        partition: i32,
        /// Offset within the partition
        offset: i64,
    },

    /// The payload was not a valid envelope
    #[error("Message at {topic}/{partition}@{offset} is not a valid envelope: {reason}")]
    Malformed {
        /// Source topic
        topic: String,
        /// Source partition
        partition: i32,
        /// Offset within the partition
        offset: i64,
        /// Parser error
        reason: String,
    },

    /// A handler returned an error
    #[error("Handler for '{topic}' failed on event {event_id}: {reason}")]
    Handler {
        /// Source topic
        topic: String,
        /// Envelope id
        event_id: String,
        /// Handler error
        reason: String,
    },

    /// A handler panicked
    #[error("Handler for '{topic}' panicked on event {event_id}")]
    HandlerPanicked {
        /// Source topic
        topic: String,
        /// Envelope id
        event_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_lists_every_missing_parameter() {
        let err = BusError::from(ConfigError::MissingParameters(vec![
            "sasl_username",
            "sasl_password",
        ]));
        assert_eq!(
            err.to_string(),
            "Missing required connection parameters: sasl_username, sasl_password"
        );
    }

    #[test]
    fn publish_error_keeps_the_final_transport_error() {
        let err = BusError::Publish {
            topic: "system-events".to_string(),
            attempts: 4,
            source: TransportError::Delivery("broker unavailable".to_string()),
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("Delivery failed: broker unavailable"));
    }
}
