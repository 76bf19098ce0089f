//! Bus configuration.
//!
//! [`BusConfig`] is a typed configuration with an explicit validation step that
//! reports every missing required parameter at once. The broker address list and
//! the SASL credentials have no defaults: a bus without them refuses to connect.
//!
//! # Environment variables
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `KAFKA_BROKERS` | `brokers` | required |
//! | `KAFKA_USERNAME` | `sasl_username` | required |
//! | `KAFKA_PASSWORD` | `sasl_password` | required |
//! | `KAFKA_GROUP_ID` | `group_id` | `waypoint-consumer-group` |
//! | `KAFKA_CLIENT_ID` | `client_id` | `waypoint-event-bus` |
//! | `KAFKA_SECURITY_PROTOCOL` | `security_protocol` | `SASL_SSL` |
//! | `KAFKA_ACKS` | `acks` | `all` |
//! | `KAFKA_RETRIES` | `send_retries` | `3` |
//! | `KAFKA_COMPRESSION` | `compression` | `gzip` |
//! | `KAFKA_AUTO_OFFSET_RESET` | `auto_offset_reset` | `latest` |
//!
//! # Example
//!
//! ```
//! use waypoint_core::config::{BusConfig, Compression};
//!
//! let config = BusConfig::new("broker-1:9092,broker-2:9092", "svc-trips", "s3cret")
//!     .with_group_id("trip-planner")
//!     .with_compression(Compression::Lz4);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.broker_list(), ["broker-1:9092", "broker-2:9092"]);
//! ```

use crate::error::ConfigError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Consumer group used when none is configured.
pub const DEFAULT_GROUP_ID: &str = "waypoint-consumer-group";

/// Client id used when none is configured.
pub const DEFAULT_CLIENT_ID: &str = "waypoint-event-bus";

macro_rules! config_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $key:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// librdkafka configuration value.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $value ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $( if s.eq_ignore_ascii_case($value) { return Ok(Self::$variant); } )+
                Err(ConfigError::Invalid { key: $key, value: s.to_string() })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

config_enum! {
    /// Transport security for broker connections.
    SecurityProtocol, "KAFKA_SECURITY_PROTOCOL" {
        /// TLS with SASL authentication (default)
        SaslSsl => "SASL_SSL",
        /// SASL authentication without TLS
        SaslPlaintext => "SASL_PLAINTEXT",
        /// TLS without SASL
        Ssl => "SSL",
        /// Neither TLS nor SASL (local development only)
        Plaintext => "PLAINTEXT",
    }
}

config_enum! {
    /// Producer acknowledgement mode.
    Acks, "KAFKA_ACKS" {
        /// Wait for every in-sync replica (default)
        All => "all",
        /// Wait for the partition leader only
        Leader => "1",
        /// Fire and forget
        None => "0",
    }
}

config_enum! {
    /// Producer compression codec.
    Compression, "KAFKA_COMPRESSION" {
        /// gzip (default)
        Gzip => "gzip",
        /// No compression
        None => "none",
        /// Snappy
        Snappy => "snappy",
        /// LZ4
        Lz4 => "lz4",
        /// Zstandard
        Zstd => "zstd",
    }
}

config_enum! {
    /// Where a new consumer group starts reading.
    OffsetReset, "KAFKA_AUTO_OFFSET_RESET" {
        /// Only new records (default)
        Latest => "latest",
        /// From the beginning of each partition
        Earliest => "earliest",
    }
}

impl SecurityProtocol {
    /// Whether SASL credentials are sent with this protocol.
    #[must_use]
    pub const fn uses_sasl(self) -> bool {
        matches!(self, Self::SaslSsl | Self::SaslPlaintext)
    }
}

/// Connection and producer settings for the event bus.
#[derive(Clone)]
pub struct BusConfig {
    /// Comma-separated `host:port` broker endpoints
    pub brokers: String,
    /// SASL username
    pub sasl_username: String,
    /// SASL password
    pub sasl_password: String,
    /// Consumer group id
    pub group_id: String,
    /// Client id reported to the broker
    pub client_id: String,
    /// Transport security
    pub security_protocol: SecurityProtocol,
    /// Producer acknowledgement mode
    pub acks: Acks,
    /// Broker-level send retries (distinct from the publisher's own retry loop)
    pub send_retries: u32,
    /// Backoff between broker-level send retries
    pub send_retry_backoff: Duration,
    /// Producer compression codec
    pub compression: Compression,
    /// Consumer offset reset policy
    pub auto_offset_reset: OffsetReset,
    /// Bound on connect, close and admin calls
    pub operation_timeout: Duration,
    /// Bound on a single produce attempt
    pub send_timeout: Duration,
    /// Bound on the health metadata round-trip
    pub probe_timeout: Duration,
    /// Capacity of the consumer's inbound message buffer
    pub buffer_size: usize,
}

impl BusConfig {
    /// Create a configuration with the required parameters and default settings.
    #[must_use]
    pub fn new(
        brokers: impl Into<String>,
        sasl_username: impl Into<String>,
        sasl_password: impl Into<String>,
    ) -> Self {
        Self {
            brokers: brokers.into(),
            sasl_username: sasl_username.into(),
            sasl_password: sasl_password.into(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            security_protocol: SecurityProtocol::SaslSsl,
            acks: Acks::All,
            send_retries: 3,
            send_retry_backoff: Duration::from_secs(1),
            compression: Compression::Gzip,
            auto_offset_reset: OffsetReset::Latest,
            operation_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            buffer_size: 1000,
        }
    }

    /// Load configuration from process environment variables.
    ///
    /// Required parameters that are absent are left blank; [`Self::validate`]
    /// (called by `connect()`) reports them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if an optional variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a lookup function (e.g. a map in tests).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if an optional value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mut config = Self::new(
            lookup("KAFKA_BROKERS").unwrap_or_default(),
            lookup("KAFKA_USERNAME").unwrap_or_default(),
            lookup("KAFKA_PASSWORD").unwrap_or_default(),
        );

        if let Some(group_id) = non_blank("KAFKA_GROUP_ID") {
            config.group_id = group_id;
        }
        if let Some(client_id) = non_blank("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(protocol) = non_blank("KAFKA_SECURITY_PROTOCOL") {
            config.security_protocol = protocol.trim().parse()?;
        }
        if let Some(acks) = non_blank("KAFKA_ACKS") {
            config.acks = acks.trim().parse()?;
        }
        if let Some(retries) = non_blank("KAFKA_RETRIES") {
            config.send_retries =
                retries
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid {
                        key: "KAFKA_RETRIES",
                        value: retries.clone(),
                    })?;
        }
        if let Some(compression) = non_blank("KAFKA_COMPRESSION") {
            config.compression = compression.trim().parse()?;
        }
        if let Some(reset) = non_blank("KAFKA_AUTO_OFFSET_RESET") {
            config.auto_offset_reset = reset.trim().parse()?;
        }

        Ok(config)
    }

    /// Check that every required connection parameter is present and non-blank.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingParameters`] naming every missing parameter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.broker_list().is_empty() {
            missing.push("brokers");
        }
        if self.sasl_username.trim().is_empty() {
            missing.push("sasl_username");
        }
        if self.sasl_password.trim().is_empty() {
            missing.push("sasl_password");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingParameters(missing))
        }
    }

    /// Individual broker endpoints, trimmed, blanks removed.
    #[must_use]
    pub fn broker_list(&self) -> Vec<&str> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|broker| !broker.is_empty())
            .collect()
    }

    /// Set the consumer group id.
    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    /// Set the client id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Set the transport security protocol.
    #[must_use]
    pub const fn with_security_protocol(mut self, protocol: SecurityProtocol) -> Self {
        self.security_protocol = protocol;
        self
    }

    /// Set the producer acknowledgement mode.
    #[must_use]
    pub const fn with_acks(mut self, acks: Acks) -> Self {
        self.acks = acks;
        self
    }

    /// Set broker-level send retries.
    #[must_use]
    pub const fn with_send_retries(mut self, retries: u32) -> Self {
        self.send_retries = retries;
        self
    }

    /// Set the compression codec.
    #[must_use]
    pub const fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the consumer offset reset policy.
    #[must_use]
    pub const fn with_auto_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    /// Set the bound on connect, close and admin calls.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the bound on a single produce attempt.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the bound on the health metadata probe.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the consumer buffer capacity. Zero is raised to one.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("brokers", &self.brokers)
            .field("sasl_username", &self.sasl_username)
            .field("sasl_password", &"[REDACTED]")
            .field("group_id", &self.group_id)
            .field("client_id", &self.client_id)
            .field("security_protocol", &self.security_protocol)
            .field("acks", &self.acks)
            .field("send_retries", &self.send_retries)
            .field("send_retry_backoff", &self.send_retry_backoff)
            .field("compression", &self.compression)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .field("operation_timeout", &self.operation_timeout)
            .field("send_timeout", &self.send_timeout)
            .field("probe_timeout", &self.probe_timeout)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_producer_contract() {
        let config = BusConfig::new("localhost:9092", "user", "pass");
        assert_eq!(config.acks, Acks::All);
        assert_eq!(config.send_retries, 3);
        assert_eq!(config.send_retry_backoff, Duration::from_secs(1));
        assert_eq!(config.compression, Compression::Gzip);
        assert_eq!(config.security_protocol, SecurityProtocol::SaslSsl);
        assert_eq!(config.group_id, DEFAULT_GROUP_ID);
    }

    #[test]
    fn validate_reports_every_missing_parameter() {
        let config = BusConfig::new(" , ", "", "   ");
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingParameters(vec![
                "brokers",
                "sasl_username",
                "sasl_password"
            ]))
        );

        let only_secret_missing = BusConfig::new("b:9092", "user", "");
        assert_eq!(
            only_secret_missing.validate(),
            Err(ConfigError::MissingParameters(vec!["sasl_password"]))
        );
    }

    #[test]
    fn from_lookup_reads_required_and_optional_values() {
        let config = BusConfig::from_lookup(lookup_from(&[
            ("KAFKA_BROKERS", "a:9092, b:9092"),
            ("KAFKA_USERNAME", "svc"),
            ("KAFKA_PASSWORD", "pw"),
            ("KAFKA_GROUP_ID", "trip-planner"),
            ("KAFKA_ACKS", "1"),
            ("KAFKA_RETRIES", "5"),
            ("KAFKA_COMPRESSION", "ZSTD"),
            ("KAFKA_SECURITY_PROTOCOL", "sasl_plaintext"),
        ]))
        .unwrap();

        assert_eq!(config.broker_list(), ["a:9092", "b:9092"]);
        assert_eq!(config.group_id, "trip-planner");
        assert_eq!(config.acks, Acks::Leader);
        assert_eq!(config.send_retries, 5);
        assert_eq!(config.compression, Compression::Zstd);
        assert_eq!(config.security_protocol, SecurityProtocol::SaslPlaintext);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_lookup_falls_back_to_default_group() {
        let config = BusConfig::from_lookup(lookup_from(&[("KAFKA_GROUP_ID", "  ")])).unwrap();
        assert_eq!(config.group_id, DEFAULT_GROUP_ID);
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_lookup_rejects_unparseable_values() {
        let err = BusConfig::from_lookup(lookup_from(&[("KAFKA_RETRIES", "many")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "KAFKA_RETRIES",
                value: "many".to_string()
            }
        );

        let err = BusConfig::from_lookup(lookup_from(&[("KAFKA_COMPRESSION", "brotli")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "KAFKA_COMPRESSION", .. }));
    }

    #[test]
    fn debug_output_redacts_the_password() {
        let rendered = format!("{:?}", BusConfig::new("b:9092", "svc", "hunter2"));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("hunter2"));
    }
}
