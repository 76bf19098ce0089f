//! The event envelope: the unit of transport on the bus.
//!
//! Callers describe an event with an [`EventInput`]. At publish time the bus wraps
//! it into an [`EventEnvelope`], stamping the timestamp, the source and the
//! schema headers, and serializes it to JSON:
//!
//! ```text
//! {
//!   "id": "u1",
//!   "type": "user:emotion",
//!   "payload": { ... },
//!   "context": { "userId": "u1" },
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "source": "waypoint-event-bus",
//!   "headers": { "event-type": "user:emotion", "version": "1.0" }
//! }
//! ```
//!
//! # Identity and partition keys
//!
//! The envelope `id` is never empty. It falls back, in order, to the caller's id,
//! the context's `userId` and finally the literal `"default"`. The partition key
//! uses the same chain, preceded by an explicit key when one is given, so events
//! for the same id (or user) always land on the same partition.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Schema version written into every envelope's headers.
pub const SCHEMA_VERSION: &str = "1.0";

/// Header carrying the envelope's event type.
pub const EVENT_TYPE_HEADER: &str = "event-type";

/// Header carrying the schema version.
pub const VERSION_HEADER: &str = "version";

/// Value of `source` on every envelope this bus writes.
pub const BUS_SOURCE: &str = "waypoint-event-bus";

/// Last-resort id and partition key.
pub const DEFAULT_KEY: &str = "default";

/// Context field consulted when an event has no id.
pub const CONTEXT_USER_ID: &str = "userId";

/// An event as supplied by a caller, before the bus stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventInput {
    /// Caller-supplied id
    pub id: Option<String>,
    /// Event kind, e.g. `"user:emotion"`
    pub event_type: String,
    /// Caller-defined payload
    pub payload: Value,
    /// Correlation data (user/session identifiers)
    pub context: Option<Value>,
}

impl EventInput {
    /// Create an event with no id and no context.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            payload,
            context: None,
        }
    }

    /// Set the event id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach correlation context.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// The context's `userId`, if it is a non-empty string.
    #[must_use]
    pub fn context_user_id(&self) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|ctx| ctx.get(CONTEXT_USER_ID))
            .and_then(Value::as_str)
            .filter(|user_id| !user_id.is_empty())
    }

    /// The id the envelope will carry: `id`, then context `userId`, then `"default"`.
    #[must_use]
    pub fn resolved_id(&self) -> &str {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or_else(|| self.context_user_id())
            .unwrap_or(DEFAULT_KEY)
    }

    /// Partition key for this event: the explicit key if non-empty, else [`Self::resolved_id`].
    #[must_use]
    pub fn partition_key<'a>(&'a self, explicit: Option<&'a str>) -> &'a str {
        explicit
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| self.resolved_id())
    }
}

/// The structured wrapper written to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event id, never empty on envelopes this bus writes
    #[serde(default)]
    pub id: String,
    /// Event kind
    #[serde(rename = "type")]
    pub event_type: String,
    /// Caller-defined payload
    #[serde(default)]
    pub payload: Value,
    /// Correlation data
    #[serde(default)]
    pub context: Option<Value>,
    /// Publish time, set by the bus
    pub timestamp: DateTime<Utc>,
    /// Publishing bus instance
    #[serde(default)]
    pub source: String,
    /// Always includes `event-type` and `version`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EventEnvelope {
    /// Wrap a caller's event, stamping it with `timestamp`.
    #[must_use]
    pub fn seal(input: EventInput, timestamp: DateTime<Utc>) -> Self {
        let id = input.resolved_id().to_string();
        let headers = BTreeMap::from([
            (EVENT_TYPE_HEADER.to_string(), input.event_type.clone()),
            (VERSION_HEADER.to_string(), SCHEMA_VERSION.to_string()),
        ]);

        Self {
            id,
            event_type: input.event_type,
            payload: input.payload,
            context: input.context,
            timestamp,
            source: BUS_SOURCE.to_string(),
            headers,
        }
    }

    /// Serialize to the JSON transport payload.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the payload or context cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a JSON transport payload.
    ///
    /// `type` and `timestamp` are required; every other field tolerates absence.
    ///
    /// # Errors
    ///
    /// Returns the parser error for invalid JSON or a missing required field.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Value of a header, if present.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Where and how a consumed message was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryMetadata {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Message key, decoded as UTF-8 (lossy)
    pub key: Option<String>,
    /// Broker timestamp
    pub timestamp: Option<DateTime<Utc>>,
}

impl DeliveryMetadata {
    /// Build metadata from raw broker fields. `timestamp_ms` is milliseconds since the epoch.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<&[u8]>,
        timestamp_ms: Option<i64>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: key.map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
            timestamp: timestamp_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn at_new_year() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn id_falls_back_to_context_user_then_default() {
        let with_id = EventInput::new("user:emotion", json!({})).with_id("evt-1");
        assert_eq!(with_id.resolved_id(), "evt-1");

        let with_user =
            EventInput::new("user:emotion", json!({})).with_context(json!({ "userId": "u-42" }));
        assert_eq!(with_user.resolved_id(), "u-42");

        let bare = EventInput::new("user:emotion", json!({}));
        assert_eq!(bare.resolved_id(), "default");

        let blank = EventInput::new("user:emotion", json!({})).with_id("");
        assert_eq!(blank.resolved_id(), "default");
    }

    #[test]
    fn explicit_key_wins_over_id() {
        let event = EventInput::new("skill:execution", json!({})).with_id("evt-1");
        assert_eq!(event.partition_key(Some("trip-9")), "trip-9");
        assert_eq!(event.partition_key(Some("")), "evt-1");
        assert_eq!(event.partition_key(None), "evt-1");
    }

    #[test]
    fn non_string_user_id_is_ignored() {
        let event =
            EventInput::new("user:emotion", json!({})).with_context(json!({ "userId": 7 }));
        assert_eq!(event.partition_key(None), "default");
    }

    #[test]
    fn sealed_envelope_has_wire_shape() {
        let envelope = EventEnvelope::seal(
            EventInput::new("user:emotion", json!({ "emotion": "excited" })).with_id("u1"),
            at_new_year(),
        );

        let wire: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(wire["id"], "u1");
        assert_eq!(wire["type"], "user:emotion");
        assert_eq!(wire["timestamp"], "2025-01-01T00:00:00Z");
        assert_eq!(wire["source"], BUS_SOURCE);
        assert_eq!(wire["headers"]["event-type"], "user:emotion");
        assert_eq!(wire["headers"]["version"], "1.0");
        assert!(wire["context"].is_null());
    }

    #[test]
    fn parsing_requires_type_and_timestamp() {
        let missing_type = br#"{"id":"a","timestamp":"2025-01-01T00:00:00Z"}"#;
        assert!(EventEnvelope::from_bytes(missing_type).is_err());

        let missing_timestamp = br#"{"id":"a","type":"system:boot"}"#;
        assert!(EventEnvelope::from_bytes(missing_timestamp).is_err());

        let minimal = br#"{"type":"system:boot","timestamp":"2025-01-01T00:00:00Z"}"#;
        let envelope = EventEnvelope::from_bytes(minimal).unwrap();
        assert_eq!(envelope.event_type, "system:boot");
        assert!(envelope.headers.is_empty());
    }

    #[test]
    fn delivery_metadata_decodes_key_and_timestamp() {
        let meta = DeliveryMetadata::new(
            "user-emotions",
            1,
            17,
            Some(b"u1".as_slice()),
            Some(1_735_689_600_000),
        );
        assert_eq!(meta.key.as_deref(), Some("u1"));
        assert_eq!(meta.timestamp, Some(at_new_year()));
    }

    proptest! {
        #[test]
        fn partition_key_is_deterministic_for_an_id(id in "[a-zA-Z0-9-]{1,32}") {
            let event = EventInput::new("orchestration:result", json!({})).with_id(id.clone());
            let again = event.clone();
            prop_assert_eq!(event.partition_key(None), id.as_str());
            prop_assert_eq!(event.partition_key(None), again.partition_key(None));
        }

        #[test]
        fn partition_key_uses_user_id_when_id_is_absent(user in "[a-z0-9]{1,16}") {
            let event = EventInput::new("user:emotion", json!({}))
                .with_context(json!({ "userId": user.clone(), "sessionId": "s" }));
            prop_assert_eq!(event.partition_key(None), user.as_str());
        }
    }
}
