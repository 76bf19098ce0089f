//! Topic definitions and the fixed topic catalog.
//!
//! Topic names and policies are part of the contract other services rely on, so
//! the catalog is a fixed ordered list and is provisioned in that order.
//!
//! | Topic | Partitions | Replication | Retention | Cleanup |
//! |---|---|---|---|---|
//! | `orchestration-results` | 3 | 3 | 7 days | delete |
//! | `user-emotions` | 2 | 3 | 24 hours | delete |
//! | `skill-executions` | 2 | 3 | 7 days | delete |
//! | `system-events` | 1 | 3 | 30 days | delete |

use serde::Serialize;
use std::fmt;

/// Results produced by the orchestration layer.
pub const ORCHESTRATION_RESULTS: &str = "orchestration-results";

/// Detected user emotions.
pub const USER_EMOTIONS: &str = "user-emotions";

/// Skill execution records.
pub const SKILL_EXECUTIONS: &str = "skill-executions";

/// Operational system events.
pub const SYSTEM_EVENTS: &str = "system-events";

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Log compaction strategy for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    /// Delete segments older than the retention period
    Delete,
    /// Keep the latest record per key
    Compact,
}

impl CleanupPolicy {
    /// Broker configuration value (`cleanup.policy`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Compact => "compact",
        }
    }
}

impl fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Keep records for this many milliseconds
    Millis(u64),
    /// Never expire records
    Forever,
}

impl Retention {
    /// Retention of `hours` hours.
    #[must_use]
    pub const fn hours(hours: u64) -> Self {
        Self::Millis(hours * HOUR_MS)
    }

    /// Retention of `days` days.
    #[must_use]
    pub const fn days(days: u64) -> Self {
        Self::Millis(days * DAY_MS)
    }

    /// Broker configuration value (`retention.ms`); `-1` means forever.
    #[must_use]
    pub fn config_value(self) -> String {
        match self {
            Self::Millis(ms) => ms.to_string(),
            Self::Forever => "-1".to_string(),
        }
    }
}

/// Static provisioning record for one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicConfig {
    /// Globally unique topic name
    pub name: String,
    /// Partition count (must be positive)
    pub partitions: u16,
    /// Replication factor (must be positive)
    pub replication_factor: u16,
    /// Retention policy
    pub retention: Retention,
    /// Cleanup policy
    pub cleanup_policy: CleanupPolicy,
}

impl TopicConfig {
    /// Create a topic definition with the `delete` cleanup policy.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        partitions: u16,
        replication_factor: u16,
        retention: Retention,
    ) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
            retention,
            cleanup_policy: CleanupPolicy::Delete,
        }
    }

    /// Override the cleanup policy.
    #[must_use]
    pub const fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    /// Topic-level broker configuration entries.
    #[must_use]
    pub fn config_entries(&self) -> [(&'static str, String); 2] {
        [
            ("cleanup.policy", self.cleanup_policy.as_str().to_string()),
            ("retention.ms", self.retention.config_value()),
        ]
    }
}

/// The catalog every bus is constructed with, in provisioning order.
#[must_use]
pub fn default_catalog() -> Vec<TopicConfig> {
    vec![
        TopicConfig::new(ORCHESTRATION_RESULTS, 3, 3, Retention::days(7)),
        TopicConfig::new(USER_EMOTIONS, 2, 3, Retention::hours(24)),
        TopicConfig::new(SKILL_EXECUTIONS, 2, 3, Retention::days(7)),
        TopicConfig::new(SYSTEM_EVENTS, 1, 3, Retention::days(30)),
    ]
}
