//! Tag, change-detection policy and poll-group definitions

use serde::{Deserialize, Serialize};

use crate::kind::DataKind;

/// Deadband interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeadbandKind {
    #[default]
    Absolute,
    Percent,
}

/// Per-tag change-detection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePolicy {
    /// Disabled means every read publishes
    #[serde(default)]
    pub enabled: bool,
    /// Minimum change required for a numeric value to publish
    #[serde(default)]
    pub deadband: f64,
    #[serde(default)]
    pub deadband_kind: DeadbandKind,
    /// Maximum silence before a value republishes regardless of deadband
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

fn default_heartbeat_ms() -> u64 {
    60_000
}

impl Default for ChangePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            deadband: 0.0,
            deadband_kind: DeadbandKind::Absolute,
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

/// Tag lifecycle status in the metadata store
///
/// Anything other than `Active` counts as "not subscribed"; history purge
/// of deleted tags happens in a background job outside this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagStatus {
    #[default]
    Active,
    PendingDelete,
    Deleting,
    Deleted,
}

impl TagStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TagStatus::Active => "active",
            TagStatus::PendingDelete => "pending_delete",
            TagStatus::Deleting => "deleting",
            TagStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> TagStatus {
        match s {
            "pending_delete" => TagStatus::PendingDelete,
            "deleting" => TagStatus::Deleting,
            "deleted" => TagStatus::Deleted,
            _ => TagStatus::Active,
        }
    }
}

/// Tag definition as loaded from the metadata store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagConfig {
    /// Stable integer identifier
    pub id: i64,
    /// Owning connection identifier
    pub connection_id: String,
    /// Protocol-native address: OPC UA NodeId, S7 address string,
    /// EIP tag name or MQTT topic
    pub path: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    pub kind: DataKind,
    /// Poll group the tag reads on
    pub poll_group_id: i64,
    /// False removes the tag from acquisition without deleting it
    #[serde(default = "default_true")]
    pub subscribe: bool,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub policy: ChangePolicy,
    #[serde(default)]
    pub status: TagStatus,
}

fn default_true() -> bool {
    true
}

impl TagConfig {
    /// True when the tag should be actively acquired
    pub fn is_subscribed(&self) -> bool {
        self.subscribe && self.status == TagStatus::Active
    }
}

/// A named poll rate shared by tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollGroup {
    pub id: i64,
    /// Poll rate in milliseconds
    pub rate_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = ChangePolicy::default();
        assert!(!policy.enabled);
        assert_eq!(policy.deadband, 0.0);
        assert_eq!(policy.deadband_kind, DeadbandKind::Absolute);
        assert_eq!(policy.heartbeat_ms, 60_000);
    }

    #[test]
    fn test_tag_status_round_trip() {
        for status in [
            TagStatus::Active,
            TagStatus::PendingDelete,
            TagStatus::Deleting,
            TagStatus::Deleted,
        ] {
            assert_eq!(TagStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_subscribed_requires_active_status() {
        let mut tag = TagConfig {
            id: 1,
            connection_id: "plc-1".into(),
            path: "DB1.DBW0".into(),
            name: "speed".into(),
            kind: DataKind::Int,
            poll_group_id: 1,
            subscribe: true,
            unit: None,
            policy: ChangePolicy::default(),
            status: TagStatus::Active,
        };
        assert!(tag.is_subscribed());

        tag.status = TagStatus::PendingDelete;
        assert!(!tag.is_subscribed());

        tag.status = TagStatus::Active;
        tag.subscribe = false;
        assert!(!tag.is_subscribed());
    }
}
