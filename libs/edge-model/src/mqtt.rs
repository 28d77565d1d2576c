//! MQTT subscription and publisher definitions
//!
//! These describe broker-side ingress (topic subscriptions with optional
//! extractors and field mappings) and egress (tag-to-topic publishers).

use serde::{Deserialize, Serialize};

use crate::kind::DataKind;

/// Payload interpretation for an inbound subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Json,
    Raw,
}

impl PayloadFormat {
    pub fn parse(s: &str) -> PayloadFormat {
        if s.eq_ignore_ascii_case("raw") {
            PayloadFormat::Raw
        } else {
            PayloadFormat::Json
        }
    }
}

/// Policy when a field mapping fails to extract or convert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OnFailure {
    #[default]
    Skip,
    UseNull,
}

impl OnFailure {
    pub fn parse(s: &str) -> OnFailure {
        if s.eq_ignore_ascii_case("use-null") || s.eq_ignore_ascii_case("use_null") {
            OnFailure::UseNull
        } else {
            OnFailure::Skip
        }
    }
}

/// One (field path -> tag) extraction rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dotted path into the JSON payload (optional `$.` prefix)
    pub field_path: String,
    pub tag_id: i64,
    pub expected_kind: DataKind,
    #[serde(default)]
    pub on_failure: OnFailure,
}

/// Inbound topic subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSubscriptionConfig {
    pub id: i64,
    pub connection_id: String,
    /// Topic pattern with `+`/`#` wildcards
    pub topic: String,
    /// QoS 0..=2
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub payload_format: PayloadFormat,
    /// JSON-path extractors (dotted subset)
    #[serde(default)]
    pub value_path: Option<String>,
    #[serde(default)]
    pub ts_path: Option<String>,
    #[serde(default)]
    pub quality_path: Option<String>,
    /// Retained message buffer size (0 disables buffering)
    #[serde(default)]
    pub buffer_size: u32,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
}

/// Publisher operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherMode {
    Interval,
    OnChange,
    Both,
    Sparkplug,
}

impl PublisherMode {
    pub fn parse(s: &str) -> Option<PublisherMode> {
        match s.to_ascii_lowercase().as_str() {
            "interval" => Some(PublisherMode::Interval),
            "on_change" | "on-change" => Some(PublisherMode::OnChange),
            "both" => Some(PublisherMode::Both),
            "sparkplug" => Some(PublisherMode::Sparkplug),
            _ => None,
        }
    }

    /// Whether the mode runs an interval ticker
    pub fn has_interval(self) -> bool {
        matches!(self, PublisherMode::Interval | PublisherMode::Both)
    }

    /// Whether the mode reacts to telemetry changes
    pub fn has_on_change(self) -> bool {
        matches!(self, PublisherMode::OnChange | PublisherMode::Both)
    }
}

/// One tag-to-topic publisher mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherMapping {
    pub tag_id: i64,
    pub topic: String,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub qos: u8,
    /// Optional value transform expression over `value`
    #[serde(default)]
    pub transform: Option<String>,
}

/// Outbound publisher definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttPublisherConfig {
    pub id: i64,
    pub connection_id: String,
    pub mode: PublisherMode,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub payload_format: PayloadFormat,
    /// Optional payload template with `{{value}}`/`{{ts}}`/`{{tag}}`
    /// placeholders; default payload is `{"v": ..., "ts": ...}`
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sparkplug identity (sparkplug mode only)
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub edge_node_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub mappings: Vec<PublisherMapping>,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(PublisherMode::parse("interval"), Some(PublisherMode::Interval));
        assert_eq!(PublisherMode::parse("on_change"), Some(PublisherMode::OnChange));
        assert_eq!(PublisherMode::parse("on-change"), Some(PublisherMode::OnChange));
        assert_eq!(PublisherMode::parse("SPARKPLUG"), Some(PublisherMode::Sparkplug));
        assert_eq!(PublisherMode::parse("periodic"), None);
    }

    #[test]
    fn test_mode_capabilities() {
        assert!(PublisherMode::Interval.has_interval());
        assert!(!PublisherMode::Interval.has_on_change());
        assert!(PublisherMode::Both.has_interval());
        assert!(PublisherMode::Both.has_on_change());
        assert!(!PublisherMode::Sparkplug.has_interval());
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!(OnFailure::parse("use-null"), OnFailure::UseNull);
        assert_eq!(OnFailure::parse("use_null"), OnFailure::UseNull);
        assert_eq!(OnFailure::parse("skip"), OnFailure::Skip);
        assert_eq!(OnFailure::parse("anything"), OnFailure::Skip);
    }
}
