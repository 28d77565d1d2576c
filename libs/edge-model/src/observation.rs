//! Observation record emitted for every published read

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::value::{Quality, Value};

/// Tag reference inside an observation
///
/// Configured tags carry their stable integer id; unconfigured ingress
/// (e.g. a wildcard MQTT subscription) carries the protocol path instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagRef {
    Id(i64),
    Path(String),
}

/// A single normalized telemetry record
///
/// Ephemeral: encoded onto the bus and dropped, never stored by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub connection_id: String,
    pub tag: TagRef,
    pub ts: DateTime<Utc>,
    pub value: Value,
    pub quality: Quality,
}

impl Observation {
    pub fn new(connection_id: impl Into<String>, tag: TagRef, value: Value, quality: Quality) -> Self {
        Self {
            connection_id: connection_id.into(),
            tag,
            ts: Utc::now(),
            value,
            quality,
        }
    }

    /// Wire encoding: `{connection_id, tag_id|tag_path, ts, v, q}`
    pub fn to_wire_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "connection_id".to_string(),
            serde_json::Value::String(self.connection_id.clone()),
        );
        match &self.tag {
            TagRef::Id(id) => {
                map.insert("tag_id".to_string(), serde_json::Value::from(*id));
            },
            TagRef::Path(path) => {
                map.insert(
                    "tag_path".to_string(),
                    serde_json::Value::String(path.clone()),
                );
            },
        }
        map.insert(
            "ts".to_string(),
            serde_json::Value::String(self.ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        map.insert("v".to_string(), self.value.to_json());
        map.insert("q".to_string(), serde_json::Value::from(self.quality.code()));
        serde_json::Value::Object(map)
    }
}
