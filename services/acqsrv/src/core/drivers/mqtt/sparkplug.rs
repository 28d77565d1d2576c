//! Sparkplug B payload codec and endpoint state
//!
//! Payloads are protobuf per the Sparkplug B specification, encoded with
//! hand-written prost message structs (no build-time codegen). Endpoint
//! state enforces the two protocol invariants: the 0..=255 monotonic
//! sequence number, and DATA only after a BIRTH.

use chrono::Utc;
use prost::Message;

use edge_model::Value;

use crate::error::{AcqError, Result};

// ============================================================================
// Wire messages (Sparkplug B payload.proto subset)
// ============================================================================

/// Sparkplug B payload
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Payload {
    /// Epoch milliseconds
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: Option<u64>,
    #[prost(message, repeated, tag = "2")]
    pub metrics: Vec<Metric>,
    /// Sequence number 0..=255
    #[prost(uint64, optional, tag = "3")]
    pub seq: Option<u64>,
    #[prost(string, optional, tag = "4")]
    pub uuid: Option<String>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub body: Option<Vec<u8>>,
}

/// One metric inside a payload
///
/// Aliases are deliberately never emitted; metrics always carry names
/// (re-Birth reuses the same metric list without alias remapping).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metric {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub alias: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub timestamp: Option<u64>,
    #[prost(uint32, optional, tag = "4")]
    pub datatype: Option<u32>,
    #[prost(bool, optional, tag = "7")]
    pub is_null: Option<bool>,
    #[prost(oneof = "metric::MetricValue", tags = "10, 11, 12, 13, 14, 15, 16")]
    pub value: Option<metric::MetricValue>,
}

pub mod metric {
    /// Metric value variants
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum MetricValue {
        #[prost(uint32, tag = "10")]
        IntValue(u32),
        #[prost(uint64, tag = "11")]
        LongValue(u64),
        #[prost(float, tag = "12")]
        FloatValue(f32),
        #[prost(double, tag = "13")]
        DoubleValue(f64),
        #[prost(bool, tag = "14")]
        BooleanValue(bool),
        #[prost(string, tag = "15")]
        StringValue(String),
        #[prost(bytes = "vec", tag = "16")]
        BytesValue(Vec<u8>),
    }
}

/// Sparkplug datatype codes (the subset this service emits)
pub mod datatype {
    pub const INT64: u32 = 4;
    pub const DOUBLE: u32 = 10;
    pub const BOOLEAN: u32 = 11;
    pub const STRING: u32 = 12;
}

impl Metric {
    /// Build a named metric from a telemetry value
    pub fn from_value(name: &str, value: &Value, timestamp_ms: u64) -> Self {
        let (datatype, metric_value, is_null) = match value {
            Value::Bool(b) => (
                datatype::BOOLEAN,
                Some(metric::MetricValue::BooleanValue(*b)),
                None,
            ),
            Value::Int(i) => (
                datatype::INT64,
                Some(metric::MetricValue::LongValue(*i as u64)),
                None,
            ),
            Value::Float(f) => (
                datatype::DOUBLE,
                Some(metric::MetricValue::DoubleValue(*f)),
                None,
            ),
            Value::Text(s) => (
                datatype::STRING,
                Some(metric::MetricValue::StringValue(s.clone())),
                None,
            ),
            Value::Null => (datatype::DOUBLE, None, Some(true)),
        };
        Metric {
            name: Some(name.to_string()),
            alias: None,
            timestamp: Some(timestamp_ms),
            datatype: Some(datatype),
            is_null,
            value: metric_value,
        }
    }

    /// Telemetry value of a received metric
    pub fn to_value(&self) -> Value {
        if self.is_null == Some(true) {
            return Value::Null;
        }
        match &self.value {
            Some(metric::MetricValue::IntValue(v)) => Value::Int(*v as i64),
            Some(metric::MetricValue::LongValue(v)) => Value::Int(*v as i64),
            Some(metric::MetricValue::FloatValue(v)) => Value::Float(*v as f64),
            Some(metric::MetricValue::DoubleValue(v)) => Value::Float(*v),
            Some(metric::MetricValue::BooleanValue(v)) => Value::Bool(*v),
            Some(metric::MetricValue::StringValue(v)) => Value::Text(v.clone()),
            Some(metric::MetricValue::BytesValue(_)) | None => Value::Null,
        }
    }
}

/// Encode a payload to wire bytes
pub fn encode_payload(payload: &Payload) -> Vec<u8> {
    payload.encode_to_vec()
}

/// Decode a payload from wire bytes
pub fn decode_payload(bytes: &[u8]) -> Result<Payload> {
    Payload::decode(bytes).map_err(|e| AcqError::protocol(format!("Sparkplug payload: {}", e)))
}

// ============================================================================
// Endpoint state
// ============================================================================

/// Per-publisher Sparkplug state
///
/// Holds the monotonic sequence counter and the Birth bookkeeping.
/// Mutated only from the owning publisher task.
#[derive(Debug)]
pub struct SparkplugState {
    seq: u8,
    last_birth_ms: Option<u64>,
}

impl Default for SparkplugState {
    fn default() -> Self {
        Self::new()
    }
}

impl SparkplugState {
    pub fn new() -> Self {
        Self {
            seq: 0,
            last_birth_ms: None,
        }
    }

    /// True once a Birth has been emitted
    pub fn birthed(&self) -> bool {
        self.last_birth_ms.is_some()
    }

    pub fn last_birth_ms(&self) -> Option<u64> {
        self.last_birth_ms
    }

    /// Take the next sequence number, wrapping 255 -> 0
    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq as u64
    }

    /// Build a BIRTH payload and record it
    pub fn birth(&mut self, metrics: Vec<Metric>) -> Payload {
        let now = Utc::now().timestamp_millis() as u64;
        self.last_birth_ms = Some(now);
        Payload {
            timestamp: Some(now),
            metrics,
            seq: Some(self.next_seq()),
            uuid: None,
            body: None,
        }
    }

    /// Build a DATA payload; refused until a Birth has been emitted
    pub fn data(&mut self, metrics: Vec<Metric>) -> Result<Payload> {
        if !self.birthed() {
            return Err(AcqError::protocol("Sparkplug DATA before BIRTH".to_string()));
        }
        Ok(Payload {
            timestamp: Some(Utc::now().timestamp_millis() as u64),
            metrics,
            seq: Some(self.next_seq()),
            uuid: None,
            body: None,
        })
    }

    /// Build a DEATH payload; Birth state is cleared so a later DATA
    /// forces a fresh Birth
    pub fn death(&mut self) -> Payload {
        self.last_birth_ms = None;
        Payload {
            timestamp: Some(Utc::now().timestamp_millis() as u64),
            metrics: Vec::new(),
            seq: Some(self.next_seq()),
            uuid: None,
            body: None,
        }
    }
}
