//! Protocol driver capability set
//!
//! Every protocol exposes the same contract: connect/disconnect, grouped
//! tag subscriptions, one-shot reads, writes, browse/discovery, and an
//! observation sink. The connection manager owns one driver per connection
//! and never reaches around this interface.

pub mod eip;
pub mod mqtt;
pub mod opcua;
pub mod s7;

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

use edge_model::{ConnectionKind, Observation, PollGroup, Quality, TagConfig, Value};

use crate::error::Result;

// ============================================================================
// Deadlines
// ============================================================================

/// Default connect deadline
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for a batched or one-shot read
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for a write operation
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for browse/discovery calls
pub const BROWSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for EIP snapshot actions
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Shared driver types
// ============================================================================

/// Observation sink handed to a driver at construction
///
/// A typed channel rather than a callback: the emitter reads the other
/// end, which makes backpressure explicit.
pub type ObservationSink = mpsc::Sender<Observation>;

/// Tags of one poll group, with the group definition
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub group: PollGroup,
    pub tags: Vec<TagConfig>,
}

/// A single outbound write request
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub tag_id: i64,
    pub value: Value,
}

/// Per-request write outcome
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub tag_id: i64,
    pub ok: bool,
    pub error: Option<String>,
}

impl WriteOutcome {
    pub fn success(tag_id: i64) -> Self {
        Self {
            tag_id,
            ok: true,
            error: None,
        }
    }

    pub fn failure(tag_id: i64, error: impl Into<String>) -> Self {
        Self {
            tag_id,
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// One entry from a browse/discovery call
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BrowseItem {
    /// Protocol-native address of the item
    pub address: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    /// Node class: "Object", "Variable", "Tag", ...
    pub node_class: String,
    /// Data type name for value-bearing items
    #[serde(default)]
    pub data_type: Option<String>,
}

/// One raw reading produced by a driver's batched read path
///
/// The scheduler stamps the timestamp and runs change detection.
#[derive(Debug, Clone)]
pub struct TagReading {
    pub tag_id: i64,
    pub value: Value,
    pub quality: Quality,
}

impl TagReading {
    pub fn good(tag_id: i64, value: Value) -> Self {
        Self {
            tag_id,
            value,
            quality: Quality::Good,
        }
    }

    /// Failed read: null value with quality -1
    pub fn bad(tag_id: i64) -> Self {
        Self {
            tag_id,
            value: Value::Null,
            quality: Quality::Bad,
        }
    }
}

// ============================================================================
// Driver contract
// ============================================================================

/// Uniform protocol driver capability set
///
/// Failure semantics: transport errors reconnect with backoff inside the
/// driver; auth failures surface immediately and are never retried;
/// `disconnect` is idempotent and releases all tickers and sockets.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    fn kind(&self) -> ConnectionKind;

    /// Allow downcasting to the concrete driver (MQTT runtime wiring)
    fn as_any(&self) -> &dyn std::any::Any;

    /// Establish the protocol session
    async fn connect(&self) -> Result<()>;

    /// Tear down; idempotent, silences in-flight work
    async fn disconnect(&self) -> Result<()>;

    /// Replace the active subscription set, grouped by poll rate
    async fn apply_tag_subscriptions(&self, groups: Vec<GroupPlan>) -> Result<()>;

    /// One-shot read outside the poll cadence; failed tags come back
    /// with quality -1
    async fn read_one(&self, tag_ids: &[i64]) -> Result<Vec<Observation>>;

    /// Execute writes; at most one write batch is in flight per
    /// connection (the manager serializes callers)
    async fn write(&self, requests: &[WriteRequest]) -> Result<Vec<WriteOutcome>>;

    /// Browse the address space from an optional starting node
    async fn browse(&self, node: Option<&str>) -> Result<Vec<BrowseItem>>;

    /// Tag ids the driver is actively acquiring (for reconciliation)
    async fn list_active_tag_ids(&self) -> HashSet<i64>;

    /// Drop a single tag without a full subscription reload
    async fn remove_tag(&self, tag_id: i64) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Apply live tuning from a configuration update; default no-op
    async fn update_tuning(&self, _params: &serde_json::Map<String, serde_json::Value>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_outcome_constructors() {
        let ok = WriteOutcome::success(7);
        assert!(ok.ok);
        assert!(ok.error.is_none());

        let fail = WriteOutcome::failure(7, "unsupported address");
        assert!(!fail.ok);
        assert_eq!(fail.error.as_deref(), Some("unsupported address"));
    }

    #[test]
    fn test_bad_reading_shape() {
        let reading = TagReading::bad(3);
        assert_eq!(reading.quality, Quality::Bad);
        assert!(reading.value.is_null());
    }
}
