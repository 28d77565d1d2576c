//! EtherNet/IP driver
//!
//! Tag-name-addressed polling over CIP unconnected messaging. Large tag
//! sets shard across ticks under live-tunable budgets; discovery (device
//! identity, tag lists, paged snapshots with TTL, type resolution) is
//! served as request/reply RPCs on the bus.

pub mod cip;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use edge_bus::{subjects, Bus, RpcEnvelope};
use edge_model::{ConnectionKind, DataKind, EipParams, Observation, Quality, TagConfig, TagRef, Value};

use self::cip::{decode_cip_value, CipType, EipClient, EipTagInfo};
use crate::config::EipTuning;
use crate::core::drivers::{
    BrowseItem, Driver, GroupPlan, ObservationSink, TagReading, WriteOutcome, WriteRequest,
    SNAPSHOT_TIMEOUT, WRITE_TIMEOUT,
};
use crate::core::emitter::{ConnState, StatusPublisher};
use crate::core::reconnect::{ReconnectHelper, ReconnectPolicy};
use crate::core::scheduler::{GroupReader, PollScheduler};
use crate::error::{AcqError, Result};

/// Pacing between read shards within one tick
const SHARD_PACING: Duration = Duration::from_millis(20);
/// Snapshot time-to-live; heartbeats extend it
const SNAPSHOT_TTL: Duration = Duration::from_secs(300);
/// Hard cap on one tag-list page returned over the bus
const MAX_PAGE_LIMIT: usize = 500;

// ============================================================================
// Snapshot store
// ============================================================================

struct Snapshot {
    items: Vec<EipTagInfo>,
    deadline: Instant,
}

/// In-memory store of paged tag-list snapshots
struct SnapshotStore {
    snapshots: DashMap<String, Snapshot>,
}

impl SnapshotStore {
    fn new() -> Self {
        Self {
            snapshots: DashMap::new(),
        }
    }

    fn create(&self, items: Vec<EipTagInfo>) -> (String, usize) {
        // Opportunistic expiry sweep
        let now = Instant::now();
        self.snapshots.retain(|_, snapshot| snapshot.deadline > now);

        let id = uuid::Uuid::new_v4().simple().to_string();
        let total = items.len();
        self.snapshots.insert(
            id.clone(),
            Snapshot {
                items,
                deadline: now + SNAPSHOT_TTL,
            },
        );
        (id, total)
    }

    fn page(&self, id: &str, offset: usize, limit: usize) -> Option<(Vec<EipTagInfo>, usize)> {
        let snapshot = self.snapshots.get(id)?;
        if snapshot.deadline <= Instant::now() {
            drop(snapshot);
            self.snapshots.remove(id);
            return None;
        }
        let total = snapshot.items.len();
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let page = snapshot
            .items
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Some((page, total))
    }

    fn heartbeat(&self, id: &str) -> bool {
        if let Some(mut snapshot) = self.snapshots.get_mut(id) {
            snapshot.deadline = Instant::now() + SNAPSHOT_TTL;
            true
        } else {
            false
        }
    }

    fn delete(&self, id: &str) -> bool {
        self.snapshots.remove(id).is_some()
    }
}

// ============================================================================
// Shared driver state
// ============================================================================

struct EipShared {
    connection_id: String,
    params: EipParams,
    client: Mutex<Option<EipClient>>,
    tags: RwLock<HashMap<i64, TagConfig>>,
    tuning: RwLock<EipTuning>,
    snapshots: SnapshotStore,
    shard_cursor: AtomicUsize,
    reconnecting: AtomicBool,
    closing: AtomicBool,
    status: Arc<StatusPublisher>,
}

impl EipShared {
    async fn open_client(&self) -> Result<EipClient> {
        EipClient::connect(&self.params.host, self.params.port, self.params.slot).await
    }

    fn connection_lost(self: Arc<Self>, reason: &str) {
        if self.closing.load(Ordering::Acquire) || self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("{}: connection lost: {}", self.connection_id, reason);

        let shared = self;
        tokio::spawn(async move {
            shared
                .status
                .set_state(&shared.connection_id, ConnState::Disconnected, Some("transport"))
                .await;
            let mut helper = ReconnectHelper::new(ReconnectPolicy::default());
            loop {
                if shared.closing.load(Ordering::Acquire) {
                    break;
                }
                let result = helper
                    .execute_reconnect(|| async {
                        let client = shared.open_client().await?;
                        *shared.client.lock().await = Some(client);
                        Ok(())
                    })
                    .await;
                match result {
                    Ok(()) => {
                        shared
                            .status
                            .set_state(&shared.connection_id, ConnState::Connected, Some("reconnected"))
                            .await;
                        break;
                    },
                    Err(AcqError::Cancelled(_)) => break,
                    Err(e) => {
                        if helper.exhausted_fast_attempts() {
                            shared
                                .status
                                .set_state(&shared.connection_id, ConnState::Error, Some(&e.to_string()))
                                .await;
                        }
                    },
                }
            }
            shared.reconnecting.store(false, Ordering::Release);
        });
    }

    /// Partition a tag snapshot into shards under the current budgets
    async fn build_shards(&self, tags: &[TagConfig]) -> Vec<Vec<TagConfig>> {
        let tuning = self.tuning.read().await.clone();
        let mut shards = Vec::new();
        let mut current: Vec<TagConfig> = Vec::new();
        let mut current_bytes = 0usize;
        for tag in tags {
            let estimate = tuning.tag_overhead_bytes + tag.kind.width().max(1);
            let over_tags = current.len() >= tuning.max_tags_per_request;
            let over_bytes =
                !current.is_empty() && current_bytes + estimate > tuning.byte_budget_per_request;
            if over_tags || over_bytes {
                shards.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += estimate;
            current.push(tag.clone());
        }
        if !current.is_empty() {
            shards.push(current);
        }
        shards
    }

    /// How many shards one tick may process
    async fn shards_per_tick(&self, total_shards: usize) -> usize {
        let tuning = self.tuning.read().await;
        let budgeted = (total_shards as f64 * tuning.shard_budget_fraction).ceil() as usize;
        budgeted.max(tuning.min_shards_per_tick).min(total_shards.max(1))
    }
}

// ============================================================================
// Group reader
// ============================================================================

struct EipReader {
    shared: Arc<EipShared>,
}

#[async_trait]
impl GroupReader for EipReader {
    async fn read_group(&self, tags: &[TagConfig]) -> Vec<TagReading> {
        if tags.is_empty() {
            return Vec::new();
        }
        let shards = self.shared.build_shards(tags).await;
        let budget = self.shared.shards_per_tick(shards.len()).await;
        // Rotate through shards across ticks so every tag gets read
        let start = self.shared.shard_cursor.fetch_add(budget, Ordering::Relaxed);

        let mut readings = Vec::new();
        for i in 0..budget {
            let shard = &shards[(start + i) % shards.len()];
            if i > 0 {
                tokio::time::sleep(SHARD_PACING).await;
            }
            let names: Vec<String> = shard.iter().map(|t| t.path.clone()).collect();

            let mut guard = self.shared.client.lock().await;
            let Some(client) = guard.as_mut() else {
                readings.extend(shard.iter().map(|t| TagReading::bad(t.id)));
                continue;
            };
            match client.read_tags(&names).await {
                Ok(results) => {
                    for (tag, result) in shard.iter().zip(results) {
                        match result.and_then(|(cip_type, bytes)| {
                            decode_cip_value(cip_type, &bytes).ok_or_else(|| {
                                AcqError::protocol(format!(
                                    "Undecodable type 0x{:04X} for '{}'",
                                    cip_type.0, tag.path
                                ))
                            })
                        }) {
                            Ok(value) => readings.push(TagReading::good(tag.id, value)),
                            Err(e) => {
                                debug!("{}: {}", self.shared.connection_id, e);
                                readings.push(TagReading::bad(tag.id));
                            },
                        }
                    }
                },
                Err(e) => {
                    readings.extend(shard.iter().map(|t| TagReading::bad(t.id)));
                    if matches!(e, AcqError::TransportError(_) | AcqError::TimeoutError(_)) {
                        *guard = None;
                        Arc::clone(&self.shared).connection_lost(&e.to_string());
                        break;
                    }
                },
            }
        }
        readings
    }
}

// ============================================================================
// Driver
// ============================================================================

/// EtherNet/IP protocol driver
pub struct EipDriver {
    shared: Arc<EipShared>,
    scheduler: PollScheduler,
    write_lock: Mutex<()>,
    rpc_task: Mutex<Option<JoinHandle<()>>>,
}

impl EipDriver {
    pub fn new(
        connection_id: impl Into<String>,
        params: EipParams,
        tuning: EipTuning,
        sink: ObservationSink,
        status: Arc<StatusPublisher>,
    ) -> Arc<Self> {
        let connection_id = connection_id.into();
        let shared = Arc::new(EipShared {
            connection_id: connection_id.clone(),
            params,
            client: Mutex::new(None),
            tags: RwLock::new(HashMap::new()),
            tuning: RwLock::new(tuning.clamped()),
            snapshots: SnapshotStore::new(),
            shard_cursor: AtomicUsize::new(0),
            reconnecting: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            status,
        });
        let reader = Arc::new(EipReader {
            shared: Arc::clone(&shared),
        });
        let scheduler = PollScheduler::new(connection_id, reader, sink);
        Arc::new(Self {
            shared,
            scheduler,
            write_lock: Mutex::new(()),
            rpc_task: Mutex::new(None),
        })
    }

    /// Start serving discovery RPCs on the bus
    pub async fn start_rpc_task(self: Arc<Self>, bus: Arc<dyn Bus>) {
        let subject = subjects::rpc_eip(&self.shared.connection_id);
        let mut subscription = match bus.subscribe(&subject).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("{}: RPC subscribe failed: {}", self.shared.connection_id, e);
                return;
            },
        };
        let driver = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            while let Some(msg) = subscription.next().await {
                let envelope: RpcEnvelope = match serde_json::from_slice(&msg.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!("{}: bad RPC envelope: {}", driver.shared.connection_id, e);
                        continue;
                    },
                };
                let reply = driver.handle_rpc(&envelope.body).await;
                if let Err(e) = bus.publish_json(&envelope.reply_to, &reply).await {
                    warn!("{}: RPC reply failed: {}", driver.shared.connection_id, e);
                }
            }
        });
        *self.rpc_task.lock().await = Some(handle);
    }

    async fn handle_rpc(&self, body: &serde_json::Value) -> serde_json::Value {
        let action = body.get("action").and_then(|a| a.as_str()).unwrap_or("");
        match self.dispatch_rpc(action, body).await {
            Ok(result) => result,
            Err(e) => serde_json::json!({"error": e.to_string()}),
        }
    }

    async fn dispatch_rpc(&self, action: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        match action {
            "identify" => {
                let mut guard = self.shared.client.lock().await;
                let client = guard
                    .as_mut()
                    .ok_or_else(|| AcqError::transport("Not connected".to_string()))?;
                let identity = client.identify().await?;
                Ok(serde_json::to_value(identity)?)
            },
            "tag_list" => {
                let start = body.get("start_instance").and_then(|v| v.as_u64()).unwrap_or(0);
                let mut guard = self.shared.client.lock().await;
                let client = guard
                    .as_mut()
                    .ok_or_else(|| AcqError::transport("Not connected".to_string()))?;
                let (tags, next) = client.list_tags(start as u32).await?;
                Ok(serde_json::json!({"tags": tags, "next_instance": next}))
            },
            "snapshot.create" => {
                let items =
                    tokio::time::timeout(SNAPSHOT_TIMEOUT, self.full_tag_list()).await??;
                let (id, total) = self.shared.snapshots.create(items);
                Ok(serde_json::json!({"snapshot_id": id, "total": total}))
            },
            "snapshot.page" => {
                let id = body
                    .get("snapshot_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AcqError::config("snapshot_id required".to_string()))?;
                let offset = body.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let limit = body.get("limit").and_then(|v| v.as_u64()).unwrap_or(100) as usize;
                let (page, total) = self
                    .shared
                    .snapshots
                    .page(id, offset, limit)
                    .ok_or_else(|| AcqError::config(format!("Unknown snapshot {}", id)))?;
                Ok(serde_json::json!({"tags": page, "total": total, "offset": offset}))
            },
            "snapshot.heartbeat" => {
                let id = body.get("snapshot_id").and_then(|v| v.as_str()).unwrap_or("");
                Ok(serde_json::json!({"ok": self.shared.snapshots.heartbeat(id)}))
            },
            "snapshot.delete" => {
                let id = body.get("snapshot_id").and_then(|v| v.as_str()).unwrap_or("");
                Ok(serde_json::json!({"ok": self.shared.snapshots.delete(id)}))
            },
            "resolve_types" => {
                let names: Vec<String> = body
                    .get("names")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .ok_or_else(|| AcqError::config("names required".to_string()))?;
                let mut guard = self.shared.client.lock().await;
                let client = guard
                    .as_mut()
                    .ok_or_else(|| AcqError::transport("Not connected".to_string()))?;
                let mut types = serde_json::Map::new();
                for name in names {
                    let entry = match client.read_tag(&name).await {
                        Ok((cip_type, _)) => serde_json::json!({
                            "code": cip_type.0,
                            "name": cip_type.name(),
                        }),
                        Err(e) => serde_json::json!({"error": e.to_string()}),
                    };
                    types.insert(name, entry);
                }
                Ok(serde_json::json!({"types": types}))
            },
            other => Err(AcqError::config(format!("Unknown EIP action '{}'", other))),
        }
    }

    /// Enumerate every controller tag, following partial transfers
    async fn full_tag_list(&self) -> Result<Vec<EipTagInfo>> {
        let mut guard = self.shared.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| AcqError::transport("Not connected".to_string()))?;
        let mut items = Vec::new();
        let mut start = 0u32;
        loop {
            let (mut page, next) = client.list_tags(start).await?;
            items.append(&mut page);
            match next {
                Some(next_start) => start = next_start,
                None => break,
            }
        }
        Ok(items)
    }

    fn cip_type_for(kind: DataKind) -> Option<CipType> {
        match kind {
            DataKind::Bool => Some(CipType::BOOL),
            DataKind::Sint => Some(CipType::SINT),
            DataKind::Int => Some(CipType::INT),
            DataKind::Dint => Some(CipType::DINT),
            DataKind::Lint => Some(CipType::LINT),
            DataKind::Usint => Some(CipType::USINT),
            DataKind::Uint => Some(CipType::UINT),
            DataKind::Udint => Some(CipType::UDINT),
            DataKind::Real => Some(CipType::REAL),
            DataKind::Lreal => Some(CipType::LREAL),
            DataKind::String => None,
        }
    }
}

#[async_trait]
impl Driver for EipDriver {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Eip
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self) -> Result<()> {
        self.shared.closing.store(false, Ordering::Release);
        let client = self.shared.open_client().await?;
        *self.shared.client.lock().await = Some(client);
        info!(
            "{}: EIP connected ({}:{} slot {})",
            self.shared.connection_id,
            self.shared.params.host,
            self.shared.params.port,
            self.shared.params.slot
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::Release);
        self.scheduler.stop().await;
        if let Some(handle) = self.rpc_task.lock().await.take() {
            handle.abort();
        }
        if let Some(mut client) = self.shared.client.lock().await.take() {
            client.unregister().await;
        }
        debug!("{}: EIP disconnected", self.shared.connection_id);
        Ok(())
    }

    async fn apply_tag_subscriptions(&self, groups: Vec<GroupPlan>) -> Result<()> {
        let mut index = HashMap::new();
        for plan in &groups {
            for tag in &plan.tags {
                if tag.path.is_empty() {
                    return Err(AcqError::config(format!("Tag {} has an empty name", tag.id)));
                }
                index.insert(tag.id, tag.clone());
            }
        }
        let count = index.len();
        *self.shared.tags.write().await = index;
        self.scheduler.apply(groups).await;
        info!("{}: {} EIP tags subscribed", self.shared.connection_id, count);
        Ok(())
    }

    async fn read_one(&self, tag_ids: &[i64]) -> Result<Vec<Observation>> {
        let index = self.shared.tags.read().await;
        let now = Utc::now();
        let mut observations = Vec::with_capacity(tag_ids.len());
        let mut guard = self.shared.client.lock().await;
        for &tag_id in tag_ids {
            let reading = match (index.get(&tag_id), guard.as_mut()) {
                (Some(tag), Some(client)) => match client.read_tag(&tag.path).await {
                    Ok((cip_type, bytes)) => decode_cip_value(cip_type, &bytes)
                        .map(|v| (v, Quality::Good))
                        .unwrap_or((Value::Null, Quality::Bad)),
                    Err(_) => (Value::Null, Quality::Bad),
                },
                _ => (Value::Null, Quality::Bad),
            };
            observations.push(Observation {
                connection_id: self.shared.connection_id.clone(),
                tag: TagRef::Id(tag_id),
                ts: now,
                value: reading.0,
                quality: reading.1,
            });
        }
        Ok(observations)
    }

    async fn write(&self, requests: &[WriteRequest]) -> Result<Vec<WriteOutcome>> {
        let _write_guard = self.write_lock.lock().await;
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = async {
                let tag = self
                    .shared
                    .tags
                    .read()
                    .await
                    .get(&request.tag_id)
                    .cloned()
                    .ok_or_else(|| AcqError::tag(format!("Unknown tag {}", request.tag_id)))?;
                let cip_type = Self::cip_type_for(tag.kind)
                    .ok_or_else(|| AcqError::tag(format!("Unwritable kind {}", tag.kind)))?;
                let mut guard = self.shared.client.lock().await;
                let client = guard
                    .as_mut()
                    .ok_or_else(|| AcqError::transport("Not connected".to_string()))?;
                tokio::time::timeout(
                    WRITE_TIMEOUT,
                    client.write_tag(&tag.path, cip_type, &request.value),
                )
                .await?
            }
            .await;
            outcomes.push(match outcome {
                Ok(()) => WriteOutcome::success(request.tag_id),
                Err(e) => WriteOutcome::failure(request.tag_id, e.to_string()),
            });
        }
        Ok(outcomes)
    }

    async fn browse(&self, node: Option<&str>) -> Result<Vec<BrowseItem>> {
        let start = node.and_then(|n| n.parse::<u32>().ok()).unwrap_or(0);
        let mut guard = self.shared.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| AcqError::transport("Not connected".to_string()))?;
        let (tags, _) = client.list_tags(start).await?;
        Ok(tags
            .into_iter()
            .map(|t| BrowseItem {
                address: t.name.clone(),
                display_name: t.name.clone(),
                name: t.name,
                node_class: "Tag".to_string(),
                data_type: Some(t.type_name),
            })
            .collect())
    }

    async fn list_active_tag_ids(&self) -> HashSet<i64> {
        self.scheduler.active_tag_ids().await
    }

    async fn remove_tag(&self, tag_id: i64) -> Result<()> {
        self.scheduler.remove_tag(tag_id).await;
        self.shared.tags.write().await.remove(&tag_id);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.shared.client.lock().await.is_some()
    }

    async fn update_tuning(&self, params: &serde_json::Map<String, serde_json::Value>) {
        let Some(eip_params) = params.get("eip") else {
            return;
        };
        match serde_json::from_value::<EipTuning>(eip_params.clone()) {
            Ok(tuning) => {
                let tuning = tuning.clamped();
                info!(
                    "{}: EIP tuning updated (max_tags {}, byte_budget {})",
                    self.shared.connection_id,
                    tuning.max_tags_per_request,
                    tuning.byte_budget_per_request
                );
                *self.shared.tuning.write().await = tuning;
            },
            Err(e) => warn!("{}: bad EIP tuning ignored: {}", self.shared.connection_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_model::{ChangePolicy, TagStatus};

    fn tag(id: i64, name: &str, kind: DataKind) -> TagConfig {
        TagConfig {
            id,
            connection_id: "cell-1".into(),
            path: name.into(),
            name: name.into(),
            kind,
            poll_group_id: 1,
            subscribe: true,
            unit: None,
            policy: ChangePolicy::default(),
            status: TagStatus::Active,
        }
    }

    fn shared_with_tuning(tuning: EipTuning) -> Arc<EipShared> {
        Arc::new(EipShared {
            connection_id: "cell-1".into(),
            params: EipParams {
                host: "10.0.0.9".into(),
                port: 44818,
                slot: 0,
            },
            client: Mutex::new(None),
            tags: RwLock::new(HashMap::new()),
            tuning: RwLock::new(tuning),
            snapshots: SnapshotStore::new(),
            shard_cursor: AtomicUsize::new(0),
            reconnecting: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            status: Arc::new(StatusPublisher::new(edge_bus::helpers::create_test_bus())),
        })
    }

    #[tokio::test]
    async fn test_sharding_respects_tag_budget() {
        let tuning = EipTuning {
            max_tags_per_request: 3,
            byte_budget_per_request: 4000,
            ..EipTuning::default()
        };
        let shared = shared_with_tuning(tuning);
        let tags: Vec<TagConfig> = (0..8)
            .map(|i| tag(i, &format!("T{}", i), DataKind::Dint))
            .collect();
        let shards = shared.build_shards(&tags).await;
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].len(), 3);
        assert_eq!(shards[2].len(), 2);
    }

    #[tokio::test]
    async fn test_sharding_respects_byte_budget() {
        let tuning = EipTuning {
            max_tags_per_request: 100,
            byte_budget_per_request: 256, // minimum after clamping
            tag_overhead_bytes: 120,
            ..EipTuning::default()
        };
        let shared = shared_with_tuning(tuning.clamped());
        let tags: Vec<TagConfig> = (0..4)
            .map(|i| tag(i, &format!("T{}", i), DataKind::Lreal))
            .collect();
        let shards = shared.build_shards(&tags).await;
        // 120 + 8 bytes per tag against a 256-byte budget: 2 per shard
        assert_eq!(shards.len(), 2);
    }

    #[tokio::test]
    async fn test_shards_per_tick_budget() {
        let tuning = EipTuning {
            shard_budget_fraction: 0.5,
            min_shards_per_tick: 1,
            ..EipTuning::default()
        };
        let shared = shared_with_tuning(tuning);
        assert_eq!(shared.shards_per_tick(4).await, 2);
        assert_eq!(shared.shards_per_tick(1).await, 1);
        // min_shards floor
        let tuning = EipTuning {
            shard_budget_fraction: 0.1,
            min_shards_per_tick: 3,
            ..EipTuning::default()
        };
        let shared = shared_with_tuning(tuning);
        assert_eq!(shared.shards_per_tick(10).await, 3);
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let store = SnapshotStore::new();
        let items: Vec<EipTagInfo> = (0..10)
            .map(|i| EipTagInfo {
                instance: i,
                name: format!("T{}", i),
                symbol_type: 0x00C4,
                type_name: "DINT".into(),
            })
            .collect();
        let (id, total) = store.create(items);
        assert_eq!(total, 10);

        let (page, total) = store.page(&id, 4, 3).unwrap();
        assert_eq!(total, 10);
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].name, "T4");

        assert!(store.heartbeat(&id));
        assert!(store.delete(&id));
        assert!(!store.delete(&id));
        assert!(store.page(&id, 0, 10).is_none());
    }

    #[test]
    fn test_cip_type_mapping() {
        assert_eq!(EipDriver::cip_type_for(DataKind::Dint), Some(CipType::DINT));
        assert_eq!(EipDriver::cip_type_for(DataKind::Real), Some(CipType::REAL));
        assert_eq!(EipDriver::cip_type_for(DataKind::String), None);
    }
}
