//! Siemens S7 driver
//!
//! Polling-only. Addresses are parsed by the address codec into
//! (area, kind, offset, bit) records; bit reads fetch the enclosing byte
//! and mask, bit writes perform a read-modify-write of that byte. The
//! read-modify-write is non-atomic on the wire and therefore serialized
//! through the connection write lock.

pub mod address;
pub mod client;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use edge_model::{ConnectionKind, Observation, Quality, S7Params, TagConfig, TagRef, Value};

use self::address::{S7Address, S7Kind};
use self::client::S7Client;
use crate::core::drivers::{
    BrowseItem, Driver, GroupPlan, ObservationSink, TagReading, WriteOutcome, WriteRequest,
    WRITE_TIMEOUT,
};
use crate::core::emitter::{ConnState, StatusPublisher};
use crate::core::reconnect::{ReconnectHelper, ReconnectPolicy};
use crate::core::scheduler::{GroupReader, PollScheduler};
use crate::error::{AcqError, Result};
use crate::utils::bytes::{
    be_f32, be_i16, bit_get, bit_set, value_to_be_f32, value_to_be_i16, value_to_byte,
};

/// Suppression window for repeated per-tag read failure logs
const FAILURE_LOG_WINDOW_SECS: u64 = 30;

struct S7Shared {
    connection_id: String,
    params: S7Params,
    client: Mutex<Option<S7Client>>,
    /// All known tags with their parsed addresses (for one-shot reads
    /// and writes; the scheduler owns the subscribed subset)
    tags: RwLock<HashMap<i64, (TagConfig, S7Address)>>,
    reconnecting: AtomicBool,
    closing: AtomicBool,
    status: Arc<StatusPublisher>,
    last_failure_log: DashMap<i64, Instant>,
}

impl S7Shared {
    async fn open_client(&self) -> Result<S7Client> {
        S7Client::connect(
            &self.params.host,
            self.params.port,
            self.params.rack,
            self.params.slot,
        )
        .await
    }

    /// Read one address; the caller holds the client lock
    async fn read_address(client: &mut S7Client, addr: &S7Address) -> Result<Value> {
        let data = client
            .read_bytes(addr.area, addr.byte, addr.kind.width() as u16)
            .await?;
        decode_value(addr, &data)
    }

    fn log_read_failure(&self, tag_id: i64, error: &AcqError) {
        let now = Instant::now();
        let should_log = self
            .last_failure_log
            .get(&tag_id)
            .map(|last| now.duration_since(*last).as_secs() >= FAILURE_LOG_WINDOW_SECS)
            .unwrap_or(true);
        if should_log {
            self.last_failure_log.insert(tag_id, now);
            warn!("{}: tag {} read failed: {}", self.connection_id, tag_id, error);
        }
    }

    /// Drop the session and start a background reconnect loop
    fn connection_lost(self: Arc<Self>, reason: &str) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::AcqRel) {
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
}

struct S7Reader {
    shared: Arc<S7Shared>,
}

#[async_trait]
impl GroupReader for S7Reader {
    async fn read_group(&self, tags: &[TagConfig]) -> Vec<TagReading> {
        let index = self.shared.tags.read().await;
        let mut guard = self.shared.client.lock().await;
        let Some(client) = guard.as_mut() else {
            return tags.iter().map(|t| TagReading::bad(t.id)).collect();
        };

        let mut readings = Vec::with_capacity(tags.len());
        for tag in tags {
            let Some((_, addr)) = index.get(&tag.id) else {
                readings.push(TagReading::bad(tag.id));
                continue;
            };
            match S7Shared::read_address(client, addr).await {
                Ok(value) => readings.push(TagReading::good(tag.id, value)),
                Err(e) => {
                    self.shared.log_read_failure(tag.id, &e);
                    readings.push(TagReading::bad(tag.id));
                    if matches!(e, AcqError::TransportError(_) | AcqError::TimeoutError(_)) {
                        *guard = None;
                        Arc::clone(&self.shared).connection_lost(&e.to_string());
                        // Remaining tags in this snapshot fail fast
                        for rest in tags.iter().skip(readings.len()) {
                            readings.push(TagReading::bad(rest.id));
                        }
                        break;
                    }
                },
            }
        }
        readings
    }
}

/// S7 protocol driver
pub struct S7Driver {
    shared: Arc<S7Shared>,
    scheduler: PollScheduler,
    write_lock: Mutex<()>,
}

impl S7Driver {
    pub fn new(
        connection_id: impl Into<String>,
        params: S7Params,
        sink: ObservationSink,
        status: Arc<StatusPublisher>,
    ) -> Arc<Self> {
        let connection_id = connection_id.into();
        let shared = Arc::new(S7Shared {
            connection_id: connection_id.clone(),
            params,
            client: Mutex::new(None),
            tags: RwLock::new(HashMap::new()),
            reconnecting: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            status,
            last_failure_log: DashMap::new(),
        });
        let reader = Arc::new(S7Reader {
            shared: Arc::clone(&shared),
        });
        let scheduler = PollScheduler::new(connection_id, reader, sink);
        Arc::new(Self {
            shared,
            scheduler,
            write_lock: Mutex::new(()),
        })
    }

    async fn resolve(&self, tag_id: i64) -> Result<(TagConfig, S7Address)> {
        self.shared
            .tags
            .read()
            .await
            .get(&tag_id)
            .cloned()
            .ok_or_else(|| AcqError::tag(format!("Unknown tag {}", tag_id)))
    }

    /// Execute one write; bit writes read-modify-write the enclosing byte
    async fn write_address(client: &mut S7Client, addr: &S7Address, value: &Value) -> Result<()> {
        match addr.kind {
            S7Kind::Bool => {
                let on = match value {
                    Value::Bool(b) => *b,
                    other => other
                        .as_f64()
                        .map(|v| v != 0.0)
                        .ok_or_else(|| AcqError::tag("Bool write needs a boolean".to_string()))?,
                };
                let current = client.read_bytes(addr.area, addr.byte, 1).await?;
                let byte = *current
                    .first()
                    .ok_or_else(|| AcqError::protocol("Empty byte read".to_string()))?;
                let updated = bit_set(byte, addr.bit, on);
                client.write_bytes(addr.area, addr.byte, &[updated]).await
            },
            S7Kind::Byte => {
                let byte = value_to_byte(value)
                    .ok_or_else(|| AcqError::tag("Byte write out of range".to_string()))?;
                client.write_bytes(addr.area, addr.byte, &[byte]).await
            },
            S7Kind::Int16 => {
                let bytes = value_to_be_i16(value)
                    .ok_or_else(|| AcqError::tag("Int16 write needs a number".to_string()))?;
                client.write_bytes(addr.area, addr.byte, &bytes).await
            },
            S7Kind::Real => {
                let bytes = value_to_be_f32(value)
                    .ok_or_else(|| AcqError::tag("Real write needs a number".to_string()))?;
                client.write_bytes(addr.area, addr.byte, &bytes).await
            },
        }
    }
}

#[async_trait]
impl Driver for S7Driver {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::S7
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self) -> Result<()> {
        self.shared.closing.store(false, Ordering::Release);
        let client = self.shared.open_client().await?;
        *self.shared.client.lock().await = Some(client);
        info!(
            "{}: S7 connected ({}:{} rack {} slot {})",
            self.shared.connection_id,
            self.shared.params.host,
            self.shared.params.port,
            self.shared.params.rack,
            self.shared.params.slot
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::Release);
        self.scheduler.stop().await;
        *self.shared.client.lock().await = None;
        debug!("{}: S7 disconnected", self.shared.connection_id);
        Ok(())
    }

    async fn apply_tag_subscriptions(&self, groups: Vec<GroupPlan>) -> Result<()> {
        // Validate every address up front; a bad address refuses the set
        let mut index = HashMap::new();
        for plan in &groups {
            for tag in &plan.tags {
                let addr: S7Address = tag.path.parse()?;
                index.insert(tag.id, (tag.clone(), addr));
            }
        }
        let count = index.len();
        *self.shared.tags.write().await = index;
        self.scheduler.apply(groups).await;
        info!("{}: {} S7 tags subscribed", self.shared.connection_id, count);
        Ok(())
    }

    async fn read_one(&self, tag_ids: &[i64]) -> Result<Vec<Observation>> {
        let index = self.shared.tags.read().await;
        let mut guard = self.shared.client.lock().await;
        let now = Utc::now();
        let mut observations = Vec::with_capacity(tag_ids.len());
        for &tag_id in tag_ids {
            let reading = match (index.get(&tag_id), guard.as_mut()) {
                (Some((_, addr)), Some(client)) => {
                    match S7Shared::read_address(client, addr).await {
                        Ok(value) => (value, Quality::Good),
                        Err(_) => (Value::Null, Quality::Bad),
                    }
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
        // One write operation in flight per connection; this also
        // serializes read-modify-write cycles targeting the same byte
        let _write_guard = self.write_lock.lock().await;
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = async {
                let (_, addr) = self.resolve(request.tag_id).await?;
                let mut guard = self.shared.client.lock().await;
                let client = guard
                    .as_mut()
                    .ok_or_else(|| AcqError::transport("Not connected".to_string()))?;
                tokio::time::timeout(
                    WRITE_TIMEOUT,
                    Self::write_address(client, &addr, &request.value),
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

    async fn browse(&self, _node: Option<&str>) -> Result<Vec<BrowseItem>> {
        Err(AcqError::protocol("S7 does not support browse".to_string()))
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
}

/// Decode raw PLC bytes per the address kind
fn decode_value(addr: &S7Address, data: &[u8]) -> Result<Value> {
    let short = || AcqError::protocol(format!("Short read for {}", addr));
    match addr.kind {
        S7Kind::Bool => {
            let byte = *data.first().ok_or_else(short)?;
            Ok(Value::Bool(bit_get(byte, addr.bit)))
        },
        S7Kind::Byte => Ok(Value::Int(*data.first().ok_or_else(short)? as i64)),
        S7Kind::Int16 => Ok(Value::Int(be_i16(data).ok_or_else(short)? as i64)),
        S7Kind::Real => Ok(Value::Float(be_f32(data).ok_or_else(short)? as f64)),
    }
}
