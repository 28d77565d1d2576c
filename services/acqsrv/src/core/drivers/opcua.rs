//! OPC UA client driver
//!
//! Session-based: subscriptions are created per poll group with the
//! publishing interval equal to the group rate, and monitored items per
//! tag. The OPC UA deadband filter stays disabled; the generic change
//! detector applies instead so policy is uniform across protocols. The
//! underlying client library is synchronous, so session calls run under
//! `spawn_blocking` and data-change callbacks hand off to the sink with
//! a non-blocking send.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use opcua::client::prelude::*;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use edge_model::{
    ConnectionKind, Observation, OpcuaParams, Quality, TagConfig, TagRef, Value,
};

use crate::core::change::{should_publish, LastSeen};
use crate::core::drivers::{
    BrowseItem, Driver, GroupPlan, ObservationSink, WriteOutcome, WriteRequest,
};
use crate::core::emitter::StatusPublisher;
use crate::error::{AcqError, Result};

type SharedSession = Arc<opcua::sync::RwLock<Session>>;

/// Monitored-item bookkeeping for one tag
#[derive(Debug, Clone)]
struct MonitoredTag {
    tag: TagConfig,
    subscription_id: u32,
    monitored_item_id: u32,
}

struct OpcuaShared {
    connection_id: String,
    sink: ObservationSink,
    /// client_handle -> tag, consulted from the data-change callback
    handle_to_tag: DashMap<u32, TagConfig>,
    last_seen: DashMap<i64, LastSeen>,
}

impl OpcuaShared {
    /// Data-change delivery; runs on the client library's thread
    fn deliver(&self, client_handle: u32, data_value: &DataValue) {
        let Some(tag) = self.handle_to_tag.get(&client_handle) else {
            return;
        };
        let value = data_value
            .value
            .as_ref()
            .map(variant_to_value)
            .unwrap_or(Value::Null);
        let quality = match data_value.status {
            Some(status) if status.is_bad() => Quality::Bad,
            Some(status) if status.is_uncertain() => Quality::Uncertain,
            _ => Quality::Good,
        };
        let ts = data_value
            .source_timestamp
            .as_ref()
            .map(|dt| dt.as_chrono())
            .unwrap_or_else(Utc::now);

        let publish = {
            let prev = self.last_seen.get(&tag.id);
            should_publish(prev.as_deref(), &value, quality, ts, &tag.policy)
        };
        if !publish {
            return;
        }
        self.last_seen
            .insert(tag.id, LastSeen::new(value.clone(), quality, ts));
        let obs = Observation {
            connection_id: self.connection_id.clone(),
            tag: TagRef::Id(tag.id),
            ts,
            value,
            quality,
        };
        // Non-blocking: the emitter applies backpressure by dropping here
        if self.sink.try_send(obs).is_err() {
            debug!("{}: observation sink full, dropped", self.connection_id);
        }
    }
}

/// OPC UA protocol driver
pub struct OpcuaDriver {
    shared: Arc<OpcuaShared>,
    params: OpcuaParams,
    status: Arc<StatusPublisher>,
    session: Mutex<Option<SharedSession>>,
    /// tag id -> monitored item bookkeeping
    monitored: Mutex<HashMap<i64, MonitoredTag>>,
    /// Subscription ids by poll group
    subscriptions: Mutex<Vec<u32>>,
    next_client_handle: std::sync::atomic::AtomicU32,
    write_lock: Mutex<()>,
    rpc_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OpcuaDriver {
    /// Start serving browse/attribute RPCs on the bus
    pub async fn start_rpc_task(self: Arc<Self>, bus: Arc<dyn edge_bus::Bus>) {
        let subject = edge_bus::subjects::rpc_opcua(&self.shared.connection_id);
        let mut subscription = match bus.subscribe(&subject).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("{}: RPC subscribe failed: {}", self.shared.connection_id, e);
                return;
            },
        };
        let driver = Arc::clone(&self);
        let mut slot = self.rpc_task.lock().await;
        *slot = Some(tokio::spawn(async move {
            while let Some(msg) = subscription.next().await {
                let envelope: edge_bus::RpcEnvelope = match serde_json::from_slice(&msg.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!("{}: bad RPC envelope: {}", driver.shared.connection_id, e);
                        continue;
                    },
                };
                let reply = match driver.handle_rpc(&envelope.body).await {
                    Ok(result) => result,
                    Err(e) => serde_json::json!({"error": e.to_string()}),
                };
                if let Err(e) = bus.publish_json(&envelope.reply_to, &reply).await {
                    warn!("{}: RPC reply failed: {}", driver.shared.connection_id, e);
                }
            }
        }));
    }

    async fn handle_rpc(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let action = body.get("action").and_then(|a| a.as_str()).unwrap_or("");
        let node = body.get("node").and_then(|n| n.as_str());
        match action {
            "browse" => {
                let items = tokio::time::timeout(
                    crate::core::drivers::BROWSE_TIMEOUT,
                    self.browse(node),
                )
                .await??;
                Ok(serde_json::json!({"items": items}))
            },
            "attributes" => {
                let node = node
                    .ok_or_else(|| AcqError::config("node required".to_string()))?;
                let attrs = tokio::time::timeout(
                    crate::core::drivers::BROWSE_TIMEOUT,
                    self.read_attributes(node),
                )
                .await??;
                Ok(attrs)
            },
            other => Err(AcqError::config(format!("Unknown OPC UA action '{}'", other))),
        }
    }

    /// Read the browse name, display name, node class and (for variables)
    /// data type of one node
    async fn read_attributes(&self, path: &str) -> Result<serde_json::Value> {
        let node = self.parse_node(path)?;
        let session = self.session_handle().await?;
        let path = path.to_string();
        tokio::task::spawn_blocking(move || -> Result<serde_json::Value> {
            let wanted = [
                AttributeId::BrowseName,
                AttributeId::DisplayName,
                AttributeId::NodeClass,
                AttributeId::DataType,
            ];
            let reads: Vec<ReadValueId> = wanted
                .iter()
                .map(|attribute| ReadValueId {
                    node_id: node.clone(),
                    attribute_id: *attribute as u32,
                    index_range: UAString::null(),
                    data_encoding: QualifiedName::null(),
                })
                .collect();
            let values = session
                .read()
                .read(&reads, TimestampsToReturn::Neither, 0.0)
                .map_err(|status| AcqError::protocol(format!("read attributes: {}", status)))?;

            let rendered: Vec<serde_json::Value> = values
                .iter()
                .map(|data_value| match &data_value.value {
                    Some(variant) => serde_json::Value::String(format!("{:?}", variant)),
                    None => serde_json::Value::Null,
                })
                .collect();
            Ok(serde_json::json!({
                "node": path,
                "browse_name": rendered.first().cloned().unwrap_or(serde_json::Value::Null),
                "display_name": rendered.get(1).cloned().unwrap_or(serde_json::Value::Null),
                "node_class": rendered.get(2).cloned().unwrap_or(serde_json::Value::Null),
                "data_type": rendered.get(3).cloned().unwrap_or(serde_json::Value::Null),
            }))
        })
        .await
        .map_err(|e| AcqError::internal(e.to_string()))?
    }

    pub fn new(
        connection_id: impl Into<String>,
        params: OpcuaParams,
        sink: ObservationSink,
        status: Arc<StatusPublisher>,
    ) -> Arc<Self> {
        let connection_id = connection_id.into();
        Arc::new(Self {
            shared: Arc::new(OpcuaShared {
                connection_id,
                sink,
                handle_to_tag: DashMap::new(),
                last_seen: DashMap::new(),
            }),
            params,
            status,
            session: Mutex::new(None),
            monitored: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            next_client_handle: std::sync::atomic::AtomicU32::new(1),
            write_lock: Mutex::new(()),
            rpc_task: Mutex::new(None),
        })
    }

    async fn session_handle(&self) -> Result<SharedSession> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| AcqError::transport("Not connected".to_string()))
    }

    fn parse_node(&self, path: &str) -> Result<NodeId> {
        NodeId::from_str(path)
            .map_err(|_| AcqError::config(format!("Invalid NodeId '{}'", path)))
    }
}

#[async_trait]
impl Driver for OpcuaDriver {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::OpcuaClient
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self) -> Result<()> {
        let params = self.params.clone();
        let connection_id = self.shared.connection_id.clone();

        let session = tokio::task::spawn_blocking(move || -> Result<SharedSession> {
            let mut client = ClientBuilder::new()
                .application_name("acqsrv")
                .application_uri("urn:acqsrv")
                .product_uri("urn:acqsrv")
                .trust_server_certs(params.trust_server_certs)
                .create_sample_keypair(true)
                .session_retry_limit(0)
                .session_timeout(params.session_timeout_ms as u32)
                .client()
                .ok_or_else(|| AcqError::config("OPC UA client build failed".to_string()))?;

            let identity = match (&params.username, &params.password) {
                (Some(username), Some(password)) => {
                    IdentityToken::UserName(username.clone(), password.clone())
                },
                _ => IdentityToken::Anonymous,
            };
            let endpoint: EndpointDescription = (
                params.endpoint.as_str(),
                SecurityPolicy::None.to_str(),
                MessageSecurityMode::None,
                UserTokenPolicy::anonymous(),
            )
                .into();

            let session = client
                .connect_to_endpoint(endpoint, identity)
                .map_err(|status| classify_status(&params.endpoint, status))?;

            // The session needs its run loop for publish processing
            let run_session = session.clone();
            std::thread::Builder::new()
                .name(format!("opcua-{}", connection_id))
                .spawn(move || {
                    Session::run(run_session);
                })
                .map_err(|e| AcqError::internal(e.to_string()))?;

            Ok(session)
        })
        .await
        .map_err(|e| AcqError::internal(e.to_string()))??;

        *self.session.lock().await = Some(session);
        info!(
            "{}: OPC UA session up ({})",
            self.shared.connection_id, self.params.endpoint
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(session) = self.session.lock().await.take() {
            let _ = tokio::task::spawn_blocking(move || {
                session.write().disconnect();
            })
            .await;
            self.status
                .set_state(
                    &self.shared.connection_id,
                    crate::core::emitter::ConnState::Disconnected,
                    Some("session closed"),
                )
                .await;
        }
        if let Some(handle) = self.rpc_task.lock().await.take() {
            handle.abort();
        }
        self.monitored.lock().await.clear();
        self.subscriptions.lock().await.clear();
        self.shared.handle_to_tag.clear();
        debug!("{}: OPC UA disconnected", self.shared.connection_id);
        Ok(())
    }

    async fn apply_tag_subscriptions(&self, groups: Vec<GroupPlan>) -> Result<()> {
        // Validate NodeIds before touching the live session
        let mut parsed: Vec<(u64, Vec<(TagConfig, NodeId)>)> = Vec::new();
        for plan in &groups {
            if !plan.group.enabled || plan.tags.is_empty() {
                continue;
            }
            let mut tags = Vec::with_capacity(plan.tags.len());
            for tag in &plan.tags {
                tags.push((tag.clone(), self.parse_node(&tag.path)?));
            }
            parsed.push((plan.group.rate_ms, tags));
        }

        let session = self.session_handle().await?;

        // Replace atomically: delete previous subscriptions, then build
        // the new set per poll group
        let old_subscriptions: Vec<u32> = self.subscriptions.lock().await.drain(..).collect();
        self.monitored.lock().await.clear();
        self.shared.handle_to_tag.clear();

        let shared = Arc::clone(&self.shared);
        let (subscription_ids, monitored) = {
            let next_handle = &self.next_client_handle;
            let mut assignments: Vec<(u64, Vec<(TagConfig, NodeId, u32)>)> = Vec::new();
            for (rate_ms, tags) in parsed {
                let tags = tags
                    .into_iter()
                    .map(|(tag, node)| {
                        let handle = next_handle
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        (tag, node, handle)
                    })
                    .collect();
                assignments.push((rate_ms, tags));
            }

            tokio::task::spawn_blocking(move || -> Result<(Vec<u32>, HashMap<i64, MonitoredTag>)> {
                let session = session.read();
                for subscription_id in old_subscriptions {
                    let _ = session.delete_subscription(subscription_id);
                }

                let mut subscription_ids = Vec::new();
                let mut monitored = HashMap::new();
                for (rate_ms, tags) in assignments {
                    let callback_shared = Arc::clone(&shared);
                    let subscription_id = session
                        .create_subscription(
                            rate_ms as f64,
                            30,
                            10,
                            0,
                            0,
                            true,
                            DataChangeCallback::new(move |changed_items| {
                                for item in changed_items {
                                    callback_shared.deliver(
                                        item.client_handle(),
                                        item.last_value(),
                                    );
                                }
                            }),
                        )
                        .map_err(|status| {
                            AcqError::protocol(format!("create_subscription: {}", status))
                        })?;
                    subscription_ids.push(subscription_id);

                    let requests: Vec<MonitoredItemCreateRequest> = tags
                        .iter()
                        .map(|(tag, node, handle)| MonitoredItemCreateRequest {
                            item_to_monitor: ReadValueId {
                                node_id: node.clone(),
                                attribute_id: AttributeId::Value as u32,
                                index_range: UAString::null(),
                                data_encoding: QualifiedName::null(),
                            },
                            monitoring_mode: MonitoringMode::Reporting,
                            requested_parameters: MonitoringParameters {
                                client_handle: *handle,
                                sampling_interval: rate_ms as f64,
                                // Server deadband filter off; the generic
                                // change detector is authoritative
                                filter: ExtensionObject::null(),
                                queue_size: queue_size_for(tag),
                                discard_oldest: true,
                            },
                        })
                        .collect();

                    let results = session
                        .create_monitored_items(
                            subscription_id,
                            TimestampsToReturn::Both,
                            &requests,
                        )
                        .map_err(|status| {
                            AcqError::protocol(format!("create_monitored_items: {}", status))
                        })?;

                    for ((tag, _, handle), result) in tags.iter().zip(results) {
                        shared.handle_to_tag.insert(*handle, tag.clone());
                        monitored.insert(
                            tag.id,
                            MonitoredTag {
                                tag: tag.clone(),
                                subscription_id,
                                monitored_item_id: result.monitored_item_id,
                            },
                        );
                    }
                }
                Ok((subscription_ids, monitored))
            })
            .await
            .map_err(|e| AcqError::internal(e.to_string()))??
        };

        let count = monitored.len();
        *self.subscriptions.lock().await = subscription_ids;
        *self.monitored.lock().await = monitored;
        info!(
            "{}: {} OPC UA monitored items across {} subscriptions",
            self.shared.connection_id,
            count,
            self.subscriptions.lock().await.len()
        );
        Ok(())
    }

    async fn read_one(&self, tag_ids: &[i64]) -> Result<Vec<Observation>> {
        let monitored = self.monitored.lock().await;
        let mut nodes = Vec::new();
        let mut order = Vec::new();
        for &tag_id in tag_ids {
            match monitored.get(&tag_id) {
                Some(entry) => {
                    let node = self.parse_node(&entry.tag.path)?;
                    nodes.push(ReadValueId {
                        node_id: node,
                        attribute_id: AttributeId::Value as u32,
                        index_range: UAString::null(),
                        data_encoding: QualifiedName::null(),
                    });
                    order.push((tag_id, true));
                },
                None => order.push((tag_id, false)),
            }
        }
        drop(monitored);

        let session = self.session_handle().await?;
        let connection_id = self.shared.connection_id.clone();
        let values = tokio::task::spawn_blocking(move || -> Result<Vec<DataValue>> {
            session
                .read()
                .read(&nodes, TimestampsToReturn::Both, 0.0)
                .map_err(|status| AcqError::protocol(format!("read: {}", status)))
        })
        .await
        .map_err(|e| AcqError::internal(e.to_string()))??;

        let now = Utc::now();
        let mut value_iter = values.into_iter();
        Ok(order
            .into_iter()
            .map(|(tag_id, known)| {
                let (value, quality) = if known {
                    match value_iter.next() {
                        Some(data_value) => {
                            let quality = match data_value.status {
                                Some(status) if status.is_bad() => Quality::Bad,
                                Some(status) if status.is_uncertain() => Quality::Uncertain,
                                _ => Quality::Good,
                            };
                            let value = data_value
                                .value
                                .as_ref()
                                .map(variant_to_value)
                                .unwrap_or(Value::Null);
                            (value, quality)
                        },
                        None => (Value::Null, Quality::Bad),
                    }
                } else {
                    (Value::Null, Quality::Bad)
                };
                Observation {
                    connection_id: connection_id.clone(),
                    tag: TagRef::Id(tag_id),
                    ts: now,
                    value,
                    quality,
                }
            })
            .collect())
    }

    async fn write(&self, requests: &[WriteRequest]) -> Result<Vec<WriteOutcome>> {
        let _write_guard = self.write_lock.lock().await;
        let monitored = self.monitored.lock().await;
        let mut writes = Vec::new();
        let mut order = Vec::new();
        for request in requests {
            match monitored.get(&request.tag_id) {
                Some(entry) => {
                    let node = self.parse_node(&entry.tag.path)?;
                    writes.push(WriteValue {
                        node_id: node,
                        attribute_id: AttributeId::Value as u32,
                        index_range: UAString::null(),
                        value: DataValue::value_only(value_to_variant(&request.value)),
                    });
                    order.push((request.tag_id, true));
                },
                None => order.push((request.tag_id, false)),
            }
        }
        drop(monitored);

        let session = self.session_handle().await?;
        let statuses = tokio::task::spawn_blocking(move || -> Result<Vec<StatusCode>> {
            session
                .read()
                .write(&writes)
                .map_err(|status| AcqError::protocol(format!("write: {}", status)))
        })
        .await
        .map_err(|e| AcqError::internal(e.to_string()))??;

        let mut status_iter = statuses.into_iter();
        Ok(order
            .into_iter()
            .map(|(tag_id, known)| {
                if !known {
                    return WriteOutcome::failure(tag_id, "unknown tag");
                }
                match status_iter.next() {
                    Some(status) if status.is_good() => WriteOutcome::success(tag_id),
                    Some(status) => WriteOutcome::failure(tag_id, status.to_string()),
                    None => WriteOutcome::failure(tag_id, "no result"),
                }
            })
            .collect())
    }

    async fn browse(&self, node: Option<&str>) -> Result<Vec<BrowseItem>> {
        let start = match node {
            Some(path) => self.parse_node(path)?,
            None => ObjectId::ObjectsFolder.into(),
        };
        let session = self.session_handle().await?;
        let results = tokio::task::spawn_blocking(move || -> Result<Vec<BrowseItem>> {
            let description = BrowseDescription {
                node_id: start,
                browse_direction: BrowseDirection::Forward,
                reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
                include_subtypes: true,
                node_class_mask: 0,
                result_mask: BrowseResultMask::All as u32,
            };
            let results = session
                .read()
                .browse(&[description])
                .map_err(|status| AcqError::protocol(format!("browse: {}", status)))?
                .unwrap_or_default();

            let mut items = Vec::new();
            for result in results {
                let Some(references) = result.references else { continue };
                for reference in references {
                    let node_class = format!("{:?}", reference.node_class);
                    items.push(BrowseItem {
                        address: reference.node_id.node_id.to_string(),
                        name: reference.browse_name.name.to_string(),
                        display_name: reference.display_name.text.to_string(),
                        data_type: (reference.node_class == NodeClass::Variable)
                            .then(|| reference.type_definition.node_id.to_string()),
                        node_class,
                    });
                }
            }
            Ok(items)
        })
        .await
        .map_err(|e| AcqError::internal(e.to_string()))??;
        Ok(results)
    }

    async fn list_active_tag_ids(&self) -> HashSet<i64> {
        self.monitored.lock().await.keys().copied().collect()
    }

    async fn remove_tag(&self, tag_id: i64) -> Result<()> {
        let Some(entry) = self.monitored.lock().await.remove(&tag_id) else {
            return Ok(());
        };
        self.shared.last_seen.remove(&tag_id);
        self.shared
            .handle_to_tag
            .retain(|_, tag| tag.id != tag_id);

        if let Ok(session) = self.session_handle().await {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = session.read().delete_monitored_items(
                    entry.subscription_id,
                    &[entry.monitored_item_id],
                );
            })
            .await;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.session.lock().await.as_ref() {
            Some(session) => {
                let session = session.clone();
                tokio::task::spawn_blocking(move || session.read().is_connected())
                    .await
                    .unwrap_or(false)
            },
            None => false,
        }
    }
}

/// Monitored-item queue size from the tag policy: heartbeat-only tags
/// keep a single slot, change-detected tags buffer a few notifications
fn queue_size_for(tag: &TagConfig) -> u32 {
    if tag.policy.enabled {
        10
    } else {
        1
    }
}

/// Classify a connect failure status
fn classify_status(endpoint: &str, status: StatusCode) -> AcqError {
    let auth = matches!(
        status,
        StatusCode::BadIdentityTokenRejected
            | StatusCode::BadIdentityTokenInvalid
            | StatusCode::BadUserAccessDenied
            | StatusCode::BadCertificateUntrusted
            | StatusCode::BadSecurityChecksFailed
    );
    if auth {
        AcqError::auth(format!("OPC UA {}: {}", endpoint, status))
    } else {
        AcqError::transport(format!("OPC UA {}: {}", endpoint, status))
    }
}

/// Convert an OPC UA variant to a telemetry value
fn variant_to_value(variant: &Variant) -> Value {
    match variant {
        Variant::Boolean(b) => Value::Bool(*b),
        Variant::SByte(v) => Value::Int(*v as i64),
        Variant::Byte(v) => Value::Int(*v as i64),
        Variant::Int16(v) => Value::Int(*v as i64),
        Variant::UInt16(v) => Value::Int(*v as i64),
        Variant::Int32(v) => Value::Int(*v as i64),
        Variant::UInt32(v) => Value::Int(*v as i64),
        Variant::Int64(v) => Value::Int(*v),
        Variant::UInt64(v) => Value::Int(*v as i64),
        Variant::Float(v) => Value::Float(*v as f64),
        Variant::Double(v) => Value::Float(*v),
        Variant::String(s) => Value::Text(s.to_string()),
        Variant::Empty => Value::Null,
        other => Value::Text(format!("{:?}", other)),
    }
}

/// Convert a telemetry value to an OPC UA variant for writes
fn value_to_variant(value: &Value) -> Variant {
    match value {
        Value::Bool(b) => Variant::Boolean(*b),
        Value::Int(i) => Variant::Int64(*i),
        Value::Float(f) => Variant::Double(*f),
        Value::Text(s) => Variant::String(UAString::from(s.as_str())),
        Value::Null => Variant::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_model::ChangePolicy;

    #[test]
    fn test_variant_conversion() {
        assert_eq!(variant_to_value(&Variant::Double(1.5)), Value::Float(1.5));
        assert_eq!(variant_to_value(&Variant::Int32(-3)), Value::Int(-3));
        assert_eq!(variant_to_value(&Variant::Boolean(true)), Value::Bool(true));
        assert_eq!(variant_to_value(&Variant::Empty), Value::Null);
        assert_eq!(
            variant_to_value(&Variant::String(UAString::from("run"))),
            Value::Text("run".into())
        );
    }

    #[test]
    fn test_value_to_variant_round_trip() {
        for value in [
            Value::Bool(false),
            Value::Int(42),
            Value::Float(2.5),
            Value::Text("x".into()),
            Value::Null,
        ] {
            assert_eq!(variant_to_value(&value_to_variant(&value)), value);
        }
    }

    #[test]
    fn test_queue_size_from_policy() {
        let mut tag = TagConfig {
            id: 1,
            connection_id: "ua-1".into(),
            path: "ns=2;s=Speed".into(),
            name: "speed".into(),
            kind: edge_model::DataKind::Real,
            poll_group_id: 1,
            subscribe: true,
            unit: None,
            policy: ChangePolicy::default(),
            status: edge_model::TagStatus::Active,
        };
        assert_eq!(queue_size_for(&tag), 1);
        tag.policy.enabled = true;
        assert_eq!(queue_size_for(&tag), 10);
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status("opc.tcp://x", StatusCode::BadIdentityTokenRejected),
            AcqError::AuthError(_)
        ));
        assert!(matches!(
            classify_status("opc.tcp://x", StatusCode::BadConnectionClosed),
            AcqError::TransportError(_)
        ));
    }
}
