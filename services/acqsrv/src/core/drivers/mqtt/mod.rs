//! MQTT driver
//!
//! Built over rumqttc. Ingress: subscribed topics (tag paths and wildcard
//! subscriptions with extractors/field mappings) become observations;
//! Sparkplug B payloads are decoded when the connection runs the
//! sparkplug protocol variant. Egress lives in the publisher engine.

pub mod extract;
pub mod publisher;
pub mod sparkplug;
pub mod topic;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use edge_model::{
    ConnectionKind, MqttParams, MqttProtocolVariant, MqttSubscriptionConfig, Observation,
    OnFailure, PayloadFormat, Quality, TagConfig, TagRef, Value,
};

use self::extract::{extract_quality, extract_timestamp, json_path, parse_raw_value, validate_path};
use self::sparkplug::decode_payload;
use self::topic::{topic_matches, SparkplugTopic, SPARKPLUG_NAMESPACE};
use crate::core::change::{should_publish, LastSeen};
use crate::core::drivers::{
    BrowseItem, Driver, GroupPlan, ObservationSink, WriteOutcome, WriteRequest, CONNECT_TIMEOUT,
};
use crate::core::emitter::{ConnState, StatusPublisher};
use crate::error::{AcqError, Result};

/// Map a numeric QoS onto the client enum
pub(crate) fn qos_of(level: u8) -> QoS {
    match level {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

struct MqttShared {
    connection_id: String,
    params: MqttParams,
    sink: ObservationSink,
    status: Arc<StatusPublisher>,
    client: RwLock<Option<AsyncClient>>,
    /// Topic-addressed tags (tag.path is an MQTT topic filter)
    tags: RwLock<HashMap<i64, TagConfig>>,
    /// Wildcard subscriptions with extractors and field mappings
    subscriptions: RwLock<Vec<MqttSubscriptionConfig>>,
    last_seen: DashMap<i64, LastSeen>,
    connected: AtomicBool,
    closing: AtomicBool,
    /// Sparkplug ingress bookkeeping: endpoint scope -> metric names
    /// announced in the last Birth
    birth_metrics: DashMap<String, Vec<String>>,
    /// Endpoints already warned about DATA-before-BIRTH
    warned_unbirthed: DashMap<String, ()>,
}

impl MqttShared {
    async fn subscribe_all(&self) {
        let client = self.client.read().await;
        let Some(client) = client.as_ref() else { return };

        let mut filters: HashMap<String, u8> = HashMap::new();
        for tag in self.tags.read().await.values() {
            filters.entry(tag.path.clone()).or_insert(0);
        }
        for sub in self.subscriptions.read().await.iter() {
            let entry = filters.entry(sub.topic.clone()).or_insert(0);
            *entry = (*entry).max(sub.qos);
        }
        if self.params.protocol == MqttProtocolVariant::Sparkplug {
            filters
                .entry(format!("{}/#", SPARKPLUG_NAMESPACE))
                .or_insert(0);
        }
        for (filter, qos) in filters {
            if let Err(e) = client.subscribe(&filter, qos_of(qos)).await {
                warn!("{}: subscribe '{}' failed: {}", self.connection_id, filter, e);
            }
        }
    }

    /// Route one inbound publish to observations
    async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        if self.params.protocol == MqttProtocolVariant::Sparkplug
            && topic.starts_with(SPARKPLUG_NAMESPACE)
        {
            self.handle_sparkplug(topic, payload).await;
            return;
        }

        // Wildcard subscriptions with extractors / field mappings
        let subscriptions = self.subscriptions.read().await.clone();
        for sub in subscriptions
            .iter()
            .filter(|s| topic_matches(&s.topic, topic))
        {
            self.handle_subscription(sub, topic, payload).await;
        }

        // Topic-addressed tags go through change detection
        let tags: Vec<TagConfig> = self
            .tags
            .read()
            .await
            .values()
            .filter(|t| topic_matches(&t.path, topic))
            .cloned()
            .collect();
        for tag in tags {
            let value = match serde_json::from_slice::<serde_json::Value>(payload) {
                Ok(doc) => json_path(&doc, "v")
                    .or(json_path(&doc, "value"))
                    .map(Value::from_json)
                    .unwrap_or_else(|| Value::from_json(&doc)),
                Err(_) => parse_raw_value(payload),
            };
            self.emit_tag(&tag, value, Quality::Good).await;
        }
    }

    async fn handle_subscription(
        &self,
        sub: &MqttSubscriptionConfig,
        topic: &str,
        payload: &[u8],
    ) {
        match sub.payload_format {
            PayloadFormat::Raw => {
                let value = parse_raw_value(payload);
                self.emit_path(topic, value, Quality::Good, None).await;
            },
            PayloadFormat::Json => {
                let doc: serde_json::Value = match serde_json::from_slice(payload) {
                    Ok(doc) => doc,
                    Err(e) => {
                        debug!("{}: non-JSON payload on {}: {}", self.connection_id, topic, e);
                        return;
                    },
                };

                if !sub.field_mappings.is_empty() {
                    for mapping in &sub.field_mappings {
                        let extracted = json_path(&doc, &mapping.field_path)
                            .map(Value::from_json)
                            .filter(|v| !v.is_null());
                        match (extracted, mapping.on_failure) {
                            (Some(value), _) => {
                                self.emit_mapped(mapping.tag_id, value, Quality::Good).await;
                            },
                            (None, OnFailure::UseNull) => {
                                self.emit_mapped(mapping.tag_id, Value::Null, Quality::Bad).await;
                            },
                            (None, OnFailure::Skip) => {},
                        }
                    }
                    return;
                }

                let value = match &sub.value_path {
                    Some(path) => match json_path(&doc, path) {
                        Some(node) => Value::from_json(node),
                        None => return,
                    },
                    None => Value::from_json(&doc),
                };
                let ts = sub
                    .ts_path
                    .as_deref()
                    .and_then(|p| json_path(&doc, p))
                    .and_then(extract_timestamp);
                let quality = sub
                    .quality_path
                    .as_deref()
                    .and_then(|p| json_path(&doc, p))
                    .and_then(extract_quality)
                    .unwrap_or(Quality::Good);
                self.emit_path(topic, value, quality, ts).await;
            },
        }
    }

    async fn handle_sparkplug(&self, raw_topic: &str, payload: &[u8]) {
        let parsed = match SparkplugTopic::parse(raw_topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("{}: {}", self.connection_id, e);
                return;
            },
        };
        let kind = parsed.kind;
        // NCMD/DCMD and anything else are not telemetry
        if !kind.is_birth() && !kind.is_data() && !kind.is_death() {
            return;
        }

        let scope = match &parsed.device_id {
            Some(device) => format!("{}/{}/{}", parsed.group_id, parsed.edge_node_id, device),
            None => format!("{}/{}", parsed.group_id, parsed.edge_node_id),
        };

        if kind.is_death() {
            // Retract: everything announced by the Birth goes bad
            if let Some((_, metrics)) = self.birth_metrics.remove(&scope) {
                let now = Utc::now();
                for name in metrics {
                    let path = format!("{}/{}/{}", SPARKPLUG_NAMESPACE, scope, name);
                    self.emit_path_at(&path, Value::Null, Quality::Bad, now).await;
                }
            }
            return;
        }

        let message = match decode_payload(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("{}: {} on {}", self.connection_id, e, raw_topic);
                return;
            },
        };

        if kind.is_birth() {
            let names: Vec<String> = message
                .metrics
                .iter()
                .filter_map(|m| m.name.clone())
                .collect();
            self.birth_metrics.insert(scope.clone(), names);
            self.warned_unbirthed.remove(&scope);
        } else if !self.birth_metrics.contains_key(&scope)
            && self.warned_unbirthed.insert(scope.clone(), ()).is_none()
        {
            warn!("{}: DATA before BIRTH from {}", self.connection_id, scope);
        }

        let now = Utc::now();
        for metric in &message.metrics {
            let Some(name) = metric.name.as_deref() else { continue };
            let path = format!("{}/{}/{}", SPARKPLUG_NAMESPACE, scope, name);
            let ts = metric
                .timestamp
                .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64))
                .unwrap_or(now);
            self.emit_path_at(&path, metric.to_value(), Quality::Good, ts).await;
        }
    }

    /// Emit for a configured tag, applying its change policy
    async fn emit_tag(&self, tag: &TagConfig, value: Value, quality: Quality) {
        let now = Utc::now();
        let publish = {
            let prev = self.last_seen.get(&tag.id);
            should_publish(prev.as_deref(), &value, quality, now, &tag.policy)
        };
        if !publish {
            return;
        }
        self.last_seen
            .insert(tag.id, LastSeen::new(value.clone(), quality, now));
        let _ = self
            .sink
            .send(Observation {
                connection_id: self.connection_id.clone(),
                tag: TagRef::Id(tag.id),
                ts: now,
                value,
                quality,
            })
            .await;
    }

    async fn emit_mapped(&self, tag_id: i64, value: Value, quality: Quality) {
        if let Some(tag) = self.tags.read().await.get(&tag_id).cloned() {
            self.emit_tag(&tag, value, quality).await;
            return;
        }
        // Mapped to a tag this driver does not own; emit without policy
        let _ = self
            .sink
            .send(Observation {
                connection_id: self.connection_id.clone(),
                tag: TagRef::Id(tag_id),
                ts: Utc::now(),
                value,
                quality,
            })
            .await;
    }

    async fn emit_path(
        &self,
        path: &str,
        value: Value,
        quality: Quality,
        ts: Option<chrono::DateTime<Utc>>,
    ) {
        self.emit_path_at(path, value, quality, ts.unwrap_or_else(Utc::now))
            .await;
    }

    async fn emit_path_at(
        &self,
        path: &str,
        value: Value,
        quality: Quality,
        ts: chrono::DateTime<Utc>,
    ) {
        let _ = self
            .sink
            .send(Observation {
                connection_id: self.connection_id.clone(),
                tag: TagRef::Path(path.to_string()),
                ts,
                value,
                quality,
            })
            .await;
    }
}

/// MQTT protocol driver
pub struct MqttDriver {
    shared: Arc<MqttShared>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    write_lock: Mutex<()>,
}

impl MqttDriver {
    pub fn new(
        connection_id: impl Into<String>,
        params: MqttParams,
        sink: ObservationSink,
        status: Arc<StatusPublisher>,
    ) -> Arc<Self> {
        let connection_id = connection_id.into();
        Arc::new(Self {
            shared: Arc::new(MqttShared {
                connection_id,
                params,
                sink,
                status,
                client: RwLock::new(None),
                tags: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(Vec::new()),
                last_seen: DashMap::new(),
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                birth_metrics: DashMap::new(),
                warned_unbirthed: DashMap::new(),
            }),
            event_task: Mutex::new(None),
            write_lock: Mutex::new(()),
        })
    }

    /// The underlying client, for the publisher engine
    pub async fn client(&self) -> Option<AsyncClient> {
        self.shared.client.read().await.clone()
    }

    /// Install wildcard subscriptions (validated extractors included)
    pub async fn set_subscriptions(&self, subscriptions: Vec<MqttSubscriptionConfig>) -> Result<()> {
        for sub in &subscriptions {
            for path in [&sub.value_path, &sub.ts_path, &sub.quality_path]
                .into_iter()
                .flatten()
            {
                validate_path(path)?;
            }
            for mapping in &sub.field_mappings {
                validate_path(&mapping.field_path)?;
            }
        }
        *self.shared.subscriptions.write().await = subscriptions;
        self.shared.subscribe_all().await;
        Ok(())
    }

    fn build_options(&self) -> Result<MqttOptions> {
        let params = &self.shared.params;
        let client_id = params
            .client_id
            .clone()
            .unwrap_or_else(|| format!("acqsrv-{}", self.shared.connection_id));
        let mut options = MqttOptions::new(client_id, params.host.clone(), params.port);
        options.set_keep_alive(Duration::from_secs(params.keep_alive_s.max(5)));
        options.set_clean_session(params.clean_session);
        if let (Some(username), Some(password)) = (&params.username, &params.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        if let Some(ca) = &params.ca_pem {
            let client_auth = match (&params.client_cert_pem, &params.client_key_pem) {
                (Some(cert), Some(key)) => {
                    Some((cert.as_bytes().to_vec(), key.as_bytes().to_vec()))
                },
                (None, None) => None,
                _ => {
                    return Err(AcqError::config(
                        "TLS client auth needs both certificate and key".to_string(),
                    ))
                },
            };
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: ca.as_bytes().to_vec(),
                alpn: None,
                client_auth,
            }));
        }
        Ok(options)
    }
}

#[async_trait]
impl Driver for MqttDriver {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Mqtt
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self) -> Result<()> {
        self.shared.closing.store(false, Ordering::Release);
        let options = self.build_options()?;
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        *self.shared.client.write().await = Some(client);

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        shared.connected.store(true, Ordering::Release);
                        shared
                            .status
                            .set_state(&shared.connection_id, ConnState::Connected, Some("broker session"))
                            .await;
                        shared.subscribe_all().await;
                    },
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        shared.handle_publish(&publish.topic, &publish.payload).await;
                    },
                    Ok(_) => {},
                    Err(e) => {
                        if shared.closing.load(Ordering::Acquire) {
                            return;
                        }
                        let was_connected = shared.connected.swap(false, Ordering::AcqRel);
                        if was_connected {
                            shared
                                .status
                                .set_state(
                                    &shared.connection_id,
                                    ConnState::Disconnected,
                                    Some(&e.to_string()),
                                )
                                .await;
                        }
                        // The event loop reconnects on the next poll;
                        // pace it so a dead broker does not spin
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    },
                }
            }
        });
        *self.event_task.lock().await = Some(handle);

        // Wait for the first ConnAck so connect() reports real failures
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        while !self.shared.connected.load(Ordering::Acquire) {
            if tokio::time::Instant::now() >= deadline {
                self.disconnect().await?;
                return Err(AcqError::transport(format!(
                    "MQTT broker {}:{} unreachable",
                    self.shared.params.host, self.shared.params.port
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!(
            "{}: MQTT connected ({}:{}, {:?})",
            self.shared.connection_id,
            self.shared.params.host,
            self.shared.params.port,
            self.shared.params.protocol
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::Release);
        self.shared.connected.store(false, Ordering::Release);
        if let Some(client) = self.shared.client.write().await.take() {
            let _ = client.disconnect().await;
        }
        if let Some(handle) = self.event_task.lock().await.take() {
            handle.abort();
        }
        debug!("{}: MQTT disconnected", self.shared.connection_id);
        Ok(())
    }

    async fn apply_tag_subscriptions(&self, groups: Vec<GroupPlan>) -> Result<()> {
        let mut index = HashMap::new();
        for plan in &groups {
            for tag in &plan.tags {
                if tag.path.is_empty() {
                    return Err(AcqError::config(format!("Tag {} has an empty topic", tag.id)));
                }
                index.insert(tag.id, tag.clone());
            }
        }
        let count = index.len();
        *self.shared.tags.write().await = index;
        self.shared.subscribe_all().await;
        info!("{}: {} MQTT topics subscribed", self.shared.connection_id, count);
        Ok(())
    }

    async fn read_one(&self, tag_ids: &[i64]) -> Result<Vec<Observation>> {
        // MQTT has no demand read; answer from the last retained state
        let now = Utc::now();
        Ok(tag_ids
            .iter()
            .map(|&tag_id| match self.shared.last_seen.get(&tag_id) {
                Some(seen) => Observation {
                    connection_id: self.shared.connection_id.clone(),
                    tag: TagRef::Id(tag_id),
                    ts: seen.ts,
                    value: seen.value.clone(),
                    quality: seen.quality,
                },
                None => Observation {
                    connection_id: self.shared.connection_id.clone(),
                    tag: TagRef::Id(tag_id),
                    ts: now,
                    value: Value::Null,
                    quality: Quality::Bad,
                },
            })
            .collect())
    }

    async fn write(&self, requests: &[WriteRequest]) -> Result<Vec<WriteOutcome>> {
        let _write_guard = self.write_lock.lock().await;
        let client = self
            .shared
            .client
            .read()
            .await
            .clone()
            .ok_or_else(|| AcqError::transport("Not connected".to_string()))?;

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
                let payload = request.value.to_json().to_string();
                client
                    .publish(&tag.path, QoS::AtLeastOnce, false, payload)
                    .await
                    .map_err(|e| AcqError::transport(format!("Publish '{}': {}", tag.path, e)))
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
        Err(AcqError::protocol(
            "MQTT does not support browse".to_string(),
        ))
    }

    async fn list_active_tag_ids(&self) -> HashSet<i64> {
        self.shared.tags.read().await.keys().copied().collect()
    }

    async fn remove_tag(&self, tag_id: i64) -> Result<()> {
        let removed = self.shared.tags.write().await.remove(&tag_id);
        self.shared.last_seen.remove(&tag_id);
        if let Some(tag) = removed {
            // Unsubscribe only when no other tag or subscription still
            // references the filter
            let still_used = {
                let tags = self.shared.tags.read().await;
                let subs = self.shared.subscriptions.read().await;
                tags.values().any(|t| t.path == tag.path)
                    || subs.iter().any(|s| s.topic == tag.path)
            };
            if !still_used {
                if let Some(client) = self.shared.client.read().await.as_ref() {
                    let _ = client.unsubscribe(&tag.path).await;
                }
            }
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_model::{ChangePolicy, DataKind, FieldMapping, TagStatus};
    use tokio::sync::mpsc;

    fn test_shared(params: MqttParams) -> (Arc<MqttShared>, mpsc::Receiver<Observation>) {
        let (tx, rx) = mpsc::channel(256);
        let shared = Arc::new(MqttShared {
            connection_id: "broker-1".into(),
            params,
            sink: tx,
            status: Arc::new(StatusPublisher::new(edge_bus::helpers::create_test_bus())),
            client: RwLock::new(None),
            tags: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(Vec::new()),
            last_seen: DashMap::new(),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            birth_metrics: DashMap::new(),
            warned_unbirthed: DashMap::new(),
        });
        (shared, rx)
    }

    fn plain_params() -> MqttParams {
        MqttParams {
            host: "localhost".into(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_s: 30,
            clean_session: true,
            protocol: MqttProtocolVariant::V311,
            ca_pem: None,
            client_cert_pem: None,
            client_key_pem: None,
            group_id: None,
            edge_node_id: None,
        }
    }

    fn sparkplug_params() -> MqttParams {
        MqttParams {
            protocol: MqttProtocolVariant::Sparkplug,
            ..plain_params()
        }
    }

    fn topic_tag(id: i64, filter: &str) -> TagConfig {
        TagConfig {
            id,
            connection_id: "broker-1".into(),
            path: filter.into(),
            name: format!("t{}", id),
            kind: DataKind::Real,
            poll_group_id: 1,
            subscribe: true,
            unit: None,
            policy: ChangePolicy::default(),
            status: TagStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_topic_tag_ingress() {
        let (shared, mut rx) = test_shared(plain_params());
        shared
            .tags
            .write()
            .await
            .insert(1, topic_tag(1, "plant/+/temp"));

        shared.handle_publish("plant/line1/temp", b"21.5").await;
        let obs = rx.recv().await.unwrap();
        assert_eq!(obs.tag, TagRef::Id(1));
        assert_eq!(obs.value, Value::Float(21.5));
        assert_eq!(obs.quality, Quality::Good);

        // Non-matching topic emits nothing
        shared.handle_publish("plant/line1/pressure", b"3").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_json_payload_value_field() {
        let (shared, mut rx) = test_shared(plain_params());
        shared.tags.write().await.insert(1, topic_tag(1, "m/1"));

        shared
            .handle_publish("m/1", br#"{"v": 7, "extra": true}"#)
            .await;
        let obs = rx.recv().await.unwrap();
        assert_eq!(obs.value, Value::Int(7));
    }

    #[tokio::test]
    async fn test_subscription_extractors() {
        let (shared, mut rx) = test_shared(plain_params());
        shared.subscriptions.write().await.push(MqttSubscriptionConfig {
            id: 1,
            connection_id: "broker-1".into(),
            topic: "sensors/#".into(),
            qos: 0,
            payload_format: PayloadFormat::Json,
            value_path: Some("$.data.value".into()),
            ts_path: Some("data.ts".into()),
            quality_path: Some("data.q".into()),
            buffer_size: 0,
            field_mappings: Vec::new(),
        });

        shared
            .handle_publish(
                "sensors/a",
                br#"{"data": {"value": 4.25, "ts": "2024-05-01T00:00:00.000Z", "q": -1}}"#,
            )
            .await;
        let obs = rx.recv().await.unwrap();
        assert_eq!(obs.tag, TagRef::Path("sensors/a".into()));
        assert_eq!(obs.value, Value::Float(4.25));
        assert_eq!(obs.quality, Quality::Bad);
        assert_eq!(obs.ts.timestamp_millis(), 1_714_521_600_000);
    }

    #[tokio::test]
    async fn test_field_mappings_failure_policies() {
        let (shared, mut rx) = test_shared(plain_params());
        shared.subscriptions.write().await.push(MqttSubscriptionConfig {
            id: 1,
            connection_id: "broker-1".into(),
            topic: "plant/agg".into(),
            qos: 0,
            payload_format: PayloadFormat::Json,
            value_path: None,
            ts_path: None,
            quality_path: None,
            buffer_size: 0,
            field_mappings: vec![
                FieldMapping {
                    field_path: "speed".into(),
                    tag_id: 10,
                    expected_kind: DataKind::Real,
                    on_failure: OnFailure::Skip,
                },
                FieldMapping {
                    field_path: "missing".into(),
                    tag_id: 11,
                    expected_kind: DataKind::Real,
                    on_failure: OnFailure::UseNull,
                },
                FieldMapping {
                    field_path: "absent_skip".into(),
                    tag_id: 12,
                    expected_kind: DataKind::Real,
                    on_failure: OnFailure::Skip,
                },
            ],
        });

        shared.handle_publish("plant/agg", br#"{"speed": 9.5}"#).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.tag, TagRef::Id(10));
        assert_eq!(first.value, Value::Float(9.5));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.tag, TagRef::Id(11));
        assert!(second.value.is_null());
        assert_eq!(second.quality, Quality::Bad);

        // Tag 12 was skipped
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sparkplug_ingress_birth_data_death() {
        let (shared, mut rx) = test_shared(sparkplug_params());

        let mut state = sparkplug::SparkplugState::new();
        let birth = state.birth(vec![sparkplug::Metric::from_value(
            "speed",
            &Value::Float(1.0),
            100,
        )]);
        shared
            .handle_publish(
                "spBv1.0/groupA/NBIRTH/node1",
                &sparkplug::encode_payload(&birth),
            )
            .await;
        let obs = rx.recv().await.unwrap();
        assert_eq!(obs.tag, TagRef::Path("spBv1.0/groupA/node1/speed".into()));
        assert_eq!(obs.value, Value::Float(1.0));

        let data = state
            .data(vec![sparkplug::Metric::from_value(
                "speed",
                &Value::Float(2.0),
                200,
            )])
            .unwrap();
        shared
            .handle_publish(
                "spBv1.0/groupA/NDATA/node1",
                &sparkplug::encode_payload(&data),
            )
            .await;
        let obs = rx.recv().await.unwrap();
        assert_eq!(obs.value, Value::Float(2.0));

        // Death retracts the birthed metric with bad quality
        shared.handle_publish("spBv1.0/groupA/NDEATH/node1", &[]).await;
        let obs = rx.recv().await.unwrap();
        assert_eq!(obs.tag, TagRef::Path("spBv1.0/groupA/node1/speed".into()));
        assert_eq!(obs.quality, Quality::Bad);
    }

    #[tokio::test]
    async fn test_sparkplug_ignores_commands() {
        let (shared, mut rx) = test_shared(sparkplug_params());
        shared.handle_publish("spBv1.0/g/NCMD/n", &[1, 2, 3]).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_change_policy_applies_to_topic_tags() {
        let (shared, mut rx) = test_shared(plain_params());
        let mut tag = topic_tag(1, "m/1");
        tag.policy = ChangePolicy {
            enabled: true,
            deadband: 1.0,
            ..ChangePolicy::default()
        };
        shared.tags.write().await.insert(1, tag);

        shared.handle_publish("m/1", b"10.0").await;
        shared.handle_publish("m/1", b"10.5").await; // inside deadband
        shared.handle_publish("m/1", b"11.5").await; // outside

        assert_eq!(rx.recv().await.unwrap().value, Value::Float(10.0));
        assert_eq!(rx.recv().await.unwrap().value, Value::Float(11.5));
        assert!(rx.try_recv().is_err());
    }
}
