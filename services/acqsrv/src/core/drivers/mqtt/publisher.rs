//! MQTT publisher engine
//!
//! Drives interval-based, on-change and Sparkplug publications from
//! tag-to-topic mappings. Interval publishers read current values from
//! the metadata store's latest-value cache; on-change publishers follow
//! the live telemetry feed with a last-published dedup map; Sparkplug
//! publishers maintain Birth/Data ordering and the sequence counter.

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::AsyncClient;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use edge_model::{
    MqttPublisherConfig, Observation, PublisherMapping, PublisherMode, TagRef, Transform, Value,
};

use super::sparkplug::{encode_payload, Metric, SparkplugState};
use super::topic::{SparkplugMessageKind, SparkplugTopic};
use crate::core::drivers::mqtt::qos_of;
use crate::core::store::MetaStore;
use crate::error::{AcqError, Result};
use crate::utils::time::format_bus_timestamp;

// ============================================================================
// Publish transport
// ============================================================================

/// Outbound MQTT publish seam, mockable in tests
#[async_trait]
pub trait MqttPublish: Send + Sync + 'static {
    async fn publish(&self, topic: &str, qos: u8, retain: bool, payload: Vec<u8>) -> Result<()>;
}

#[async_trait]
impl MqttPublish for AsyncClient {
    async fn publish(&self, topic: &str, qos: u8, retain: bool, payload: Vec<u8>) -> Result<()> {
        AsyncClient::publish(self, topic, qos_of(qos), retain, payload)
            .await
            .map_err(|e| AcqError::transport(format!("Publish '{}': {}", topic, e)))
    }
}

// ============================================================================
// Compiled mappings
// ============================================================================

struct CompiledMapping {
    mapping: PublisherMapping,
    transform: Option<Transform>,
    /// Set after the first transform failure so it logs once
    transform_failed: std::sync::atomic::AtomicBool,
}

impl CompiledMapping {
    /// Compile the mapping set, rejecting transforms that fail to parse
    fn compile(connection_id: &str, mappings: &[PublisherMapping]) -> Vec<Arc<CompiledMapping>> {
        mappings
            .iter()
            .filter_map(|mapping| {
                let transform = match &mapping.transform {
                    Some(source) => match Transform::parse(source) {
                        Ok(transform) => Some(transform),
                        Err(e) => {
                            warn!(
                                "{}: mapping for tag {} rejected: {}",
                                connection_id, mapping.tag_id, e
                            );
                            return None;
                        },
                    },
                    None => None,
                };
                Some(Arc::new(CompiledMapping {
                    mapping: mapping.clone(),
                    transform,
                    transform_failed: std::sync::atomic::AtomicBool::new(false),
                }))
            })
            .collect()
    }

    /// Apply the transform; None means skip this publish
    fn apply(&self, connection_id: &str, value: &Value) -> Option<Value> {
        let Some(transform) = &self.transform else {
            return Some(value.clone());
        };
        match transform.apply(value) {
            Ok(result) => Some(result),
            Err(e) => {
                use std::sync::atomic::Ordering;
                if !self.transform_failed.swap(true, Ordering::AcqRel) {
                    warn!(
                        "{}: transform '{}' failed, publish skipped: {}",
                        connection_id,
                        transform.source(),
                        e
                    );
                }
                None
            },
        }
    }
}

/// Render a payload from the optional template
///
/// Templates substitute `{{value}}`, `{{ts}}` and `{{tag}}`; without a
/// template the payload is `{"v": ..., "ts": "..."}`.
fn render_payload(template: Option<&str>, tag_id: i64, value: &Value, ts_iso: &str) -> Vec<u8> {
    match template {
        Some(template) => template
            .replace("{{value}}", &value.to_json().to_string())
            .replace("{{ts}}", ts_iso)
            .replace("{{tag}}", &tag_id.to_string())
            .into_bytes(),
        None => serde_json::json!({"v": value.to_json(), "ts": ts_iso})
            .to_string()
            .into_bytes(),
    }
}

// ============================================================================
// Sparkplug publisher
// ============================================================================

/// Sparkplug-mode publisher for one endpoint identity
///
/// Metric names come from the mapping topics; a DATA request before any
/// Birth emits the Birth first, carrying the full metric list.
pub struct SparkplugPublisher {
    connection_id: String,
    group_id: String,
    edge_node_id: String,
    device_id: Option<String>,
    mappings: Vec<Arc<CompiledMapping>>,
    store: Arc<MetaStore>,
    transport: Arc<dyn MqttPublish>,
    state: Mutex<SparkplugState>,
}

impl SparkplugPublisher {
    fn topic(&self, kind: SparkplugMessageKind) -> String {
        SparkplugTopic::new(
            self.group_id.clone(),
            kind,
            self.edge_node_id.clone(),
            self.device_id.clone(),
        )
        .to_string()
    }

    fn birth_kind(&self) -> SparkplugMessageKind {
        if self.device_id.is_some() {
            SparkplugMessageKind::DBirth
        } else {
            SparkplugMessageKind::NBirth
        }
    }

    fn data_kind(&self) -> SparkplugMessageKind {
        if self.device_id.is_some() {
            SparkplugMessageKind::DData
        } else {
            SparkplugMessageKind::NData
        }
    }

    fn death_kind(&self) -> SparkplugMessageKind {
        if self.device_id.is_some() {
            SparkplugMessageKind::DDeath
        } else {
            SparkplugMessageKind::NDeath
        }
    }

    /// Full metric list with current values from the store cache
    fn all_metrics(&self) -> Vec<Metric> {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.mappings
            .iter()
            .map(|compiled| {
                let value = self
                    .store
                    .latest_value(compiled.mapping.tag_id)
                    .map(|latest| latest.value)
                    .unwrap_or(Value::Null);
                let value = compiled
                    .apply(&self.connection_id, &value)
                    .unwrap_or(Value::Null);
                Metric::from_value(&compiled.mapping.topic, &value, now_ms)
            })
            .collect()
    }

    /// Publish DATA carrying the given metrics, prepending a Birth when
    /// none has been emitted yet
    pub async fn publish_data(&self, metrics: Vec<Metric>) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.birthed() {
            let birth = state.birth(self.all_metrics());
            self.transport
                .publish(&self.topic(self.birth_kind()), 0, false, encode_payload(&birth))
                .await?;
            info!(
                "{}: Sparkplug birth on {} (seq 0)",
                self.connection_id,
                self.topic(self.birth_kind())
            );
        }
        let data = state.data(metrics)?;
        self.transport
            .publish(&self.topic(self.data_kind()), 0, false, encode_payload(&data))
            .await
    }

    /// Publish a Death; the next DATA re-Births
    pub async fn publish_death(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let death = state.death();
        self.transport
            .publish(&self.topic(self.death_kind()), 0, false, encode_payload(&death))
            .await
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Running publisher set for one MQTT connection
pub struct PublisherEngine {
    connection_id: String,
    tasks: Vec<JoinHandle<()>>,
    sparkplug: Vec<Arc<SparkplugPublisher>>,
}

impl PublisherEngine {
    /// Compile the configs and start one task per publisher leg
    pub fn start(
        connection_id: &str,
        configs: Vec<MqttPublisherConfig>,
        store: Arc<MetaStore>,
        feed: impl Fn() -> broadcast::Receiver<Observation>,
        transport: Arc<dyn MqttPublish>,
    ) -> Self {
        let mut tasks = Vec::new();
        let mut sparkplug_publishers = Vec::new();

        for config in configs.into_iter().filter(|c| c.enabled) {
            let compiled = CompiledMapping::compile(connection_id, &config.mappings);
            if compiled.is_empty() {
                debug!("{}: publisher {} has no usable mappings", connection_id, config.id);
                continue;
            }

            if config.mode == PublisherMode::Sparkplug {
                let (Some(group_id), Some(edge_node_id)) =
                    (config.group_id.clone(), config.edge_node_id.clone())
                else {
                    warn!(
                        "{}: sparkplug publisher {} missing group/node identity",
                        connection_id, config.id
                    );
                    continue;
                };
                let publisher = Arc::new(SparkplugPublisher {
                    connection_id: connection_id.to_string(),
                    group_id,
                    edge_node_id,
                    device_id: config.device_id.clone(),
                    mappings: compiled,
                    store: Arc::clone(&store),
                    transport: Arc::clone(&transport),
                    state: Mutex::new(SparkplugState::new()),
                });
                sparkplug_publishers.push(Arc::clone(&publisher));
                tasks.push(Self::spawn_sparkplug(publisher, feed()));
                continue;
            }

            if config.mode.has_interval() {
                tasks.push(Self::spawn_interval(
                    connection_id.to_string(),
                    config.interval_ms,
                    config.template.clone(),
                    compiled.clone(),
                    Arc::clone(&store),
                    Arc::clone(&transport),
                ));
            }
            if config.mode.has_on_change() {
                tasks.push(Self::spawn_on_change(
                    connection_id.to_string(),
                    config.template.clone(),
                    compiled,
                    Arc::clone(&transport),
                    feed(),
                ));
            }
        }

        info!("{}: {} publisher tasks started", connection_id, tasks.len());
        Self {
            connection_id: connection_id.to_string(),
            tasks,
            sparkplug: sparkplug_publishers,
        }
    }

    /// Stop every publisher task, emitting Sparkplug deaths first
    pub async fn stop(&mut self) {
        for publisher in &self.sparkplug {
            if let Err(e) = publisher.publish_death().await {
                debug!("{}: death publish failed: {}", self.connection_id, e);
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        debug!("{}: publisher engine stopped", self.connection_id);
    }

    /// Sparkplug publishers, exposed for demand publishes
    pub fn sparkplug_publishers(&self) -> &[Arc<SparkplugPublisher>] {
        &self.sparkplug
    }

    fn spawn_interval(
        connection_id: String,
        interval_ms: u64,
        template: Option<String>,
        mappings: Vec<Arc<CompiledMapping>>,
        store: Arc<MetaStore>,
        transport: Arc<dyn MqttPublish>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for compiled in &mappings {
                    let Some(latest) = store.latest_value(compiled.mapping.tag_id) else {
                        continue;
                    };
                    let Some(value) = compiled.apply(&connection_id, &latest.value) else {
                        continue;
                    };
                    let payload = render_payload(
                        template.as_deref(),
                        compiled.mapping.tag_id,
                        &value,
                        &format_bus_timestamp(latest.ts),
                    );
                    if let Err(e) = transport
                        .publish(
                            &compiled.mapping.topic,
                            compiled.mapping.qos,
                            compiled.mapping.retain,
                            payload,
                        )
                        .await
                    {
                        debug!("{}: interval publish failed: {}", connection_id, e);
                    }
                }
            }
        })
    }

    fn spawn_on_change(
        connection_id: String,
        template: Option<String>,
        mappings: Vec<Arc<CompiledMapping>>,
        transport: Arc<dyn MqttPublish>,
        mut feed: broadcast::Receiver<Observation>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let by_tag: HashMap<i64, Arc<CompiledMapping>> = mappings
                .into_iter()
                .map(|compiled| (compiled.mapping.tag_id, compiled))
                .collect();
            // Last published value per tag; publish only on difference
            let mut last_published: HashMap<i64, Value> = HashMap::new();

            loop {
                let obs = match feed.recv().await {
                    Ok(obs) => obs,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("{}: on-change feed lagged {}", connection_id, missed);
                        continue;
                    },
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let TagRef::Id(tag_id) = obs.tag else { continue };
                let Some(compiled) = by_tag.get(&tag_id) else { continue };
                let Some(value) = compiled.apply(&connection_id, &obs.value) else {
                    continue;
                };
                if last_published.get(&tag_id) == Some(&value) {
                    continue;
                }
                let payload = render_payload(
                    template.as_deref(),
                    tag_id,
                    &value,
                    &format_bus_timestamp(obs.ts),
                );
                match transport
                    .publish(
                        &compiled.mapping.topic,
                        compiled.mapping.qos,
                        compiled.mapping.retain,
                        payload,
                    )
                    .await
                {
                    Ok(()) => {
                        last_published.insert(tag_id, value);
                    },
                    Err(e) => debug!("{}: on-change publish failed: {}", connection_id, e),
                }
            }
        })
    }

    fn spawn_sparkplug(
        publisher: Arc<SparkplugPublisher>,
        mut feed: broadcast::Receiver<Observation>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let tag_to_metric: HashMap<i64, Arc<CompiledMapping>> = publisher
                .mappings
                .iter()
                .map(|compiled| (compiled.mapping.tag_id, Arc::clone(compiled)))
                .collect();
            loop {
                let obs = match feed.recv().await {
                    Ok(obs) => obs,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let TagRef::Id(tag_id) = obs.tag else { continue };
                let Some(compiled) = tag_to_metric.get(&tag_id) else { continue };
                let Some(value) = compiled.apply(&publisher.connection_id, &obs.value) else {
                    continue;
                };
                let metric = Metric::from_value(
                    &compiled.mapping.topic,
                    &value,
                    obs.ts.timestamp_millis() as u64,
                );
                if let Err(e) = publisher.publish_data(vec![metric]).await {
                    debug!("{}: sparkplug publish failed: {}", publisher.connection_id, e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_model::Quality;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        messages: StdMutex<Vec<(String, u8, bool, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: StdMutex::new(Vec::new()),
            })
        }

        fn topics(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, ..)| topic.clone())
                .collect()
        }

        fn payloads(&self) -> Vec<Vec<u8>> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|(.., payload)| payload.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MqttPublish for RecordingTransport {
        async fn publish(&self, topic: &str, qos: u8, retain: bool, payload: Vec<u8>) -> Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), qos, retain, payload));
            Ok(())
        }
    }

    fn mapping(tag_id: i64, topic: &str, transform: Option<&str>) -> PublisherMapping {
        PublisherMapping {
            tag_id,
            topic: topic.into(),
            retain: false,
            qos: 0,
            transform: transform.map(|s| s.to_string()),
        }
    }

    fn sparkplug_publisher(
        transport: Arc<RecordingTransport>,
        store: Arc<MetaStore>,
        device: Option<&str>,
        mappings: Vec<PublisherMapping>,
    ) -> SparkplugPublisher {
        SparkplugPublisher {
            connection_id: "broker-1".into(),
            group_id: "groupA".into(),
            edge_node_id: "node1".into(),
            device_id: device.map(|s| s.to_string()),
            mappings: CompiledMapping::compile("broker-1", &mappings),
            store,
            transport,
            state: Mutex::new(SparkplugState::new()),
        }
    }

    #[test]
    fn test_render_payload_default_and_template() {
        let payload = render_payload(None, 7, &Value::Float(1.5), "2024-05-01T00:00:00.000Z");
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["v"], 1.5);
        assert_eq!(json["ts"], "2024-05-01T00:00:00.000Z");

        let payload = render_payload(
            Some(r#"{"tag":{{tag}},"val":{{value}}}"#),
            7,
            &Value::Int(3),
            "x",
        );
        assert_eq!(&payload, br#"{"tag":7,"val":3}"#);
    }

    #[test]
    fn test_compile_rejects_bad_transform() {
        let compiled = CompiledMapping::compile(
            "broker-1",
            &[
                mapping(1, "a", Some("value * 2")),
                mapping(2, "b", Some("value + +")),
                mapping(3, "c", None),
            ],
        );
        assert_eq!(compiled.len(), 2);
        assert_eq!(compiled[0].mapping.tag_id, 1);
        assert_eq!(compiled[1].mapping.tag_id, 3);
    }

    /// Sparkplug happy path from the acceptance scenario: data without a
    /// prior birth emits NBIRTH (seq 0) then NDATA (seq 1); the fifth
    /// publish after four more carries seq 5.
    #[tokio::test]
    async fn test_sparkplug_birth_then_data_sequence() {
        let transport = RecordingTransport::new();
        let store = Arc::new(MetaStore::in_memory().await.unwrap());
        store.record_latest(1, Value::Float(1.0), Quality::Good, Utc::now());
        store.record_latest(2, Value::Float(2.0), Quality::Good, Utc::now());

        let publisher = sparkplug_publisher(
            Arc::clone(&transport),
            store,
            None,
            vec![mapping(1, "speed", None), mapping(2, "flow", None)],
        );

        let metric = Metric::from_value("speed", &Value::Float(1.5), 100);
        publisher.publish_data(vec![metric]).await.unwrap();

        let topics = transport.topics();
        assert_eq!(
            topics,
            vec![
                "spBv1.0/groupA/NBIRTH/node1".to_string(),
                "spBv1.0/groupA/NDATA/node1".to_string(),
            ]
        );

        let payloads = transport.payloads();
        let birth = super::super::sparkplug::decode_payload(&payloads[0]).unwrap();
        assert_eq!(birth.seq, Some(0));
        // Birth carries the full metric list
        assert_eq!(birth.metrics.len(), 2);
        let data = super::super::sparkplug::decode_payload(&payloads[1]).unwrap();
        assert_eq!(data.seq, Some(1));

        // Four more publishes: the last data payload has seq 5
        for i in 0..4 {
            let metric = Metric::from_value("speed", &Value::Float(i as f64), 100);
            publisher.publish_data(vec![metric]).await.unwrap();
        }
        let payloads = transport.payloads();
        let last = super::super::sparkplug::decode_payload(payloads.last().unwrap()).unwrap();
        assert_eq!(last.seq, Some(5));
    }

    #[tokio::test]
    async fn test_sparkplug_device_topics() {
        let transport = RecordingTransport::new();
        let store = Arc::new(MetaStore::in_memory().await.unwrap());
        let publisher = sparkplug_publisher(
            Arc::clone(&transport),
            store,
            Some("cell2"),
            vec![mapping(1, "speed", None)],
        );

        publisher
            .publish_data(vec![Metric::from_value("speed", &Value::Int(1), 0)])
            .await
            .unwrap();
        publisher.publish_death().await.unwrap();

        assert_eq!(
            transport.topics(),
            vec![
                "spBv1.0/groupA/DBIRTH/node1/cell2".to_string(),
                "spBv1.0/groupA/DDATA/node1/cell2".to_string(),
                "spBv1.0/groupA/DDEATH/node1/cell2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_on_change_dedup() {
        let transport = RecordingTransport::new();
        let (feed_tx, _) = broadcast::channel(64);

        let compiled = CompiledMapping::compile("broker-1", &[mapping(1, "out/speed", None)]);
        let task = PublisherEngine::spawn_on_change(
            "broker-1".into(),
            None,
            compiled,
            transport.clone() as Arc<dyn MqttPublish>,
            feed_tx.subscribe(),
        );

        let obs = |v: f64| Observation {
            connection_id: "broker-1".into(),
            tag: TagRef::Id(1),
            ts: Utc::now(),
            value: Value::Float(v),
            quality: Quality::Good,
        };
        feed_tx.send(obs(1.0)).unwrap();
        feed_tx.send(obs(1.0)).unwrap(); // duplicate, deduped
        feed_tx.send(obs(2.0)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(transport.topics().len(), 2);
    }

    #[tokio::test]
    async fn test_interval_publisher_reads_store() {
        let transport = RecordingTransport::new();
        let store = Arc::new(MetaStore::in_memory().await.unwrap());
        store.record_latest(1, Value::Float(9.0), Quality::Good, Utc::now());

        let compiled =
            CompiledMapping::compile("broker-1", &[mapping(1, "out/speed", Some("value * 10"))]);
        let task = PublisherEngine::spawn_interval(
            "broker-1".into(),
            100,
            None,
            compiled,
            store,
            transport.clone() as Arc<dyn MqttPublish>,
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        task.abort();

        let payloads = transport.payloads();
        assert!(!payloads.is_empty());
        let json: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(json["v"], 90.0);
    }
}
