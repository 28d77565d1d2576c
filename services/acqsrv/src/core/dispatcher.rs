//! Bus event dispatcher
//!
//! Subscribes to the configuration, tag-change and write subjects and
//! routes events to the connection manager. Events for one connection id
//! run through a per-id worker queue so they apply in receive order;
//! different ids proceed in parallel. Write requests bypass the config
//! queue (they must not wait behind a reload).

use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use edge_bus::{subjects, Bus, BusMessage};
use edge_model::{ConnectionConfig, Value};

use crate::core::drivers::WriteRequest;
use crate::core::emitter::TelemetryEmitter;
use crate::core::manager::{ConfigEvent, ConnectionManager};
use crate::error::Result;

const WORKER_QUEUE: usize = 64;

/// Envelope on `connectivity.config.v1`
#[derive(Debug, Deserialize)]
struct ConfigEnvelope {
    #[serde(default)]
    schema: String,
    op: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    conn: Option<ConnectionConfig>,
}

/// Envelope on `connectivity.tags.changed.v1`
#[derive(Debug, Deserialize)]
struct TagChangeEnvelope {
    #[serde(default)]
    connection_id: Option<String>,
    op: String,
    #[serde(default)]
    tag_id: Option<i64>,
}

/// Envelope on `connectivity.telemetry.write.v1.<id>`
#[derive(Debug, Deserialize)]
struct WriteEnvelope {
    requests: Vec<WriteItem>,
    #[serde(default)]
    reply_to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteItem {
    tag_id: i64,
    v: serde_json::Value,
}

/// Work items routed through the per-connection queue
enum QueuedEvent {
    Config(ConfigEvent),
    TagReload,
    TagRemoved(i64),
}

/// Runs the bus subscriptions and routes events
pub struct Dispatcher {
    bus: Arc<dyn Bus>,
    manager: Arc<ConnectionManager>,
    emitter: Arc<TelemetryEmitter>,
    workers: Arc<DashMap<String, mpsc::Sender<QueuedEvent>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(
        bus: Arc<dyn Bus>,
        manager: Arc<ConnectionManager>,
        emitter: Arc<TelemetryEmitter>,
    ) -> Self {
        Self {
            bus,
            manager,
            emitter,
            workers: Arc::new(DashMap::new()),
            tasks: Vec::new(),
        }
    }

    /// Subscribe to every inbound subject and start routing
    pub async fn start(&mut self) -> Result<()> {
        let config_sub = self
            .bus
            .subscribe(&subjects::config_v1())
            .await
            .map_err(|e| crate::error::AcqError::bus(e.to_string()))?;
        let tags_sub = self
            .bus
            .subscribe(&subjects::tags_changed_v1())
            .await
            .map_err(|e| crate::error::AcqError::bus(e.to_string()))?;
        let write_sub = self
            .bus
            .subscribe(&subjects::telemetry_write_v1_pattern())
            .await
            .map_err(|e| crate::error::AcqError::bus(e.to_string()))?;

        self.tasks.push(self.spawn_config_loop(config_sub));
        self.tasks.push(self.spawn_tag_loop(tags_sub));
        self.tasks.push(self.spawn_write_loop(write_sub));
        info!("Dispatcher subscribed (config, tags, writes)");
        Ok(())
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.workers.clear();
    }

    async fn run_worker(
        connection_id: String,
        manager: Arc<ConnectionManager>,
        mut rx: mpsc::Receiver<QueuedEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let result = match event {
                QueuedEvent::Config(config_event) => manager.apply_config(config_event).await,
                QueuedEvent::TagReload => manager.apply_tag_change(&connection_id).await,
                QueuedEvent::TagRemoved(tag_id) => {
                    manager.remove_tag_fast(&connection_id, tag_id).await
                },
            };
            if let Err(e) = result {
                warn!("{}: event failed: {}", connection_id, e);
            }
        }
    }

    fn spawn_config_loop(&self, mut sub: edge_bus::Subscription) -> JoinHandle<()> {
        let dispatcher = self.clone_refs();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                dispatcher.handle_config_message(&msg);
            }
            error!("Config subscription ended");
        })
    }

    fn spawn_tag_loop(&self, mut sub: edge_bus::Subscription) -> JoinHandle<()> {
        let dispatcher = self.clone_refs();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                dispatcher.handle_tag_message(&msg);
            }
            error!("Tag-change subscription ended");
        })
    }

    fn spawn_write_loop(&self, mut sub: edge_bus::Subscription) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let emitter = Arc::clone(&self.emitter);
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let Some(connection_id) = subjects::connection_id_of(&msg.subject) else {
                    continue;
                };
                let connection_id = connection_id.to_string();
                let envelope: WriteEnvelope = match serde_json::from_slice(&msg.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("{}: bad write envelope: {}", connection_id, e);
                        emitter.record_error(&connection_id);
                        continue;
                    },
                };
                let requests: Vec<WriteRequest> = envelope
                    .requests
                    .iter()
                    .map(|item| WriteRequest {
                        tag_id: item.tag_id,
                        value: Value::from_json(&item.v),
                    })
                    .collect();

                let manager = Arc::clone(&manager);
                let emitter = Arc::clone(&emitter);
                let bus = Arc::clone(&bus);
                tokio::spawn(async move {
                    match manager.write(&connection_id, &requests).await {
                        Ok(outcomes) => {
                            for outcome in &outcomes {
                                if !outcome.ok {
                                    emitter.record_error(&connection_id);
                                }
                            }
                            if let Some(reply_to) = envelope.reply_to {
                                let results: Vec<serde_json::Value> = outcomes
                                    .iter()
                                    .map(|o| {
                                        serde_json::json!({
                                            "tag_id": o.tag_id,
                                            "ok": o.ok,
                                            "error": o.error,
                                        })
                                    })
                                    .collect();
                                let _ = bus
                                    .publish_json(
                                        &reply_to,
                                        &serde_json::json!({"results": results}),
                                    )
                                    .await;
                            }
                        },
                        Err(e) => {
                            warn!("{}: write failed: {}", connection_id, e);
                            emitter.record_error(&connection_id);
                        },
                    }
                });
            }
            error!("Write subscription ended");
        })
    }

    fn clone_refs(&self) -> DispatcherRefs {
        DispatcherRefs {
            manager: Arc::clone(&self.manager),
            workers: Arc::clone(&self.workers),
        }
    }
}

/// The subset of dispatcher state the subscription loops need
struct DispatcherRefs {
    manager: Arc<ConnectionManager>,
    workers: Arc<DashMap<String, mpsc::Sender<QueuedEvent>>>,
}

impl DispatcherRefs {
    fn enqueue(&self, connection_id: &str, event: QueuedEvent) {
        let sender = self
            .workers
            .entry(connection_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(WORKER_QUEUE);
                tokio::spawn(Dispatcher::run_worker(
                    connection_id.to_string(),
                    Arc::clone(&self.manager),
                    rx,
                ));
                tx
            })
            .clone();
        if sender.try_send(event).is_err() {
            warn!("{}: config queue full, event dropped", connection_id);
        }
    }

    fn handle_config_message(&self, msg: &BusMessage) {
        let envelope: ConfigEnvelope = match serde_json::from_slice(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Bad config envelope: {}", e);
                return;
            },
        };
        if !envelope.schema.is_empty() && !envelope.schema.starts_with("connectivity.config") {
            debug!("Foreign schema '{}' ignored", envelope.schema);
            return;
        }
        match envelope.op.as_str() {
            "upsert" => match envelope.conn {
                Some(conn) => {
                    let id = conn.id.clone();
                    debug!("{}: config upsert received", id);
                    self.enqueue(&id, QueuedEvent::Config(ConfigEvent::Upsert(conn)));
                },
                None => warn!("Config upsert without conn body"),
            },
            "delete" => match envelope.id {
                Some(id) => {
                    debug!("{}: config delete received", id);
                    self.enqueue(&id, QueuedEvent::Config(ConfigEvent::Delete(id.clone())));
                },
                None => warn!("Config delete without id"),
            },
            other => debug!("Unknown config op '{}' ignored", other),
        }
    }

    fn handle_tag_message(&self, msg: &BusMessage) {
        let envelope: TagChangeEnvelope = match serde_json::from_slice(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Bad tag-change envelope: {}", e);
                return;
            },
        };
        let Some(connection_id) = envelope.connection_id else {
            debug!("Tag change without connection_id ignored");
            return;
        };
        match envelope.op.as_str() {
            "tag_removed" => match envelope.tag_id {
                Some(tag_id) => self.enqueue(&connection_id, QueuedEvent::TagRemoved(tag_id)),
                None => self.enqueue(&connection_id, QueuedEvent::TagReload),
            },
            "connection_removed" => {
                self.enqueue(
                    &connection_id,
                    QueuedEvent::Config(ConfigEvent::Delete(connection_id.clone())),
                );
            },
            "tag_added" | "tag_pending_delete" | "tag_restored" | "tag_subscription_update"
            | "tags_added_summary" => {
                self.enqueue(&connection_id, QueuedEvent::TagReload);
            },
            other => debug!("Unknown tag op '{}' ignored", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::drivers::Driver;
    use crate::core::manager::tests::test_manager;
    use bytes::Bytes;
    use std::time::Duration;

    async fn started_dispatcher() -> (
        Dispatcher,
        Arc<ConnectionManager>,
        Arc<crate::core::manager::tests::MockFactory>,
        Arc<edge_bus::MemoryBus>,
        Arc<crate::core::store::MetaStore>,
    ) {
        let (manager, factory, bus, store) = test_manager().await;
        let status = Arc::new(crate::core::emitter::StatusPublisher::new(bus.clone()));
        let (emitter, _) =
            crate::core::emitter::TelemetryEmitter::start(bus.clone(), store.clone(), status);
        let mut dispatcher = Dispatcher::new(bus.clone(), Arc::clone(&manager), emitter);
        dispatcher.start().await.unwrap();
        (dispatcher, manager, factory, bus, store)
    }

    async fn publish(bus: &edge_bus::MemoryBus, subject: &str, payload: serde_json::Value) {
        use edge_bus::Bus as _;
        bus.publish(subject, Bytes::from(payload.to_string()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_config_upsert_over_bus() {
        let (_dispatcher, manager, _, bus, _) = started_dispatcher().await;

        publish(
            &bus,
            "connectivity.config.v1",
            serde_json::json!({
                "schema": "connectivity.config@v1",
                "ts": "2024-05-01T00:00:00.000Z",
                "op": "upsert",
                "conn": {"id": "plc-1", "type": "s7", "enabled": true, "host": "10.0.0.5"}
            }),
        )
        .await;

        for _ in 0..50 {
            if manager.connection_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_config_delete_over_bus() {
        let (_dispatcher, manager, _, bus, _) = started_dispatcher().await;
        publish(
            &bus,
            "connectivity.config.v1",
            serde_json::json!({
                "op": "upsert",
                "conn": {"id": "plc-1", "type": "s7", "enabled": true, "host": "h"}
            }),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        publish(
            &bus,
            "connectivity.config.v1",
            serde_json::json!({"op": "delete", "id": "plc-1"}),
        )
        .await;
        for _ in 0..50 {
            if manager.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_dropped() {
        let (_dispatcher, manager, _, bus, _) = started_dispatcher().await;
        publish(&bus, "connectivity.config.v1", serde_json::json!({"op": 42})).await;
        bus.publish("connectivity.config.v1", Bytes::from_static(b"not json"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_tag_removed_fast_path() {
        let (_dispatcher, manager, factory, bus, store) = started_dispatcher().await;
        sqlx::query("INSERT INTO poll_groups (id, rate_ms, enabled) VALUES (1, 1000, 1)")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tags (id, connection_id, path, name, kind, poll_group_id)
             VALUES (42, 'plc-1', 'MW0', 'a', 'INT16', 1)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        publish(
            &bus,
            "connectivity.config.v1",
            serde_json::json!({
                "op": "upsert",
                "conn": {"id": "plc-1", "type": "s7", "enabled": true, "host": "h"}
            }),
        )
        .await;
        for _ in 0..50 {
            if let Some(driver) = factory.last_driver() {
                if driver.list_active_tag_ids().await.contains(&42) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        publish(
            &bus,
            "connectivity.tags.changed.v1",
            serde_json::json!({
                "schema": "connectivity.tags@v1",
                "connection_id": "plc-1",
                "op": "tag_removed",
                "tag_id": 42
            }),
        )
        .await;

        let driver = factory.last_driver().unwrap();
        for _ in 0..50 {
            if driver.removed.lock().unwrap().contains(&42) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(driver.removed.lock().unwrap().contains(&42));
        assert!(!driver.list_active_tag_ids().await.contains(&42));
        let _ = manager;
    }

    #[tokio::test]
    async fn test_write_request_over_bus() {
        let (_dispatcher, _manager, factory, bus, _) = started_dispatcher().await;
        publish(
            &bus,
            "connectivity.config.v1",
            serde_json::json!({
                "op": "upsert",
                "conn": {"id": "plc-1", "type": "s7", "enabled": true, "host": "h"}
            }),
        )
        .await;
        for _ in 0..50 {
            if factory.last_driver().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut reply_sub = bus.subscribe("test.write.reply").await.unwrap();
        publish(
            &bus,
            "connectivity.telemetry.write.v1.plc-1",
            serde_json::json!({
                "schema": "connectivity.write@v1",
                "ts": "2024-05-01T00:00:00.000Z",
                "requests": [{"tag_id": 7, "v": 1.5}],
                "reply_to": "test.write.reply"
            }),
        )
        .await;

        let reply = tokio::time::timeout(Duration::from_secs(2), reply_sub.next())
            .await
            .unwrap()
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(reply["results"][0]["tag_id"], 7);
        assert_eq!(reply["results"][0]["ok"], true);
    }
}
