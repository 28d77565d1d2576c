//! Connection lifecycle management
//!
//! Holds the live set of connections keyed by identifier, applies
//! declarative config deltas, coordinates start/stop, and exposes status.
//! Config events for one connection are serialized by the dispatcher;
//! the manager guards runtime mutations with a per-entry apply lock.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use edge_bus::Bus;
use edge_model::{ConnectionConfig, ConnectionKind};

use crate::config::EipTuning;
use crate::core::drivers::eip::EipDriver;
use crate::core::drivers::mqtt::publisher::{MqttPublish, PublisherEngine};
use crate::core::drivers::mqtt::MqttDriver;
use crate::core::drivers::opcua::OpcuaDriver;
use crate::core::drivers::s7::S7Driver;
use crate::core::drivers::{Driver, ObservationSink, WriteOutcome, WriteRequest, CONNECT_TIMEOUT};
use crate::core::emitter::{ConnState, StatusPublisher, TelemetryEmitter};
use crate::core::reconnect::{ReconnectHelper, ReconnectPolicy};
use crate::core::store::MetaStore;
use crate::error::{AcqError, Result};

/// A declarative configuration event from the bus
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    Upsert(ConnectionConfig),
    Delete(String),
}

// ============================================================================
// Driver factory
// ============================================================================

/// Creates driver instances per connection kind
///
/// A seam for tests: the default factory builds real protocol drivers.
#[async_trait]
pub trait DriverFactory: Send + Sync + 'static {
    async fn create(
        &self,
        config: &ConnectionConfig,
        sink: ObservationSink,
        status: Arc<StatusPublisher>,
    ) -> Result<Arc<dyn Driver>>;
}

/// Production factory
pub struct DefaultDriverFactory {
    bus: Arc<dyn Bus>,
    eip_tuning: EipTuning,
}

impl DefaultDriverFactory {
    pub fn new(bus: Arc<dyn Bus>, eip_tuning: EipTuning) -> Self {
        Self { bus, eip_tuning }
    }
}

#[async_trait]
impl DriverFactory for DefaultDriverFactory {
    async fn create(
        &self,
        config: &ConnectionConfig,
        sink: ObservationSink,
        status: Arc<StatusPublisher>,
    ) -> Result<Arc<dyn Driver>> {
        match config.kind()? {
            ConnectionKind::S7 => {
                let params = config.typed_params()?;
                Ok(S7Driver::new(&config.id, params, sink, status))
            },
            ConnectionKind::Eip => {
                let params = config.typed_params()?;
                let driver = EipDriver::new(
                    &config.id,
                    params,
                    self.eip_tuning.clone(),
                    sink,
                    status,
                );
                driver.update_tuning(&config.params).await;
                Arc::clone(&driver).start_rpc_task(Arc::clone(&self.bus)).await;
                Ok(driver)
            },
            ConnectionKind::Mqtt => {
                let params = config.typed_params()?;
                Ok(MqttDriver::new(&config.id, params, sink, status))
            },
            ConnectionKind::OpcuaClient => {
                let params = config.typed_params()?;
                let driver = OpcuaDriver::new(&config.id, params, sink, status);
                Arc::clone(&driver)
                    .start_rpc_task(Arc::clone(&self.bus))
                    .await;
                Ok(driver)
            },
            ConnectionKind::OpcuaServer => Err(AcqError::config(
                "opcua-server connections are not acquisition endpoints".to_string(),
            )),
        }
    }
}

// ============================================================================
// Connection entry
// ============================================================================

/// One live connection
pub struct ConnectionEntry {
    pub config: Mutex<ConnectionConfig>,
    pub driver: Arc<dyn Driver>,
    pub created_at: Instant,
    /// Cancels a connect still in progress; a concurrent delete wins
    cancel: CancellationToken,
    /// Serializes subscription/config mutations on this connection
    apply_lock: Mutex<()>,
    /// MQTT publisher engine, when the connection runs one
    publishers: Mutex<Option<PublisherEngine>>,
}

// ============================================================================
// Connection manager
// ============================================================================

pub struct ConnectionManager {
    connections: DashMap<String, Arc<ConnectionEntry>>,
    store: Arc<MetaStore>,
    emitter: Arc<TelemetryEmitter>,
    status: Arc<StatusPublisher>,
    factory: Arc<dyn DriverFactory>,
    max_connections_per_host: usize,
}

/// Shared context a connect task carries
struct ConnectCtx {
    status: Arc<StatusPublisher>,
    store: Arc<MetaStore>,
    emitter: Arc<TelemetryEmitter>,
}

/// Device host a connection targets, for the per-host connection cap
fn host_of(config: &ConnectionConfig) -> Option<String> {
    if let Some(host) = config.params.get("host").and_then(|v| v.as_str()) {
        return Some(host.to_string());
    }
    let endpoint = config.params.get("endpoint").and_then(|v| v.as_str())?;
    let authority = endpoint.split("://").nth(1).unwrap_or(endpoint);
    let host = authority.split(['/', ':']).next().unwrap_or(authority);
    (!host.is_empty()).then(|| host.to_string())
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        store: Arc<MetaStore>,
        emitter: Arc<TelemetryEmitter>,
        status: Arc<StatusPublisher>,
        factory: Arc<dyn DriverFactory>,
        max_connections_per_host: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            store,
            emitter,
            status,
            factory,
            max_connections_per_host: max_connections_per_host.max(1),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConnectionEntry>> {
        self.connections.get(id).map(|e| Arc::clone(e.value()))
    }

    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for entry in self.connections.iter() {
            if entry.driver.is_connected().await {
                count += 1;
            }
        }
        count
    }

    /// Boot: load the enabled connection set and bring each up
    pub async fn boot(&self) -> Result<()> {
        let connections = self.store.load_enabled_connections().await?;
        info!("Boot: {} enabled connections", connections.len());
        for config in connections {
            if let Err(e) = self.apply_config(ConfigEvent::Upsert(config.clone())).await {
                warn!("{}: boot failed: {}", config.id, e);
            }
        }
        Ok(())
    }

    /// Apply one configuration event
    ///
    /// The caller (dispatcher) serializes events per connection id.
    pub async fn apply_config(&self, event: ConfigEvent) -> Result<()> {
        match event {
            ConfigEvent::Delete(id) => self.remove_connection(&id, ConnState::Deleted).await,
            ConfigEvent::Upsert(config) => self.upsert(config).await,
        }
    }

    async fn upsert(&self, config: ConnectionConfig) -> Result<()> {
        let id = config.id.clone();
        let kind = match config.kind() {
            Ok(kind) => kind,
            Err(e) => {
                self.status
                    .set_state(&id, ConnState::Error, Some(&e.to_string()))
                    .await;
                return Err(e.into());
            },
        };

        if let Some(entry) = self.get(&id) {
            let (same, old_kind) = {
                let current = entry.config.lock().await;
                (current.same_as(&config), current.kind().ok())
            };
            if same {
                debug!("{}: config unchanged, no-op", id);
                return Ok(());
            }
            if !config.enabled {
                return self.remove_connection(&id, ConnState::Disabled).await;
            }
            if old_kind != Some(kind) {
                // Type change: tear down and recreate
                self.remove_connection(&id, ConnState::Disconnected).await?;
                return self.create_connection(config).await;
            }

            // In-place update: tuning plus a subscription reload
            entry.driver.update_tuning(&config.params).await;
            *entry.config.lock().await = config;
            self.apply_tag_change(&id).await?;
            info!("{}: config updated", id);
            return Ok(());
        }

        if !config.enabled {
            self.status
                .set_state(&id, ConnState::Disabled, Some("disabled by config"))
                .await;
            return Ok(());
        }
        self.create_connection(config).await
    }

    async fn create_connection(&self, config: ConnectionConfig) -> Result<()> {
        let id = config.id.clone();

        if let Some(host) = host_of(&config) {
            let mut on_host = 0usize;
            for entry in self.connections.iter() {
                let current = entry.config.lock().await;
                if host_of(&current).as_deref() == Some(host.as_str()) {
                    on_host += 1;
                }
            }
            if on_host >= self.max_connections_per_host {
                let reason = format!(
                    "Host {} already has {} connections (limit {})",
                    host, on_host, self.max_connections_per_host
                );
                self.status
                    .set_state(&id, ConnState::Error, Some(&reason))
                    .await;
                return Err(AcqError::config(reason));
            }
        }

        let sink = self.emitter.sink();
        let driver = match self
            .factory
            .create(&config, sink, Arc::clone(&self.status))
            .await
        {
            Ok(driver) => driver,
            Err(e) => {
                self.status
                    .set_state(&id, ConnState::Error, Some(&e.to_string()))
                    .await;
                return Err(e);
            },
        };

        let entry = Arc::new(ConnectionEntry {
            config: Mutex::new(config),
            driver,
            created_at: Instant::now(),
            cancel: CancellationToken::new(),
            apply_lock: Mutex::new(()),
            publishers: Mutex::new(None),
        });
        self.connections.insert(id.clone(), Arc::clone(&entry));

        // Connect asynchronously; further config events are not blocked
        let ctx = ConnectCtx {
            status: Arc::clone(&self.status),
            store: Arc::clone(&self.store),
            emitter: Arc::clone(&self.emitter),
        };
        tokio::spawn(Self::run_connect(ctx, id, entry));
        Ok(())
    }

    /// Connect with backoff until success, a fatal error, or cancellation
    async fn run_connect(ctx: ConnectCtx, id: String, entry: Arc<ConnectionEntry>) {
        ctx.status.set_state(&id, ConnState::Connecting, None).await;
        let mut helper = ReconnectHelper::new(ReconnectPolicy::default());

        loop {
            if entry.cancel.is_cancelled() {
                let _ = entry.driver.disconnect().await;
                return;
            }
            let driver = Arc::clone(&entry.driver);
            let cancel = entry.cancel.clone();
            let result = helper
                .execute_reconnect(|| {
                    let driver = Arc::clone(&driver);
                    let cancel = cancel.clone();
                    async move {
                        tokio::select! {
                            _ = cancel.cancelled() => Err(AcqError::cancelled("delete during connect")),
                            connected = tokio::time::timeout(CONNECT_TIMEOUT, driver.connect()) => {
                                connected.map_err(|_| AcqError::timeout("connect deadline"))?
                            }
                        }
                    }
                })
                .await;

            match result {
                Ok(()) => break,
                Err(AcqError::Cancelled(_)) => {
                    // The delete wins; tear down whatever half-connected
                    let _ = entry.driver.disconnect().await;
                    return;
                },
                Err(e) if e.is_fatal_for_connect() => {
                    ctx.status
                        .set_state(&id, ConnState::Error, Some(&e.to_string()))
                        .await;
                    return;
                },
                Err(e) => {
                    if helper.exhausted_fast_attempts() {
                        ctx.status
                            .set_state(&id, ConnState::Error, Some(&e.to_string()))
                            .await;
                    }
                    // Keep probing on the helper's idle cadence
                },
            }
        }

        ctx.status
            .set_state(&id, ConnState::Connected, Some("session established"))
            .await;
        if let Err(e) = Self::load_runtime(&ctx, &id, &entry).await {
            warn!("{}: runtime load failed: {}", id, e);
            ctx.status
                .set_state(&id, ConnState::Error, Some(&e.to_string()))
                .await;
        }
    }

    /// Load subscriptions (and MQTT ingress/egress config) after connect
    async fn load_runtime(ctx: &ConnectCtx, id: &str, entry: &Arc<ConnectionEntry>) -> Result<()> {
        let _guard = entry.apply_lock.lock().await;
        let plans = ctx.store.load_group_plans(id).await?;
        entry.driver.apply_tag_subscriptions(plans).await?;

        if let Some(mqtt) = entry.driver.as_any().downcast_ref::<MqttDriver>() {
            let subscriptions = ctx.store.load_mqtt_subscriptions(id).await?;
            mqtt.set_subscriptions(subscriptions).await?;

            let publishers = ctx.store.load_mqtt_publishers(id).await?;
            if !publishers.is_empty() {
                let Some(client) = mqtt.client().await else {
                    return Err(AcqError::transport("MQTT client missing".to_string()));
                };
                let transport: Arc<dyn MqttPublish> = Arc::new(client);
                let emitter = Arc::clone(&ctx.emitter);
                let engine = PublisherEngine::start(
                    id,
                    publishers,
                    Arc::clone(&ctx.store),
                    move || emitter.subscribe(),
                    transport,
                );
                let mut slot = entry.publishers.lock().await;
                if let Some(mut previous) = slot.take() {
                    previous.stop().await;
                }
                *slot = Some(engine);
            }
        }
        Ok(())
    }

    /// Refetch tag metadata and re-apply subscriptions
    pub async fn apply_tag_change(&self, id: &str) -> Result<()> {
        let entry = self
            .get(id)
            .ok_or_else(|| AcqError::connection_not_found(id))?;
        let _guard = entry.apply_lock.lock().await;
        let plans = self.store.load_group_plans(id).await?;
        entry.driver.apply_tag_subscriptions(plans).await?;
        debug!("{}: subscriptions reloaded", id);
        Ok(())
    }

    /// Fast-path removal of a single tag without a full reload
    pub async fn remove_tag_fast(&self, id: &str, tag_id: i64) -> Result<()> {
        let entry = self
            .get(id)
            .ok_or_else(|| AcqError::connection_not_found(id))?;
        entry.driver.remove_tag(tag_id).await
    }

    /// Execute a write batch on a connection
    pub async fn write(&self, id: &str, requests: &[WriteRequest]) -> Result<Vec<WriteOutcome>> {
        let entry = self
            .get(id)
            .ok_or_else(|| AcqError::connection_not_found(id))?;
        entry.driver.write(requests).await
    }

    async fn remove_connection(&self, id: &str, final_state: ConnState) -> Result<()> {
        let Some((_, entry)) = self.connections.remove(id) else {
            // Deleting something unknown still reports the state
            self.status.set_state(id, final_state, None).await;
            if final_state == ConnState::Deleted {
                self.status.forget(id);
            }
            return Ok(());
        };
        entry.cancel.cancel();
        if let Some(mut engine) = entry.publishers.lock().await.take() {
            engine.stop().await;
        }
        let _ = entry.driver.disconnect().await;
        self.status
            .set_state(id, final_state, Some("removed by config"))
            .await;
        if final_state == ConnState::Deleted {
            self.status.forget(id);
        }
        info!("{}: connection removed ({})", id, final_state.as_str());
        Ok(())
    }

    /// Disconnect everything (service shutdown)
    pub async fn shutdown(&self) {
        info!("Shutting down {} connections", self.connections.len());
        let ids = self.connection_ids();
        for id in ids {
            if let Some((_, entry)) = self.connections.remove(&id) {
                entry.cancel.cancel();
                if let Some(mut engine) = entry.publishers.lock().await.take() {
                    engine.stop().await;
                }
                let _ = entry.driver.disconnect().await;
                self.status
                    .set_state(&id, ConnState::Disconnected, Some("service shutdown"))
                    .await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use edge_bus::helpers::create_test_memory_bus;
    use edge_model::{Observation, Quality, TagRef, Value};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::core::drivers::{BrowseItem, GroupPlan};

    /// Scriptable in-memory driver
    pub(crate) struct MockDriver {
        kind: ConnectionKind,
        pub connected: AtomicBool,
        pub fail_connect: AtomicBool,
        pub connect_calls: AtomicUsize,
        pub active: std::sync::Mutex<HashSet<i64>>,
        pub removed: std::sync::Mutex<Vec<i64>>,
        sink: ObservationSink,
    }

    impl MockDriver {
        pub fn new(kind: ConnectionKind, sink: ObservationSink) -> Arc<Self> {
            Arc::new(Self {
                kind,
                connected: AtomicBool::new(false),
                fail_connect: AtomicBool::new(false),
                connect_calls: AtomicUsize::new(0),
                active: std::sync::Mutex::new(HashSet::new()),
                removed: std::sync::Mutex::new(Vec::new()),
                sink,
            })
        }

        pub async fn emit(&self, connection_id: &str, tag_id: i64, value: Value) {
            let _ = self
                .sink
                .send(Observation::new(
                    connection_id,
                    TagRef::Id(tag_id),
                    value,
                    Quality::Good,
                ))
                .await;
        }
    }

    #[async_trait]
    impl Driver for MockDriver {
        fn kind(&self) -> ConnectionKind {
            self.kind
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        async fn connect(&self) -> Result<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(AcqError::transport("mock refuses"));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn apply_tag_subscriptions(&self, groups: Vec<GroupPlan>) -> Result<()> {
            let mut active = self.active.lock().unwrap();
            active.clear();
            for plan in groups {
                for tag in plan.tags {
                    active.insert(tag.id);
                }
            }
            Ok(())
        }

        async fn read_one(&self, _tag_ids: &[i64]) -> Result<Vec<Observation>> {
            Ok(Vec::new())
        }

        async fn write(&self, requests: &[WriteRequest]) -> Result<Vec<WriteOutcome>> {
            Ok(requests
                .iter()
                .map(|r| WriteOutcome::success(r.tag_id))
                .collect())
        }

        async fn browse(&self, _node: Option<&str>) -> Result<Vec<BrowseItem>> {
            Ok(Vec::new())
        }

        async fn list_active_tag_ids(&self) -> HashSet<i64> {
            self.active.lock().unwrap().clone()
        }

        async fn remove_tag(&self, tag_id: i64) -> Result<()> {
            self.active.lock().unwrap().remove(&tag_id);
            self.removed.lock().unwrap().push(tag_id);
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    pub(crate) struct MockFactory {
        pub created: std::sync::Mutex<Vec<Arc<MockDriver>>>,
        pub fail_connect: AtomicBool,
    }

    impl MockFactory {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                created: std::sync::Mutex::new(Vec::new()),
                fail_connect: AtomicBool::new(false),
            })
        }

        pub fn last_driver(&self) -> Option<Arc<MockDriver>> {
            self.created.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl DriverFactory for MockFactory {
        async fn create(
            &self,
            config: &ConnectionConfig,
            sink: ObservationSink,
            _status: Arc<StatusPublisher>,
        ) -> Result<Arc<dyn Driver>> {
            let driver = MockDriver::new(config.kind()?, sink);
            driver
                .fail_connect
                .store(self.fail_connect.load(Ordering::SeqCst), Ordering::SeqCst);
            self.created.lock().unwrap().push(Arc::clone(&driver));
            Ok(driver)
        }
    }

    pub(crate) async fn test_manager() -> (
        Arc<ConnectionManager>,
        Arc<MockFactory>,
        Arc<edge_bus::MemoryBus>,
        Arc<MetaStore>,
    ) {
        let bus = create_test_memory_bus();
        let store = Arc::new(MetaStore::in_memory().await.unwrap());
        let status = Arc::new(StatusPublisher::new(bus.clone()));
        let (emitter, _) = TelemetryEmitter::start(bus.clone(), store.clone(), status.clone());
        let factory = MockFactory::new();
        let manager = ConnectionManager::new(store.clone(), emitter, status, factory.clone(), 8);
        (manager, factory, bus, store)
    }

    fn conn(id: &str, enabled: bool) -> ConnectionConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "type": "s7",
            "enabled": enabled,
            "host": "10.0.0.5"
        }))
        .unwrap()
    }

    async fn wait_connected(factory: &MockFactory) -> Arc<MockDriver> {
        for _ in 0..50 {
            if let Some(driver) = factory.last_driver() {
                if driver.connected.load(Ordering::SeqCst) {
                    return driver;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("driver never connected");
    }

    #[tokio::test]
    async fn test_upsert_creates_and_connects() {
        let (manager, factory, _, _) = test_manager().await;
        manager
            .apply_config(ConfigEvent::Upsert(conn("plc-1", true)))
            .await
            .unwrap();
        assert_eq!(manager.connection_count(), 1);
        let driver = wait_connected(&factory).await;
        assert_eq!(driver.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connected_count().await, 1);
    }

    #[tokio::test]
    async fn test_identical_upsert_is_noop() {
        let (manager, factory, _, _) = test_manager().await;
        manager
            .apply_config(ConfigEvent::Upsert(conn("plc-1", true)))
            .await
            .unwrap();
        wait_connected(&factory).await;

        // Same content again: no new driver, no reconnect
        manager
            .apply_config(ConfigEvent::Upsert(conn("plc-1", true)))
            .await
            .unwrap();
        assert_eq!(factory.created.lock().unwrap().len(), 1);
        let driver = factory.last_driver().unwrap();
        assert_eq!(driver.connect_calls.load(Ordering::SeqCst), 1);
    }

    /// Config churn scenario: upsert(enabled) -> upsert(disabled) ->
    /// delete. Final state: no driver; status transitions include
    /// connected, disabled, deleted in order.
    #[tokio::test]
    async fn test_config_churn_lifecycle() {
        let (manager, factory, bus, _) = test_manager().await;
        let mut status_sub = bus.subscribe("connectivity.status.v1.plc-1").await.unwrap();

        manager
            .apply_config(ConfigEvent::Upsert(conn("plc-1", true)))
            .await
            .unwrap();
        wait_connected(&factory).await;

        manager
            .apply_config(ConfigEvent::Upsert(conn("plc-1", false)))
            .await
            .unwrap();
        assert_eq!(manager.connection_count(), 0);
        let driver = factory.last_driver().unwrap();
        assert!(!driver.connected.load(Ordering::SeqCst));

        manager
            .apply_config(ConfigEvent::Delete("plc-1".into()))
            .await
            .unwrap();
        assert_eq!(manager.connection_count(), 0);

        let mut states = Vec::new();
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(200), status_sub.next()).await
        {
            states.push(msg.json().unwrap()["state"].as_str().unwrap().to_string());
        }
        let positions: Vec<usize> = ["connected", "disabled", "deleted"]
            .iter()
            .map(|wanted| states.iter().position(|s| s == wanted).unwrap())
            .collect();
        assert!(positions[0] < positions[1] && positions[1] < positions[2], "{:?}", states);
    }

    #[tokio::test]
    async fn test_delete_wins_during_connect() {
        let (manager, factory, _, _) = test_manager().await;
        factory.fail_connect.store(true, Ordering::SeqCst);

        manager
            .apply_config(ConfigEvent::Upsert(conn("plc-1", true)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.connection_count(), 1);

        // Delete while the connect loop is still retrying
        manager
            .apply_config(ConfigEvent::Delete("plc-1".into()))
            .await
            .unwrap();
        assert_eq!(manager.connection_count(), 0);

        // Even if a late attempt succeeds, teardown leaves it closed
        factory.fail_connect.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(600)).await;
        let driver = factory.last_driver().unwrap();
        assert!(!driver.connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unknown_kind_refused_with_error_status() {
        let (manager, _, bus, _) = test_manager().await;
        let mut status_sub = bus.subscribe("connectivity.status.v1.x-1").await.unwrap();

        let config: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "id": "x-1", "type": "profinet", "enabled": true
        }))
        .unwrap();
        let result = manager.apply_config(ConfigEvent::Upsert(config)).await;
        assert!(result.is_err());
        assert_eq!(manager.connection_count(), 0);

        let msg = tokio::time::timeout(Duration::from_secs(1), status_sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.json().unwrap()["state"], "error");
    }

    #[tokio::test]
    async fn test_host_connection_limit() {
        let bus = create_test_memory_bus();
        let store = Arc::new(MetaStore::in_memory().await.unwrap());
        let status = Arc::new(StatusPublisher::new(bus.clone()));
        let (emitter, _) = TelemetryEmitter::start(bus.clone(), store.clone(), status.clone());
        let factory = MockFactory::new();
        let manager =
            ConnectionManager::new(store, emitter, status, factory.clone(), 2);

        for i in 0..2 {
            let mut config = conn(&format!("plc-{}", i), true);
            config.id = format!("plc-{}", i);
            manager
                .apply_config(ConfigEvent::Upsert(config))
                .await
                .unwrap();
        }
        assert_eq!(manager.connection_count(), 2);

        // Third connection to the same host is refused
        let result = manager
            .apply_config(ConfigEvent::Upsert(conn("plc-extra", true)))
            .await;
        assert!(matches!(result, Err(AcqError::ConfigError(_))));
        assert_eq!(manager.connection_count(), 2);

        // A different host is fine
        let other: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "id": "plc-other", "type": "s7", "enabled": true, "host": "10.0.0.6"
        }))
        .unwrap();
        manager
            .apply_config(ConfigEvent::Upsert(other))
            .await
            .unwrap();
        assert_eq!(manager.connection_count(), 3);
    }

    #[test]
    fn test_host_extraction() {
        let s7 = conn("a", true);
        assert_eq!(host_of(&s7).as_deref(), Some("10.0.0.5"));

        let ua: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "id": "b", "type": "opcua-client", "endpoint": "opc.tcp://10.0.0.7:4840/server"
        }))
        .unwrap();
        assert_eq!(host_of(&ua).as_deref(), Some("10.0.0.7"));

        let bare: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "id": "c", "type": "mqtt"
        }))
        .unwrap();
        assert_eq!(host_of(&bare), None);
    }

    #[tokio::test]
    async fn test_tag_change_reload() {
        let (manager, factory, _, store) = test_manager().await;
        sqlx::query("INSERT INTO poll_groups (id, rate_ms, enabled) VALUES (1, 1000, 1)")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tags (id, connection_id, path, name, kind, poll_group_id)
             VALUES (1, 'plc-1', 'MW0', 'a', 'INT16', 1), (2, 'plc-1', 'MW2', 'b', 'INT16', 1)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        manager
            .apply_config(ConfigEvent::Upsert(conn("plc-1", true)))
            .await
            .unwrap();
        let driver = wait_connected(&factory).await;

        // The connect task loads subscriptions from the store
        for _ in 0..50 {
            if driver.list_active_tag_ids().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(driver.list_active_tag_ids().await.len(), 2);

        // Tag 2 goes pending_delete; reload drops it
        sqlx::query("UPDATE tags SET status = 'pending_delete' WHERE id = 2")
            .execute(store.pool())
            .await
            .unwrap();
        manager.apply_tag_change("plc-1").await.unwrap();
        let active = driver.list_active_tag_ids().await;
        assert_eq!(active, HashSet::from([1]));
    }
}
