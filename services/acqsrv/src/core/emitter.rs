//! Telemetry and status emission
//!
//! Drivers hand observations to a typed channel; the emitter drains it,
//! encodes each record onto the per-connection telemetry subject, updates
//! the latest-value cache, and aggregates a sliding one-second window of
//! rate/byte/error counters that flushes into status updates.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use edge_bus::{subjects, Bus};
use edge_model::{Observation, Quality, TagRef};

use crate::core::store::MetaStore;
use crate::utils::time::{bus_timestamp, format_bus_timestamp};

const SINK_BUFFER: usize = 8192;
const BROADCAST_BUFFER: usize = 1024;
const WINDOW_MS: u128 = 1000;

// ============================================================================
// Connection state
// ============================================================================

/// Connection state as carried on the status subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Disabled,
    Connecting,
    Connected,
    Error,
    Disconnected,
    Deleted,
    Unknown,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Disabled => "disabled",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Error => "error",
            ConnState::Disconnected => "disconnected",
            ConnState::Deleted => "deleted",
            ConnState::Unknown => "unknown",
        }
    }
}

/// Per-connection rate/byte/error stats of the last window
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WindowStats {
    pub rps: u64,
    pub bps: u64,
    pub errors: u64,
    pub last_seen_ts: Option<String>,
}

// ============================================================================
// Status publisher
// ============================================================================

/// Tracks the current state of every connection and publishes transitions
pub struct StatusPublisher {
    bus: Arc<dyn Bus>,
    states: DashMap<String, ConnState>,
}

impl StatusPublisher {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            states: DashMap::new(),
        }
    }

    /// Record a state transition and publish it with a reason
    pub async fn set_state(&self, id: &str, state: ConnState, reason: Option<&str>) {
        let previous = self.states.insert(id.to_string(), state);
        if previous == Some(state) {
            // No transition, no churn
            return;
        }
        debug!("{}: {} ({})", id, state.as_str(), reason.unwrap_or("-"));

        let mut payload = serde_json::json!({
            "schema": "connectivity.status@v1",
            "ts": bus_timestamp(),
            "id": id,
            "state": state.as_str(),
        });
        if let Some(reason) = reason {
            payload["reason"] = serde_json::Value::String(reason.to_string());
        }
        if let Err(e) = self.bus.publish_json(&subjects::status_v1(id), &payload).await {
            warn!("{}: status publish failed: {}", id, e);
        }
    }

    /// Publish a stats-bearing status update without changing state
    pub async fn publish_stats(&self, id: &str, stats: &WindowStats) {
        let state = self.state_of(id);
        let payload = serde_json::json!({
            "schema": "connectivity.status@v1",
            "ts": bus_timestamp(),
            "id": id,
            "state": state.as_str(),
            "stats": stats,
        });
        if let Err(e) = self.bus.publish_json(&subjects::status_v1(id), &payload).await {
            warn!("{}: stats publish failed: {}", id, e);
        }
    }

    pub fn state_of(&self, id: &str) -> ConnState {
        self.states
            .get(id)
            .map(|s| *s)
            .unwrap_or(ConnState::Unknown)
    }

    /// Forget a deleted connection after its final status was published
    pub fn forget(&self, id: &str) {
        self.states.remove(id);
    }

    /// Snapshot for the /status endpoint
    pub fn snapshot(&self) -> Vec<(String, ConnState)> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

// ============================================================================
// Telemetry emitter
// ============================================================================

struct WindowAgg {
    window_start: Instant,
    count: u64,
    bytes: u64,
    errors: u64,
    last_seen: Option<DateTime<Utc>>,
}

impl WindowAgg {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
            bytes: 0,
            errors: 0,
            last_seen: None,
        }
    }

    fn take_if_elapsed(&mut self) -> Option<WindowStats> {
        let elapsed = self.window_start.elapsed().as_millis();
        if elapsed < WINDOW_MS || (self.count == 0 && self.errors == 0) {
            return None;
        }
        let factor = 1000.0 / elapsed as f64;
        let stats = WindowStats {
            rps: (self.count as f64 * factor).round() as u64,
            bps: (self.bytes as f64 * factor).round() as u64,
            errors: self.errors,
            last_seen_ts: self.last_seen.map(format_bus_timestamp),
        };
        let last_seen = self.last_seen;
        *self = WindowAgg::new();
        self.last_seen = last_seen;
        Some(stats)
    }
}

/// Drains the observation sink into the telemetry subject
pub struct TelemetryEmitter {
    bus: Arc<dyn Bus>,
    store: Arc<MetaStore>,
    status: Arc<StatusPublisher>,
    sink_tx: mpsc::Sender<Observation>,
    broadcast_tx: broadcast::Sender<Observation>,
    windows: Arc<DashMap<String, WindowAgg>>,
}

impl TelemetryEmitter {
    /// Create the emitter and start its background drain task
    pub fn start(
        bus: Arc<dyn Bus>,
        store: Arc<MetaStore>,
        status: Arc<StatusPublisher>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (sink_tx, sink_rx) = mpsc::channel(SINK_BUFFER);
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_BUFFER);
        let emitter = Arc::new(Self {
            bus,
            store,
            status,
            sink_tx,
            broadcast_tx,
            windows: Arc::new(DashMap::new()),
        });
        let handle = tokio::spawn(Arc::clone(&emitter).run(sink_rx));
        (emitter, handle)
    }

    /// Sink handed to drivers at construction
    pub fn sink(&self) -> mpsc::Sender<Observation> {
        self.sink_tx.clone()
    }

    /// Live observation feed for on-change publishers
    pub fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.broadcast_tx.subscribe()
    }

    /// Count an error that is not tied to a specific observation
    pub fn record_error(&self, connection_id: &str) {
        self.windows
            .entry(connection_id.to_string())
            .or_insert_with(WindowAgg::new)
            .errors += 1;
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Observation>) {
        let mut flush_tick = tokio::time::interval(std::time::Duration::from_millis(250));
        loop {
            tokio::select! {
                maybe_obs = rx.recv() => {
                    let Some(obs) = maybe_obs else {
                        debug!("Observation sink closed, emitter stopping");
                        return;
                    };
                    self.handle_observation(obs).await;
                }
                _ = flush_tick.tick() => {
                    self.flush_elapsed_windows().await;
                }
            }
        }
    }

    async fn handle_observation(&self, obs: Observation) {
        let payload = obs.to_wire_json();
        let encoded = payload.to_string();
        let size = encoded.len() as u64;

        if let TagRef::Id(tag_id) = obs.tag {
            self.store
                .record_latest(tag_id, obs.value.clone(), obs.quality, obs.ts);
        }

        // Best-effort: bus loss drops telemetry but keeps local counters
        if let Err(e) = self
            .bus
            .publish(&subjects::telemetry_raw(&obs.connection_id), Bytes::from(encoded))
            .await
        {
            warn!("{}: telemetry publish failed: {}", obs.connection_id, e);
        }

        {
            let mut window = self
                .windows
                .entry(obs.connection_id.clone())
                .or_insert_with(WindowAgg::new);
            window.count += 1;
            window.bytes += size;
            window.last_seen = Some(obs.ts);
            if obs.quality == Quality::Bad {
                window.errors += 1;
            }
        }

        let _ = self.broadcast_tx.send(obs);
    }

    async fn flush_elapsed_windows(&self) {
        let mut flushes = Vec::new();
        for mut entry in self.windows.iter_mut() {
            if let Some(stats) = entry.value_mut().take_if_elapsed() {
                flushes.push((entry.key().clone(), stats));
            }
        }
        for (id, stats) in flushes {
            self.status.publish_stats(&id, &stats).await;
        }
    }
}
