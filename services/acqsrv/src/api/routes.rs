//! Health and status handlers

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use edge_bus::Bus;

use crate::core::emitter::StatusPublisher;
use crate::core::manager::ConnectionManager;
use crate::core::store::MetaStore;
use crate::utils::time::bus_timestamp;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service_id: String,
    pub manager: Arc<ConnectionManager>,
    pub status: Arc<StatusPublisher>,
    pub bus: Arc<dyn Bus>,
    pub store: Arc<MetaStore>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

/// GET /health
///
/// `{service, bus_ok, connections, database_ok, ts}`
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let bus_ok = state.bus.is_connected().await;
    let database_ok = state.store.is_healthy().await;
    Json(serde_json::json!({
        "service": state.service_id,
        "bus_ok": bus_ok,
        "connections": state.manager.connection_count(),
        "database_ok": database_ok,
        "ts": bus_timestamp(),
    }))
}

/// GET /status
///
/// Per-connection states plus counts.
async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut connections: Vec<serde_json::Value> = state
        .status
        .snapshot()
        .into_iter()
        .map(|(id, conn_state)| {
            serde_json::json!({"id": id, "state": conn_state.as_str()})
        })
        .collect();
    connections.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    Json(serde_json::json!({
        "service": state.service_id,
        "total": state.manager.connection_count(),
        "connected": state.manager.connected_count().await,
        "connections": connections,
        "ts": bus_timestamp(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::emitter::{ConnState, TelemetryEmitter};
    use crate::core::manager::tests::test_manager;

    async fn test_state() -> AppState {
        let (manager, _, bus, store) = test_manager().await;
        let status = Arc::new(StatusPublisher::new(bus.clone()));
        let (_, _handle) = TelemetryEmitter::start(bus.clone(), store.clone(), status.clone());
        AppState {
            service_id: "acqsrv".into(),
            manager,
            status,
            bus,
            store,
        }
    }

    #[tokio::test]
    async fn test_health_payload() {
        let state = test_state().await;
        let Json(body) = health(State(state)).await;
        assert_eq!(body["service"], "acqsrv");
        assert_eq!(body["bus_ok"], true);
        assert_eq!(body["database_ok"], true);
        assert_eq!(body["connections"], 0);
        assert!(body["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_status_payload() {
        let state = test_state().await;
        state
            .status
            .set_state("plc-1", ConnState::Connected, None)
            .await;
        state.status.set_state("plc-2", ConnState::Error, Some("x")).await;

        let Json(body) = status(State(state)).await;
        let connections = body["connections"].as_array().unwrap();
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0]["id"], "plc-1");
        assert_eq!(connections[0]["state"], "connected");
        assert_eq!(connections[1]["state"], "error");
    }
}
