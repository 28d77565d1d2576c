//! Connection configuration and per-protocol parameters
//!
//! Declarative configuration arrives as JSON over the bus. The envelope
//! fields are typed here; protocol parameters stay in a raw map so unknown
//! fields survive a round trip, with typed extraction per driver.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ModelError;

/// Protocol family of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    OpcuaClient,
    OpcuaServer,
    S7,
    Eip,
    Mqtt,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::OpcuaClient => "opcua-client",
            ConnectionKind::OpcuaServer => "opcua-server",
            ConnectionKind::S7 => "s7",
            ConnectionKind::Eip => "eip",
            ConnectionKind::Mqtt => "mqtt",
        }
    }
}

impl FromStr for ConnectionKind {
    type Err = ModelError;

    /// Parse a kind string, normalizing case and dash/underscore variants
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "opcua-client" | "opcua" => Ok(ConnectionKind::OpcuaClient),
            "opcua-server" => Ok(ConnectionKind::OpcuaServer),
            "s7" | "siemens-s7" => Ok(ConnectionKind::S7),
            "eip" | "ethernet-ip" | "ethernetip" => Ok(ConnectionKind::Eip),
            "mqtt" => Ok(ConnectionKind::Mqtt),
            other => Err(ModelError::Parse(format!("Unknown connection kind: {}", other))),
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative connection definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Stable string identifier
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind_raw: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Protocol-specific fields; unknown keys are preserved
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl ConnectionConfig {
    pub fn kind(&self) -> Result<ConnectionKind, ModelError> {
        self.kind_raw.parse()
    }

    /// Extract typed parameters for a driver
    pub fn typed_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, ModelError> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone()))
            .map_err(|e| ModelError::InvalidConfig(format!("{}: {}", self.id, e)))
    }

    /// Structural equality after kind normalization; used to detect no-op
    /// upserts that must not cause a reconnect.
    pub fn same_as(&self, other: &ConnectionConfig) -> bool {
        self.id == other.id
            && self.enabled == other.enabled
            && self.kind().ok() == other.kind().ok()
            && self.params == other.params
    }
}

// ============================================================================
// Per-protocol parameter structs
// ============================================================================

/// OPC UA client parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpcuaParams {
    pub endpoint: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Accept the server certificate without a configured trust store
    #[serde(default = "default_true")]
    pub trust_server_certs: bool,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

/// Siemens S7 parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S7Params {
    pub host: String,
    #[serde(default = "default_s7_port")]
    pub port: u16,
    #[serde(default)]
    pub rack: u16,
    #[serde(default = "default_s7_slot")]
    pub slot: u16,
}

fn default_s7_port() -> u16 {
    102
}

fn default_s7_slot() -> u16 {
    1
}

/// EtherNet/IP parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EipParams {
    pub host: String,
    #[serde(default = "default_eip_port")]
    pub port: u16,
    /// Processor slot in the backplane
    #[serde(default)]
    pub slot: u8,
}

fn default_eip_port() -> u16 {
    44818
}

/// MQTT protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MqttProtocolVariant {
    #[default]
    V311,
    V5,
    Sparkplug,
}

/// MQTT broker parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttParams {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default)]
    pub protocol: MqttProtocolVariant,
    /// PEM bundle for TLS; plain TCP when absent
    #[serde(default)]
    pub ca_pem: Option<String>,
    #[serde(default)]
    pub client_cert_pem: Option<String>,
    #[serde(default)]
    pub client_key_pem: Option<String>,
    /// Sparkplug group id (sparkplug protocol only)
    #[serde(default)]
    pub group_id: Option<String>,
    /// Sparkplug edge node id (sparkplug protocol only)
    #[serde(default)]
    pub edge_node_id: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive_s() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_normalization() {
        assert_eq!(
            "opcua_client".parse::<ConnectionKind>().unwrap(),
            ConnectionKind::OpcuaClient
        );
        assert_eq!(
            "OPCUA-Client".parse::<ConnectionKind>().unwrap(),
            ConnectionKind::OpcuaClient
        );
        assert_eq!("S7".parse::<ConnectionKind>().unwrap(), ConnectionKind::S7);
        assert_eq!(
            "ethernet_ip".parse::<ConnectionKind>().unwrap(),
            ConnectionKind::Eip
        );
        assert!("profinet".parse::<ConnectionKind>().is_err());
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let json = serde_json::json!({
            "id": "plc-1",
            "name": "Press PLC",
            "type": "s7",
            "enabled": true,
            "host": "10.0.0.5",
            "rack": 0,
            "slot": 2,
            "vendor_hint": "s7-1200"
        });
        let conn: ConnectionConfig = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(conn.kind().unwrap(), ConnectionKind::S7);
        assert_eq!(conn.params.get("vendor_hint").unwrap(), "s7-1200");

        let back = serde_json::to_value(&conn).unwrap();
        assert_eq!(back["vendor_hint"], "s7-1200");
    }

    #[test]
    fn test_typed_params_extraction() {
        let conn: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "id": "plc-1",
            "type": "s7",
            "host": "10.0.0.5"
        }))
        .unwrap();
        let params: S7Params = conn.typed_params().unwrap();
        assert_eq!(params.host, "10.0.0.5");
        assert_eq!(params.port, 102);
        assert_eq!(params.rack, 0);
        assert_eq!(params.slot, 1);
    }

    #[test]
    fn test_same_as_ignores_kind_spelling() {
        let a: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "id": "b1", "type": "opcua-client", "endpoint": "opc.tcp://x:4840"
        }))
        .unwrap();
        let mut b = a.clone();
        b.kind_raw = "OPCUA_CLIENT".to_string();
        assert!(a.same_as(&b));

        b.params
            .insert("endpoint".into(), serde_json::json!("opc.tcp://y:4840"));
        assert!(!a.same_as(&b));
    }
}
