//! Service configuration
//!
//! Static service settings come from an optional YAML file merged with
//! `ACQSRV_`-prefixed environment variables. Declarative connection and
//! tag configuration does NOT live here; that arrives over the bus and
//! the metadata store.

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{AcqError, Result};

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service identifier used in logs and health output
    #[serde(default = "default_service_id")]
    pub service_id: String,

    /// Bus (redis) URL
    #[serde(default = "default_bus_url")]
    pub bus_url: String,

    /// Metadata store (SQLite) path or URL
    #[serde(default = "default_db_url")]
    pub database_url: String,

    /// Health endpoint bind settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tag reconciliation interval in seconds (clamped to >= 1)
    #[serde(default = "default_reconcile_interval_s")]
    pub reconcile_interval_s: u64,

    /// Maximum concurrent connections per host
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,

    /// EIP tuning defaults (overridable per connection via config events)
    #[serde(default)]
    pub eip: EipTuning,
}

/// Health API bind settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file directory; stdout only when absent
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: None,
        }
    }
}

/// EtherNet/IP read-sharding tuning
///
/// Values are clamped into safe ranges on load and on every live update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EipTuning {
    /// Maximum tags packed into one multiple-service request
    #[serde(default = "default_eip_max_tags")]
    pub max_tags_per_request: usize,
    /// Response byte budget per request
    #[serde(default = "default_eip_byte_budget")]
    pub byte_budget_per_request: usize,
    /// Fraction of a tick usable for sharded reads (0.1..=1.0)
    #[serde(default = "default_eip_shard_budget")]
    pub shard_budget_fraction: f64,
    /// Minimum shards per tick
    #[serde(default = "default_eip_min_shards")]
    pub min_shards_per_tick: usize,
    /// Estimated per-tag response overhead in bytes
    #[serde(default = "default_eip_tag_overhead")]
    pub tag_overhead_bytes: usize,
}

impl Default for EipTuning {
    fn default() -> Self {
        Self {
            max_tags_per_request: default_eip_max_tags(),
            byte_budget_per_request: default_eip_byte_budget(),
            shard_budget_fraction: default_eip_shard_budget(),
            min_shards_per_tick: default_eip_min_shards(),
            tag_overhead_bytes: default_eip_tag_overhead(),
        }
    }
}

impl EipTuning {
    /// Clamp every field into its sane range
    pub fn clamped(mut self) -> Self {
        self.max_tags_per_request = self.max_tags_per_request.clamp(1, 200);
        self.byte_budget_per_request = self.byte_budget_per_request.clamp(256, 4000);
        self.shard_budget_fraction = self.shard_budget_fraction.clamp(0.1, 1.0);
        self.min_shards_per_tick = self.min_shards_per_tick.clamp(1, 64);
        self.tag_overhead_bytes = self.tag_overhead_bytes.clamp(4, 256);
        self
    }
}

fn default_service_id() -> String {
    "acqsrv".to_string()
}

fn default_bus_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_db_url() -> String {
    "sqlite:data/connectivity.db".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_reconcile_interval_s() -> u64 {
    60
}

fn default_max_connections_per_host() -> usize {
    8
}

fn default_eip_max_tags() -> usize {
    40
}

fn default_eip_byte_budget() -> usize {
    1400
}

fn default_eip_shard_budget() -> f64 {
    0.5
}

fn default_eip_min_shards() -> usize {
    1
}

fn default_eip_tag_overhead() -> usize {
    12
}

impl Default for ServiceConfig {
    fn default() -> Self {
        // Figment with no file and no env produces all serde defaults
        Self::load(None).unwrap_or_else(|_| ServiceConfig {
            service_id: default_service_id(),
            bus_url: default_bus_url(),
            database_url: default_db_url(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            reconcile_interval_s: default_reconcile_interval_s(),
            max_connections_per_host: default_max_connections_per_host(),
            eip: EipTuning::default(),
        })
    }
}

impl ServiceConfig {
    /// Load from optional YAML file merged with `ACQSRV_*` env variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let mut config: ServiceConfig = figment
            .merge(Env::prefixed("ACQSRV_").split("__"))
            .extract()
            .map_err(|e| AcqError::config(format!("Service config: {}", e)))?;

        // Bounded values
        config.reconcile_interval_s = config.reconcile_interval_s.max(1);
        config.max_connections_per_host = config.max_connections_per_host.clamp(1, 64);
        config.eip = config.eip.clamped();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::load(None).unwrap();
        assert_eq!(config.service_id, "acqsrv");
        assert_eq!(config.reconcile_interval_s, 60);
        assert_eq!(config.api.port, 3100);
        assert_eq!(config.eip.max_tags_per_request, 40);
    }

    #[test]
    fn test_yaml_file_overrides() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "service_id: edge-7\nreconcile_interval_s: 0\napi:\n  port: 9000\n"
        )
        .unwrap();

        let config = ServiceConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.service_id, "edge-7");
        assert_eq!(config.api.port, 9000);
        // Interval is clamped to >= 1s
        assert_eq!(config.reconcile_interval_s, 1);
    }

    #[test]
    fn test_eip_tuning_clamps() {
        let tuning = EipTuning {
            max_tags_per_request: 0,
            byte_budget_per_request: 10_000,
            shard_budget_fraction: 3.0,
            min_shards_per_tick: 0,
            tag_overhead_bytes: 1,
        }
        .clamped();

        assert_eq!(tuning.max_tags_per_request, 1);
        assert_eq!(tuning.byte_budget_per_request, 4000);
        assert_eq!(tuning.shard_budget_fraction, 1.0);
        assert_eq!(tuning.min_shards_per_tick, 1);
        assert_eq!(tuning.tag_overhead_bytes, 4);
    }
}
