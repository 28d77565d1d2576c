//! Metadata store access
//!
//! The authoritative definitions of connections, poll groups and tags live
//! in a SQLite database maintained by the configuration service. This
//! module is the read side the engine consumes, plus the latest-value
//! cache interval publishers read from.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use edge_model::{
    ChangePolicy, ConnectionConfig, DataKind, DeadbandKind, FieldMapping, MqttPublisherConfig,
    MqttSubscriptionConfig, OnFailure, PayloadFormat, PollGroup, PublisherMapping, PublisherMode,
    Quality, TagConfig, TagStatus, Value,
};

use crate::core::drivers::GroupPlan;
use crate::error::{AcqError, Result};

/// Latest published value of one tag
#[derive(Debug, Clone)]
pub struct LatestValue {
    pub value: Value,
    pub quality: Quality,
    pub ts: DateTime<Utc>,
}

/// Metadata store handle
pub struct MetaStore {
    pool: SqlitePool,
    /// Write-through cache of the last published value per tag
    latest: DashMap<i64, LatestValue>,
}

impl MetaStore {
    /// Open the store at the given sqlx URL (e.g. `sqlite:data/meta.db`)
    pub async fn connect(url: &str) -> Result<Self> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            latest: DashMap::new(),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for unit tests
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Liveness probe for health reporting
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    async fn migrate(&self) -> Result<()> {
        let ddl = [
            "CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                type TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                params TEXT NOT NULL DEFAULT '{}'
            )",
            "CREATE TABLE IF NOT EXISTS poll_groups (
                id INTEGER PRIMARY KEY,
                rate_ms INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY,
                connection_id TEXT NOT NULL,
                path TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                poll_group_id INTEGER NOT NULL,
                subscribe INTEGER NOT NULL DEFAULT 1,
                unit TEXT,
                policy_enabled INTEGER NOT NULL DEFAULT 0,
                deadband REAL NOT NULL DEFAULT 0,
                deadband_kind TEXT NOT NULL DEFAULT 'absolute',
                heartbeat_ms INTEGER NOT NULL DEFAULT 60000,
                status TEXT NOT NULL DEFAULT 'active'
            )",
            "CREATE INDEX IF NOT EXISTS idx_tags_connection ON tags(connection_id)",
            "CREATE TABLE IF NOT EXISTS mqtt_subscriptions (
                id INTEGER PRIMARY KEY,
                connection_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                qos INTEGER NOT NULL DEFAULT 0,
                payload_format TEXT NOT NULL DEFAULT 'json',
                value_path TEXT,
                ts_path TEXT,
                quality_path TEXT,
                buffer_size INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS mqtt_field_mappings (
                id INTEGER PRIMARY KEY,
                subscription_id INTEGER NOT NULL,
                field_path TEXT NOT NULL,
                tag_id INTEGER NOT NULL,
                expected_kind TEXT NOT NULL DEFAULT 'REAL',
                on_failure TEXT NOT NULL DEFAULT 'skip'
            )",
            "CREATE TABLE IF NOT EXISTS mqtt_publishers (
                id INTEGER PRIMARY KEY,
                connection_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                interval_ms INTEGER NOT NULL DEFAULT 1000,
                payload_format TEXT NOT NULL DEFAULT 'json',
                template TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                group_id TEXT,
                edge_node_id TEXT,
                device_id TEXT
            )",
            "CREATE TABLE IF NOT EXISTS mqtt_publisher_mappings (
                id INTEGER PRIMARY KEY,
                publisher_id INTEGER NOT NULL,
                tag_id INTEGER NOT NULL,
                topic TEXT NOT NULL,
                retain INTEGER NOT NULL DEFAULT 0,
                qos INTEGER NOT NULL DEFAULT 0,
                transform TEXT
            )",
        ];
        for statement in ddl {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Enabled connection set, loaded at boot
    pub async fn load_enabled_connections(&self) -> Result<Vec<ConnectionConfig>> {
        let rows = sqlx::query("SELECT id, name, type, enabled, params FROM connections WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_connection).collect()
    }

    /// One connection by id, enabled or not
    pub async fn load_connection(&self, id: &str) -> Result<Option<ConnectionConfig>> {
        let row = sqlx::query("SELECT id, name, type, enabled, params FROM connections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_connection).transpose()
    }

    // ========================================================================
    // Tags and poll groups
    // ========================================================================

    /// Subscribed tags of one connection grouped by enabled poll group
    ///
    /// Tags whose status is not `active`, whose subscribe flag is off, or
    /// whose poll group is disabled are excluded.
    pub async fn load_group_plans(&self, connection_id: &str) -> Result<Vec<GroupPlan>> {
        let groups = self.load_poll_groups().await?;
        let tags = self.load_tags(connection_id).await?;

        let mut by_group: HashMap<i64, Vec<TagConfig>> = HashMap::new();
        for tag in tags {
            if tag.is_subscribed() {
                by_group.entry(tag.poll_group_id).or_default().push(tag);
            }
        }

        let mut plans = Vec::new();
        for (group_id, tags) in by_group {
            let Some(group) = groups.get(&group_id) else {
                return Err(AcqError::config(format!(
                    "Tag references unknown poll group {}",
                    group_id
                )));
            };
            if group.enabled {
                plans.push(GroupPlan {
                    group: group.clone(),
                    tags,
                });
            }
        }
        plans.sort_by_key(|p| p.group.id);
        Ok(plans)
    }

    /// All tags of one connection, regardless of status
    pub async fn load_tags(&self, connection_id: &str) -> Result<Vec<TagConfig>> {
        let rows = sqlx::query(
            "SELECT id, connection_id, path, name, kind, poll_group_id, subscribe, unit,
                    policy_enabled, deadband, deadband_kind, heartbeat_ms, status
             FROM tags WHERE connection_id = ?",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_tag).collect()
    }

    pub async fn load_poll_groups(&self) -> Result<HashMap<i64, PollGroup>> {
        let rows = sqlx::query("SELECT id, rate_ms, enabled FROM poll_groups")
            .fetch_all(&self.pool)
            .await?;
        let mut groups = HashMap::new();
        for row in rows {
            let group = PollGroup {
                id: row.get("id"),
                rate_ms: row.get::<i64, _>("rate_ms").max(0) as u64,
                enabled: row.get::<i64, _>("enabled") != 0,
            };
            groups.insert(group.id, group);
        }
        Ok(groups)
    }

    /// Canonical subscribed (connection, tag) pairs for the reconciler
    pub async fn subscribed_pairs(&self) -> Result<HashMap<String, HashSet<i64>>> {
        let rows = sqlx::query(
            "SELECT t.connection_id, t.id FROM tags t
             JOIN poll_groups g ON g.id = t.poll_group_id
             WHERE t.subscribe = 1 AND t.status = 'active' AND g.enabled = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut pairs: HashMap<String, HashSet<i64>> = HashMap::new();
        for row in rows {
            let connection_id: String = row.get("connection_id");
            pairs.entry(connection_id).or_default().insert(row.get("id"));
        }
        Ok(pairs)
    }

    // ========================================================================
    // MQTT subscriptions and publishers
    // ========================================================================

    pub async fn load_mqtt_subscriptions(
        &self,
        connection_id: &str,
    ) -> Result<Vec<MqttSubscriptionConfig>> {
        let rows = sqlx::query(
            "SELECT id, connection_id, topic, qos, payload_format,
                    value_path, ts_path, quality_path, buffer_size
             FROM mqtt_subscriptions WHERE connection_id = ?",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let mappings = sqlx::query(
                "SELECT field_path, tag_id, expected_kind, on_failure
                 FROM mqtt_field_mappings WHERE subscription_id = ?",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

            let field_mappings = mappings
                .iter()
                .map(|m| {
                    Ok(FieldMapping {
                        field_path: m.get("field_path"),
                        tag_id: m.get("tag_id"),
                        expected_kind: m.get::<String, _>("expected_kind").parse()?,
                        on_failure: OnFailure::parse(&m.get::<String, _>("on_failure")),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            subscriptions.push(MqttSubscriptionConfig {
                id,
                connection_id: row.get("connection_id"),
                topic: row.get("topic"),
                qos: row.get::<i64, _>("qos").clamp(0, 2) as u8,
                payload_format: PayloadFormat::parse(&row.get::<String, _>("payload_format")),
                value_path: row.get("value_path"),
                ts_path: row.get("ts_path"),
                quality_path: row.get("quality_path"),
                buffer_size: row.get::<i64, _>("buffer_size").max(0) as u32,
                field_mappings,
            });
        }
        Ok(subscriptions)
    }

    pub async fn load_mqtt_publishers(
        &self,
        connection_id: &str,
    ) -> Result<Vec<MqttPublisherConfig>> {
        let rows = sqlx::query(
            "SELECT id, connection_id, mode, interval_ms, payload_format, template,
                    enabled, group_id, edge_node_id, device_id
             FROM mqtt_publishers WHERE connection_id = ? AND enabled = 1",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;

        let mut publishers = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let mode_str: String = row.get("mode");
            let Some(mode) = PublisherMode::parse(&mode_str) else {
                return Err(AcqError::config(format!(
                    "Publisher {} has unknown mode '{}'",
                    id, mode_str
                )));
            };

            let mapping_rows = sqlx::query(
                "SELECT tag_id, topic, retain, qos, transform
                 FROM mqtt_publisher_mappings WHERE publisher_id = ?",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
            let mappings = mapping_rows
                .iter()
                .map(|m| PublisherMapping {
                    tag_id: m.get("tag_id"),
                    topic: m.get("topic"),
                    retain: m.get::<i64, _>("retain") != 0,
                    qos: m.get::<i64, _>("qos").clamp(0, 2) as u8,
                    transform: m.get("transform"),
                })
                .collect();

            publishers.push(MqttPublisherConfig {
                id,
                connection_id: row.get("connection_id"),
                mode,
                interval_ms: row.get::<i64, _>("interval_ms").max(100) as u64,
                payload_format: PayloadFormat::parse(&row.get::<String, _>("payload_format")),
                template: row.get("template"),
                enabled: true,
                group_id: row.get("group_id"),
                edge_node_id: row.get("edge_node_id"),
                device_id: row.get("device_id"),
                mappings,
            });
        }
        Ok(publishers)
    }

    // ========================================================================
    // Latest-value cache
    // ========================================================================

    /// Record the latest published value of a tag (write-through from the
    /// telemetry emitter)
    pub fn record_latest(&self, tag_id: i64, value: Value, quality: Quality, ts: DateTime<Utc>) {
        self.latest.insert(tag_id, LatestValue { value, quality, ts });
    }

    /// Current value of a tag, if one has been published
    pub fn latest_value(&self, tag_id: i64) -> Option<LatestValue> {
        self.latest.get(&tag_id).map(|v| v.clone())
    }
}

fn row_to_connection(row: &sqlx::sqlite::SqliteRow) -> Result<ConnectionConfig> {
    let params_text: String = row.get("params");
    let params: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&params_text)
        .map_err(|e| AcqError::store(format!("Connection params: {}", e)))?;
    Ok(ConnectionConfig {
        id: row.get("id"),
        name: row.get("name"),
        kind_raw: row.get("type"),
        enabled: row.get::<i64, _>("enabled") != 0,
        params,
    })
}

fn row_to_tag(row: &sqlx::sqlite::SqliteRow) -> Result<TagConfig> {
    let kind: DataKind = row.get::<String, _>("kind").parse()?;
    let deadband_kind = match row.get::<String, _>("deadband_kind").as_str() {
        "percent" => DeadbandKind::Percent,
        _ => DeadbandKind::Absolute,
    };
    Ok(TagConfig {
        id: row.get("id"),
        connection_id: row.get("connection_id"),
        path: row.get("path"),
        name: row.get("name"),
        kind,
        poll_group_id: row.get("poll_group_id"),
        subscribe: row.get::<i64, _>("subscribe") != 0,
        unit: row.get("unit"),
        policy: ChangePolicy {
            enabled: row.get::<i64, _>("policy_enabled") != 0,
            deadband: row.get("deadband"),
            deadband_kind,
            heartbeat_ms: row.get::<i64, _>("heartbeat_ms").max(0) as u64,
        },
        status: TagStatus::parse(&row.get::<String, _>("status")),
    })
}
