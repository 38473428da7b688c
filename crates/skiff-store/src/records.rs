//! Entity records persisted by the store.
//!
//! Enum-typed columns (status, protocol, command kind) are stored as their
//! wire strings and parsed on read; a row that fails to parse surfaces as a
//! decode error rather than a silent default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_proto::{CommandKind, CommandStatus, NodeStatus, Protocol, ProxySettings};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

fn decode<E>(column: &str, err: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    }
}

// ─── Node ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub display_name: String,
    pub host: String,
    pub port: u16,
    pub region: String,
    pub weight: u32,
    pub max_users: u32,
    pub tags: Vec<String>,
    pub status: NodeStatus,
    pub metrics_enabled: bool,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for NodeRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let tags: String = row.try_get("tags")?;
        Ok(Self {
            id: row.try_get("id")?,
            display_name: row.try_get("display_name")?,
            host: row.try_get("host")?,
            port: row.try_get("port")?,
            region: row.try_get("region")?,
            weight: row.try_get("weight")?,
            max_users: row.try_get("max_users")?,
            tags: serde_json::from_str(&tags).map_err(|e| decode("tags", e))?,
            status: status.parse().map_err(|e| decode("status", e))?,
            metrics_enabled: row.try_get("metrics_enabled")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Operator-supplied fields for a new node; everything else is server-assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNode {
    pub display_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub region: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub max_users: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metrics_enabled: bool,
}

fn default_weight() -> u32 {
    1
}

// ─── NodeToken ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeTokenRecord {
    pub id: String,
    pub node_id: String,
    pub secret_hash: String,
    pub fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl NodeTokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && !self.is_expired(now)
    }
}

// ─── User ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRecord {
    pub id: String,
    /// 0 means unlimited.
    pub traffic_limit_bytes: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    /// Whether the user's proxies may appear in rendered configs.
    pub fn is_renderable(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.expires_at.is_some_and(|t| t <= now)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUser {
    #[serde(default)]
    pub traffic_limit_bytes: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// ─── Proxy ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: String,
    pub user_id: String,
    /// None = unpinned; rendered on every assigned node when the panel's
    /// binding policy allows it.
    pub node_id: Option<String>,
    pub protocol: Protocol,
    pub listen_port: u16,
    pub settings: ProxySettings,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for ProxyRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let protocol: String = row.try_get("protocol")?;
        let settings: String = row.try_get("settings")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            node_id: row.try_get("node_id")?,
            protocol: protocol.parse().map_err(|e| decode("protocol", e))?,
            listen_port: row.try_get("listen_port")?,
            settings: serde_json::from_str(&settings).map_err(|e| decode("settings", e))?,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProxy {
    pub user_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub protocol: Protocol,
    pub listen_port: u16,
    pub settings: ProxySettings,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// ─── Assignment ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssignmentRecord {
    pub user_id: String,
    pub node_id: String,
    pub created_at: DateTime<Utc>,
}

// ─── Traffic ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrafficSampleRecord {
    pub id: String,
    pub user_id: String,
    pub node_id: String,
    pub proxy_id: Option<String>,
    pub up_bytes: i64,
    pub down_bytes: i64,
    pub recorded_at: DateTime<Utc>,
}

// ─── NodeHealth ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeHealthRecord {
    pub id: i64,
    pub node_id: String,
    pub t: DateTime<Utc>,
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub disk_pct: f32,
    pub active_conns: u32,
    pub up_delta_bytes: i64,
    pub down_delta_bytes: i64,
    pub forwarder_alive: bool,
}

// ─── Command ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: String,
    pub node_id: String,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub attempts: u32,
    pub timeout_secs: u32,
    pub queued_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for CommandRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            kind: kind.parse().map_err(|e| decode("kind", e))?,
            status: status.parse().map_err(|e| decode("status", e))?,
            attempts: row.try_get("attempts")?,
            timeout_secs: row.try_get("timeout_secs")?,
            queued_at: row.try_get("queued_at")?,
            delivered_at: row.try_get("delivered_at")?,
            completed_at: row.try_get("completed_at")?,
            success: row.try_get("success")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
        })
    }
}
