//! SQLite-backed store for the Skiff panel.
//!
//! Owns every persistent entity (nodes, tokens, users, proxies,
//! assignments, traffic, health samples, commands), the forward-only
//! migration chain, and the per-node render-invalidation registry that the
//! config renderer consults for cache coherence.

#![forbid(unsafe_code)]

pub mod records;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use skiff_proto::{CommandKind, CommandStatus, NodeStatus};

pub use records::{
    AssignmentRecord, CommandRecord, NewNode, NewProxy, NewUser, NodeHealthRecord, NodeRecord,
    NodeTokenRecord, ProxyRecord, TrafficSampleRecord, UserRecord,
};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient failure; callers in background loops retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// The database was written by a newer binary. Fatal at startup.
    #[error("schema version {found} is newer than the supported {expected}")]
    SchemaMismatch { found: i64, expected: i64 },

    #[error("migration v{version} failed: {source}")]
    Migration { version: i64, source: sqlx::Error },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ─── Migrations ───────────────────────────────────────────────────────────────

/// Forward-only migration chain. Never edit a shipped entry; append.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE nodes (
            id                TEXT PRIMARY KEY,
            display_name      TEXT NOT NULL,
            host              TEXT NOT NULL,
            port              INTEGER NOT NULL,
            region            TEXT NOT NULL DEFAULT '',
            weight            INTEGER NOT NULL DEFAULT 1,
            max_users         INTEGER NOT NULL DEFAULT 0,
            tags              TEXT NOT NULL DEFAULT '[]',
            status            TEXT NOT NULL DEFAULT 'offline',
            metrics_enabled   INTEGER NOT NULL DEFAULT 0,
            last_heartbeat_at TEXT,
            created_at        TEXT NOT NULL
        );
        CREATE TABLE node_tokens (
            id          TEXT PRIMARY KEY,
            node_id     TEXT NOT NULL REFERENCES nodes(id),
            secret_hash TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            issued_at   TEXT NOT NULL,
            expires_at  TEXT,
            revoked_at  TEXT
        );
        CREATE UNIQUE INDEX idx_node_tokens_live ON node_tokens(node_id) WHERE revoked_at IS NULL;
        CREATE INDEX idx_node_tokens_hash ON node_tokens(secret_hash);
        CREATE TABLE users (
            id                  TEXT PRIMARY KEY,
            traffic_limit_bytes INTEGER NOT NULL DEFAULT 0,
            expires_at          TEXT,
            enabled             INTEGER NOT NULL DEFAULT 1,
            created_at          TEXT NOT NULL
        );
        CREATE TABLE proxies (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            node_id     TEXT REFERENCES nodes(id),
            protocol    TEXT NOT NULL,
            listen_port INTEGER NOT NULL,
            settings    TEXT NOT NULL DEFAULT '{}',
            enabled     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX idx_proxies_node_enabled ON proxies(node_id, enabled);
        CREATE TABLE user_node_assignments (
            user_id    TEXT NOT NULL REFERENCES users(id),
            node_id    TEXT NOT NULL REFERENCES nodes(id),
            created_at TEXT NOT NULL,
            PRIMARY KEY (user_id, node_id)
        );
        CREATE INDEX idx_assignments_node ON user_node_assignments(node_id);
        "#,
    ),
    (
        2,
        r#"
        CREATE TABLE traffic_samples (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            node_id     TEXT NOT NULL,
            proxy_id    TEXT,
            up_bytes    INTEGER NOT NULL,
            down_bytes  INTEGER NOT NULL,
            recorded_at TEXT NOT NULL
        );
        CREATE INDEX idx_traffic_user_time ON traffic_samples(user_id, recorded_at);
        CREATE INDEX idx_traffic_node_time ON traffic_samples(node_id, recorded_at);
        CREATE TABLE traffic_batches (
            node_id     TEXT NOT NULL,
            batch_id    TEXT NOT NULL,
            received_at TEXT NOT NULL,
            PRIMARY KEY (node_id, batch_id)
        );
        "#,
    ),
    (
        3,
        r#"
        CREATE TABLE node_health (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id          TEXT NOT NULL,
            t                TEXT NOT NULL,
            cpu_pct          REAL NOT NULL,
            mem_pct          REAL NOT NULL,
            disk_pct         REAL NOT NULL,
            active_conns     INTEGER NOT NULL,
            up_delta_bytes   INTEGER NOT NULL,
            down_delta_bytes INTEGER NOT NULL,
            forwarder_alive  INTEGER NOT NULL
        );
        CREATE INDEX idx_node_health_node_time ON node_health(node_id, t);
        "#,
    ),
    (
        4,
        r#"
        CREATE TABLE commands (
            id           TEXT PRIMARY KEY,
            node_id      TEXT NOT NULL,
            kind         TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'queued',
            attempts     INTEGER NOT NULL DEFAULT 0,
            timeout_secs INTEGER NOT NULL DEFAULT 120,
            queued_at    TEXT NOT NULL,
            delivered_at TEXT,
            completed_at TEXT,
            success      INTEGER,
            output       TEXT,
            error        TEXT
        );
        CREATE INDEX idx_commands_node_status ON commands(node_id, status);
        "#,
    ),
];

/// Latest schema version this binary understands.
pub fn latest_schema_version() -> i64 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}

/// Apply pending migrations, one transaction each.
pub async fn migrate(pool: &SqlitePool) -> Result<i64> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;

    let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(pool)
        .await?;

    let expected = latest_schema_version();
    if current > expected {
        return Err(StoreError::SchemaMismatch {
            found: current,
            expected,
        });
    }

    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(*sql)
            .execute(&mut *tx)
            .await
            .map_err(|source| StoreError::Migration {
                version: *version,
                source,
            })?;
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(version, "applied schema migration");
    }

    Ok(expected)
}

// ─── Render invalidation registry ─────────────────────────────────────────────

/// Per-node generation counters, bumped synchronously after every committed
/// write touching a node's rendered inputs. The renderer caches against the
/// generation it rendered at.
#[derive(Default)]
pub struct RenderInvalidations {
    generations: RwLock<HashMap<String, u64>>,
}

impl RenderInvalidations {
    pub fn generation(&self, node_id: &str) -> u64 {
        self.generations.read().get(node_id).copied().unwrap_or(0)
    }

    fn bump(&self, node_id: &str) {
        let mut map = self.generations.write();
        let g = map.entry(node_id.to_string()).or_insert(0);
        *g += 1;
        debug!(node = %node_id, generation = *g, "render inputs invalidated");
    }
}

// ─── Status counts ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusCounts {
    pub total: u32,
    pub online: u32,
    pub degraded: u32,
    pub offline: u32,
    pub unknown: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandSweep {
    pub requeued: u32,
    pub expired: u32,
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// Handle to the panel database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    invalidations: Arc<RenderInvalidations>,
}

impl Store {
    /// Open (creating if missing) and migrate a database at the given URL.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        migrate(&pool).await?;
        Ok(Self {
            pool,
            invalidations: Arc::new(RenderInvalidations::default()),
        })
    }

    /// In-memory database for tests. Single connection so state is shared.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        migrate(&pool).await?;
        Ok(Self {
            pool,
            invalidations: Arc::new(RenderInvalidations::default()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current render generation for a node (see [`RenderInvalidations`]).
    pub fn render_generation(&self, node_id: &str) -> u64 {
        self.invalidations.generation(node_id)
    }

    /// Bump render generations for every node the user is assigned to.
    async fn bump_for_user(&self, user_id: &str) -> Result<()> {
        let nodes: Vec<String> =
            sqlx::query_scalar("SELECT node_id FROM user_node_assignments WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        for node_id in nodes {
            self.invalidations.bump(&node_id);
        }
        Ok(())
    }

    // ─── Nodes ────────────────────────────────────────────────────────────

    pub async fn create_node(&self, new: NewNode) -> Result<NodeRecord> {
        let record = NodeRecord {
            id: Uuid::new_v4().to_string(),
            display_name: new.display_name,
            host: new.host,
            port: new.port,
            region: new.region,
            weight: new.weight,
            max_users: new.max_users,
            tags: new.tags,
            status: NodeStatus::Offline,
            metrics_enabled: new.metrics_enabled,
            last_heartbeat_at: None,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO nodes (id, display_name, host, port, region, weight, max_users, tags, status, metrics_enabled, last_heartbeat_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.display_name)
        .bind(&record.host)
        .bind(record.port)
        .bind(&record.region)
        .bind(record.weight)
        .bind(record.max_users)
        .bind(serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string()))
        .bind(record.status.to_string())
        .bind(record.metrics_enabled)
        .bind(record.last_heartbeat_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        info!(node = %record.id, name = %record.display_name, "node created");
        Ok(record)
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<NodeRecord>> {
        let row = sqlx::query_as::<_, NodeRecord>("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query_as::<_, NodeRecord>("SELECT * FROM nodes ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Update operator-owned node fields. Status and heartbeat are untouched.
    pub async fn update_node(&self, record: &NodeRecord) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE nodes SET display_name = ?, host = ?, port = ?, region = ?, weight = ?, max_users = ?, tags = ?, metrics_enabled = ? WHERE id = ?",
        )
        .bind(&record.display_name)
        .bind(&record.host)
        .bind(record.port)
        .bind(&record.region)
        .bind(record.weight)
        .bind(record.max_users)
        .bind(serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string()))
        .bind(record.metrics_enabled)
        .bind(&record.id)
        .execute(&self.pool)
        .await?;
        self.invalidations.bump(&record.id);
        Ok(result.rows_affected() > 0)
    }

    /// Delete a node: revokes its tokens and removes its assignments in the
    /// same transaction. Pinned proxies are un-pinned; traffic is retained.
    pub async fn delete_node(&self, id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE node_tokens SET revoked_at = ? WHERE node_id = ? AND revoked_at IS NULL")
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_node_assignments WHERE node_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE proxies SET node_id = NULL WHERE node_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.invalidations.bump(id);
        Ok(result.rows_affected() > 0)
    }

    /// Record a heartbeat arrival. Called only by the heartbeat service.
    pub async fn record_heartbeat(
        &self,
        id: &str,
        status: NodeStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE nodes SET status = ?, last_heartbeat_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Demotion-only status write used by the liveness sweeper.
    pub async fn set_status(&self, id: &str, status: NodeStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE nodes SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, u32)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM nodes GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.total += n;
            match status.parse::<NodeStatus>() {
                Ok(NodeStatus::Online) => counts.online += n,
                Ok(NodeStatus::Degraded) => counts.degraded += n,
                Ok(NodeStatus::Offline) => counts.offline += n,
                Ok(NodeStatus::Unknown) | Err(_) => counts.unknown += n,
            }
        }
        Ok(counts)
    }

    // ─── Node tokens ──────────────────────────────────────────────────────

    /// Persist a freshly issued token, revoking any prior live token for the
    /// node in the same transaction.
    pub async fn issue_token(
        &self,
        node_id: &str,
        secret_hash: &str,
        fingerprint: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<NodeTokenRecord> {
        let record = NodeTokenRecord {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            secret_hash: secret_hash.to_string(),
            fingerprint: fingerprint.to_string(),
            issued_at: Utc::now(),
            expires_at,
            revoked_at: None,
        };
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE node_tokens SET revoked_at = ? WHERE node_id = ? AND revoked_at IS NULL")
            .bind(record.issued_at)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO node_tokens (id, node_id, secret_hash, fingerprint, issued_at, expires_at, revoked_at) \
             VALUES (?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&record.id)
        .bind(&record.node_id)
        .bind(&record.secret_hash)
        .bind(&record.fingerprint)
        .bind(record.issued_at)
        .bind(record.expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Look up a non-revoked token by secret hash. Expiry is checked by the
    /// token authority so the rejection can be logged precisely.
    pub async fn find_token_by_hash(&self, secret_hash: &str) -> Result<Option<NodeTokenRecord>> {
        let row = sqlx::query_as::<_, NodeTokenRecord>(
            "SELECT * FROM node_tokens WHERE secret_hash = ? AND revoked_at IS NULL",
        )
        .bind(secret_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn live_token_for_node(&self, node_id: &str) -> Result<Option<NodeTokenRecord>> {
        let row = sqlx::query_as::<_, NodeTokenRecord>(
            "SELECT * FROM node_tokens WHERE node_id = ? AND revoked_at IS NULL",
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn revoke_tokens(&self, node_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE node_tokens SET revoked_at = ? WHERE node_id = ? AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ─── Users ────────────────────────────────────────────────────────────

    pub async fn create_user(&self, new: NewUser) -> Result<UserRecord> {
        let record = UserRecord {
            id: Uuid::new_v4().to_string(),
            traffic_limit_bytes: new.traffic_limit_bytes,
            expires_at: new.expires_at,
            enabled: new.enabled,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO users (id, traffic_limit_bytes, expires_at, enabled, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.traffic_limit_bytes)
        .bind(record.expires_at)
        .bind(record.enabled)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query_as::<_, UserRecord>("SELECT * FROM users ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn update_user(&self, record: &UserRecord) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET traffic_limit_bytes = ?, expires_at = ?, enabled = ? WHERE id = ?",
        )
        .bind(record.traffic_limit_bytes)
        .bind(record.expires_at)
        .bind(record.enabled)
        .bind(&record.id)
        .execute(&self.pool)
        .await?;
        self.bump_for_user(&record.id).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_user(&self, id: &str) -> Result<bool> {
        self.bump_for_user(id).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM proxies WHERE user_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_node_assignments WHERE user_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Users assigned to a node, regardless of enabled/expiry state; the
    /// renderer applies the renderability filter.
    pub async fn users_for_node(&self, node_id: &str) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query_as::<_, UserRecord>(
            "SELECT u.* FROM users u \
             JOIN user_node_assignments a ON a.user_id = u.id \
             WHERE a.node_id = ? ORDER BY u.id",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ─── Proxies ──────────────────────────────────────────────────────────

    pub async fn create_proxy(&self, new: NewProxy) -> Result<ProxyRecord> {
        let record = ProxyRecord {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            node_id: new.node_id,
            protocol: new.protocol,
            listen_port: new.listen_port,
            settings: new.settings,
            enabled: new.enabled,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO proxies (id, user_id, node_id, protocol, listen_port, settings, enabled, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.node_id)
        .bind(record.protocol.to_string())
        .bind(record.listen_port)
        .bind(serde_json::to_string(&record.settings).unwrap_or_else(|_| "{}".to_string()))
        .bind(record.enabled)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        match &record.node_id {
            Some(node_id) => self.invalidations.bump(node_id),
            None => self.bump_for_user(&record.user_id).await?,
        }
        Ok(record)
    }

    pub async fn get_proxy(&self, id: &str) -> Result<Option<ProxyRecord>> {
        let row = sqlx::query_as::<_, ProxyRecord>("SELECT * FROM proxies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_proxies_for_user(&self, user_id: &str) -> Result<Vec<ProxyRecord>> {
        let rows =
            sqlx::query_as::<_, ProxyRecord>("SELECT * FROM proxies WHERE user_id = ? ORDER BY id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn update_proxy(&self, record: &ProxyRecord) -> Result<bool> {
        let previous = self.get_proxy(&record.id).await?;
        let result = sqlx::query(
            "UPDATE proxies SET node_id = ?, protocol = ?, listen_port = ?, settings = ?, enabled = ? WHERE id = ?",
        )
        .bind(&record.node_id)
        .bind(record.protocol.to_string())
        .bind(record.listen_port)
        .bind(serde_json::to_string(&record.settings).unwrap_or_else(|_| "{}".to_string()))
        .bind(record.enabled)
        .bind(&record.id)
        .execute(&self.pool)
        .await?;
        // Both the old and new placement are stale.
        for node_id in [
            previous.as_ref().and_then(|p| p.node_id.clone()),
            record.node_id.clone(),
        ]
        .into_iter()
        .flatten()
        {
            self.invalidations.bump(&node_id);
        }
        if previous.as_ref().is_some_and(|p| p.node_id.is_none()) || record.node_id.is_none() {
            self.bump_for_user(&record.user_id).await?;
        }
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_proxy(&self, id: &str) -> Result<bool> {
        let previous = self.get_proxy(id).await?;
        let result = sqlx::query("DELETE FROM proxies WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if let Some(p) = previous {
            match p.node_id {
                Some(node_id) => self.invalidations.bump(&node_id),
                None => self.bump_for_user(&p.user_id).await?,
            }
        }
        Ok(result.rows_affected() > 0)
    }

    /// Enabled proxies that belong in a node's rendered config: pinned to the
    /// node, or unpinned when the binding policy includes them. Only proxies
    /// of assigned users qualify.
    pub async fn proxies_for_node(
        &self,
        node_id: &str,
        include_unpinned: bool,
    ) -> Result<Vec<ProxyRecord>> {
        let rows = sqlx::query_as::<_, ProxyRecord>(
            "SELECT p.* FROM proxies p \
             JOIN user_node_assignments a ON a.user_id = p.user_id AND a.node_id = ? \
             WHERE p.enabled = 1 AND (p.node_id = ? OR (p.node_id IS NULL AND ?)) \
             ORDER BY p.id",
        )
        .bind(node_id)
        .bind(node_id)
        .bind(include_unpinned)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ─── Assignments ──────────────────────────────────────────────────────

    pub async fn assign_user(&self, user_id: &str, node_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO user_node_assignments (user_id, node_id, created_at) VALUES (?, ?, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(node_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.invalidations.bump(node_id);
        Ok(result.rows_affected() > 0)
    }

    pub async fn unassign_user(&self, user_id: &str, node_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM user_node_assignments WHERE user_id = ? AND node_id = ?")
                .bind(user_id)
                .bind(node_id)
                .execute(&self.pool)
                .await?;
        self.invalidations.bump(node_id);
        Ok(result.rows_affected() > 0)
    }

    pub async fn assignments_for_node(&self, node_id: &str) -> Result<Vec<AssignmentRecord>> {
        let rows = sqlx::query_as::<_, AssignmentRecord>(
            "SELECT * FROM user_node_assignments WHERE node_id = ? ORDER BY created_at",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn nodes_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        let rows =
            sqlx::query_scalar("SELECT node_id FROM user_node_assignments WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    // ─── Traffic ──────────────────────────────────────────────────────────

    /// Insert a traffic batch. Returns false (and writes nothing) when the
    /// (node, batch) pair was already ingested.
    pub async fn insert_traffic_batch(
        &self,
        node_id: &str,
        batch_id: &str,
        samples: &[TrafficSampleRecord],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "INSERT INTO traffic_batches (node_id, batch_id, received_at) VALUES (?, ?, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(node_id)
        .bind(batch_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(node = %node_id, batch = %batch_id, "duplicate traffic batch ignored");
            return Ok(false);
        }
        for sample in samples {
            sqlx::query(
                "INSERT INTO traffic_samples (id, user_id, node_id, proxy_id, up_bytes, down_bytes, recorded_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&sample.id)
            .bind(&sample.user_id)
            .bind(&sample.node_id)
            .bind(&sample.proxy_id)
            .bind(sample.up_bytes)
            .bind(sample.down_bytes)
            .bind(sample.recorded_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Σ(up, down) for one user over [t0, t1). The user filter is part of the
    /// query contract; see the traffic service's isolation tests.
    pub async fn traffic_sum_for_user(
        &self,
        user_id: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<(i64, i64)> {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(up_bytes), 0), COALESCE(SUM(down_bytes), 0) \
             FROM traffic_samples WHERE user_id = ? AND recorded_at >= ? AND recorded_at < ?",
        )
        .bind(user_id)
        .bind(t0)
        .bind(t1)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn traffic_rows_for_user(
        &self,
        user_id: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<Vec<TrafficSampleRecord>> {
        let rows = sqlx::query_as::<_, TrafficSampleRecord>(
            "SELECT * FROM traffic_samples \
             WHERE user_id = ? AND recorded_at >= ? AND recorded_at < ? ORDER BY recorded_at",
        )
        .bind(user_id)
        .bind(t0)
        .bind(t1)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn traffic_sum_for_node(
        &self,
        node_id: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<(i64, i64)> {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(up_bytes), 0), COALESCE(SUM(down_bytes), 0) \
             FROM traffic_samples WHERE node_id = ? AND recorded_at >= ? AND recorded_at < ?",
        )
        .bind(node_id)
        .bind(t0)
        .bind(t1)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    // ─── Node health ──────────────────────────────────────────────────────

    pub async fn insert_health_sample(
        &self,
        node_id: &str,
        t: DateTime<Utc>,
        cpu_pct: f32,
        mem_pct: f32,
        disk_pct: f32,
        active_conns: u32,
        up_delta_bytes: i64,
        down_delta_bytes: i64,
        forwarder_alive: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_health (node_id, t, cpu_pct, mem_pct, disk_pct, active_conns, up_delta_bytes, down_delta_bytes, forwarder_alive) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(node_id)
        .bind(t)
        .bind(cpu_pct)
        .bind(mem_pct)
        .bind(disk_pct)
        .bind(active_conns)
        .bind(up_delta_bytes)
        .bind(down_delta_bytes)
        .bind(forwarder_alive)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn health_window(
        &self,
        node_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<NodeHealthRecord>> {
        let rows = sqlx::query_as::<_, NodeHealthRecord>(
            "SELECT * FROM node_health WHERE node_id = ? AND t >= ? ORDER BY t",
        )
        .bind(node_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn prune_health_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM node_health WHERE t < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let pruned = result.rows_affected();
        if pruned > 0 {
            debug!(pruned, "pruned node health samples");
        }
        Ok(pruned)
    }

    // ─── Commands ─────────────────────────────────────────────────────────

    pub async fn enqueue_command(
        &self,
        node_id: &str,
        kind: CommandKind,
        timeout_secs: u32,
    ) -> Result<CommandRecord> {
        let record = CommandRecord {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            kind,
            status: CommandStatus::Queued,
            attempts: 0,
            timeout_secs,
            queued_at: Utc::now(),
            delivered_at: None,
            completed_at: None,
            success: None,
            output: None,
            error: None,
        };
        sqlx::query(
            "INSERT INTO commands (id, node_id, kind, status, attempts, timeout_secs, queued_at) \
             VALUES (?, ?, ?, 'queued', 0, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.node_id)
        .bind(record.kind.to_string())
        .bind(record.timeout_secs)
        .bind(record.queued_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    /// Atomically drain queued commands for a node, marking them delivered.
    pub async fn take_queued_commands(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CommandRecord>> {
        let mut tx = self.pool.begin().await?;
        let mut rows = sqlx::query_as::<_, CommandRecord>(
            "SELECT * FROM commands WHERE node_id = ? AND status = 'queued' ORDER BY queued_at",
        )
        .bind(node_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in &mut rows {
            sqlx::query(
                "UPDATE commands SET status = 'delivered', delivered_at = ?, attempts = attempts + 1 WHERE id = ?",
            )
            .bind(now)
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;
            row.status = CommandStatus::Delivered;
            row.delivered_at = Some(now);
            row.attempts += 1;
        }
        tx.commit().await?;
        Ok(rows)
    }

    /// Record an agent's result for a delivered command.
    pub async fn complete_command(
        &self,
        command_id: &str,
        success: bool,
        output: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE commands SET status = 'completed', completed_at = ?, success = ?, output = ?, error = ? \
             WHERE id = ? AND status = 'delivered'",
        )
        .bind(now)
        .bind(success)
        .bind(output)
        .bind(error)
        .bind(command_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_command(&self, id: &str) -> Result<Option<CommandRecord>> {
        let row = sqlx::query_as::<_, CommandRecord>("SELECT * FROM commands WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_commands_for_node(
        &self,
        node_id: &str,
        limit: u32,
    ) -> Result<Vec<CommandRecord>> {
        let rows = sqlx::query_as::<_, CommandRecord>(
            "SELECT * FROM commands WHERE node_id = ? ORDER BY queued_at DESC LIMIT ?",
        )
        .bind(node_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Requeue delivered commands whose result never arrived within their
    /// timeout; expire them after the second delivery attempt.
    pub async fn sweep_commands(&self, now: DateTime<Utc>) -> Result<CommandSweep> {
        let stale = sqlx::query_as::<_, CommandRecord>(
            "SELECT * FROM commands WHERE status = 'delivered'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut sweep = CommandSweep::default();
        for command in stale {
            let Some(delivered_at) = command.delivered_at else {
                continue;
            };
            let deadline = delivered_at + chrono::Duration::seconds(command.timeout_secs as i64);
            if now < deadline {
                continue;
            }
            if command.attempts >= 2 {
                sqlx::query("UPDATE commands SET status = 'expired', completed_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(&command.id)
                    .execute(&self.pool)
                    .await?;
                sweep.expired += 1;
                warn!(command = %command.id, node = %command.node_id, kind = %command.kind, "command expired after retry");
            } else {
                sqlx::query(
                    "UPDATE commands SET status = 'queued', delivered_at = NULL WHERE id = ?",
                )
                .bind(&command.id)
                .execute(&self.pool)
                .await?;
                sweep.requeued += 1;
                debug!(command = %command.id, node = %command.node_id, "command requeued for redelivery");
            }
        }
        Ok(sweep)
    }
}
