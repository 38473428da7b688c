//! Admin-facing endpoints, guarded by the operator bearer token.

use axum::Json;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::{header, request::Parts};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use skiff_deploy::{DeployError, DeployReport, DeployTarget, TestConnectionReport, bootstrap_script};
use skiff_proto::{
    CommandKind, Envelope, ErrorCode, NodeStatus, validate_listen_port,
};
use skiff_store::{
    CommandRecord, NewNode, NewProxy, NewUser, NodeHealthRecord, NodeRecord, ProxyRecord,
    StatusCounts, UserRecord,
};
use skiff_traffic::{Bucket, TimelineBucket};

use crate::error::{ApiFailure, ApiResult};
use crate::{AppState, StoreProbe};

// ─── Admin auth extractor ─────────────────────────────────────────────────────

pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiFailure;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match presented {
            Some(token) if token == state.config.admin_token => Ok(Self),
            _ => Err(ApiFailure::new(
                ErrorCode::TokenInvalid,
                "operator token required",
            )),
        }
    }
}

fn ok<T>(data: T) -> Json<Envelope<T>> {
    Json(Envelope::ok(data))
}

// ─── Nodes ────────────────────────────────────────────────────────────────────

pub async fn create_node(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(new): Json<NewNode>,
) -> ApiResult<Json<Envelope<NodeRecord>>> {
    let node = state.store.create_node(new).await?;
    Ok(ok(node))
}

pub async fn list_nodes(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> ApiResult<Json<Envelope<Vec<NodeRecord>>>> {
    Ok(ok(state.store.list_nodes().await?))
}

pub async fn get_node(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<NodeRecord>>> {
    let node = require_node(&state, &id).await?;
    Ok(ok(node))
}

pub async fn update_node(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
    Json(update): Json<NewNode>,
) -> ApiResult<Json<Envelope<NodeRecord>>> {
    let mut node = require_node(&state, &id).await?;
    node.display_name = update.display_name;
    node.host = update.host;
    node.port = update.port;
    node.region = update.region;
    node.weight = update.weight;
    node.max_users = update.max_users;
    node.tags = update.tags;
    node.metrics_enabled = update.metrics_enabled;
    state.store.update_node(&node).await?;
    Ok(ok(node))
}

pub async fn delete_node(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    if !state.store.delete_node(&id).await? {
        return Err(node_missing(&id));
    }
    info!(node = %id, "node deleted by operator");
    Ok(ok(serde_json::json!({ "deleted": true })))
}

// ─── Tokens ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct IssuedTokenResponse {
    /// Shown exactly once; only the fingerprint is retrievable later.
    pub secret: String,
    pub fingerprint: String,
    pub issued_at: DateTime<Utc>,
}

pub async fn issue_token(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<IssuedTokenResponse>>> {
    let issued = state.tokens.rotate(&id).await?;
    Ok(ok(IssuedTokenResponse {
        secret: issued.secret,
        fingerprint: issued.fingerprint,
        issued_at: issued.issued_at,
    }))
}

pub async fn revoke_token(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    require_node(&state, &id).await?;
    let revoked = state.tokens.revoke(&id).await?;
    Ok(ok(serde_json::json!({ "revoked": revoked })))
}

// ─── Config preview ───────────────────────────────────────────────────────────

pub async fn preview_config(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    let rendered = state.renderer.render_uncached(&id).await?;
    Ok(ok(serde_json::json!({
        "fingerprint": rendered.fingerprint,
        "rendered_at": rendered.rendered_at,
        "config": rendered.config,
    })))
}

// ─── Health & cluster ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeHealthView {
    pub node_id: String,
    pub display_name: String,
    pub status: NodeStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub latest: Option<NodeHealthRecord>,
}

pub async fn nodes_health(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> ApiResult<Json<Envelope<Vec<NodeHealthView>>>> {
    let since = Utc::now() - Duration::hours(1);
    let mut views = Vec::new();
    for node in state.store.list_nodes().await? {
        let latest = state
            .store
            .health_window(&node.id, since)
            .await?
            .into_iter()
            .next_back();
        views.push(NodeHealthView {
            node_id: node.id,
            display_name: node.display_name,
            status: node.status,
            last_heartbeat_at: node.last_heartbeat_at,
            latest,
        });
    }
    Ok(ok(views))
}

pub async fn cluster_summary(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> ApiResult<Json<Envelope<StatusCounts>>> {
    Ok(ok(state.health.cluster_summary().await?))
}

// ─── Traffic views ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub bucket: Option<Bucket>,
}

impl RangeQuery {
    fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(to - Duration::hours(24));
        (from, to)
    }
}

pub async fn node_traffic(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    require_node(&state, &id).await?;
    let (from, to) = range.bounds();
    let (up, down) = state.traffic.usage_for_node(&id, from, to).await?;
    Ok(ok(serde_json::json!({
        "node_id": id,
        "from": from,
        "to": to,
        "up_bytes": up,
        "down_bytes": down,
    })))
}

pub async fn user_timeline(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<Json<Envelope<Vec<TimelineBucket>>>> {
    let (from, to) = range.bounds();
    let bucket = range.bucket.unwrap_or(Bucket::Day);
    Ok(ok(state.traffic.timeline_by_user(&id, from, to, bucket).await?))
}

// ─── Users ────────────────────────────────────────────────────────────────────

pub async fn create_user(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(new): Json<NewUser>,
) -> ApiResult<Json<Envelope<UserRecord>>> {
    Ok(ok(state.store.create_user(new).await?))
}

pub async fn list_users(
    State(state): State<AppState>,
    _auth: AdminAuth,
) -> ApiResult<Json<Envelope<Vec<UserRecord>>>> {
    Ok(ok(state.store.list_users().await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<UserRecord>>> {
    let user = require_user(&state, &id).await?;
    Ok(ok(user))
}

pub async fn update_user(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
    Json(update): Json<NewUser>,
) -> ApiResult<Json<Envelope<UserRecord>>> {
    let mut user = require_user(&state, &id).await?;
    user.traffic_limit_bytes = update.traffic_limit_bytes;
    user.expires_at = update.expires_at;
    user.enabled = update.enabled;
    state.store.update_user(&user).await?;
    Ok(ok(user))
}

pub async fn delete_user(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    if !state.store.delete_user(&id).await? {
        return Err(ApiFailure::new(
            ErrorCode::UserMissing,
            format!("user '{id}' not found"),
        ));
    }
    Ok(ok(serde_json::json!({ "deleted": true })))
}

// ─── Proxies ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UpdateProxyRequest {
    pub node_id: Option<String>,
    pub protocol: skiff_proto::Protocol,
    pub listen_port: u16,
    pub settings: skiff_proto::ProxySettings,
    pub enabled: bool,
}

pub async fn create_proxy(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(new): Json<NewProxy>,
) -> ApiResult<Json<Envelope<ProxyRecord>>> {
    if !validate_listen_port(new.listen_port) {
        return Err(ApiFailure::new(ErrorCode::InvalidRequest, "invalid listen port"));
    }
    require_user(&state, &new.user_id).await?;
    if let Some(node_id) = &new.node_id {
        require_node(&state, node_id).await?;
    }
    Ok(ok(state.store.create_proxy(new).await?))
}

pub async fn get_proxy(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<ProxyRecord>>> {
    let proxy = require_proxy(&state, &id).await?;
    Ok(ok(proxy))
}

pub async fn update_proxy(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
    Json(update): Json<UpdateProxyRequest>,
) -> ApiResult<Json<Envelope<ProxyRecord>>> {
    if !validate_listen_port(update.listen_port) {
        return Err(ApiFailure::new(ErrorCode::InvalidRequest, "invalid listen port"));
    }
    if let Some(node_id) = &update.node_id {
        require_node(&state, node_id).await?;
    }
    let mut proxy = require_proxy(&state, &id).await?;
    proxy.node_id = update.node_id;
    proxy.protocol = update.protocol;
    proxy.listen_port = update.listen_port;
    proxy.settings = update.settings;
    proxy.enabled = update.enabled;
    state.store.update_proxy(&proxy).await?;
    Ok(ok(proxy))
}

pub async fn delete_proxy(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    if !state.store.delete_proxy(&id).await? {
        return Err(ApiFailure::new(
            ErrorCode::ProxyMissing,
            format!("proxy '{id}' not found"),
        ));
    }
    Ok(ok(serde_json::json!({ "deleted": true })))
}

pub async fn list_user_proxies(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<Vec<ProxyRecord>>>> {
    require_user(&state, &id).await?;
    Ok(ok(state.store.list_proxies_for_user(&id).await?))
}

// ─── Assignments ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct AssignmentRequest {
    pub user_id: String,
    pub node_id: String,
}

pub async fn create_assignment(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(request): Json<AssignmentRequest>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    require_user(&state, &request.user_id).await?;
    require_node(&state, &request.node_id).await?;
    let created = state
        .store
        .assign_user(&request.user_id, &request.node_id)
        .await?;
    Ok(ok(serde_json::json!({ "created": created })))
}

pub async fn delete_assignment(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(request): Json<AssignmentRequest>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    let removed = state
        .store
        .unassign_user(&request.user_id, &request.node_id)
        .await?;
    if !removed {
        return Err(ApiFailure::new(
            ErrorCode::AssignmentMissing,
            format!(
                "user '{}' is not assigned to node '{}'",
                request.user_id, request.node_id
            ),
        ));
    }
    Ok(ok(serde_json::json!({ "removed": true })))
}

// ─── Commands ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueCommandRequest {
    pub kind: CommandKind,
    pub timeout_secs: Option<u32>,
}

pub async fn enqueue_command(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
    Json(request): Json<EnqueueCommandRequest>,
) -> ApiResult<Json<Envelope<CommandRecord>>> {
    require_node(&state, &id).await?;
    let timeout = request
        .timeout_secs
        .unwrap_or(state.config.commands.timeout_secs);
    let command = state.store.enqueue_command(&id, request.kind, timeout).await?;
    info!(node = %id, command = %command.id, kind = %command.kind, "command enqueued");
    Ok(ok(command))
}

pub async fn get_command(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<CommandRecord>>> {
    let Some(command) = state.store.get_command(&id).await? else {
        return Err(ApiFailure::new(
            ErrorCode::InvalidRequest,
            format!("command '{id}' not found"),
        ));
    };
    Ok(ok(command))
}

// ─── Remote deploy ────────────────────────────────────────────────────────────

pub async fn deploy_node(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
    Json(target): Json<DeployTarget>,
) -> ApiResult<Json<Envelope<DeployReport>>> {
    let installer = state.installer.clone().ok_or_else(|| {
        ApiFailure::new(ErrorCode::InvalidRequest, "deploy is not configured on this panel")
    })?;
    require_node(&state, &id).await?;
    if !state.tokens.has_live_token(&id).await? {
        return Err(ApiFailure::new(
            ErrorCode::TokenMissing,
            format!("node '{id}' has no live token; issue one first"),
        ));
    }

    // The stored token is only a hash; rotate to obtain a secret the agent
    // config can carry. The rotation keeps the live-token invariant.
    let rotated = state.tokens.rotate(&id).await?;
    let probe = StoreProbe {
        store: state.store.clone(),
    };
    let report = installer
        .deploy(&id, target, rotated.secret, &probe)
        .await
        .map_err(deploy_failure)?;
    Ok(ok(report))
}

pub async fn test_connection(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Json(target): Json<DeployTarget>,
) -> ApiResult<Json<Envelope<TestConnectionReport>>> {
    let installer = state.installer.clone().ok_or_else(|| {
        ApiFailure::new(ErrorCode::InvalidRequest, "deploy is not configured on this panel")
    })?;
    Ok(ok(installer.test_connection(target).await))
}

pub async fn deploy_script(
    State(state): State<AppState>,
    _auth: AdminAuth,
    Path(id): Path<String>,
) -> ApiResult<String> {
    let Some(deploy) = &state.config.deploy else {
        return Err(ApiFailure::new(
            ErrorCode::InvalidRequest,
            "deploy is not configured on this panel",
        ));
    };
    let Some(agent_download_url) = &deploy.agent_download_url else {
        return Err(ApiFailure::new(
            ErrorCode::InvalidRequest,
            "agent_download_url is not configured",
        ));
    };
    require_node(&state, &id).await?;
    if !state.tokens.has_live_token(&id).await? {
        return Err(ApiFailure::new(
            ErrorCode::TokenMissing,
            format!("node '{id}' has no live token; issue one first"),
        ));
    }
    let rotated = state.tokens.rotate(&id).await?;
    warn!(node = %id, "deploy script generated; previous node token was rotated");
    Ok(bootstrap_script(&deploy.panel_url, &rotated.secret, agent_download_url))
}

fn deploy_failure(err: DeployError) -> ApiFailure {
    match &err {
        DeployError::TokenMissing(_) => ApiFailure::new(ErrorCode::TokenMissing, err.to_string()),
        DeployError::Timeout(_) => ApiFailure::new(ErrorCode::Timeout, err.to_string()),
        DeployError::PanelUrlLoopback(_) | DeployError::CredentialInvalid(_) => {
            ApiFailure::new(ErrorCode::InvalidRequest, err.to_string())
        }
        DeployError::HostKeyMismatch { .. } => {
            ApiFailure::new(ErrorCode::Unreachable, err.to_string())
        }
        _ => ApiFailure::new(ErrorCode::InternalError, err.to_string()),
    }
}

// ─── Lookups ──────────────────────────────────────────────────────────────────

fn node_missing(id: &str) -> ApiFailure {
    ApiFailure::new(ErrorCode::NodeMissing, format!("node '{id}' not found"))
}

async fn require_node(state: &AppState, id: &str) -> ApiResult<NodeRecord> {
    state.store.get_node(id).await?.ok_or_else(|| node_missing(id))
}

async fn require_user(state: &AppState, id: &str) -> ApiResult<UserRecord> {
    state.store.get_user(id).await?.ok_or_else(|| {
        ApiFailure::new(ErrorCode::UserMissing, format!("user '{id}' not found"))
    })
}

async fn require_proxy(state: &AppState, id: &str) -> ApiResult<ProxyRecord> {
    state.store.get_proxy(id).await?.ok_or_else(|| {
        ApiFailure::new(ErrorCode::ProxyMissing, format!("proxy '{id}' not found"))
    })
}
