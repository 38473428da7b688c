//! Agent-facing endpoints, authenticated by node token.

use axum::Json;
use axum::extract::{FromRequestParts, State};
use axum::http::{HeaderMap, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{debug, info, warn};

use skiff_proto::{
    CommandEnvelope, CommandReport, ConfigDocument, Envelope, ErrorCode, HeartbeatRequest,
    HeartbeatResponse, NODE_TOKEN_HEADER, RegisterRequest, RegisterResponse, TrafficAck,
    TrafficBatch,
};
use skiff_render::RenderError;

use crate::AppState;
use crate::error::{ApiFailure, ApiResult};

// ─── Node auth extractor ──────────────────────────────────────────────────────

/// Authenticated agent identity, resolved from `X-Node-Token` (or a bearer
/// Authorization header) through the token authority.
pub struct NodeAuth {
    pub node_id: String,
}

impl FromRequestParts<AppState> for NodeAuth {
    type Rejection = ApiFailure;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = token_from_headers(&parts.headers)
            .ok_or_else(|| ApiFailure::new(ErrorCode::TokenInvalid, "missing node token"))?;
        let node_id = state.tokens.validate(&presented).await?;
        Ok(Self { node_id })
    }
}

fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(NODE_TOKEN_HEADER) {
        return value.to_str().ok().map(str::to_string);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

// ─── POST /node/register ──────────────────────────────────────────────────────

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<Envelope<RegisterResponse>>> {
    let node_id = state.tokens.validate(&request.token).await?;
    info!(
        node = %node_id,
        agent_version = %request.agent_version,
        hostname = %request.hostname,
        os = %request.os,
        arch = %request.arch,
        "agent registered"
    );
    Ok(Json(Envelope::ok(RegisterResponse {
        node_id,
        server_time: Utc::now(),
    })))
}

// ─── POST /node/heartbeat ─────────────────────────────────────────────────────

pub async fn heartbeat(
    State(state): State<AppState>,
    auth: NodeAuth,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<Envelope<HeartbeatResponse>>> {
    let processed = state.health.process(&auth.node_id, &request).await?;

    // The authoritative fingerprint: absent when the node's inputs do not
    // currently render (e.g. a port conflict) — the agent keeps whatever it
    // has applied.
    let fingerprint = match state.renderer.render(&auth.node_id).await {
        Ok(rendered) => Some(rendered.fingerprint),
        Err(RenderError::Store(e)) => return Err(e.into()),
        Err(e) => {
            warn!(node = %auth.node_id, error = %e, "config not renderable; heartbeat carries no fingerprint");
            None
        }
    };

    if let Some(apply_error) = &request.last_apply_error {
        warn!(node = %auth.node_id, error = %apply_error, "agent reported apply failure");
    }

    let commands: Vec<CommandEnvelope> = state
        .store
        .take_queued_commands(&auth.node_id, processed.received_at)
        .await?
        .into_iter()
        .map(|c| CommandEnvelope {
            id: c.id,
            kind: c.kind,
            issued_at: c.queued_at,
            timeout_secs: c.timeout_secs as u64,
        })
        .collect();
    if !commands.is_empty() {
        debug!(node = %auth.node_id, count = commands.len(), "delivering commands on heartbeat");
    }

    Ok(Json(Envelope::ok(HeartbeatResponse {
        server_time: processed.received_at,
        status: processed.status,
        fingerprint,
        commands,
    })))
}

// ─── GET /node/config ─────────────────────────────────────────────────────────

pub async fn fetch_config(
    State(state): State<AppState>,
    auth: NodeAuth,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let rendered = state.renderer.render(&auth.node_id).await?;

    let presented = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"'));
    if presented == Some(rendered.fingerprint.as_str()) {
        debug!(node = %auth.node_id, fingerprint = %rendered.fingerprint, "config unchanged");
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    info!(node = %auth.node_id, fingerprint = %rendered.fingerprint, "config delivered");
    Ok(Json(Envelope::ok(ConfigDocument {
        fingerprint: rendered.fingerprint,
        rendered_at: rendered.rendered_at,
        config: rendered.config,
    }))
    .into_response())
}

// ─── POST /node/traffic ───────────────────────────────────────────────────────

pub async fn submit_traffic(
    State(state): State<AppState>,
    auth: NodeAuth,
    Json(batch): Json<TrafficBatch>,
) -> ApiResult<Json<Envelope<TrafficAck>>> {
    let outcome = state.traffic.ingest(&auth.node_id, &batch).await?;
    Ok(Json(Envelope::ok(TrafficAck {
        accepted: outcome.accepted,
        duplicate: outcome.duplicate,
    })))
}

// ─── POST /node/command/result ────────────────────────────────────────────────

pub async fn command_result(
    State(state): State<AppState>,
    auth: NodeAuth,
    Json(report): Json<CommandReport>,
) -> ApiResult<Json<Envelope<serde_json::Value>>> {
    let Some(command) = state.store.get_command(&report.command_id).await? else {
        return Err(ApiFailure::new(
            ErrorCode::InvalidRequest,
            format!("unknown command '{}'", report.command_id),
        ));
    };
    if command.node_id != auth.node_id {
        return Err(ApiFailure::new(
            ErrorCode::InvalidRequest,
            "command belongs to a different node",
        ));
    }

    let recorded = state
        .store
        .complete_command(
            &report.command_id,
            report.success,
            report.output.map(|v| v.to_string()),
            report.error,
            Utc::now(),
        )
        .await?;
    if !recorded {
        // Late result after requeue/expiry; harmless, but worth the trace.
        debug!(command = %report.command_id, "result arrived for a non-delivered command");
    }
    info!(
        node = %auth.node_id,
        command = %report.command_id,
        success = report.success,
        duration_ms = report.duration_ms,
        "command result recorded"
    );
    Ok(Json(Envelope::ok(serde_json::json!({ "recorded": recorded }))))
}
