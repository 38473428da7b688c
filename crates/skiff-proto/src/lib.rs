//! Protocol types for the Skiff panel/agent wire format.
//!
//! Defines the message types exchanged between the Skiff panel and the
//! skiffnode agents running on proxy nodes, the shared domain enums, and
//! the symbolic error taxonomy carried in every response envelope.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header carrying the node token on agent-facing requests.
pub const NODE_TOKEN_HEADER: &str = "x-node-token";

// ─── Node status ──────────────────────────────────────────────────────────────

/// Liveness state of a node, owned exclusively by the heartbeat service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Offline,
    Online,
    Degraded,
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Online => write!(f, "online"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(Self::Offline),
            "online" => Ok(Self::Online),
            "degraded" => Ok(Self::Degraded),
            "unknown" => Ok(Self::Unknown),
            other => Err(ProtoError::UnknownVariant {
                kind: "node status",
                value: other.to_string(),
            }),
        }
    }
}

// ─── Proxy protocol & transport ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vless => write!(f, "vless"),
            Self::Vmess => write!(f, "vmess"),
            Self::Trojan => write!(f, "trojan"),
            Self::Shadowsocks => write!(f, "shadowsocks"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vless" => Ok(Self::Vless),
            "vmess" => Ok(Self::Vmess),
            "trojan" => Ok(Self::Trojan),
            "shadowsocks" => Ok(Self::Shadowsocks),
            other => Err(ProtoError::UnknownVariant {
                kind: "protocol",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportNetwork {
    #[default]
    Tcp,
    Ws,
    Http,
    Grpc,
    Quic,
}

impl std::fmt::Display for TransportNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Ws => write!(f, "ws"),
            Self::Http => write!(f, "http"),
            Self::Grpc => write!(f, "grpc"),
            Self::Quic => write!(f, "quic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
}

impl std::fmt::Display for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Tls => write!(f, "tls"),
        }
    }
}

// ─── Proxy settings ───────────────────────────────────────────────────────────

/// Protocol-specific settings attached to a proxy row.
///
/// Persisted as an opaque JSON column; only the renderer interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProxySettings {
    /// UUID (vless/vmess) or password (trojan/shadowsocks).
    pub credential: String,
    #[serde(default)]
    pub network: TransportNetwork,
    #[serde(default)]
    pub security: Security,
    /// vmess only.
    #[serde(default)]
    pub alter_id: u32,
    /// shadowsocks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_host: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quic_security: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quic_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
}

// ─── Error taxonomy ───────────────────────────────────────────────────────────

/// Symbolic error codes surfaced through the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Auth
    TokenInvalid,
    TokenRevoked,
    TokenExpired,
    TokenMissing,
    // Model
    NodeMissing,
    ProxyMissing,
    UserMissing,
    AssignmentMissing,
    ConflictingPorts,
    UnsupportedProtocol,
    InvalidRequest,
    // Transient infra
    StoreUnavailable,
    Timeout,
    Unreachable,
    // Agent-local apply
    ValidationFailed,
    ApplyFailedRolledBack,
    ForwarderUnresponsive,
    BinaryMissing,
    SnapshotFailed,
    // Catch-all
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenInvalid => "TokenInvalid",
            Self::TokenRevoked => "TokenRevoked",
            Self::TokenExpired => "TokenExpired",
            Self::TokenMissing => "TokenMissing",
            Self::NodeMissing => "NodeMissing",
            Self::ProxyMissing => "ProxyMissing",
            Self::UserMissing => "UserMissing",
            Self::AssignmentMissing => "AssignmentMissing",
            Self::ConflictingPorts => "ConflictingPorts",
            Self::UnsupportedProtocol => "UnsupportedProtocol",
            Self::InvalidRequest => "InvalidRequest",
            Self::StoreUnavailable => "StoreUnavailable",
            Self::Timeout => "Timeout",
            Self::Unreachable => "Unreachable",
            Self::ValidationFailed => "ValidationFailed",
            Self::ApplyFailedRolledBack => "ApplyFailedRolledBack",
            Self::ForwarderUnresponsive => "ForwarderUnresponsive",
            Self::BinaryMissing => "BinaryMissing",
            Self::SnapshotFailed => "SnapshotFailed",
            Self::InternalError => "InternalError",
        }
    }

    /// Whether a background caller should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable | Self::Timeout | Self::Unreachable)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Response envelope ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Uniform `{ ok, data, error }` envelope wrapping every response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ApiError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

// ─── Registration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub token: String,
    pub agent_version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_id: String,
    pub server_time: DateTime<Utc>,
}

// ─── Heartbeat ────────────────────────────────────────────────────────────────

/// Resource/liveness sample carried on every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub disk_pct: f32,
    pub active_conns: u32,
    pub up_delta_bytes: u64,
    pub down_delta_bytes: u64,
    pub forwarder_alive: bool,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub metrics: HeartbeatMetrics,
    pub agent_version: String,
    /// Fingerprint of the config the forwarder is currently running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_fingerprint: Option<String>,
    /// Symbolic code of the last failed apply, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_apply_error: Option<ErrorCode>,
    /// Set when the forwarder binary is absent and no download URL is known.
    #[serde(default)]
    pub binary_missing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub server_time: DateTime<Utc>,
    pub status: NodeStatus,
    /// Authoritative fingerprint of the latest rendered config, if renderable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandEnvelope>,
}

// ─── Config delivery ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub fingerprint: String,
    pub rendered_at: DateTime<Utc>,
    /// Canonical forwarder-config JSON (sorted keys, LF).
    pub config: String,
}

// ─── Traffic ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSampleWire {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<String>,
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub recorded_at: DateTime<Utc>,
}

/// A batch of traffic samples. Resubmitting the same `batch_id` is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficBatch {
    pub batch_id: String,
    pub samples: Vec<TrafficSampleWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficAck {
    pub accepted: u64,
    pub duplicate: bool,
}

// ─── Command channel ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    RestartForwarder,
    ReloadConfig,
    RunDiagnostic,
    TailLogs,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RestartForwarder => write!(f, "restart_forwarder"),
            Self::ReloadConfig => write!(f, "reload_config"),
            Self::RunDiagnostic => write!(f, "run_diagnostic"),
            Self::TailLogs => write!(f, "tail_logs"),
        }
    }
}

impl std::str::FromStr for CommandKind {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart_forwarder" => Ok(Self::RestartForwarder),
            "reload_config" => Ok(Self::ReloadConfig),
            "run_diagnostic" => Ok(Self::RunDiagnostic),
            "tail_logs" => Ok(Self::TailLogs),
            other => Err(ProtoError::UnknownVariant {
                kind: "command kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Delivered,
    Completed,
    Expired,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Delivered => write!(f, "delivered"),
            Self::Completed => write!(f, "completed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "delivered" => Ok(Self::Delivered),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            other => Err(ProtoError::UnknownVariant {
                kind: "command status",
                value: other.to_string(),
            }),
        }
    }
}

/// A command delivered to an agent on a heartbeat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    pub kind: CommandKind,
    pub issued_at: DateTime<Utc>,
    pub timeout_secs: u64,
}

/// Delivery receipt posted by the agent after executing a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReport {
    pub command_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

// ─── Proto errors ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

// ─── Validation ───────────────────────────────────────────────────────────────

/// Validate an entity id: non-empty, bounded, url-safe characters only.
pub fn validate_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate a listen port. Port 0 is never a valid inbound binding.
pub fn validate_listen_port(port: u16) -> bool {
    port > 0
}

/// The client identity tag embedded in rendered inbounds: `u<user>-p<proxy>`.
pub fn client_tag(user_id: &str, proxy_id: &str) -> String {
    format!("u{user_id}-p{proxy_id}")
}

/// The inbound tag for a proxy row: `inbound-<proxy>`.
pub fn inbound_tag(proxy_id: &str) -> String {
    format!("inbound-{proxy_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_status_roundtrip() {
        for s in [NodeStatus::Offline, NodeStatus::Online, NodeStatus::Degraded, NodeStatus::Unknown] {
            let parsed: NodeStatus = s.to_string().parse().expect("parse");
            assert_eq!(parsed, s);
        }
        assert!("bogus".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn test_protocol_display_matches_wire_names() {
        assert_eq!(Protocol::Vless.to_string(), "vless");
        assert_eq!(Protocol::Shadowsocks.to_string(), "shadowsocks");
        let json = serde_json::to_string(&Protocol::Trojan).expect("serialize");
        assert_eq!(json, "\"trojan\"");
    }

    #[test]
    fn test_proxy_settings_defaults() {
        let settings: ProxySettings =
            serde_json::from_str(r#"{"credential":"abc"}"#).expect("deserialize");
        assert_eq!(settings.network, TransportNetwork::Tcp);
        assert_eq!(settings.security, Security::None);
        assert_eq!(settings.alter_id, 0);
        assert!(settings.ws_path.is_none());
    }

    #[test]
    fn test_proxy_settings_omits_empty_optionals() {
        let settings = ProxySettings {
            credential: "pw".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).expect("serialize");
        assert!(!json.contains("ws_path"), "unexpected: {json}");
        assert!(!json.contains("alpn"), "unexpected: {json}");
    }

    #[test]
    fn test_error_code_retryability() {
        assert!(ErrorCode::StoreUnavailable.is_retryable());
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(!ErrorCode::ConflictingPorts.is_retryable());
        assert!(!ErrorCode::TokenInvalid.is_retryable());
    }

    #[test]
    fn test_envelope_ok_omits_error() {
        let env = Envelope::ok(serde_json::json!({"n": 1}));
        let json = serde_json::to_string(&env).expect("serialize");
        assert!(json.contains(r#""ok":true"#));
        assert!(!json.contains("error"), "error must be omitted: {json}");
    }

    #[test]
    fn test_envelope_err_carries_symbolic_code() {
        let env: Envelope<()> = Envelope::err(ApiError::new(
            ErrorCode::ConflictingPorts,
            "port 8080 bound twice",
        ));
        let json = serde_json::to_string(&env).expect("serialize");
        assert!(json.contains("ConflictingPorts"));
        assert!(json.contains(r#""ok":false"#));
        assert!(!json.contains("data"), "data must be omitted: {json}");
    }

    #[test]
    fn test_heartbeat_request_optional_fields() {
        let raw = r#"{
            "metrics": {
                "cpu_pct": 12.5, "mem_pct": 40.0, "disk_pct": 31.0,
                "active_conns": 4, "up_delta_bytes": 100, "down_delta_bytes": 200,
                "forwarder_alive": true, "uptime_secs": 3600
            },
            "agent_version": "0.1.0"
        }"#;
        let hb: HeartbeatRequest = serde_json::from_str(raw).expect("deserialize");
        assert!(hb.applied_fingerprint.is_none());
        assert!(hb.last_apply_error.is_none());
        assert!(!hb.binary_missing);
        assert!(hb.metrics.forwarder_alive);
    }

    #[test]
    fn test_command_kind_roundtrip() {
        for kind in [
            CommandKind::RestartForwarder,
            CommandKind::ReloadConfig,
            CommandKind::RunDiagnostic,
            CommandKind::TailLogs,
        ] {
            let parsed: CommandKind = kind.to_string().parse().expect("parse");
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_command_envelope_serializes_snake_case_kind() {
        let cmd = CommandEnvelope {
            id: "c-1".to_string(),
            kind: CommandKind::RestartForwarder,
            issued_at: Utc::now(),
            timeout_secs: 120,
        };
        let json = serde_json::to_string(&cmd).expect("serialize");
        assert!(json.contains("restart_forwarder"), "unexpected: {json}");
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("n-abc123"));
        assert!(validate_id("7b0c7c4e-9f7a-4f0e-8b34-000000000001"));
        assert!(!validate_id(""));
        assert!(!validate_id("has spaces"));
        assert!(!validate_id(&"x".repeat(129)));
    }

    #[test]
    fn test_validate_listen_port() {
        assert!(validate_listen_port(1));
        assert!(validate_listen_port(65535));
        assert!(!validate_listen_port(0));
    }

    #[test]
    fn test_tags() {
        assert_eq!(client_tag("u1", "p1"), "uu1-pp1");
        assert_eq!(inbound_tag("abc"), "inbound-abc");
    }
}
