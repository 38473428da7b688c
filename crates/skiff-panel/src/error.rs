//! Error-to-HTTP mapping for the panel surface.
//!
//! Every failure leaves a handler as an [`ApiFailure`] and reaches the wire
//! as the standard envelope. Model errors map to 400 (port collisions to
//! 409), auth to 401, transient infra to 503, everything else to 500 with a
//! correlation id in the log and the response.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};
use uuid::Uuid;

use skiff_proto::{ApiError, Envelope, ErrorCode};
use skiff_render::RenderError;
use skiff_store::StoreError;
use skiff_token::TokenError;
use skiff_traffic::TrafficError;

#[derive(Debug)]
pub struct ApiFailure {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiFailure {
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

    pub fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::TokenInvalid
            | ErrorCode::TokenRevoked
            | ErrorCode::TokenExpired
            | ErrorCode::TokenMissing => StatusCode::UNAUTHORIZED,
            ErrorCode::ConflictingPorts => StatusCode::CONFLICT,
            ErrorCode::NodeMissing
            | ErrorCode::ProxyMissing
            | ErrorCode::UserMissing
            | ErrorCode::AssignmentMissing
            | ErrorCode::UnsupportedProtocol
            | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::StoreUnavailable | ErrorCode::Unreachable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ValidationFailed
            | ErrorCode::ApplyFailedRolledBack
            | ErrorCode::ForwarderUnresponsive
            | ErrorCode::BinaryMissing
            | ErrorCode::SnapshotFailed => StatusCode::BAD_REQUEST,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = %self.code, message = %self.message, "request failed");
        }
        let envelope: Envelope<()> = Envelope::err(ApiError {
            code: self.code,
            message: self.message,
            details: self.details,
        });
        (status, Json(envelope)).into_response()
    }
}

impl From<StoreError> for ApiFailure {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::Unavailable(_) => Self::new(ErrorCode::StoreUnavailable, err.to_string()),
            _ => Self::new(ErrorCode::InternalError, err.to_string()),
        }
    }
}

impl From<TokenError> for ApiFailure {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Rejected => Self::new(ErrorCode::TokenInvalid, "token rejected"),
            TokenError::NodeMissing(id) => {
                Self::new(ErrorCode::NodeMissing, format!("node '{id}' not found"))
            }
            TokenError::Store(e) => e.into(),
        }
    }
}

impl From<RenderError> for ApiFailure {
    fn from(err: RenderError) -> Self {
        match &err {
            RenderError::NodeMissing(_) => Self::new(ErrorCode::NodeMissing, err.to_string()),
            RenderError::ConflictingPorts { port, first, second } => {
                Self::new(ErrorCode::ConflictingPorts, err.to_string()).with_details(
                    serde_json::json!({ "port": port, "proxies": [first, second] }),
                )
            }
            RenderError::UnsupportedProtocol { .. } => {
                Self::new(ErrorCode::UnsupportedProtocol, err.to_string())
            }
            RenderError::Store(_) => Self::new(ErrorCode::StoreUnavailable, err.to_string()),
        }
    }
}

impl From<skiff_health::HealthError> for ApiFailure {
    fn from(err: skiff_health::HealthError) -> Self {
        match &err {
            skiff_health::HealthError::NodeMissing(_) => {
                Self::new(ErrorCode::NodeMissing, err.to_string())
            }
            skiff_health::HealthError::Store(_) => {
                Self::new(ErrorCode::StoreUnavailable, err.to_string())
            }
        }
    }
}

impl From<TrafficError> for ApiFailure {
    fn from(err: TrafficError) -> Self {
        match &err {
            TrafficError::UserMissing(_) => Self::new(ErrorCode::UserMissing, err.to_string()),
            TrafficError::Store(_) => Self::new(ErrorCode::StoreUnavailable, err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiFailure>;

/// Response builder for handler panics: a 500 envelope carrying a
/// correlation id that also lands in the log.
pub fn panic_response(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    let detail = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(correlation_id = %correlation_id, panic = %detail, "handler panicked");

    ApiFailure::new(ErrorCode::InternalError, "internal error")
        .with_details(serde_json::json!({ "correlation_id": correlation_id }))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiFailure::new(ErrorCode::TokenInvalid, "").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiFailure::new(ErrorCode::ConflictingPorts, "").status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiFailure::new(ErrorCode::NodeMissing, "").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiFailure::new(ErrorCode::StoreUnavailable, "").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiFailure::new(ErrorCode::InternalError, "").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_render_conflict_carries_proxy_ids() {
        let failure: ApiFailure = RenderError::ConflictingPorts {
            port: 8080,
            first: "p-a".to_string(),
            second: "p-b".to_string(),
        }
        .into();
        assert_eq!(failure.code, ErrorCode::ConflictingPorts);
        let details = failure.details.expect("details");
        assert_eq!(details["port"], 8080);
        assert_eq!(details["proxies"][0], "p-a");
    }

    #[test]
    fn test_token_rejection_is_uniform_401() {
        let failure: ApiFailure = TokenError::Rejected.into();
        assert_eq!(failure.code, ErrorCode::TokenInvalid);
        assert_eq!(failure.status(), StatusCode::UNAUTHORIZED);
    }
}
