//! Agent error types.

use skiff_proto::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("panel request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("panel rejected the node token")]
    Auth,

    #[error("panel error {code}: {message}")]
    Api { code: ErrorCode, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Auth failures flip the agent back to unregistered; everything else
    /// is retried with backoff.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth)
            || matches!(
                self,
                Self::Api {
                    code: ErrorCode::TokenInvalid | ErrorCode::TokenRevoked | ErrorCode::TokenExpired,
                    ..
                }
            )
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
