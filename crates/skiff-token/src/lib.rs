//! Node token authority.
//!
//! Issues, validates, rotates, and revokes the opaque secrets agents use to
//! authenticate. Secrets are 256-bit, URL-safe, returned exactly once at
//! issuance; at rest only the SHA-256 hash and a short operator-visible
//! prefix fingerprint survive. Validation looks tokens up by hash, so an
//! unknown node and a wrong secret take the same path and produce the same
//! rejection.

#![forbid(unsafe_code)]

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use skiff_store::{Store, StoreError};

/// Bytes of entropy per secret (256 bits).
const SECRET_BYTES: usize = 32;
/// Characters of the secret retained as the operator-visible fingerprint.
const FINGERPRINT_CHARS: usize = 8;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Uniform rejection: wrong secret, unknown node, revoked or expired
    /// token all surface as this. Internal logs carry the distinction.
    #[error("token rejected")]
    Rejected,

    #[error("node '{0}' not found")]
    NodeMissing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, TokenError>;

// ─── Issued token ─────────────────────────────────────────────────────────────

/// Returned from issuance. The secret is not retrievable afterwards.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub node_id: String,
    pub secret: String,
    pub fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

// ─── Authority ────────────────────────────────────────────────────────────────

/// Token authority over the panel store. Cheap to clone.
#[derive(Clone)]
pub struct TokenAuthority {
    store: Store,
}

impl TokenAuthority {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Issue a fresh secret for a node, atomically revoking any prior live
    /// token. The returned secret is shown exactly once.
    pub async fn issue(
        &self,
        node_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedToken> {
        if self.store.get_node(node_id).await?.is_none() {
            return Err(TokenError::NodeMissing(node_id.to_string()));
        }

        let secret = generate_secret();
        let fingerprint: String = secret.chars().take(FINGERPRINT_CHARS).collect();
        let record = self
            .store
            .issue_token(node_id, &hash_secret(&secret), &fingerprint, expires_at)
            .await?;

        info!(node = %node_id, fingerprint = %fingerprint, "node token issued");
        Ok(IssuedToken {
            node_id: node_id.to_string(),
            secret,
            fingerprint,
            issued_at: record.issued_at,
            expires_at,
        })
    }

    /// Validate a presented secret. Returns the owning node id, or the
    /// uniform rejection.
    pub async fn validate(&self, presented: &str) -> Result<String> {
        let Some(token) = self.store.find_token_by_hash(&hash_secret(presented)).await? else {
            // Unknown secret: covers both "no such node" and "wrong secret".
            debug!("token validation failed: no live token matches presented secret");
            return Err(TokenError::Rejected);
        };
        if token.is_expired(Utc::now()) {
            warn!(node = %token.node_id, fingerprint = %token.fingerprint, "token validation failed: expired");
            return Err(TokenError::Rejected);
        }
        Ok(token.node_id)
    }

    /// Rotate: issue a new secret and revoke the old one in one step. Any
    /// in-flight request still holding the old secret is rejected on its
    /// next call.
    pub async fn rotate(&self, node_id: &str) -> Result<IssuedToken> {
        let rotated = self.issue(node_id, None).await?;
        info!(node = %node_id, fingerprint = %rotated.fingerprint, "node token rotated");
        Ok(rotated)
    }

    /// Revoke every token for a node. Heartbeats using them fail afterwards.
    pub async fn revoke(&self, node_id: &str) -> Result<u64> {
        let revoked = self.store.revoke_tokens(node_id).await?;
        info!(node = %node_id, revoked, "node tokens revoked");
        Ok(revoked)
    }

    /// Operator-visible fingerprint of the node's live token, if any.
    pub async fn live_fingerprint(&self, node_id: &str) -> Result<Option<String>> {
        let token = self.store.live_token_for_node(node_id).await?;
        Ok(token
            .filter(|t| !t.is_expired(Utc::now()))
            .map(|t| t.fingerprint))
    }

    /// Whether the node holds a live token (remote-deploy pre-flight).
    pub async fn has_live_token(&self, node_id: &str) -> Result<bool> {
        Ok(self.live_fingerprint(node_id).await?.is_some())
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
