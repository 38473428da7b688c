//! HTTP client for the panel API, shared by every agent task.

use rand::Rng;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use skiff_proto::{
    CommandReport, ConfigDocument, Envelope, ErrorCode, HeartbeatRequest, HeartbeatResponse,
    NODE_TOKEN_HEADER, RegisterRequest, RegisterResponse, TrafficAck, TrafficBatch,
};

use crate::error::{AgentError, AgentResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// ─── Backoff ──────────────────────────────────────────────────────────────────

/// Exponential backoff with full jitter, capped. Shared by the registration
/// and heartbeat reconnect paths.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Next delay: uniform in `[0, min(cap, base × 2^attempt)]`.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(16)));
        let ceiling = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let millis = ceiling.as_millis().max(1) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// The ceiling the next delay would be drawn from, without jitter.
    pub fn current_ceiling(&self) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(16)))
            .min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PanelClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl PanelClient {
    pub fn new(base_url: &str, token: &str) -> AgentResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> AgentResult<T> {
        let response = self
            .http
            .post(self.url(path))
            .header(NODE_TOKEN_HEADER, &self.token)
            .json(body)
            .send()
            .await?;
        decode_envelope(response).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> AgentResult<RegisterResponse> {
        self.post("/node/register", request).await
    }

    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> AgentResult<HeartbeatResponse> {
        self.post("/node/heartbeat", request).await
    }

    /// Pull the rendered config. `None` when the panel's fingerprint matches
    /// `last_applied` (304, no bytes on the wire).
    pub async fn fetch_config(&self, last_applied: Option<&str>) -> AgentResult<Option<ConfigDocument>> {
        let mut request = self
            .http
            .get(self.url("/node/config"))
            .header(NODE_TOKEN_HEADER, &self.token);
        if let Some(fingerprint) = last_applied {
            request = request.header(reqwest::header::IF_NONE_MATCH, fingerprint);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("config unchanged (304)");
            return Ok(None);
        }
        let document: ConfigDocument = decode_envelope(response).await?;
        Ok(Some(document))
    }

    pub async fn submit_traffic(&self, batch: &TrafficBatch) -> AgentResult<TrafficAck> {
        self.post("/node/traffic", batch).await
    }

    pub async fn post_command_result(&self, report: &CommandReport) -> AgentResult<serde_json::Value> {
        self.post("/node/command/result", report).await
    }
}

async fn decode_envelope<T: DeserializeOwned>(response: reqwest::Response) -> AgentResult<T> {
    let status = response.status();
    let envelope: Envelope<T> = response.json().await?;
    if let Some(data) = envelope.data
        && envelope.ok
    {
        return Ok(data);
    }
    let (code, message) = envelope
        .error
        .map(|e| (e.code, e.message))
        .unwrap_or((ErrorCode::InternalError, format!("http {status}")));
    if status == StatusCode::UNAUTHORIZED {
        return Err(AgentError::Auth);
    }
    Err(AgentError::Api { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_jitter_stays_under_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(300));
        for _ in 0..20 {
            let ceiling = backoff.current_ceiling();
            let delay = backoff.next_delay();
            assert!(delay <= ceiling, "delay {delay:?} above ceiling {ceiling:?}");
        }
    }

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        assert_eq!(backoff.current_ceiling(), Duration::from_secs(5));
        backoff.next_delay();
        assert_eq!(backoff.current_ceiling(), Duration::from_secs(10));
        backoff.next_delay();
        assert_eq!(backoff.current_ceiling(), Duration::from_secs(20));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current_ceiling(), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.current_ceiling(), Duration::from_secs(5));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = PanelClient::new("https://panel.example.net/", "tok").expect("client");
        assert_eq!(client.url("/node/config"), "https://panel.example.net/node/config");
    }
}
