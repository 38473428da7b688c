//! The agent supervisor: a small set of cooperatively scheduled tasks.
//!
//! Registration runs until it succeeds and re-arms whenever the panel
//! rejects the token. Heartbeats carry metrics and drain commands; a
//! fingerprint mismatch on the response wakes the config-sync task early.
//! No task failure is ever fatal — every loop logs and retries.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tracing::{debug, info, warn};

use skiff_proto::{ErrorCode, HeartbeatRequest, RegisterRequest, TrafficBatch};
use uuid::Uuid;

use crate::client::{Backoff, PanelClient};
use crate::commands::execute_command;
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::forwarder::{ForwarderManager, ForwarderSettings};
use crate::metrics::MetricsCollector;
use crate::traffic::StatsFileSource;

/// Hard deadline for graceful shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

// ─── Shared status ────────────────────────────────────────────────────────────

/// Runtime state shared between tasks and the local health endpoint.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct AgentStatus {
    pub registered: bool,
    pub node_id: Option<String>,
    pub forwarder_alive: bool,
    pub last_apply_error: Option<ErrorCode>,
}

// ─── Agent ────────────────────────────────────────────────────────────────────

pub struct Agent {
    config: AgentConfig,
    client: PanelClient,
    manager: Arc<Mutex<ForwarderManager>>,
    status: Arc<RwLock<AgentStatus>>,
    sync_notify: Arc<Notify>,
    register_notify: Arc<Notify>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> AgentResult<Arc<Self>> {
        let client = PanelClient::new(&config.panel.url, &config.panel.token)?;
        let settings = ForwarderSettings::from_config(&config.forwarder, &config.state_dir);
        Ok(Arc::new(Self {
            client,
            manager: Arc::new(Mutex::new(ForwarderManager::new(settings))),
            status: Arc::new(RwLock::new(AgentStatus::default())),
            sync_notify: Arc::new(Notify::new()),
            register_notify: Arc::new(Notify::new()),
            config,
        }))
    }

    pub fn status_handle(&self) -> Arc<RwLock<AgentStatus>> {
        self.status.clone()
    }

    // ─── Single iterations (the loops below wrap these) ───────────────────

    fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            token: self.config.panel.token.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// One registration attempt. On success the agent knows its node id and
    /// immediately wakes the sync task for a first config pull.
    pub async fn register_once(&self) -> AgentResult<()> {
        let response = self.client.register(&self.register_request()).await?;
        info!(node = %response.node_id, "registered with panel");
        {
            let mut status = self.status.write().await;
            status.registered = true;
            status.node_id = Some(response.node_id);
        }
        self.sync_notify.notify_one();
        Ok(())
    }

    /// One heartbeat: metrics out, fingerprint and commands back.
    pub async fn heartbeat_once(&self, collector: &mut MetricsCollector) -> AgentResult<()> {
        let (alive, applied, binary_missing) = {
            let mut manager = self.manager.lock().await;
            (
                manager.is_alive(),
                manager.last_applied_fingerprint().map(str::to_string),
                manager.binary_missing(),
            )
        };
        let request = HeartbeatRequest {
            metrics: collector.collect(alive, 0),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            applied_fingerprint: applied.clone(),
            last_apply_error: self.status.read().await.last_apply_error,
            binary_missing,
        };

        let response = match self.client.heartbeat(&request).await {
            Ok(response) => response,
            Err(e) if e.is_auth() => {
                warn!("heartbeat rejected; returning to registration");
                self.status.write().await.registered = false;
                self.register_notify.notify_one();
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.status.write().await.forwarder_alive = alive;

        if let Some(fingerprint) = &response.fingerprint
            && applied.as_deref() != Some(fingerprint.as_str())
        {
            debug!(panel = %fingerprint, applied = ?applied, "fingerprint differs; waking config sync");
            self.sync_notify.notify_one();
        }

        // Commands run sequentially; each result goes straight back.
        for command in &response.commands {
            let report = execute_command(command, &self.manager, &self.sync_notify).await;
            if let Err(e) = self.client.post_command_result(&report).await {
                warn!(command = %command.id, error = %e, "failed to post command result");
            }
        }
        Ok(())
    }

    /// One config sync: conditional fetch, then the apply pipeline.
    pub async fn sync_once(&self) {
        let applied = {
            let manager = self.manager.lock().await;
            manager.last_applied_fingerprint().map(str::to_string)
        };
        match self.client.fetch_config(applied.as_deref()).await {
            Ok(Some(document)) => {
                let mut manager = self.manager.lock().await;
                match manager.apply(&document.config, &document.fingerprint).await {
                    Ok(()) => {
                        let mut status = self.status.write().await;
                        status.last_apply_error = None;
                        status.forwarder_alive = true;
                        info!(fingerprint = %document.fingerprint, "new config applied");
                    }
                    Err(e) => {
                        warn!(fingerprint = %document.fingerprint, error = %e, "config apply failed");
                        let mut status = self.status.write().await;
                        status.last_apply_error = Some(e.code());
                        status.forwarder_alive = manager.is_alive();
                    }
                }
            }
            Ok(None) => debug!("config already current"),
            Err(e) if e.is_auth() => {
                self.status.write().await.registered = false;
                self.register_notify.notify_one();
            }
            Err(e) => warn!(error = %e, "config fetch failed"),
        }
    }

    /// One traffic submission. An unacknowledged batch keeps its id and is
    /// retried verbatim, so server-side idempotency absorbs the retry.
    pub async fn traffic_once(
        &self,
        source: &mut StatsFileSource,
        buffer: &mut Vec<skiff_proto::TrafficSampleWire>,
        outstanding: &mut Option<TrafficBatch>,
    ) {
        buffer.extend(source.drain(Utc::now()));
        if outstanding.is_none() && !buffer.is_empty() {
            *outstanding = Some(TrafficBatch {
                batch_id: Uuid::new_v4().to_string(),
                samples: std::mem::take(buffer),
            });
        }
        let Some(batch) = outstanding.as_ref() else {
            return;
        };
        match self.client.submit_traffic(batch).await {
            Ok(ack) => {
                debug!(batch = %batch.batch_id, accepted = ack.accepted, duplicate = ack.duplicate, "traffic submitted");
                *outstanding = None;
            }
            Err(e) => warn!(batch = %batch.batch_id, error = %e, "traffic submission failed; will retry"),
        }
    }

    // ─── Long-lived loops ─────────────────────────────────────────────────

    async fn registration_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(
            Duration::from_secs(self.config.panel.reconnect_interval_secs),
            Duration::from_secs(self.config.panel.max_reconnect_delay_secs),
        );
        loop {
            if self.status.read().await.registered {
                tokio::select! {
                    _ = self.register_notify.notified() => {}
                    _ = shutdown.changed() => if *shutdown.borrow() { return; }
                }
                continue;
            }
            match self.register_once().await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "registration failed; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => if *shutdown.borrow() { return; }
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut collector = MetricsCollector::new();
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat.interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.status.read().await.registered {
                        continue;
                    }
                    if let Err(e) = self.heartbeat_once(&mut collector).await {
                        warn!(error = %e, "heartbeat failed");
                    }
                }
                _ = shutdown.changed() => if *shutdown.borrow() { return; }
            }
        }
    }

    async fn sync_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.sync.interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.status.read().await.registered {
                        self.sync_once().await;
                    }
                }
                _ = self.sync_notify.notified() => {
                    if self.status.read().await.registered {
                        self.sync_once().await;
                    }
                }
                _ = shutdown.changed() => if *shutdown.borrow() { return; }
            }
        }
    }

    async fn traffic_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut source = StatsFileSource::new(self.config.forwarder.stats_path.clone());
        let mut buffer = Vec::new();
        let mut outstanding = None;
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.traffic.interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.status.read().await.registered {
                        self.traffic_once(&mut source, &mut buffer, &mut outstanding).await;
                    }
                }
                _ = shutdown.changed() => if *shutdown.borrow() { return; }
            }
        }
    }

    /// Run until interrupted. Shutdown lets every task finish its current
    /// iteration under a hard deadline, then stops the forwarder.
    pub async fn run(self: Arc<Self>) -> AgentResult<()> {
        info!(
            panel = %self.config.panel.url,
            heartbeat_secs = self.config.heartbeat.interval_secs,
            sync_secs = self.config.sync.interval_secs,
            "starting skiffnode"
        );

        // Start the forwarder on the previously applied config, if present.
        {
            let mut manager = self.manager.lock().await;
            if manager.settings().config_path.exists() {
                if let Err(e) = manager.restart().await {
                    warn!(error = %e, "could not start forwarder on existing config");
                }
            } else if let Err(e) = manager.ensure_binary().await {
                warn!(error = %e, "forwarder binary unavailable at startup");
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = tokio::task::JoinSet::new();
        tasks.spawn(self.clone().registration_loop(shutdown_rx.clone()));
        tasks.spawn(self.clone().heartbeat_loop(shutdown_rx.clone()));
        tasks.spawn(self.clone().sync_loop(shutdown_rx.clone()));
        tasks.spawn(self.clone().traffic_loop(shutdown_rx.clone()));
        if self.config.health.port > 0 {
            tasks.spawn(crate::health::serve(
                self.config.health.port,
                self.status.clone(),
                shutdown_rx.clone(),
            ));
        }

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| AgentError::Config(format!("signal handler: {e}")))?;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            warn!("tasks did not stop within the shutdown deadline; aborting");
            tasks.abort_all();
        }

        self.manager.lock().await.stop().await;
        info!("skiffnode stopped");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use skiff_proto::{
        ConfigDocument, Envelope, HeartbeatResponse, NodeStatus, RegisterResponse, TrafficAck,
    };
    use std::path::Path;

    const FAKE_FORWARDER: &str = r#"#!/bin/sh
if [ "$1" = "run" ] && [ "$2" = "-test" ]; then exit 0; fi
sleep 60
"#;

    fn write_fake_forwarder(dir: &Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let binary = dir.join("forwarder");
        std::fs::write(&binary, FAKE_FORWARDER).expect("write");
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        binary
    }

    async fn stub_panel(fingerprint: &'static str) -> String {
        let router = Router::new()
            .route(
                "/node/register",
                post(|| async {
                    Json(Envelope::ok(RegisterResponse {
                        node_id: "n-stub".to_string(),
                        server_time: Utc::now(),
                    }))
                }),
            )
            .route(
                "/node/heartbeat",
                post(move || async move {
                    Json(Envelope::ok(HeartbeatResponse {
                        server_time: Utc::now(),
                        status: NodeStatus::Online,
                        fingerprint: Some(fingerprint.to_string()),
                        commands: vec![],
                    }))
                }),
            )
            .route(
                "/node/config",
                get(move || async move {
                    Json(Envelope::ok(ConfigDocument {
                        fingerprint: fingerprint.to_string(),
                        rendered_at: Utc::now(),
                        config: "{\"inbounds\": []}".to_string(),
                    }))
                }),
            )
            .route(
                "/node/traffic",
                post(|| async {
                    Json(Envelope::ok(TrafficAck {
                        accepted: 1,
                        duplicate: false,
                    }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    fn agent_config(panel_url: String, dir: &Path) -> AgentConfig {
        let binary = write_fake_forwarder(dir);
        let mut config = AgentConfig::sample(panel_url);
        config.panel.token = "stub-token".to_string();
        config.state_dir = dir.join("state");
        config.forwarder.binary_path = binary;
        config.forwarder.config_path = dir.join("forwarder.json");
        config.forwarder.backup_dir = dir.join("backups");
        config.forwarder.probe_window_secs = 0;
        config.forwarder.restart_window_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_register_once_sets_identity_and_wakes_sync() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = stub_panel("fp-a").await;
        let agent = Agent::new(agent_config(url, dir.path())).expect("agent");

        agent.register_once().await.expect("register");
        let status = agent.status.read().await;
        assert!(status.registered);
        assert_eq!(status.node_id.as_deref(), Some("n-stub"));
        drop(status);

        // The sync wake-up is pending.
        tokio::time::timeout(Duration::from_millis(50), agent.sync_notify.notified())
            .await
            .expect("sync notified");
    }

    #[tokio::test]
    async fn test_heartbeat_fingerprint_mismatch_wakes_sync() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = stub_panel("fp-new").await;
        let agent = Agent::new(agent_config(url, dir.path())).expect("agent");
        let mut collector = MetricsCollector::new();

        agent.heartbeat_once(&mut collector).await.expect("heartbeat");
        tokio::time::timeout(Duration::from_millis(50), agent.sync_notify.notified())
            .await
            .expect("sync notified on mismatch");
    }

    #[tokio::test]
    async fn test_sync_once_applies_and_clears_error_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = stub_panel("fp-apply").await;
        let agent = Agent::new(agent_config(url, dir.path())).expect("agent");
        agent.status.write().await.last_apply_error = Some(ErrorCode::ValidationFailed);

        agent.sync_once().await;

        let status = agent.status.read().await;
        assert!(status.forwarder_alive);
        assert!(status.last_apply_error.is_none());
        drop(status);

        let manager = agent.manager.lock().await;
        assert_eq!(manager.last_applied_fingerprint(), Some("fp-apply"));
        drop(manager);

        agent.manager.lock().await.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_auth_failure_rearms_registration() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A router that always rejects with 401.
        let router = Router::new().route(
            "/node/heartbeat",
            post(|| async {
                let envelope: Envelope<()> = Envelope::err(skiff_proto::ApiError::new(
                    skiff_proto::ErrorCode::TokenRevoked,
                    "token revoked",
                ));
                (axum::http::StatusCode::UNAUTHORIZED, Json(envelope))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        let agent =
            Agent::new(agent_config(format!("http://{addr}"), dir.path())).expect("agent");
        agent.status.write().await.registered = true;
        let mut collector = MetricsCollector::new();

        let err = agent
            .heartbeat_once(&mut collector)
            .await
            .expect_err("must fail auth");
        assert!(err.is_auth());
        assert!(!agent.status.read().await.registered);
        tokio::time::timeout(Duration::from_millis(50), agent.register_notify.notified())
            .await
            .expect("registration re-armed");
    }

    #[tokio::test]
    async fn test_traffic_retry_reuses_batch_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        // No server listening: submissions fail.
        let agent = Agent::new(agent_config(
            "http://127.0.0.1:9".to_string(),
            dir.path(),
        ))
        .expect("agent");

        let stats = dir.path().join("stats.json");
        std::fs::write(&stats, r#"{"uA-pB": {"up": 10, "down": 5}}"#).expect("write");
        let mut source = StatsFileSource::new(Some(stats));
        let mut buffer = Vec::new();
        let mut outstanding = None;

        agent.traffic_once(&mut source, &mut buffer, &mut outstanding).await;
        let first_id = outstanding.as_ref().expect("batch kept").batch_id.clone();

        agent.traffic_once(&mut source, &mut buffer, &mut outstanding).await;
        let second_id = outstanding.as_ref().expect("batch still kept").batch_id.clone();
        assert_eq!(first_id, second_id, "retries must reuse the batch id");
    }
}
