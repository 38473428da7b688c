//! Skiff panel — the HTTP control plane.
//!
//! Wires the store, token authority, renderer, heartbeat service, traffic
//! ingest, and remote installer behind one axum router with two surfaces:
//! agent-facing endpoints authenticated by node token, and admin endpoints
//! guarded by the operator bearer token.

#![forbid(unsafe_code)]

pub mod admin_api;
pub mod agent_api;
pub mod config;
pub mod error;

#[cfg(test)]
mod tests;

use axum::Router;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use skiff_deploy::{HeartbeatProbe, HostKeyPolicy, InstallerOptions, RemoteInstaller};
use skiff_health::{HeartbeatService, LivenessThresholds};
use skiff_render::{ConfigRenderer, RenderOptions};
use skiff_store::Store;
use skiff_token::TokenAuthority;
use skiff_traffic::{TrafficIngest, TrafficOptions};

use crate::config::{HostKeySection, PanelConfig};
use crate::error::panic_response;

// ─── Application state ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub tokens: TokenAuthority,
    pub renderer: Arc<ConfigRenderer>,
    pub health: Arc<HeartbeatService>,
    pub traffic: TrafficIngest,
    pub installer: Option<Arc<RemoteInstaller>>,
    pub config: Arc<PanelConfig>,
}

impl AppState {
    pub fn new(store: Store, config: Arc<PanelConfig>) -> Self {
        let thresholds = LivenessThresholds::from_heartbeat_interval(chrono::Duration::seconds(
            config.agent.heartbeat_interval_secs as i64,
        ));
        let traffic_options = TrafficOptions {
            tolerance: chrono::Duration::seconds(config.traffic.tolerance_secs as i64),
            skew: chrono::Duration::seconds(config.traffic.skew_secs as i64),
            utc_offset_minutes: config.traffic.utc_offset_minutes,
        };
        let render_options = RenderOptions {
            bind_unpinned_proxies: config.render.bind_unpinned_proxies,
        };

        let installer = config.deploy.as_ref().map(|deploy| {
            let host_key_policy = match &deploy.host_key {
                HostKeySection::Fingerprint { sha256_hex } => HostKeyPolicy::Fingerprint {
                    sha256_hex: sha256_hex.clone(),
                },
                HostKeySection::TrustOnFirstUse { pin_file } => HostKeyPolicy::TrustOnFirstUse {
                    pin_file: pin_file.clone(),
                },
            };
            let mut options = InstallerOptions::new(
                deploy.panel_url.clone(),
                deploy.agent_binary_path.clone(),
                host_key_policy,
            );
            options.forwarder_download_url = deploy.forwarder_download_url.clone();
            Arc::new(RemoteInstaller::new(options))
        });

        Self {
            tokens: TokenAuthority::new(store.clone()),
            renderer: Arc::new(ConfigRenderer::new(store.clone(), render_options)),
            health: Arc::new(HeartbeatService::new(store.clone(), thresholds)),
            traffic: TrafficIngest::new(store.clone(), traffic_options),
            installer,
            store,
            config,
        }
    }
}

// ─── Heartbeat probe over the store ───────────────────────────────────────────

/// Deploy verification seam: "has this node heartbeated since t?".
pub struct StoreProbe {
    pub store: Store,
}

#[async_trait::async_trait]
impl HeartbeatProbe for StoreProbe {
    async fn heartbeat_after(&self, node_id: &str, after: DateTime<Utc>) -> bool {
        match self.store.get_node(node_id).await {
            Ok(Some(node)) => node.last_heartbeat_at.is_some_and(|t| t > after),
            Ok(None) => false,
            Err(e) => {
                warn!(node = %node_id, error = %e, "heartbeat probe store read failed");
                false
            }
        }
    }
}

// ─── Router ───────────────────────────────────────────────────────────────────

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Agent surface
        .route("/node/register", post(agent_api::register))
        .route("/node/heartbeat", post(agent_api::heartbeat))
        .route("/node/config", get(agent_api::fetch_config))
        .route("/node/traffic", post(agent_api::submit_traffic))
        .route("/node/command/result", post(agent_api::command_result))
        // Admin: nodes
        .route("/admin/nodes", post(admin_api::create_node).get(admin_api::list_nodes))
        .route("/admin/nodes/health", get(admin_api::nodes_health))
        .route("/admin/nodes/test-connection", post(admin_api::test_connection))
        .route(
            "/admin/nodes/{id}",
            get(admin_api::get_node)
                .put(admin_api::update_node)
                .delete(admin_api::delete_node),
        )
        .route(
            "/admin/nodes/{id}/token",
            post(admin_api::issue_token).delete(admin_api::revoke_token),
        )
        .route("/admin/nodes/{id}/config/preview", get(admin_api::preview_config))
        .route("/admin/nodes/{id}/commands", post(admin_api::enqueue_command))
        .route("/admin/nodes/{id}/traffic", get(admin_api::node_traffic))
        .route("/admin/nodes/{id}/deploy", post(admin_api::deploy_node))
        .route("/admin/nodes/{id}/deploy/script", get(admin_api::deploy_script))
        // Admin: users
        .route("/admin/users", post(admin_api::create_user).get(admin_api::list_users))
        .route(
            "/admin/users/{id}",
            get(admin_api::get_user)
                .put(admin_api::update_user)
                .delete(admin_api::delete_user),
        )
        .route("/admin/users/{id}/proxies", get(admin_api::list_user_proxies))
        .route("/admin/users/{id}/timeline", get(admin_api::user_timeline))
        // Admin: proxies & assignments
        .route("/admin/proxies", post(admin_api::create_proxy))
        .route(
            "/admin/proxies/{id}",
            get(admin_api::get_proxy)
                .put(admin_api::update_proxy)
                .delete(admin_api::delete_proxy),
        )
        .route(
            "/admin/assignments",
            post(admin_api::create_assignment).delete(admin_api::delete_assignment),
        )
        // Admin: commands & cluster
        .route("/admin/commands/{id}", get(admin_api::get_command))
        .route("/admin/cluster/summary", get(admin_api::cluster_summary))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Background tasks ─────────────────────────────────────────────────────────

/// Requeue-or-expire sweep over delivered commands. Period is a fraction of
/// the command timeout so a stuck delivery is noticed promptly.
pub async fn run_command_sweeper(store: Store, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.sweep_commands(Utc::now()).await {
                    Ok(sweep) if sweep.requeued + sweep.expired > 0 => {
                        debug!(requeued = sweep.requeued, expired = sweep.expired, "command sweep");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "command sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Hourly prune of node health samples beyond the retention window.
pub async fn run_health_pruner(
    store: Store,
    retention: chrono::Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.prune_health_before(Utc::now() - retention).await {
                    warn!(error = %e, "health prune failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
