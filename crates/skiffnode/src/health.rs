//! Local health endpoint for node-side probes (systemd, monitoring).

use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tracing::{info, warn};

use crate::supervisor::AgentStatus;

pub fn health_router(status: Arc<RwLock<AgentStatus>>) -> Router {
    Router::new().route(
        "/health",
        get(move || {
            let status = status.clone();
            async move {
                let snapshot = status.read().await.clone();
                Json(serde_json::json!({
                    "status": if snapshot.forwarder_alive { "ok" } else { "degraded" },
                    "registered": snapshot.registered,
                    "node_id": snapshot.node_id,
                    "forwarder_alive": snapshot.forwarder_alive,
                    "last_apply_error": snapshot.last_apply_error,
                    "version": env!("CARGO_PKG_VERSION"),
                }))
            }
        }),
    )
}

/// Serve `/health` on localhost until shutdown.
pub async fn serve(port: u16, status: Arc<RwLock<AgentStatus>>, mut shutdown: watch::Receiver<bool>) {
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(addr = %addr, error = %e, "could not bind health endpoint");
            return;
        }
    };
    info!(addr = %addr, "health endpoint listening");
    let server = axum::serve(listener, health_router(status)).with_graceful_shutdown(async move {
        loop {
            if shutdown.changed().await.is_err() || *shutdown.borrow() {
                return;
            }
        }
    });
    if let Err(e) = server.await {
        warn!(error = %e, "health endpoint stopped with error");
    }
}
