//! Heartbeat service and node liveness state machine.
//!
//! Promotion happens only on heartbeat receipt; the periodic sweeper only
//! demotes. That split keeps a sweeper-vs-receiver race from flapping a
//! node's status: the worst interleaving is a demotion that the very next
//! heartbeat overturns.
//!
//! States: offline → online/degraded (heartbeat) → unknown (missed) →
//! offline (dead). A heartbeat with `forwarder_alive = false` lands the
//! node in `degraded` rather than `online`.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use skiff_proto::{HeartbeatRequest, NodeStatus};
use skiff_store::{StatusCounts, Store, StoreError};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("node '{0}' not found")]
    NodeMissing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, HealthError>;

// ─── Thresholds ───────────────────────────────────────────────────────────────

/// Tunable liveness thresholds. `miss` defaults to 3× the heartbeat
/// interval, `dead` to 10×.
#[derive(Debug, Clone, Copy)]
pub struct LivenessThresholds {
    pub heartbeat_interval: Duration,
    pub miss: Duration,
    pub dead: Duration,
}

impl LivenessThresholds {
    pub fn from_heartbeat_interval(interval: Duration) -> Self {
        Self {
            heartbeat_interval: interval,
            miss: interval * 3,
            dead: interval * 10,
        }
    }

    /// The sweeper must run at least twice per miss window.
    pub fn sweep_period(&self) -> std::time::Duration {
        (self.miss / 2).to_std().unwrap_or(std::time::Duration::from_secs(45))
    }
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self::from_heartbeat_interval(Duration::seconds(30))
    }
}

// ─── Pure transitions ─────────────────────────────────────────────────────────

/// Status a valid heartbeat lands the node in, regardless of prior state.
pub fn status_on_heartbeat(forwarder_alive: bool) -> NodeStatus {
    if forwarder_alive {
        NodeStatus::Online
    } else {
        NodeStatus::Degraded
    }
}

/// Demotion the sweeper applies, if any. Never promotes.
pub fn sweep_transition(
    current: NodeStatus,
    last_heartbeat_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    thresholds: &LivenessThresholds,
) -> Option<NodeStatus> {
    let Some(last) = last_heartbeat_at else {
        // Never heard from: online/degraded without a heartbeat timestamp is
        // an impossible record; normalize it downwards.
        return match current {
            NodeStatus::Online | NodeStatus::Degraded => Some(NodeStatus::Unknown),
            NodeStatus::Unknown => Some(NodeStatus::Offline),
            NodeStatus::Offline => None,
        };
    };

    let elapsed = now - last;
    match current {
        NodeStatus::Online | NodeStatus::Degraded if elapsed > thresholds.miss => {
            Some(NodeStatus::Unknown)
        }
        NodeStatus::Unknown if elapsed > thresholds.dead => Some(NodeStatus::Offline),
        _ => None,
    }
}

// ─── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProcessedHeartbeat {
    pub status: NodeStatus,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub checked: u32,
    pub to_unknown: u32,
    pub to_offline: u32,
}

// ─── Service ──────────────────────────────────────────────────────────────────

/// Ingests heartbeats and drives status transitions. Heartbeat processing
/// for one node is serialized by a per-node mutex.
pub struct HeartbeatService {
    store: Store,
    thresholds: LivenessThresholds,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HeartbeatService {
    pub fn new(store: Store, thresholds: LivenessThresholds) -> Self {
        Self {
            store,
            thresholds,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> &LivenessThresholds {
        &self.thresholds
    }

    async fn node_lock(&self, node_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process one authenticated heartbeat: persist the health sample,
    /// stamp `last_heartbeat_at`, and compute the status transition.
    pub async fn process(
        &self,
        node_id: &str,
        heartbeat: &HeartbeatRequest,
    ) -> Result<ProcessedHeartbeat> {
        let lock = self.node_lock(node_id).await;
        let _guard = lock.lock().await;

        let Some(node) = self.store.get_node(node_id).await? else {
            return Err(HealthError::NodeMissing(node_id.to_string()));
        };

        let now = Utc::now();
        let m = &heartbeat.metrics;
        self.store
            .insert_health_sample(
                node_id,
                now,
                m.cpu_pct,
                m.mem_pct,
                m.disk_pct,
                m.active_conns,
                m.up_delta_bytes as i64,
                m.down_delta_bytes as i64,
                m.forwarder_alive,
            )
            .await?;

        let status = status_on_heartbeat(m.forwarder_alive);
        self.store.record_heartbeat(node_id, status, now).await?;

        if node.status != status {
            info!(node = %node_id, from = %node.status, to = %status, "node status transition");
        }
        if heartbeat.binary_missing {
            warn!(node = %node_id, "agent reports forwarder binary missing");
        }

        Ok(ProcessedHeartbeat {
            status,
            received_at: now,
        })
    }

    /// One demotion pass over the fleet.
    pub async fn sweep_once(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let mut outcome = SweepOutcome::default();

        for node in self.store.list_nodes().await? {
            outcome.checked += 1;
            let Some(next) =
                sweep_transition(node.status, node.last_heartbeat_at, now, &self.thresholds)
            else {
                continue;
            };
            // Demote under the same per-node lock heartbeats take, so a
            // concurrent heartbeat cannot interleave with this write.
            let lock = self.node_lock(&node.id).await;
            let _guard = lock.lock().await;
            let Some(current) = self.store.get_node(&node.id).await? else {
                continue;
            };
            if sweep_transition(current.status, current.last_heartbeat_at, now, &self.thresholds)
                != Some(next)
            {
                continue; // a heartbeat landed in between
            }
            self.store.set_status(&node.id, next).await?;
            match next {
                NodeStatus::Unknown => outcome.to_unknown += 1,
                NodeStatus::Offline => outcome.to_offline += 1,
                _ => {}
            }
            info!(node = %node.id, from = %current.status, to = %next, "sweeper demoted node");
        }

        debug!(
            checked = outcome.checked,
            to_unknown = outcome.to_unknown,
            to_offline = outcome.to_offline,
            "liveness sweep complete"
        );
        Ok(outcome)
    }

    /// Periodic sweep loop; exits when the shutdown signal flips.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.thresholds.sweep_period());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "liveness sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("liveness sweeper stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Fleet aggregate under one consistent read.
    pub async fn cluster_summary(&self) -> Result<StatusCounts> {
        Ok(self.store.status_counts().await?)
    }
}
