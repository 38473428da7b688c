//! Host metric collection for heartbeats.

use sysinfo::System;

use skiff_proto::HeartbeatMetrics;

/// Collects host metrics, tracking network counters between calls so the
/// heartbeat carries deltas rather than absolute totals.
pub struct MetricsCollector {
    system: System,
    last_tx: u64,
    last_rx: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            last_tx: 0,
            last_rx: 0,
        }
    }

    pub fn collect(&mut self, forwarder_alive: bool, active_conns: u32) -> HeartbeatMetrics {
        self.system.refresh_all();

        let cpu_pct = self.system.global_cpu_usage();
        let mem_total = self.system.total_memory();
        let mem_used = self.system.used_memory();
        let mem_pct = if mem_total > 0 {
            (mem_used as f64 / mem_total as f64 * 100.0) as f32
        } else {
            0.0
        };

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let (disk_total, disk_used) = disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .map(|d| (d.total_space(), d.total_space() - d.available_space()))
            .unwrap_or((0, 0));
        let disk_pct = if disk_total > 0 {
            (disk_used as f64 / disk_total as f64 * 100.0) as f32
        } else {
            0.0
        };

        let networks = sysinfo::Networks::new_with_refreshed_list();
        let (tx, rx): (u64, u64) = networks
            .iter()
            .fold((0, 0), |(t, r), (_, n)| (t + n.total_transmitted(), r + n.total_received()));
        let up_delta = tx.saturating_sub(self.last_tx);
        let down_delta = rx.saturating_sub(self.last_rx);
        self.last_tx = tx;
        self.last_rx = rx;

        HeartbeatMetrics {
            cpu_pct,
            mem_pct,
            disk_pct,
            active_conns,
            up_delta_bytes: up_delta,
            down_delta_bytes: down_delta,
            forwarder_alive,
            uptime_secs: System::uptime(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
