//! Executor for panel-issued commands delivered on heartbeat responses.
//!
//! Commands run sequentially, each under its server-assigned timeout; the
//! result is posted back to the panel by the caller.

use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::info;

use skiff_proto::{CommandEnvelope, CommandKind, CommandReport};

use crate::forwarder::ForwarderManager;

/// Lines returned by the tail-logs command.
const TAIL_LINES: usize = 100;

pub async fn execute_command(
    envelope: &CommandEnvelope,
    manager: &Mutex<ForwarderManager>,
    sync_notify: &Notify,
) -> CommandReport {
    let started = Instant::now();
    let timeout = Duration::from_secs(envelope.timeout_secs.max(1));
    info!(command = %envelope.id, kind = %envelope.kind, "executing command");

    let result = tokio::time::timeout(timeout, run(envelope.kind, manager, sync_notify)).await;

    let (success, output, error) = match result {
        Ok(Ok(output)) => (true, Some(output), None),
        Ok(Err(message)) => (false, None, Some(message)),
        Err(_) => (
            false,
            None,
            Some(format!("command timed out after {}s", timeout.as_secs())),
        ),
    };

    CommandReport {
        command_id: envelope.id.clone(),
        success,
        output,
        error,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

async fn run(
    kind: CommandKind,
    manager: &Mutex<ForwarderManager>,
    sync_notify: &Notify,
) -> Result<serde_json::Value, String> {
    match kind {
        CommandKind::RestartForwarder => {
            let mut manager = manager.lock().await;
            manager.restart().await.map_err(|e| e.to_string())?;
            Ok(json!({ "restarted": true }))
        }
        CommandKind::ReloadConfig => {
            // Wake the sync task; it pulls and applies the latest config.
            sync_notify.notify_one();
            Ok(json!({ "sync_requested": true }))
        }
        CommandKind::RunDiagnostic => {
            let mut manager = manager.lock().await;
            let alive = manager.is_alive();
            let settings = manager.settings();
            Ok(json!({
                "forwarder_alive": alive,
                "binary_present": settings.binary_path.exists(),
                "config_present": settings.config_path.exists(),
                "applied_fingerprint": manager.last_applied_fingerprint(),
                "agent_version": env!("CARGO_PKG_VERSION"),
            }))
        }
        CommandKind::TailLogs => {
            let manager = manager.lock().await;
            let Some(log_path) = manager.settings().log_path.clone() else {
                return Err("forwarder.log_path is not configured".to_string());
            };
            drop(manager);
            let content =
                tokio::fs::read_to_string(&log_path).await.map_err(|e| e.to_string())?;
            Ok(json!({ "lines": tail_lines(&content, TAIL_LINES) }))
        }
    }
}

fn tail_lines(content: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = content.lines().collect();
    lines
        .iter()
        .skip(lines.len().saturating_sub(n))
        .map(|l| l.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::ForwarderSettings;
    use chrono::Utc;
    use std::path::Path;

    fn envelope(kind: CommandKind, timeout_secs: u64) -> CommandEnvelope {
        CommandEnvelope {
            id: "cmd-1".to_string(),
            kind,
            issued_at: Utc::now(),
            timeout_secs,
        }
    }

    fn manager(dir: &Path, log_path: Option<std::path::PathBuf>) -> Mutex<ForwarderManager> {
        Mutex::new(ForwarderManager::new(ForwarderSettings {
            binary_path: dir.join("missing-forwarder"),
            config_path: dir.join("forwarder.json"),
            backup_dir: dir.join("backups"),
            download_url: None,
            log_path,
            restart_window: Duration::from_millis(200),
            probe_window: Duration::from_millis(100),
            backup_retain: 3,
            state_file: dir.join("applied-fingerprint"),
        }))
    }

    #[test]
    fn test_tail_lines() {
        let content = (1..=150).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&content, 100);
        assert_eq!(tail.len(), 100);
        assert_eq!(tail[0], "line 51");
        assert_eq!(tail[99], "line 150");

        assert_eq!(tail_lines("a\nb", 100), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_reload_config_wakes_sync_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path(), None);
        let notify = Notify::new();

        let report = execute_command(&envelope(CommandKind::ReloadConfig, 10), &manager, &notify).await;
        assert!(report.success);
        assert_eq!(report.output.expect("output")["sync_requested"], true);
        // The notification is pending for the sync task.
        tokio::time::timeout(Duration::from_millis(50), notify.notified())
            .await
            .expect("notified");
    }

    #[tokio::test]
    async fn test_diagnostic_reports_missing_binary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path(), None);
        let notify = Notify::new();

        let report =
            execute_command(&envelope(CommandKind::RunDiagnostic, 10), &manager, &notify).await;
        assert!(report.success);
        let output = report.output.expect("output");
        assert_eq!(output["forwarder_alive"], false);
        assert_eq!(output["binary_present"], false);
    }

    #[tokio::test]
    async fn test_restart_failure_is_reported_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path(), None);
        let notify = Notify::new();

        let report =
            execute_command(&envelope(CommandKind::RestartForwarder, 10), &manager, &notify).await;
        assert!(!report.success);
        assert!(report.error.expect("error").contains("binary"));
    }

    #[tokio::test]
    async fn test_tail_logs_reads_configured_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("forwarder.log");
        std::fs::write(&log_path, "alpha\nbeta\ngamma\n").expect("write");
        let manager = manager(dir.path(), Some(log_path));
        let notify = Notify::new();

        let report = execute_command(&envelope(CommandKind::TailLogs, 10), &manager, &notify).await;
        assert!(report.success);
        let lines = report.output.expect("output")["lines"].clone();
        assert_eq!(lines.as_array().expect("lines").len(), 3);
        assert_eq!(lines[2], "gamma");
    }

    #[tokio::test]
    async fn test_tail_logs_without_path_fails_cleanly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path(), None);
        let notify = Notify::new();

        let report = execute_command(&envelope(CommandKind::TailLogs, 10), &manager, &notify).await;
        assert!(!report.success);
        assert!(report.error.expect("error").contains("log_path"));
    }
}
