//! Forwarder process management and the config apply pipeline.
//!
//! The live config file is only ever replaced by an atomic rename, and only
//! after the candidate passed the forwarder's validate-only mode. A snapshot
//! of the previous config is taken before every swap; if the forwarder does
//! not come back alive after the swap, the snapshot is restored and the
//! forwarder restarted on it.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use skiff_proto::ErrorCode;

use crate::config::ForwarderSection;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("config failed forwarder validation: {stderr}")]
    ValidationFailed { stderr: String },

    #[error("snapshot of live config failed: {0}")]
    SnapshotFailed(std::io::Error),

    #[error("forwarder did not come up on the new config; previous config restored")]
    ApplyFailedRolledBack,

    #[error("forwarder unresponsive on first config; no previous config to restore")]
    ForwarderUnresponsive,

    #[error("forwarder binary missing and no download URL configured")]
    BinaryMissing,

    #[error("binary download failed: {0}")]
    Download(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApplyError {
    /// Symbolic code reported on the next heartbeat.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ValidationFailed { .. } => ErrorCode::ValidationFailed,
            Self::SnapshotFailed(_) => ErrorCode::SnapshotFailed,
            Self::ApplyFailedRolledBack => ErrorCode::ApplyFailedRolledBack,
            Self::ForwarderUnresponsive => ErrorCode::ForwarderUnresponsive,
            Self::BinaryMissing | Self::Download(_) => ErrorCode::BinaryMissing,
            Self::Io(_) => ErrorCode::InternalError,
        }
    }
}

// ─── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub binary_path: PathBuf,
    pub config_path: PathBuf,
    pub backup_dir: PathBuf,
    pub download_url: Option<String>,
    pub log_path: Option<PathBuf>,
    pub restart_window: Duration,
    pub probe_window: Duration,
    pub backup_retain: usize,
    /// Small file recording the last successfully applied fingerprint.
    pub state_file: PathBuf,
}

impl ForwarderSettings {
    pub fn from_config(section: &ForwarderSection, state_dir: &Path) -> Self {
        Self {
            binary_path: section.binary_path.clone(),
            config_path: section.config_path.clone(),
            backup_dir: section.backup_dir.clone(),
            download_url: section.download_url.clone(),
            log_path: section.log_path.clone(),
            restart_window: Duration::from_secs(section.restart_window_secs),
            probe_window: Duration::from_secs(section.probe_window_secs),
            backup_retain: section.backup_retain,
            state_file: state_dir.join("applied-fingerprint"),
        }
    }
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct ForwarderManager {
    settings: ForwarderSettings,
    child: Option<Child>,
    last_applied: Option<String>,
}

impl ForwarderManager {
    pub fn new(settings: ForwarderSettings) -> Self {
        let last_applied = std::fs::read_to_string(&settings.state_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(fingerprint) = &last_applied {
            debug!(%fingerprint, "recovered last applied fingerprint");
        }
        Self {
            settings,
            child: None,
            last_applied,
        }
    }

    pub fn last_applied_fingerprint(&self) -> Option<&str> {
        self.last_applied.as_deref()
    }

    pub fn settings(&self) -> &ForwarderSettings {
        &self.settings
    }

    /// Whether the managed forwarder process is currently running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn binary_missing(&self) -> bool {
        !self.settings.binary_path.exists() && self.settings.download_url.is_none()
    }

    /// Fetch the forwarder binary if it is absent. With no download URL the
    /// manager degrades to a health flag the agent reports on heartbeat.
    pub async fn ensure_binary(&self) -> Result<(), ApplyError> {
        if self.settings.binary_path.exists() {
            return Ok(());
        }
        let Some(url) = &self.settings.download_url else {
            error!(
                path = %self.settings.binary_path.display(),
                "forwarder binary missing and forwarder.download_url is unset; cannot install"
            );
            return Err(ApplyError::BinaryMissing);
        };

        let mut last_error = String::new();
        for attempt in 1..=3u32 {
            info!(url = %url, attempt, "downloading forwarder binary");
            match download(url, &self.settings.binary_path).await {
                Ok(()) => {
                    info!(path = %self.settings.binary_path.display(), "forwarder binary installed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "forwarder download failed");
                    last_error = e;
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
        Err(ApplyError::Download(last_error))
    }

    /// The apply pipeline: temp write → validate → snapshot → atomic swap →
    /// restart → probe → rollback on failure.
    pub async fn apply(&mut self, config: &str, fingerprint: &str) -> Result<(), ApplyError> {
        if self.last_applied.as_deref() == Some(fingerprint) && self.is_alive() {
            debug!(%fingerprint, "config already applied");
            return Ok(());
        }
        self.ensure_binary().await?;

        if let Some(parent) = self.settings.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // 1. Candidate in the same directory, so the rename stays atomic.
        let candidate = self.settings.config_path.with_extension("json.next");
        tokio::fs::write(&candidate, config).await?;

        // 2. Validate before anything touches the live file.
        if let Err(e) = self.validate(&candidate).await {
            let _ = tokio::fs::remove_file(&candidate).await;
            warn!(%fingerprint, error = %e, "candidate config rejected by validation");
            return Err(e);
        }

        // 3. Snapshot the live config (absent on first bootstrap).
        let snapshot = if self.settings.config_path.exists() {
            Some(self.snapshot().await?)
        } else {
            None
        };

        // 4. Atomic swap.
        tokio::fs::rename(&candidate, &self.settings.config_path).await?;

        // 5. Restart onto the new config.
        self.restart().await?;

        // 6. Probe; roll back if the forwarder does not stay up.
        if !self.probe().await {
            return match snapshot {
                Some(snapshot_path) => {
                    warn!(%fingerprint, "forwarder failed probe; rolling back");
                    self.rollback(&snapshot_path).await;
                    Err(ApplyError::ApplyFailedRolledBack)
                }
                None => {
                    error!(%fingerprint, "forwarder failed probe on first config");
                    Err(ApplyError::ForwarderUnresponsive)
                }
            };
        }

        // 7. Persist the fingerprint only after a verified apply.
        self.last_applied = Some(fingerprint.to_string());
        self.persist_state().await;
        info!(%fingerprint, "config applied");
        Ok(())
    }

    async fn validate(&self, candidate: &Path) -> Result<(), ApplyError> {
        let output = Command::new(&self.settings.binary_path)
            .arg("run")
            .arg("-test")
            .arg("-c")
            .arg(candidate)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ApplyError::BinaryMissing
                } else {
                    ApplyError::Io(e)
                }
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Err(ApplyError::ValidationFailed {
                stderr: if stderr.is_empty() { stdout } else { stderr },
            });
        }
        Ok(())
    }

    /// Copy the live config into the backup directory, pruning old entries.
    async fn snapshot(&self) -> Result<PathBuf, ApplyError> {
        tokio::fs::create_dir_all(&self.settings.backup_dir)
            .await
            .map_err(ApplyError::SnapshotFailed)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let old = self.last_applied.as_deref().unwrap_or("unknown");
        let path = self.settings.backup_dir.join(format!("{stamp}-{old}.json"));
        tokio::fs::copy(&self.settings.config_path, &path)
            .await
            .map_err(ApplyError::SnapshotFailed)?;
        self.prune_backups().await;
        Ok(path)
    }

    async fn prune_backups(&self) {
        let Ok(mut entries) = std::fs::read_dir(&self.settings.backup_dir).map(|dir| {
            dir.filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect::<Vec<_>>()
        }) else {
            return;
        };
        // Timestamp-prefixed names sort chronologically.
        entries.sort();
        while entries.len() > self.settings.backup_retain {
            let victim = entries.remove(0);
            if let Err(e) = tokio::fs::remove_file(&victim).await {
                warn!(path = %victim.display(), error = %e, "failed to prune backup");
            }
        }
    }

    /// Restore a snapshot over the live config and restart.
    async fn rollback(&mut self, snapshot: &Path) {
        // Copy-then-rename keeps both the backup and the swap atomicity.
        let staging = self.settings.config_path.with_extension("json.rollback");
        let restored = match tokio::fs::copy(snapshot, &staging).await {
            Ok(_) => tokio::fs::rename(&staging, &self.settings.config_path)
                .await
                .is_ok(),
            Err(e) => {
                error!(error = %e, "rollback staging copy failed");
                false
            }
        };
        if !restored {
            error!("rollback could not restore the previous config");
            return;
        }
        if let Err(e) = self.restart().await {
            error!(error = %e, "forwarder restart after rollback failed");
        } else {
            info!("previous config restored");
        }
    }

    /// Stop the current process (if any) and start a fresh one on the live
    /// config, bounded by the restart window.
    pub async fn restart(&mut self) -> Result<(), ApplyError> {
        self.stop().await;

        let mut command = Command::new(&self.settings.binary_path);
        command
            .arg("run")
            .arg("-c")
            .arg(&self.settings.config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match &self.settings.log_path {
            Some(log_path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(log_path)?;
                command.stdout(Stdio::from(file.try_clone()?));
                command.stderr(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::null());
                command.stderr(Stdio::null());
            }
        }

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ApplyError::BinaryMissing
            } else {
                ApplyError::Io(e)
            }
        })?;
        debug!(pid = child.id(), "forwarder started");
        self.child = Some(child);
        Ok(())
    }

    /// Stop the forwarder, waiting up to the restart window for it to exit.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            if tokio::time::timeout(self.settings.restart_window, child.wait())
                .await
                .is_err()
            {
                warn!("forwarder did not exit within the restart window");
            }
        }
    }

    /// Watch the freshly started process through the probe window; an early
    /// exit fails the probe immediately.
    async fn probe(&mut self) -> bool {
        let deadline = tokio::time::Instant::now() + self.settings.probe_window;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive() {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.is_alive()
    }

    async fn persist_state(&self) {
        if let Some(parent) = self.settings.state_file.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Some(fingerprint) = &self.last_applied
            && let Err(e) = tokio::fs::write(&self.settings.state_file, fingerprint).await
        {
            warn!(error = %e, "failed to persist applied fingerprint");
        }
    }
}

async fn download(url: &str, to: &Path) -> Result<(), String> {
    let response = reqwest::get(url).await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("http {}", response.status()));
    }
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| e.to_string())?;
    }
    tokio::fs::write(to, &bytes).await.map_err(|e| e.to_string())?;
    set_executable(to).map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// A stand-in forwarder: validate mode rejects configs containing
    /// INVALID; run mode exits immediately on CRASH, otherwise stays up.
    const FAKE_FORWARDER: &str = r#"#!/bin/sh
if [ "$1" = "run" ] && [ "$2" = "-test" ]; then
    if grep -q INVALID "$4"; then
        echo "config rejected" >&2
        exit 1
    fi
    exit 0
fi
if grep -q CRASH "$3"; then
    exit 1
fi
sleep 60
"#;

    fn settings(dir: &Path) -> ForwarderSettings {
        let binary = dir.join("forwarder");
        std::fs::write(&binary, FAKE_FORWARDER).expect("write fake forwarder");
        set_executable(&binary).expect("chmod");
        ForwarderSettings {
            binary_path: binary,
            config_path: dir.join("live").join("forwarder.json"),
            backup_dir: dir.join("backups"),
            download_url: None,
            log_path: None,
            restart_window: Duration::from_secs(2),
            probe_window: Duration::from_millis(300),
            backup_retain: 3,
            state_file: dir.join("state").join("applied-fingerprint"),
        }
    }

    #[tokio::test]
    async fn test_apply_success_persists_fingerprint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let state_file = settings.state_file.clone();
        let config_path = settings.config_path.clone();
        let mut manager = ForwarderManager::new(settings);

        manager.apply("{\"inbounds\": []}", "fp-1").await.expect("apply");
        assert!(manager.is_alive());
        assert_eq!(manager.last_applied_fingerprint(), Some("fp-1"));
        assert_eq!(
            std::fs::read_to_string(&config_path).expect("live"),
            "{\"inbounds\": []}"
        );
        assert_eq!(std::fs::read_to_string(&state_file).expect("state"), "fp-1");

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_failed_validation_keeps_live_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let config_path = settings.config_path.clone();
        let mut manager = ForwarderManager::new(settings);

        manager.apply("{\"v\": 1}", "fp-1").await.expect("first apply");

        let err = manager
            .apply("{\"v\": 2, \"note\": \"INVALID\"}", "fp-2")
            .await
            .expect_err("must fail validation");
        assert!(matches!(err, ApplyError::ValidationFailed { .. }));
        assert_eq!(err.code(), ErrorCode::ValidationFailed);

        // Live config untouched, forwarder still on the old config.
        assert_eq!(std::fs::read_to_string(&config_path).expect("live"), "{\"v\": 1}");
        assert!(manager.is_alive());
        assert_eq!(manager.last_applied_fingerprint(), Some("fp-1"));
        // No half-written candidate left behind.
        assert!(!config_path.with_extension("json.next").exists());

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_probe_failure_rolls_back_to_previous_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let config_path = settings.config_path.clone();
        let mut manager = ForwarderManager::new(settings);

        manager.apply("{\"v\": 1}", "fp-1").await.expect("first apply");

        // Passes validation, but the forwarder dies on it at runtime.
        let err = manager
            .apply("{\"v\": 2, \"mode\": \"CRASH\"}", "fp-2")
            .await
            .expect_err("must roll back");
        assert!(matches!(err, ApplyError::ApplyFailedRolledBack));

        assert_eq!(
            std::fs::read_to_string(&config_path).expect("live"),
            "{\"v\": 1}",
            "bytes on disk must equal the pre-apply config"
        );
        assert!(manager.is_alive(), "forwarder must be running on the restored config");
        assert_eq!(manager.last_applied_fingerprint(), Some("fp-1"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_first_bootstrap_validation_failure_leaves_no_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let config_path = settings.config_path.clone();
        let mut manager = ForwarderManager::new(settings);

        let err = manager
            .apply("{\"note\": \"INVALID\"}", "fp-1")
            .await
            .expect_err("must fail");
        assert!(matches!(err, ApplyError::ValidationFailed { .. }));
        assert!(!config_path.exists());
        assert!(!manager.is_alive());
    }

    #[tokio::test]
    async fn test_first_bootstrap_probe_failure_is_unresponsive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let mut manager = ForwarderManager::new(settings);

        let err = manager
            .apply("{\"mode\": \"CRASH\"}", "fp-1")
            .await
            .expect_err("must fail");
        assert!(matches!(err, ApplyError::ForwarderUnresponsive));
        assert!(!manager.is_alive());
    }

    #[tokio::test]
    async fn test_backup_retention() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let backup_dir = settings.backup_dir.clone();
        let mut manager = ForwarderManager::new(settings);

        for i in 0..6 {
            manager
                .apply(&format!("{{\"v\": {i}}}"), &format!("fp-{i}"))
                .await
                .expect("apply");
        }
        manager.stop().await;

        let backups: Vec<_> = std::fs::read_dir(&backup_dir)
            .expect("backups dir")
            .filter_map(|e| e.ok())
            .collect();
        // 5 snapshots taken, retention keeps at most 3.
        assert!(backups.len() <= 3, "retention exceeded: {}", backups.len());
    }

    #[tokio::test]
    async fn test_reapplying_same_fingerprint_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let backup_dir = settings.backup_dir.clone();
        let mut manager = ForwarderManager::new(settings);

        manager.apply("{\"v\": 1}", "fp-1").await.expect("apply");
        manager.apply("{\"v\": 1}", "fp-1").await.expect("noop");

        let backups = std::fs::read_dir(&backup_dir)
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(backups, 0, "no snapshot for a no-op apply");

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_missing_binary_without_url_reports_binary_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = settings(dir.path());
        settings.binary_path = dir.path().join("no-such-binary");
        let mut manager = ForwarderManager::new(settings);

        assert!(manager.binary_missing());
        let err = manager.apply("{}", "fp-1").await.expect_err("must fail");
        assert!(matches!(err, ApplyError::BinaryMissing));
        assert_eq!(err.code(), ErrorCode::BinaryMissing);
    }
}
