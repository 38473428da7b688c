//! Agent configuration.
//!
//! One YAML document (`/etc/skiffnode/config.yaml`), loaded once at startup.
//! The remote installer writes this file with 0600 permissions; the token
//! inside is the node's only credential.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub panel: PanelSection,

    #[serde(default)]
    pub forwarder: ForwarderSection,

    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub heartbeat: HeartbeatSection,

    #[serde(default)]
    pub traffic: TrafficSection,

    #[serde(default)]
    pub health: HealthSection,

    /// Directory for agent-local state (applied fingerprint, host pins).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelSection {
    /// Base URL of the panel API.
    pub url: String,
    /// Node token issued by the panel.
    pub token: String,
    /// Initial reconnect backoff.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Backoff cap.
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderSection {
    #[serde(default = "default_binary_path")]
    pub binary_path: PathBuf,
    /// The file the apply pipeline atomically swaps.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Where the forwarder binary is fetched from when absent.
    #[serde(default)]
    pub download_url: Option<String>,
    /// Forwarder log file, served by the tail-logs command.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Stats counters file exported by the forwarder, drained for traffic
    /// submission.
    #[serde(default)]
    pub stats_path: Option<PathBuf>,
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
    #[serde(default = "default_probe_window")]
    pub probe_window_secs: u64,
    #[serde(default = "default_backup_retain")]
    pub backup_retain: usize,
}

impl Default for ForwarderSection {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            config_path: default_config_path(),
            backup_dir: default_backup_dir(),
            download_url: None,
            log_path: None,
            stats_path: None,
            restart_window_secs: default_restart_window(),
            probe_window_secs: default_probe_window(),
            backup_retain: default_backup_retain(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Config pull period.
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSection {
    #[serde(default = "default_traffic_interval")]
    pub interval_secs: u64,
}

impl Default for TrafficSection {
    fn default() -> Self {
        Self {
            interval_secs: default_traffic_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthSection {
    /// Local port exposing `/health`; 0 or absent disables it.
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/skiffnode")
}

fn default_binary_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/skiff-forwarder")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/var/lib/skiffnode/forwarder.json")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/skiffnode/backups")
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_max_reconnect_delay() -> u64 {
    300
}

fn default_sync_interval() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_traffic_interval() -> u64 {
    60
}

fn default_restart_window() -> u64 {
    5
}

fn default_probe_window() -> u64 {
    10
}

fn default_backup_retain() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    pub fn load(path: &Path) -> AgentResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("read {}: {e}", path.display())))?;
        serde_yaml::from_str(&data)
            .map_err(|e| AgentError::Config(format!("parse {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> AgentResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_yaml::to_string(self)
            .map_err(|e| AgentError::Config(format!("serialize config: {e}")))?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Starter config written by `skiffnode init-config`.
    pub fn sample(panel_url: String) -> Self {
        Self {
            panel: PanelSection {
                url: panel_url,
                token: String::new(),
                reconnect_interval_secs: default_reconnect_interval(),
                max_reconnect_delay_secs: default_max_reconnect_delay(),
            },
            forwarder: ForwarderSection::default(),
            sync: SyncSection::default(),
            heartbeat: HeartbeatSection::default(),
            traffic: TrafficSection::default(),
            health: HealthSection::default(),
            state_dir: default_state_dir(),
            log: LogSection::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let yaml = "panel:\n  url: \"https://panel.example.net\"\n  token: \"tok\"\n";
        let config: AgentConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.sync.interval_secs, 300);
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.traffic.interval_secs, 60);
        assert_eq!(config.forwarder.backup_retain, 10);
        assert_eq!(config.forwarder.probe_window_secs, 10);
        assert_eq!(config.health.port, 0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        let mut config = AgentConfig::sample("https://panel.example.net".to_string());
        config.panel.token = "secret-token".to_string();
        config.save(&path).expect("save");

        let loaded = AgentConfig::load(&path).expect("load");
        assert_eq!(loaded.panel.url, "https://panel.example.net");
        assert_eq!(loaded.panel.token, "secret-token");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = AgentConfig::load(Path::new("/nonexistent/config.yaml")).expect_err("err");
        assert!(matches!(err, AgentError::Config(_)));
    }
}
