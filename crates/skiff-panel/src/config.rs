//! Panel configuration.
//!
//! One YAML document, loaded at startup and immutable afterwards. Anything
//! that changes at runtime lives in the store, not here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Socket the API binds.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// SQLite URL, e.g. `sqlite:///var/lib/skiffpanel/panel.db`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Static bearer token guarding the admin surface.
    pub admin_token: String,

    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub traffic: TrafficSection,

    #[serde(default)]
    pub render: RenderSection,

    #[serde(default)]
    pub commands: CommandSection,

    /// Hours of node health samples to retain.
    #[serde(default = "default_health_retention_hours")]
    pub health_retention_hours: u32,

    #[serde(default)]
    pub deploy: Option<DeploySection>,

    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Heartbeat interval agents are expected to keep; liveness thresholds
    /// derive from it (miss = 3×, dead = 10×).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSection {
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,
    #[serde(default = "default_skew_secs")]
    pub skew_secs: u64,
    /// Service time zone as minutes east of UTC; timeline buckets align to
    /// its calendar boundaries.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for TrafficSection {
    fn default() -> Self {
        Self {
            tolerance_secs: default_tolerance_secs(),
            skew_secs: default_skew_secs(),
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSection {
    /// Whether node-unpinned proxies render on every assigned node.
    #[serde(default = "default_true")]
    pub bind_unpinned_proxies: bool,
}

impl Default for RenderSection {
    fn default() -> Self {
        Self {
            bind_unpinned_proxies: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSection {
    /// Server-side delivery timeout before a command is retried (once).
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u32,
}

impl Default for CommandSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    /// Panel base URL templated into deployed agent configs. Must be
    /// reachable from the nodes (not loopback).
    pub panel_url: String,
    /// Local path of the skiffnode binary uploaded during deploys.
    pub agent_binary_path: PathBuf,
    #[serde(default)]
    pub forwarder_download_url: Option<String>,
    /// Download URL handed out in the self-service bootstrap script.
    #[serde(default)]
    pub agent_download_url: Option<String>,
    pub host_key: HostKeySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HostKeySection {
    Fingerprint { sha256_hex: String },
    TrustOnFirstUse { pin_file: PathBuf },
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

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_url() -> String {
    "sqlite:///var/lib/skiffpanel/panel.db".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_tolerance_secs() -> u64 {
    3600
}

fn default_skew_secs() -> u64 {
    300
}

fn default_command_timeout() -> u32 {
    120
}

fn default_health_retention_hours() -> u32 {
    24
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

impl PanelConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
        let data = serde_yaml::to_string(self).unwrap_or_default();
        std::fs::write(path, data).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Starter config written by `skiffpanel init-config`.
    pub fn sample() -> Self {
        Self {
            listen: default_listen(),
            database_url: default_database_url(),
            admin_token: "change-me".to_string(),
            agent: AgentSection::default(),
            traffic: TrafficSection::default(),
            render: RenderSection::default(),
            commands: CommandSection::default(),
            health_retention_hours: default_health_retention_hours(),
            deploy: None,
            log: LogSection::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: PanelConfig =
            serde_yaml::from_str("admin_token: \"secret\"\n").expect("parse");
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.agent.heartbeat_interval_secs, 30);
        assert_eq!(config.traffic.tolerance_secs, 3600);
        assert_eq!(config.commands.timeout_secs, 120);
        assert!(config.render.bind_unpinned_proxies);
        assert!(config.deploy.is_none());
    }

    #[test]
    fn test_deploy_section_host_key_variants() {
        let yaml = r#"
admin_token: "secret"
deploy:
  panel_url: "https://panel.example.net"
  agent_binary_path: "/opt/skiff/skiffnode"
  host_key:
    kind: trust_on_first_use
    pin_file: "/var/lib/skiffpanel/host-pins"
"#;
        let config: PanelConfig = serde_yaml::from_str(yaml).expect("parse");
        let deploy = config.deploy.expect("deploy section");
        assert!(matches!(deploy.host_key, HostKeySection::TrustOnFirstUse { .. }));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("panel.yaml");
        let config = PanelConfig::sample();
        config.save(&path).expect("save");
        let loaded = PanelConfig::load(&path).expect("load");
        assert_eq!(loaded.admin_token, "change-me");
        assert_eq!(loaded.database_url, config.database_url);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = PanelConfig::load(Path::new("/nonexistent/panel.yaml")).expect_err("err");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
