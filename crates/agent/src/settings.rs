use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use common::ApplySpec;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state;

/// On-disk agent configuration (`agent.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// Refuse to start after the machine rebooted underneath a running deployment.
    #[serde(default)]
    pub reboot_protection: bool,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub bundles: BundlesConfig,
    #[serde(default)]
    pub blobstore: BlobstoreConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    #[serde(skip)]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// 0 picks a random port.
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub bootstrap: Vec<String>,
    #[serde(default = "default_cmd_topic")]
    pub command_topic: String,
    #[serde(default = "default_health_topic")]
    pub health_topic: String,
    #[serde(default = "default_reply_topic")]
    pub reply_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BundlesConfig {
    #[serde(default)]
    pub installs_root: Option<PathBuf>,
    #[serde(default)]
    pub enable_root: Option<PathBuf>,
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlobstoreConfig {
    /// `file:/abs/dir` or `http(s)://host/prefix`.
    #[serde(default)]
    pub remote: Option<String>,
    /// Local cache tiers, nearest first.
    #[serde(default)]
    pub tiers: Vec<PathBuf>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Index into `tiers` that remote fetches are written through to.
    #[serde(default)]
    pub cache_tier: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
}

fn default_heartbeat_secs() -> u64 { 60 }
fn default_cmd_topic() -> String { common::STEWARD_CMD_TOPIC.to_string() }
fn default_health_topic() -> String { common::STEWARD_HEALTH_TOPIC.to_string() }
fn default_reply_topic() -> String { common::STEWARD_REPLY_TOPIC.to_string() }
fn default_dir_mode() -> u32 { 0o755 }
fn default_restart_delay_secs() -> u64 { 5 }

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap: Vec::new(),
            command_topic: default_cmd_topic(),
            health_topic: default_health_topic(),
            reply_topic: default_reply_topic(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            heartbeat_interval_secs: default_heartbeat_secs(),
            reboot_protection: false,
            bus: BusConfig::default(),
            bundles: BundlesConfig::default(),
            blobstore: BlobstoreConfig::default(),
            jobs: Vec::new(),
            data_dir: PathBuf::new(),
        }
    }
}

impl AgentConfig {
    /// Load `path` (or `{data_dir}/agent.toml`), then apply environment overrides.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let data_dir = state::agent_data_dir();
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| state::config_path(&data_dir));
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str::<AgentConfig>(&text)
                .with_context(|| format!("parsing config {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path=%path.display(), "No config file found, using defaults");
                AgentConfig::default()
            }
            Err(e) => return Err(e).with_context(|| format!("reading config {}", path.display())),
        };
        cfg.data_dir = data_dir;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("STEWARD_AGENT_ID") {
            if !id.trim().is_empty() {
                self.agent_id = Some(id.trim().to_string());
            }
        }
        if let Some(secs) = std::env::var("STEWARD_HEARTBEAT_SECS").ok().and_then(|v| v.parse::<u64>().ok()) {
            self.heartbeat_interval_secs = secs;
        }
        if let Ok(v) = std::env::var("STEWARD_REBOOT_PROTECTION") {
            self.reboot_protection = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Agent id from config, falling back to the hostname.
    pub fn resolved_agent_id(&self) -> String {
        self.agent_id.clone().unwrap_or_else(local_hostname)
    }

    pub fn installs_root(&self) -> PathBuf {
        self.bundles.installs_root.clone().unwrap_or_else(|| self.data_dir.join("data").join("bundles"))
    }

    pub fn enable_root(&self) -> PathBuf {
        self.bundles.enable_root.clone().unwrap_or_else(|| self.data_dir.join("bundles"))
    }

    pub fn blob_work_dir(&self) -> PathBuf {
        self.blobstore.work_dir.clone().unwrap_or_else(|| self.data_dir.join("tmp"))
    }
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Resolved identity used when titling alerts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub agent_id: String,
}

pub trait SettingsService: Send + Sync {
    fn settings(&self) -> anyhow::Result<Settings>;
}

pub struct ConfigSettingsService {
    agent_id: String,
}

impl ConfigSettingsService {
    pub fn new(config: &AgentConfig) -> Self {
        Self { agent_id: config.resolved_agent_id() }
    }
}

impl SettingsService for ConfigSettingsService {
    fn settings(&self) -> anyhow::Result<Settings> {
        Ok(Settings { agent_id: self.agent_id.clone() })
    }
}

/// Source of the currently applied deployment spec.
#[async_trait]
pub trait SpecService: Send + Sync {
    async fn get(&self) -> anyhow::Result<ApplySpec>;
}

/// Reads `spec.json`; an absent file means nothing has been applied yet.
pub struct FileSpecService {
    path: PathBuf,
}

impl FileSpecService {
    pub fn new(data_dir: &Path) -> Self {
        Self { path: state::spec_path(data_dir) }
    }
}

#[async_trait]
impl SpecService for FileSpecService {
    async fn get(&self) -> anyhow::Result<ApplySpec> {
        let spec = state::read_json::<ApplySpec>(&self.path).context("Loading apply spec")?;
        Ok(spec.unwrap_or_default())
    }
}
