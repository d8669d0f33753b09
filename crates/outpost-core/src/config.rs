//! Configuration resolution for Outpost.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/outpost/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`OUTPOST_*`)
//! 5. CLI arguments (applied by the binaries, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Outpost configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub kube: KubeConfig,
}

/// Tunnel server and edge job settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the tunnel server listens on for agent connections.
    pub tunnel_addr: String,
    /// Host agents dial; embedded in edge keys. Empty means "use the host of
    /// `tunnel_addr`".
    pub public_host: String,
    /// Maximum number of concurrently active tunnels.
    pub max_tunnels: usize,
    /// An active tunnel with no proxied traffic for this long is closed.
    pub idle_timeout_secs: u64,
    /// Interval edge agents are told to wait between check-ins.
    pub checkin_interval_secs: u32,
    /// How long a fresh connection may take to send its handshake frame.
    pub handshake_timeout_secs: u64,
    /// Root directory for edge job scripts and collected logs.
    pub data_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tunnel_addr: "0.0.0.0:8000".to_string(),
            public_host: String::new(),
            max_tunnels: 256,
            idle_timeout_secs: 300,
            checkin_interval_secs: 5,
            handshake_timeout_secs: 10,
            data_dir: None,
            database_path: None,
        }
    }
}

/// Per-user cluster credential settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KubeConfig {
    pub enabled: bool,
    /// Distinguishes the identities of several Outpost instances sharing one
    /// cluster.
    pub instance_id: String,
    /// Namespace holding per-user service accounts and the access policy
    /// config map.
    pub namespace: String,
    /// Token file of the relay's own service account, when running in-cluster.
    pub admin_token_path: Option<PathBuf>,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_id: "default".to_string(),
            namespace: "outpost".to_string(),
            admin_token_path: None,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(path) = explicit {
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    config.validate()?;
    Ok(config)
}

impl Config {
    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field, reason: &str| {
            Err(Error::InvalidSetting {
                field,
                reason: reason.to_string(),
            })
        };
        let relay = &self.relay;
        if relay.tunnel_addr.trim().is_empty() {
            return invalid("relay.tunnel_addr", "must not be empty");
        }
        // Edge keys use '|' as their field separator.
        if relay.public_host.contains('|') {
            return invalid("relay.public_host", "must not contain '|'");
        }
        if relay.max_tunnels == 0 {
            return invalid("relay.max_tunnels", "must be at least 1");
        }
        if relay.idle_timeout_secs == 0 {
            return invalid("relay.idle_timeout_secs", "must be at least 1");
        }
        if relay.handshake_timeout_secs == 0 {
            return invalid("relay.handshake_timeout_secs", "must be at least 1");
        }
        if self.kube.enabled && self.kube.namespace.is_empty() {
            return invalid("kube.namespace", "required when kube is enabled");
        }
        Ok(())
    }
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("outpost").join("settings.json"))
}

/// Default data directory (`~/.outpost`).
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".outpost"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    let relay = overlay.relay;
    if relay.data_dir.is_some() {
        base.relay.data_dir = relay.data_dir;
    }
    if relay.database_path.is_some() {
        base.relay.database_path = relay.database_path;
    }
    base.relay.tunnel_addr = relay.tunnel_addr;
    base.relay.public_host = relay.public_host;
    base.relay.max_tunnels = relay.max_tunnels;
    base.relay.idle_timeout_secs = relay.idle_timeout_secs;
    base.relay.checkin_interval_secs = relay.checkin_interval_secs;
    base.relay.handshake_timeout_secs = relay.handshake_timeout_secs;

    let kube = overlay.kube;
    if kube.admin_token_path.is_some() {
        base.kube.admin_token_path = kube.admin_token_path;
    }
    base.kube.enabled = kube.enabled;
    base.kube.instance_id = kube.instance_id;
    base.kube.namespace = kube.namespace;
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("OUTPOST_TUNNEL_ADDR") {
        config.relay.tunnel_addr = val;
    }
    if let Some(val) = lookup("OUTPOST_PUBLIC_HOST") {
        config.relay.public_host = val;
    }
    if let Some(n) = lookup("OUTPOST_MAX_TUNNELS").and_then(|v| v.parse().ok()) {
        config.relay.max_tunnels = n;
    }
    if let Some(n) = lookup("OUTPOST_IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.relay.idle_timeout_secs = n;
    }
    if let Some(val) = lookup("OUTPOST_DATA_DIR") {
        config.relay.data_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("OUTPOST_KUBE_INSTANCE_ID") {
        config.kube.instance_id = val;
    }
}
