//! Configuration handling for the VPN client

use crate::tunnel::OpenVpnSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_DIR: &str = "dvpn-client";
const CONFIG_FILE: &str = "config.toml";
const LOCAL_CONFIG_FILE: &str = "dvpn-client.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Base URL of the proposal directory service
    pub url: String,
    /// Send per-session byte counts to the directory
    #[serde(default = "default_report_session_stats")]
    pub report_session_stats: bool,
}

fn default_report_session_stats() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub binary: String,
    pub runtime_dir: PathBuf,
    #[serde(default = "default_bytecount_interval")]
    pub bytecount_interval_secs: u64,
}

fn default_bytecount_interval() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig {
                url: "http://127.0.0.1:8001/v1".to_string(),
                report_session_stats: default_report_session_stats(),
            },
            tunnel: TunnelConfig {
                binary: "openvpn".to_string(),
                runtime_dir: std::env::temp_dir().join(CONFIG_DIR),
                bytecount_interval_secs: default_bytecount_interval(),
            },
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Per-user config location, e.g. `~/.config/dvpn-client/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(LOCAL_CONFIG_FILE))
    }

    /// Loads the first config found: `./dvpn-client.toml`, then the per-user
    /// file. Falls back to defaults when neither exists.
    pub fn discover() -> Result<Self, ConfigError> {
        let candidates = [PathBuf::from(LOCAL_CONFIG_FILE), Self::default_path()];
        match candidates.iter().find(|path| path.exists()) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn openvpn_settings(&self) -> OpenVpnSettings {
        OpenVpnSettings {
            binary: self.tunnel.binary.clone(),
            runtime_dir: self.tunnel.runtime_dir.clone(),
            bytecount_interval_secs: self.tunnel.bytecount_interval_secs,
        }
    }
}
