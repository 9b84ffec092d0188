//! Indicator configuration.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/tradfri-indicator/indicator.toml`
//! - Windows: `%APPDATA%/tradfri-indicator/indicator.toml`

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tradfri_gateway_connection::{ObserveConfig, ObserveMode, SyncConfig};
use tradfri_protocol::constants::COAP_DTLS_PORT;

/// Indicator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Fixed gateway address; mDNS discovery is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_host: Option<IpAddr>,

    /// Gateway CoAP/DTLS port, used with `gateway_host`.
    #[serde(default = "default_port")]
    pub gateway_port: u16,

    /// How long one mDNS browse waits for the gateway.
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,

    /// `push` (CoAP observe) or `poll`.
    #[serde(default)]
    pub observe: ObserveMode,

    /// Poll interval in seconds, used in `poll` mode.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Overrides the credential file location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,
}

fn default_port() -> u16 {
    COAP_DTLS_PORT
}

fn default_discovery_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_host: None,
            gateway_port: default_port(),
            discovery_timeout_secs: default_discovery_timeout(),
            observe: ObserveMode::default(),
            poll_interval_secs: default_poll_interval(),
            credentials_path: None,
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs.max(1))
    }

    /// Library settings derived from this file; the rest keep their defaults.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            observe: ObserveConfig {
                mode: self.observe,
                poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
                ..ObserveConfig::default()
            },
            ..SyncConfig::default()
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata)
            .join("tradfri-indicator")
            .join("indicator.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME")
            .map_err(|_| anyhow::anyhow!("HOME is not set, cannot locate configuration"))?;
        Ok(PathBuf::from(home)
            .join(".config")
            .join("tradfri-indicator")
            .join("indicator.toml"))
    }
}
