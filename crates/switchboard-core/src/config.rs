//! Configuration: `~/.switchboard/config.toml`, every field defaulted

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub gateway: GatewayConfig,
    pub progress: ProgressConfig,
    pub tenant: TenantConfig,
}

/// `[gateway]`: room channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket endpoint; `{room}` is replaced with the room id
    pub url: String,
    pub room: String,
    pub user_id: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8700/rooms/{room}".to_string(),
            room: "main".to_string(),
            user_id: None,
        }
    }
}

impl GatewayConfig {
    /// Endpoint for a given room
    pub fn room_url(&self, room: &str) -> String {
        self.url.replace("{room}", room)
    }
}

/// `[progress]`: progress stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub base_url: String,
    pub max_reconnect_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8700".to_string(),
            max_reconnect_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// `[tenant]`: shared tenant context record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub store_path: PathBuf,
    pub reload_delay_ms: u64,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            store_path: default_dir().join("tenant-context.json"),
            reload_delay_ms: 100,
        }
    }
}

impl TenantConfig {
    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }
}

/// `~/.switchboard`, falling back to the working directory without a home
pub fn default_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}

pub fn default_config_path() -> PathBuf {
    default_dir().join("config.toml")
}

/// Replace `${VAR}` references with environment values; unknown variables
/// expand to the empty string.
fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

impl SwitchboardConfig {
    /// Parse a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env(content);
        toml::from_str(&expanded).context("Failed to parse switchboard config")
    }

    /// Load from a file; a missing file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        debug!("Loading config from {:?}", path);
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {:?}", path))?;
        Self::parse(&content)
    }
}
