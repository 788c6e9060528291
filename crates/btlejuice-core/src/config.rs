//! Settings and persistence
//!
//! One TOML file shared by the proxy daemon and the interception CLI, stored under the
//! user config dir as `btlejuice/settings.toml`. Command-line flags override it.

use crate::intercept::{EditOrder, Hook};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub proxy: ProxySettings,
    pub intercept: InterceptSettings,
}

/// Relay side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// WebSocket listen address
    pub listen: String,
    /// BlueZ adapter used as central (e.g. `hci0`), default adapter when unset
    pub adapter: Option<String>,
    pub discovery_timeout_secs: u64,
    /// ATT MTU assumed when the stack does not report one
    pub default_mtu: u16,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            adapter: None,
            discovery_timeout_secs: 60,
            default_mtu: 23,
        }
    }
}

/// Interception side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptSettings {
    pub proxy_url: String,
    /// Adapter hosting the emulated peripheral
    pub adapter: Option<String>,
    pub keep_handles: bool,
    /// Re-target the device after it drops the link
    pub reconnect: bool,
    pub edit_order: EditOrder,
    pub log_file: Option<PathBuf>,
    pub hooks: Vec<HookSettings>,
}

impl Default for InterceptSettings {
    fn default() -> Self {
        Self {
            proxy_url: "ws://127.0.0.1:8000".to_string(),
            adapter: None,
            keep_handles: true,
            reconnect: true,
            edit_order: EditOrder::Fifo,
            log_file: None,
            hooks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSettings {
    pub service: String,
    pub characteristic: String,
    #[serde(flatten)]
    pub action: HookAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum HookAction {
    Manual,
    /// Substitute the payload with a fixed hex value
    Replace { hex: String },
}

impl HookSettings {
    pub fn to_hook(&self) -> anyhow::Result<Hook> {
        match &self.action {
            HookAction::Manual => Ok(Hook::Manual),
            HookAction::Replace { hex } => {
                let payload = hex::decode(hex.trim()).map_err(|e| {
                    anyhow::anyhow!(
                        "invalid replacement for {} {}: {}",
                        self.service,
                        self.characteristic,
                        e
                    )
                })?;
                Ok(Hook::Transform(Arc::new(move |_: &[u8]| payload.clone())))
            }
        }
    }
}

impl AppSettings {
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("btlejuice")
            .join("settings.toml")
    }

    /// Loads the settings, falling back to defaults when the file is absent or broken.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => warn!("Failed to parse settings: {}, using defaults", e),
                },
                Err(e) => warn!("Failed to read settings file: {}, using defaults", e),
            }
        }
        Self::default()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}
