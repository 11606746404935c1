//! Server settings, loaded from a TOML file.
//!
//! The file path comes from `FCR_CONFIG` (default `fcr.toml`); a missing
//! file yields defaults, which run the router in embedded mode against a
//! local SQLite queue database.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub sync: SyncSettings,
    pub embedded: EmbeddedSettings,
    pub mediator: MediatorSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SyncSettings {
    /// URL of the topology document; empty disables remote sync.
    pub config_url: String,
    pub interval_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            config_url: String::new(),
            interval_seconds: 300,
        }
    }
}

impl SyncSettings {
    pub fn enabled(&self) -> bool {
        !self.config_url.is_empty()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EmbeddedSettings {
    /// SQLite database for the embedded broker; `:memory:` is allowed.
    pub database: String,
    pub visibility_timeout_seconds: u32,
}

impl Default for EmbeddedSettings {
    fn default() -> Self {
        Self {
            database: "fcr-queues.db".to_string(),
            visibility_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MediatorSettings {
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
}

impl Default for MediatorSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            connect_timeout_seconds: 10,
        }
    }
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("FCR_CONFIG").unwrap_or_else(|_| "fcr.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing settings file {}", path.display()))
    }
}
