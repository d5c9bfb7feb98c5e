use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

// Where rooms and bookings live
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite(SqliteConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

// Where booking notifications go
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifierConfig {
    #[default]
    Inbox,
    #[serde(rename = "none")]
    Disabled,
    Webhook(WebhookConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_duration_ms() -> u64 {
    30_000
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        raw.parse()
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if let StoreConfig::Sqlite(sqlite) = &self.store {
            anyhow::ensure!(!sqlite.url.is_empty(), "store.url must not be empty");
            anyhow::ensure!(
                sqlite.max_connections > 0,
                "store.max_connections must be at least 1"
            );
        }
        if let NotifierConfig::Webhook(webhook) = &self.notifier {
            anyhow::ensure!(!webhook.url.is_empty(), "notifier.url must not be empty");
            anyhow::ensure!(
                webhook.failure_threshold > 0 && webhook.success_threshold > 0,
                "notifier thresholds must be at least 1"
            );
        }
        Ok(())
    }
}
