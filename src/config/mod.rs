use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::credentials::DEFAULT_NEAR_EXPIRY_THRESHOLD_SECS;

/// Complete credstore configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredstoreConfig {
    #[serde(default)]
    pub store: StoreConfig,
}

/// Token store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file; its directory is created on demand
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Lookahead window for near-expiry checks (seconds)
    #[serde(default = "default_near_expiry_threshold")]
    pub near_expiry_threshold_secs: i64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/credstore.db")
}

fn default_near_expiry_threshold() -> i64 {
    DEFAULT_NEAR_EXPIRY_THRESHOLD_SECS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            near_expiry_threshold_secs: default_near_expiry_threshold(),
        }
    }
}

impl StoreConfig {
    /// Overrides fields from env vars. Unparseable values are ignored.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("CREDSTORE_DATABASE_PATH") {
            if !v.is_empty() {
                self.database_path = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("CREDSTORE_NEAR_EXPIRY_THRESHOLD_SECS") {
            if let Ok(n) = v.parse::<i64>() {
                self.near_expiry_threshold_secs = n;
            }
        }

        if self.database_path.is_relative() {
            warn!(
                path = %self.database_path.display(),
                "Relative database path resolves against the working directory"
            );
        }

        self
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CredstoreConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("Invalid config file {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<CredstoreConfig> {
    let config: CredstoreConfig = toml::from_str(contents)?;
    Ok(config)
}
