//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating naslock
//! settings from JSON files and environment variables.
//!
//! ## Environment Variables
//!
//! - `NASLOCK_VAULT_DIR`: Override vault directory path
//! - `NASLOCK_STORAGE_DIR`: Override storage directory path
//! - `NASLOCK_AGENT_URL`: Override indexing agent base URL
//! - `NASLOCK_CONFIG`: Override config file path

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::policy::DEFAULT_MAX_ENCRYPT_SIZE;

/// Environment variable names for configuration overrides
pub const ENV_VAULT_DIR: &str = "NASLOCK_VAULT_DIR";
pub const ENV_STORAGE_DIR: &str = "NASLOCK_STORAGE_DIR";
pub const ENV_AGENT_URL: &str = "NASLOCK_AGENT_URL";
pub const ENV_CONFIG_PATH: &str = "NASLOCK_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub vault_dir: String,
    pub storage_dir: String,
    /// Base URL of the indexing agent, empty to disable
    #[serde(default)]
    pub agent_url: String,
    /// Size ceiling for automatic encryption
    #[serde(default = "default_max_encrypt_size")]
    pub max_encrypt_size_bytes: u64,
}

fn default_max_encrypt_size() -> u64 {
    DEFAULT_MAX_ENCRYPT_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_dir: "./vault".to_string(),
            storage_dir: "./storage".to_string(),
            agent_url: String::new(),
            max_encrypt_size_bytes: DEFAULT_MAX_ENCRYPT_SIZE,
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config = serde_json::from_str(&s)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s)?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(vault_dir) = env::var(ENV_VAULT_DIR) {
            debug!(vault_dir = %vault_dir, "overriding vault_dir from environment");
            self.vault_dir = vault_dir;
        }

        if let Ok(storage_dir) = env::var(ENV_STORAGE_DIR) {
            debug!(storage_dir = %storage_dir, "overriding storage_dir from environment");
            self.storage_dir = storage_dir;
        }

        if let Ok(agent_url) = env::var(ENV_AGENT_URL) {
            debug!(agent_url = %agent_url, "overriding agent_url from environment");
            self.agent_url = agent_url;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.vault_dir.trim().is_empty() {
            anyhow::bail!("vault_dir cannot be empty");
        }

        if self.storage_dir.trim().is_empty() {
            anyhow::bail!("storage_dir cannot be empty");
        }

        // Warn if the vault looks like it lives somewhere web-served
        let vault_dir = Path::new(&self.vault_dir);
        let dir_str = vault_dir.to_string_lossy().to_lowercase();
        if dir_str.contains("public") || dir_str.contains("www") || dir_str.contains("htdocs") {
            warn!(
                path = %self.vault_dir,
                "vault directory appears to be in a public directory - this is a security risk"
            );
        }

        if self.vault_dir.contains("..") {
            warn!("vault_dir contains '..' - consider using absolute paths");
        }

        Ok(())
    }

    /// Create a new config with explicit values
    pub fn new(vault_dir: impl Into<String>, storage_dir: impl Into<String>) -> Self {
        Self {
            vault_dir: vault_dir.into(),
            storage_dir: storage_dir.into(),
            ..Default::default()
        }
    }
}
