//! Application configuration management.
//!
//! This module handles loading and saving the client configuration, which
//! includes the API endpoint, an optional predefined bearer token, the
//! request timeout, and where session tokens are kept.
//!
//! Configuration is stored at `~/.config/rmc/config.json`. The
//! `RMC_API_ENDPOINT`, `RMC_BEARER_TOKEN` and `RMC_TOKEN_STORE` environment
//! variables take precedence over the file.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::client::DEFAULT_REQUEST_TIMEOUT_SECS;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "rmc";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// API address used when nothing else is configured
pub const DEFAULT_API_ENDPOINT: &str = "http://localhost:42069";

pub const ENV_API_ENDPOINT: &str = "RMC_API_ENDPOINT";
pub const ENV_BEARER_TOKEN: &str = "RMC_BEARER_TOKEN";
pub const ENV_TOKEN_STORE: &str = "RMC_TOKEN_STORE";

/// Where session tokens are persisted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenStoreKind {
    #[default]
    File,
    Keyring,
}

impl FromStr for TokenStoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(TokenStoreKind::File),
            "keyring" => Ok(TokenStoreKind::Keyring),
            other => Err(anyhow::anyhow!(
                "Unknown token store '{}' (expected 'file' or 'keyring')",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub api_endpoint: String,
    pub bearer_token: Option<String>,
    pub request_timeout_secs: u64,
    pub token_store: TokenStoreKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            bearer_token: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            token_store: TokenStoreKind::default(),
        }
    }
}

impl Config {
    /// Load the config file, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load the config file alone, or defaults when it does not exist
    pub fn load_file() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from `lookup`. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(endpoint) = var(ENV_API_ENDPOINT) {
            self.api_endpoint = endpoint;
        }
        if let Some(token) = var(ENV_BEARER_TOKEN) {
            self.bearer_token = Some(token);
        }
        if let Some(kind) = var(ENV_TOKEN_STORE) {
            self.token_store = kind
                .parse::<TokenStoreKind>()
                .with_context(|| format!("Invalid {}", ENV_TOKEN_STORE))?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}
