//! Configuration Loader
//!
//! Handles loading and merging gateway configurations from multiple sources.

use crate::config::GatewayConfig;
use crate::error::{RelayError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Configuration loader with support for multiple sources
pub struct ConfigLoader {
    config: GatewayConfig,
    sources: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader and load from default locations
    pub fn new() -> Result<Self> {
        // Key env vars may live in a .env file
        let _ = dotenvy::dotenv();

        let mut loader = Self::empty();
        loader.load_builtin_defaults()?;
        loader.load_from_default_paths()?;
        loader.config.validate()?;
        Ok(loader)
    }

    /// Create a loader with a specific config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut loader = Self::empty();
        loader.load_builtin_defaults()?;
        loader.load_from_file(path)?;
        loader.config.validate()?;
        Ok(loader)
    }

    fn empty() -> Self {
        Self {
            config: GatewayConfig::default(),
            sources: Vec::new(),
        }
    }

    /// Load built-in defaults
    fn load_builtin_defaults(&mut self) -> Result<()> {
        let defaults = include_str!("../../keyrelay.json");
        let config = GatewayConfig::from_json(defaults).map_err(|e| {
            RelayError::Config(format!("Failed to parse built-in keyrelay.json: {}", e))
        })?;

        self.config.merge(config);
        Ok(())
    }

    /// Load configuration from default paths
    fn load_from_default_paths(&mut self) -> Result<()> {
        for path in Self::get_config_paths() {
            if path.exists() {
                self.load_from_file(&path)?;
            }
        }
        Ok(())
    }

    /// Get list of config paths to check, lowest precedence first
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".keyrelay").join("keyrelay.json"));
        }

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("keyrelay").join("keyrelay.json"));
        }

        paths.push(PathBuf::from("keyrelay.json"));

        if let Ok(custom_path) = std::env::var("KEYRELAY_CONFIG_PATH") {
            paths.push(PathBuf::from(custom_path));
        }

        paths
    }

    /// Load configuration from a specific file
    fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: GatewayConfig = serde_json::from_str(&content).map_err(|e| {
            RelayError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), "Loaded configuration layer");
        self.config.merge(config);
        self.sources.push(path.to_path_buf());
        Ok(())
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Files that contributed, in load order
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Take ownership of the configuration
    pub fn into_config(self) -> GatewayConfig {
        self.config
    }
}
