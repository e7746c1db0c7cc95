//! Configuration management for the threshold engine server
//!
//! This module handles loading, validation, and management of server configuration
//! from a `server.toml` file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use engine::EngineConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// The expected name of the configuration file.
const SERVER_CONFIG_FILE: &str = "server.toml";

fn default_listen_address() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_log_dir() -> String {
    "./logs".to_string()
}
fn default_graceful_shutdown_timeout_seconds() -> u64 {
    30
}
fn default_wal_checkpoint_interval_seconds() -> u64 {
    60
}
fn default_auto_refresh_poll_interval_seconds() -> u64 {
    60
}
fn default_auto_refresh_max_iterations() -> u32 {
    100
}
fn default_auto_refresh_gap_time_minutes() -> u64 {
    10
}
fn default_fetcher_base_url() -> String {
    "http://localhost:9000".to_string()
}
fn default_rule_provider_base_url() -> String {
    "http://localhost:9001".to_string()
}
fn default_http_client_timeout_seconds() -> u64 {
    30
}

/// Server-level configuration (§10, §11): listen address, storage paths,
/// the nested engine tunables, and the HTTP client settings for the
/// provider adapters in `crate::providers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address and port to bind the API server to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Directory holding the SQLite store.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Directory for daily-rolling log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Graceful shutdown timeout in seconds (default: 30).
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// WAL checkpoint interval in seconds (default: 60).
    #[serde(default = "default_wal_checkpoint_interval_seconds")]
    pub wal_checkpoint_interval_seconds: u64,
    /// How often the background driver checks for a Processing auto-refresh
    /// record to advance, in seconds (default: 60).
    #[serde(default = "default_auto_refresh_poll_interval_seconds")]
    pub auto_refresh_poll_interval_seconds: u64,
    /// Default `max_iterations` for `POST .../auto-refresh/process` when the
    /// caller omits the query parameter (§6).
    #[serde(default = "default_auto_refresh_max_iterations")]
    pub auto_refresh_max_iterations: u32,
    /// Default `gap_time` minutes for the same endpoint.
    #[serde(default = "default_auto_refresh_gap_time_minutes")]
    pub auto_refresh_gap_time_minutes: u64,
    /// Base URL of the data source fetch backend consumed by
    /// `crate::providers::HttpFetcher`.
    #[serde(default = "default_fetcher_base_url")]
    pub fetcher_base_url: String,
    /// Base URL of the monitoring provider backend consumed by
    /// `crate::providers::HttpRuleProvider`.
    #[serde(default = "default_rule_provider_base_url")]
    pub rule_provider_base_url: String,
    /// Timeout applied to the underlying `reqwest::Client` for both
    /// adapters, in seconds (default: 30).
    #[serde(default = "default_http_client_timeout_seconds")]
    pub http_client_timeout_seconds: u64,
    /// Engine tunables (§6 `Configuration`), nested so `server.toml` can set
    /// `[engine]` fields alongside the server-level ones.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            graceful_shutdown_timeout_seconds: default_graceful_shutdown_timeout_seconds(),
            wal_checkpoint_interval_seconds: default_wal_checkpoint_interval_seconds(),
            auto_refresh_poll_interval_seconds: default_auto_refresh_poll_interval_seconds(),
            auto_refresh_max_iterations: default_auto_refresh_max_iterations(),
            auto_refresh_gap_time_minutes: default_auto_refresh_gap_time_minutes(),
            fetcher_base_url: default_fetcher_base_url(),
            rule_provider_base_url: default_rule_provider_base_url(),
            http_client_timeout_seconds: default_http_client_timeout_seconds(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Validate the server configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.is_empty() {
            anyhow::bail!("listen_address cannot be empty");
        }
        if self.listen_address.parse::<SocketAddr>().is_err() {
            anyhow::bail!("invalid listen_address: {}", self.listen_address);
        }
        if self.data_dir.is_empty() {
            anyhow::bail!("data_dir cannot be empty");
        }
        if self.graceful_shutdown_timeout_seconds == 0 {
            anyhow::bail!("graceful_shutdown_timeout_seconds must be greater than 0");
        }
        if self.wal_checkpoint_interval_seconds == 0 {
            anyhow::bail!("wal_checkpoint_interval_seconds must be greater than 0");
        }
        if self.auto_refresh_poll_interval_seconds == 0 {
            anyhow::bail!("auto_refresh_poll_interval_seconds must be greater than 0");
        }
        engine::utils::validate_url(&self.fetcher_base_url).map_err(|e| anyhow::anyhow!("invalid fetcher_base_url: {e}"))?;
        engine::utils::validate_url(&self.rule_provider_base_url).map_err(|e| anyhow::anyhow!("invalid rule_provider_base_url: {e}"))?;
        Ok(())
    }
}

/// Manages the server's configuration.
/// This struct is responsible for the entire lifecycle of the server's
/// configuration, including initial loading, validation, and reloading.
pub struct ConfigManager {
    /// The full path to the configuration file (e.g., `/etc/ite/server.toml`).
    pub config_path: PathBuf,
    /// The loaded and validated server configuration, wrapped in an `Option`
    /// to represent the unloaded state, although the constructor ensures it's
    /// always `Some` on success.
    pub server_config: Option<ServerConfig>,
}

impl ConfigManager {
    /// Creates a new `ConfigManager` and immediately loads the configuration.
    /// This design ensures that a `ConfigManager` instance is always in a valid,
    /// loaded state if successfully created.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        // This logic allows the user to provide either a path to a directory
        // containing `server.toml` or a direct path to the file itself.
        let config_path = if config_path.is_dir() { config_path.join(SERVER_CONFIG_FILE) } else { config_path };

        if !config_path.exists() {
            anyhow::bail!("Configuration file does not exist: {}", config_path.display());
        }

        let mut manager = Self { config_path, server_config: None };
        manager.load_config()?;
        Ok(manager)
    }

    /// Loads the configuration file from disk, parses, and validates it.
    pub fn load_config(&mut self) -> Result<()> {
        info!("Loading server configuration from {}", self.config_path.display());

        let config_content = std::fs::read_to_string(&self.config_path).with_context(|| format!("Failed to read {}", self.config_path.display()))?;

        let server_config: ServerConfig = toml::from_str(&config_content).with_context(|| format!("Failed to parse {}", self.config_path.display()))?;

        server_config.validate().with_context(|| format!("Invalid server configuration in {}", self.config_path.display()))?;

        self.server_config = Some(server_config.clone());

        debug!("Server configuration parameters (including defaults):");
        debug!("  listen_address: {}", server_config.listen_address);
        debug!("  data_dir: {}", server_config.data_dir);
        debug!("  log_dir: {}", server_config.log_dir);
        debug!("  graceful_shutdown_timeout_seconds: {}", server_config.graceful_shutdown_timeout_seconds);
        debug!("  wal_checkpoint_interval_seconds: {}", server_config.wal_checkpoint_interval_seconds);
        debug!("  auto_refresh_poll_interval_seconds: {}", server_config.auto_refresh_poll_interval_seconds);
        debug!("  fetcher_base_url: {}", server_config.fetcher_base_url);
        debug!("  rule_provider_base_url: {}", server_config.rule_provider_base_url);
        debug!("  engine.max_concurrent: {}", server_config.engine.max_concurrent);
        debug!("  engine.timezone: {}", server_config.engine.timezone);

        let config = self.server_config.as_ref().expect("Server configuration should be loaded after successful load_config()");

        info!(
            listen_address = %config.listen_address,
            data_dir = %config.data_dir,
            "Server configuration loaded successfully"
        );

        Ok(())
    }

    /// Reloads the configuration from disk and reports if it has changed.
    /// Returns `Ok(true)` if the configuration changed, `Ok(false)` otherwise.
    pub fn reload_config(&mut self) -> Result<bool> {
        debug!("Reloading server configuration");

        let old_config = self.server_config.clone();

        match self.load_config() {
            Ok(()) => {
                if let Some(old) = old_config {
                    let current = self.server_config.as_ref().expect("Server configuration should be loaded after successful load_config()");

                    if old.listen_address != current.listen_address || old.data_dir != current.data_dir || old.fetcher_base_url != current.fetcher_base_url || old.rule_provider_base_url != current.rule_provider_base_url {
                        info!("Server configuration changed and reloaded");
                        Ok(true)
                    } else {
                        debug!("Server configuration unchanged");
                        Ok(false)
                    }
                } else {
                    info!("Server configuration loaded for first time");
                    Ok(true)
                }
            }
            Err(e) => {
                self.server_config = old_config;
                Err(e)
            }
        }
    }

    /// Checks if the configuration is loaded.
    pub fn is_loaded(&self) -> bool {
        self.server_config.is_some()
    }

    /// Validates that the data directory exists and is accessible, creating
    /// it if necessary. Mirrors the monitoring system's startup check for
    /// its agent configs directory.
    pub fn validate_data_dir(&self) -> Result<()> {
        let config = self.server_config.as_ref().expect("Server configuration not loaded. This should not happen as config is loaded in new().");
        let data_dir = Path::new(&config.data_dir);

        if !data_dir.exists() {
            info!("Data directory does not exist, creating: {}", data_dir.display());
            std::fs::create_dir_all(data_dir).with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
        }

        if !data_dir.is_dir() {
            anyhow::bail!("data_dir path is not a directory: {}", data_dir.display());
        }

        match std::fs::read_dir(data_dir) {
            Ok(_) => {
                debug!("Data directory is accessible");
                Ok(())
            }
            Err(e) => anyhow::bail!("Cannot access data directory {}: {}", data_dir.display(), e),
        }
    }

    /// Override server configuration values and persist to disk.
    /// Returns true if any values were changed.
    pub fn override_and_persist_config(&mut self, listen_address: Option<String>, data_dir: Option<String>) -> Result<bool> {
        let mut config_changed = false;

        if self.server_config.is_none() {
            self.load_config()?;
        }

        let mut server_config = self.server_config.clone().expect("Server configuration must be loaded");

        if let Some(addr) = listen_address {
            if server_config.listen_address != addr {
                info!("Overriding listen_address: {} -> {}", server_config.listen_address, addr);
                server_config.listen_address = addr;
                config_changed = true;
            }
        }

        if let Some(dir) = data_dir {
            if server_config.data_dir != dir {
                info!("Overriding data_dir: {} -> {}", server_config.data_dir, dir);
                server_config.data_dir = dir;
                config_changed = true;
            }
        }

        if config_changed {
            server_config.validate().context("Invalid configuration after applying command-line overrides")?;

            let server_toml = toml::to_string_pretty(&server_config).context("Failed to serialize server configuration")?;

            std::fs::write(&self.config_path, server_toml).with_context(|| format!("Failed to write {}", self.config_path.display()))?;

            self.server_config = Some(server_config);

            info!("Server configuration updated and persisted to disk");
        }

        Ok(config_changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let cfg = ServerConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_empty_listen_address() {
        let mut cfg = ServerConfig::default();
        cfg.listen_address = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_toml_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"listen_address = "127.0.0.1:9090""#).unwrap();
        let manager = ConfigManager::new(file.path().to_path_buf()).unwrap();
        let cfg = manager.server_config.unwrap();
        assert_eq!(cfg.listen_address, "127.0.0.1:9090");
        assert_eq!(cfg.data_dir, "./data");
        assert_eq!(cfg.engine.max_concurrent, 5);
    }
}
