//! relay-conf - configuration loading for the relay gateway.
//!
//! This crate provides configuration loading with minimal dependencies,
//! designed to be imported by every crate in the workspace without risking
//! a circular dependency.
//!
//! # Config file locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/relay-gateway/config.toml` (system)
//! 2. `~/.config/relay-gateway/config.toml` (user)
//! 3. `--config <path>` (explicit override)
//! 4. Environment variables (`RELAY_GATEWAY_*`)
//!
//! # Usage
//!
//! ```rust,no_run
//! use relay_conf::RelayConfig;
//!
//! let config = RelayConfig::load().expect("failed to load config");
//! println!("HTTP listens on {}", config.gateway.address);
//! ```
//!
//! # Example config file
//!
//! ```toml
//! [gateway]
//! address = "0.0.0.0:8080"
//! path_prefix = "api"
//!
//! [ipc]
//! address = "0.0.0.0:7900"
//! max_message_size = 10485760
//! send_queue_size = 256
//!
//! [registry]
//! cleanup_interval = "10s"
//! instance_expiry = "30s"
//!
//! [transport]
//! timeout = "30s"
//!
//! [server]
//! shutdown_timeout = "5s"
//!
//! [log]
//! level = "info"
//! ```

mod config;
mod loader;

pub use config::{
    GatewayConfig, IpcConfig, LogConfig, RegistryConfig, RelayConfig, ServerConfig,
    TransportConfig,
};
pub use loader::ConfigSources;

use std::path::Path;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse {
        path: std::path::PathBuf,
        message: String,
    },
}

impl RelayConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins): compiled defaults, then system config, then
    /// user config, then environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, with an explicit `--config` file taking
    /// precedence over the user config (system config still loads first).
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about where values came from.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// Load configuration from an optional explicit path, returning sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = RelayConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Render the resolved configuration as TOML, for `--show-config`.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
