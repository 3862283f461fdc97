//! Config file discovery, loading, and environment variable overlay.

use crate::config::{
    GatewayConfig, IpcConfig, LogConfig, RegistryConfig, RelayConfig, ServerConfig,
    TransportConfig,
};
use crate::ConfigError;
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, explicit override). Only
/// returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it is appended after the system and
/// user configs and takes precedence over both.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/relay-gateway/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("relay-gateway/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
        }
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<RelayConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Merge two configs, with `overlay` taking precedence field-by-field.
///
/// A field in `overlay` only replaces its `base` counterpart when it differs
/// from that field's own compiled default — so a file that sets only
/// `log.level` does not clobber every other section back to defaults.
pub fn merge_configs(base: RelayConfig, overlay: RelayConfig) -> RelayConfig {
    RelayConfig {
        gateway: GatewayConfig {
            address: if overlay.gateway.address != GatewayConfig::default().address {
                overlay.gateway.address
            } else {
                base.gateway.address
            },
            path_prefix: if overlay.gateway.path_prefix != GatewayConfig::default().path_prefix {
                overlay.gateway.path_prefix
            } else {
                base.gateway.path_prefix
            },
        },
        ipc: IpcConfig {
            address: if overlay.ipc.address != IpcConfig::default().address {
                overlay.ipc.address
            } else {
                base.ipc.address
            },
            max_message_size: if overlay.ipc.max_message_size
                != IpcConfig::default().max_message_size
            {
                overlay.ipc.max_message_size
            } else {
                base.ipc.max_message_size
            },
            send_queue_size: if overlay.ipc.send_queue_size
                != IpcConfig::default().send_queue_size
            {
                overlay.ipc.send_queue_size
            } else {
                base.ipc.send_queue_size
            },
        },
        registry: RegistryConfig {
            cleanup_interval: if overlay.registry.cleanup_interval
                != RegistryConfig::default().cleanup_interval
            {
                overlay.registry.cleanup_interval
            } else {
                base.registry.cleanup_interval
            },
            instance_expiry: if overlay.registry.instance_expiry
                != RegistryConfig::default().instance_expiry
            {
                overlay.registry.instance_expiry
            } else {
                base.registry.instance_expiry
            },
        },
        transport: TransportConfig {
            timeout: if overlay.transport.timeout != TransportConfig::default().timeout {
                overlay.transport.timeout
            } else {
                base.transport.timeout
            },
        },
        server: ServerConfig {
            shutdown_timeout: if overlay.server.shutdown_timeout
                != ServerConfig::default().shutdown_timeout
            {
                overlay.server.shutdown_timeout
            } else {
                base.server.shutdown_timeout
            },
        },
        log: LogConfig {
            level: if overlay.log.level != LogConfig::default().level {
                overlay.log.level
            } else {
                base.log.level
            },
        },
    }
}

/// Apply `RELAY_GATEWAY_*` environment variable overrides to config.
pub fn apply_env_overrides(config: &mut RelayConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("RELAY_GATEWAY_ADDRESS") {
        if let Ok(addr) = v.parse() {
            config.gateway.address = addr;
            sources.env_overrides.push("RELAY_GATEWAY_ADDRESS".to_string());
        }
    }
    if let Ok(v) = env::var("RELAY_GATEWAY_PATH_PREFIX") {
        config.gateway.path_prefix = v;
        sources.env_overrides.push("RELAY_GATEWAY_PATH_PREFIX".to_string());
    }

    if let Ok(v) = env::var("RELAY_GATEWAY_IPC_ADDRESS") {
        if let Ok(addr) = v.parse() {
            config.ipc.address = addr;
            sources.env_overrides.push("RELAY_GATEWAY_IPC_ADDRESS".to_string());
        }
    }
    if let Ok(v) = env::var("RELAY_GATEWAY_IPC_MAX_MESSAGE_SIZE") {
        if let Ok(n) = v.parse() {
            config.ipc.max_message_size = n;
            sources
                .env_overrides
                .push("RELAY_GATEWAY_IPC_MAX_MESSAGE_SIZE".to_string());
        }
    }
    if let Ok(v) = env::var("RELAY_GATEWAY_IPC_SEND_QUEUE_SIZE") {
        if let Ok(n) = v.parse() {
            config.ipc.send_queue_size = n;
            sources
                .env_overrides
                .push("RELAY_GATEWAY_IPC_SEND_QUEUE_SIZE".to_string());
        }
    }

    if let Ok(v) = env::var("RELAY_GATEWAY_REGISTRY_CLEANUP_INTERVAL") {
        if let Ok(d) = v.parse::<humantime::Duration>() {
            config.registry.cleanup_interval = d.into();
            sources
                .env_overrides
                .push("RELAY_GATEWAY_REGISTRY_CLEANUP_INTERVAL".to_string());
        }
    }
    if let Ok(v) = env::var("RELAY_GATEWAY_REGISTRY_INSTANCE_EXPIRY") {
        if let Ok(d) = v.parse::<humantime::Duration>() {
            config.registry.instance_expiry = d.into();
            sources
                .env_overrides
                .push("RELAY_GATEWAY_REGISTRY_INSTANCE_EXPIRY".to_string());
        }
    }

    if let Ok(v) = env::var("RELAY_GATEWAY_TRANSPORT_TIMEOUT") {
        if let Ok(d) = v.parse::<humantime::Duration>() {
            config.transport.timeout = d.into();
            sources
                .env_overrides
                .push("RELAY_GATEWAY_TRANSPORT_TIMEOUT".to_string());
        }
    }

    if let Ok(v) = env::var("RELAY_GATEWAY_SERVER_SHUTDOWN_TIMEOUT") {
        if let Ok(d) = v.parse::<humantime::Duration>() {
            config.server.shutdown_timeout = d.into();
            sources
                .env_overrides
                .push("RELAY_GATEWAY_SERVER_SHUTDOWN_TIMEOUT".to_string());
        }
    }

    if let Ok(v) = env::var("RELAY_GATEWAY_LOG_LEVEL") {
        config.log.level = v;
        sources.env_overrides.push("RELAY_GATEWAY_LOG_LEVEL".to_string());
    }
    // Also honor the ambient RUST_LOG convention.
    if let Ok(v) = env::var("RUST_LOG") {
        config.log.level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}
