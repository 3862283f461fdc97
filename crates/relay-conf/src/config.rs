//! Configuration sections recognized by the gateway.
//!
//! Every field has a compiled-in default (a named `default_*` fn, so
//! `loader::merge_configs` can tell an explicitly-set value apart from one
//! left at its default).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

fn humantime_default(s: &str) -> Duration {
    s.parse::<humantime::Duration>()
        .expect("built-in default duration must parse")
        .into()
}

/// HTTP front-door bind address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen address for the HTTP front-door.
    /// Default: 0.0.0.0:8080
    #[serde(default = "GatewayConfig::default_address")]
    pub address: SocketAddr,

    /// Fixed path segment routed calls are matched under:
    /// `/<path_prefix>/<service>/<method>`.
    /// Default: api
    #[serde(default = "GatewayConfig::default_path_prefix")]
    pub path_prefix: String,
}

impl GatewayConfig {
    fn default_address() -> SocketAddr {
        "0.0.0.0:8080".parse().unwrap()
    }

    fn default_path_prefix() -> String {
        "api".to_string()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            path_prefix: Self::default_path_prefix(),
        }
    }
}

/// IPC broker listen settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Listen address for backend connections.
    /// Default: 0.0.0.0:7900
    #[serde(default = "IpcConfig::default_address")]
    pub address: SocketAddr,

    /// Maximum total frame size in bytes, enforces the wire-format cap.
    /// Default: 10 MiB
    #[serde(default = "IpcConfig::default_max_message_size")]
    pub max_message_size: usize,

    /// Bound on each session's outbound frame queue.
    /// Default: 256
    #[serde(default = "IpcConfig::default_send_queue_size")]
    pub send_queue_size: usize,
}

impl IpcConfig {
    fn default_address() -> SocketAddr {
        "0.0.0.0:7900".parse().unwrap()
    }

    fn default_max_message_size() -> usize {
        10 * 1024 * 1024
    }

    fn default_send_queue_size() -> usize {
        256
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            max_message_size: Self::default_max_message_size(),
            send_queue_size: Self::default_send_queue_size(),
        }
    }
}

/// Service registry expiry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Interval between expiry sweeps.
    /// Default: 10s
    #[serde(default = "RegistryConfig::default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Time since last heartbeat after which an instance is expired.
    /// Default: 30s
    #[serde(default = "RegistryConfig::default_instance_expiry", with = "humantime_serde")]
    pub instance_expiry: Duration,
}

impl RegistryConfig {
    fn default_cleanup_interval() -> Duration {
        humantime_default("10s")
    }

    fn default_instance_expiry() -> Duration {
        humantime_default("30s")
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Self::default_cleanup_interval(),
            instance_expiry: Self::default_instance_expiry(),
        }
    }
}

/// Dispatcher-facing transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Per-request deadline used by the dispatcher.
    /// Default: 30s
    #[serde(default = "TransportConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl TransportConfig {
    fn default_timeout() -> Duration {
        humantime_default("30s")
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Self::default_timeout(),
        }
    }
}

/// Process lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Graceful-stop budget before a second signal forces exit.
    /// Default: 5s
    #[serde(default = "ServerConfig::default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    fn default_shutdown_timeout() -> Duration {
        humantime_default("5s")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Self::default_shutdown_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "debug,tower_http=warn".
    /// Default: info
    #[serde(default = "LogConfig::default_level")]
    pub level: String,
}

impl LogConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// Top-level configuration for the relay gateway process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}
