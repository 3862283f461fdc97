//! relay-gateway - polyglot microservice communication gateway
//!
//! Backend services connect over a long-lived TCP socket and register by
//! name; external HTTP clients call `/<prefix>/<service>/<method>` and the
//! gateway dispatches the call to a registered instance, correlates the
//! response, and writes it back.
//!
//! Configuration is loaded from (in order, later wins):
//! 1. Compiled defaults
//! 2. /etc/relay-gateway/config.toml
//! 3. `$XDG_CONFIG_HOME`/relay-gateway/config.toml (or ~/.config/...)
//! 4. --config <path>
//! 5. Environment variables (RELAY_GATEWAY_*)

use anyhow::{Context, Result};
use clap::Parser;
use relay_conf::RelayConfig;
use std::path::PathBuf;

/// Polyglot microservice communication gateway.
#[derive(Parser)]
#[command(name = "relay-gateway")]
#[command(about = "IPC broker + HTTP front-door for polyglot backend services")]
#[command(version)]
struct Cli {
    /// Path to config file (overrides discovered config files)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the resolved configuration as TOML and exit without starting the broker
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = RelayConfig::load_with_sources_from(cli.config.as_deref())
        .context("failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {}", var);
            }
        }
        println!();
        println!("{}", config.to_toml());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(&config.log.level).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
        }))
        .init();

    tracing::info!("configuration loaded from:");
    for path in &sources.files {
        tracing::info!("  - {}", path.display());
    }
    if !sources.env_overrides.is_empty() {
        tracing::info!(overrides = ?sources.env_overrides, "environment overrides applied");
    }

    relay_gateway::run(config).await
}
