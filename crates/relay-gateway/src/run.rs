//! Process wiring: binds both listeners, starts the broker's accept loop
//! and background sweepers, serves HTTP, and drives graceful shutdown.
//!
//! One broadcast channel fans a single shutdown signal out to every
//! long-running task (the IPC accept loop, the two sweepers, and axum's
//! `with_graceful_shutdown`); a second SIGINT/SIGTERM within
//! `server.shutdown_timeout` forces `std::process::exit(1)` rather than
//! waiting out the budget.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_broker::{spawn_background_sweepers, Broker};
use relay_conf::RelayConfig;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::http::{self, AppState};

/// Run the gateway process to completion: binds listeners, serves both the
/// IPC broker and the HTTP front-door, and returns once a graceful shutdown
/// has finished draining.
pub async fn run(config: RelayConfig) -> Result<()> {
    let broker = Arc::new(Broker::new(
        config.ipc.send_queue_size,
        config.transport.timeout,
        config.ipc.max_message_size,
    ));

    let ipc_listener = TcpListener::bind(config.ipc.address)
        .await
        .with_context(|| format!("failed to bind IPC listener on {}", config.ipc.address))?;
    let http_listener = TcpListener::bind(config.gateway.address)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.gateway.address))?;

    info!(ipc_addr = %config.ipc.address, "IPC broker listening");
    info!(http_addr = %config.gateway.address, prefix = %config.gateway.path_prefix, "HTTP front-door listening");

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let accept_task = {
        let broker = broker.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(broker.run_accept_loop(ipc_listener, shutdown_rx))
    };

    spawn_background_sweepers(&broker, config.registry.cleanup_interval, config.registry.instance_expiry, &shutdown_tx);

    let state = AppState {
        dispatcher: broker.dispatcher.clone(),
        request_timeout: config.transport.timeout,
    };
    let app = http::router(state, &config.gateway.path_prefix).layer(tower_http::trace::TraceLayer::new_for_http());

    let shutdown_timeout = config.server.shutdown_timeout;
    let mut http_shutdown_rx = shutdown_rx;
    let http_server = axum::serve(http_listener, app).with_graceful_shutdown(async move {
        let _ = http_shutdown_rx.recv().await;
        info!("HTTP front-door draining");
    });

    tokio::spawn(watch_for_shutdown_signal(shutdown_tx.clone(), shutdown_timeout));

    http_server.await.context("HTTP server error")?;
    let _ = accept_task.await;

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGINT/SIGTERM, fan it out over `shutdown_tx`, then race the
/// configured shutdown budget against a second signal. Whichever arrives
/// first past that point forces an immediate exit.
async fn watch_for_shutdown_signal(shutdown_tx: broadcast::Sender<()>, shutdown_timeout: Duration) {
    wait_for_signal().await;
    info!(budget = ?shutdown_timeout, "shutdown signal received, draining");
    let _ = shutdown_tx.send(());

    tokio::select! {
        _ = tokio::time::sleep(shutdown_timeout) => {
            warn!("graceful shutdown budget elapsed, forcing exit");
            std::process::exit(1);
        }
        _ = wait_for_signal() => {
            warn!("second shutdown signal received, forcing exit");
            std::process::exit(1);
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
