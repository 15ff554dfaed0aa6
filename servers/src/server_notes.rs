//! # Note Change Relay
//!
//! Listens on a Postgres `NOTIFY` channel and forwards every payload, unchanged, to all connected
//! WebSocket clients.
//!
//! ## Core Responsibilities:
//! - **Upstream:** one `LISTEN` connection, reconnected with backoff if it drops mid-run. An
//!   unreachable database at startup is fatal.
//! - **Downstream:** WebSocket endpoint on `/` and `/ws` plus a `/health` check.
//! - **Protection:** per-IP connection ceiling, per-client message budget per window, heartbeat
//!   pings, and a maximum connection lifetime.
//! - **Lifecycle:** on Ctrl-C or SIGTERM every client is closed with 1001 before the process
//!   exits.

use anyhow::Result;
use lib_common::core::Relay;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod notes_logic;
use notes_logic::{config, downstream, logger, upstream};

/// Upper bound on waiting for client sessions to flush their close frames.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    let log_path = logger::setup_logging(&config.log_dir, &config.log_level)?;
    log::info!("Logging to {}", log_path.display());

    let relay = Arc::new(Relay::new(config.limits()));
    log::info!("Relay limits: {:?}", relay.limits());

    let shutdown = CancellationToken::new();
    let sweep = relay.spawn_rate_reset(shutdown.clone());

    let upstream = match upstream::start(&config, &relay, shutdown.clone()).await {
        Ok(tasks) => tasks,
        Err(e) => {
            log::error!("{:#}", e);
            shutdown.cancel();
            return Err(e);
        }
    };

    let state = downstream::AppState::new(Arc::clone(&relay));
    let sessions = state.sessions.clone();
    let mut server = tokio::spawn(downstream::run(config.clone(), state, shutdown.clone()));

    // Wait for a shutdown signal, or for the server to stop on its own.
    let early_exit = tokio::select! {
        _ = shutdown_signal() => None,
        res = &mut server => Some(res),
    };

    // Stop accepting and stop the feed, then tell every client.
    shutdown.cancel();
    let closed = relay.registry().shutdown();
    log::info!("Closed {} client connection(s).", closed);

    sessions.close();
    if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, sessions.wait()).await.is_err() {
        log::warn!("Timed out waiting for client sessions to finish.");
    }

    let server_result = match early_exit {
        Some(res) => res,
        None => server.await,
    };
    upstream.join().await;
    if let Some(sweep) = sweep {
        let _ = sweep.await;
    }

    if let Err(e) = server_result? {
        log::error!("Downstream server failed: {:#}", e);
        return Err(e);
    }

    log::info!("Shutdown complete.");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => log::info!("SIGTERM received, initiating shutdown."),
    }
}
