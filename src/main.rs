//! EasySSH Server entrypoint

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use easyssh_server::config::ServerConfig;
use easyssh_server::init_logging;
use easyssh_server::server::{build_router, watchdog, AppState};

/// Usage retention sweep cadence
const USAGE_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    init_logging(config.default_log_filter());

    let addr = SocketAddr::new(config.host, config.port);
    let state = AppState::new(config);

    watchdog::spawn_watchdog(state.sockets.clone());
    spawn_usage_sweeper(&state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("EasySSH server listening on {}", addr);

    let router = build_router(state.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("server error")?;

    info!("EasySSH server stopped");
    Ok(())
}

fn spawn_usage_sweeper(state: &AppState) {
    let ai = state.ai.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(USAGE_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            ai.sweep_usage();
        }
    });
}

/// Resolve on SIGINT/SIGTERM, then close every live socket so sessions tear
/// down session-out (SSH channel first, WebSocket second).
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(
        "Shutdown requested; closing {} live sockets, {} sessions",
        state.sockets.len(),
        state.registry.len()
    );
    state.sockets.sweep(Duration::ZERO);
}
