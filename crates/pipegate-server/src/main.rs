//! pipegate
//!
//! Serves allow-listed line-oriented worker processes to SSE clients, one
//! process per stream.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use pipegate_core::GatewayConfig;
use pipegate_core::tracing_init::{default_filter, init_tracing};
use pipegate_server::cleanup::CleanupScheduler;
use pipegate_server::server::{AppState, build_router};
use pipegate_server::shutdown::ShutdownCoordinator;

#[derive(Parser, Debug)]
#[command(name = "pipegate")]
#[command(version, about = "pipegate - SSE gateway for stdio worker processes")]
struct Args {
    /// Path to a JSON config file (defaults to the global config when present)
    #[arg(long, env = "PIPEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overrides host and port from the config
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Shared bearer secret, overrides the config
    #[arg(long)]
    auth_token: Option<String>,

    /// Enable a command in the allow-list (repeatable)
    #[arg(long = "command", value_name = "COMMAND")]
    commands: Vec<String>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "PIPEGATE_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PIPEGATE_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(addr) = self.addr {
            config.host = addr.ip().to_string();
            config.port = addr.port();
        }
        if let Some(token) = &self.auth_token {
            config.auth_token.clone_from(token);
        }
        for command in &self.commands {
            config.commands.insert(command.clone(), true);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&default_filter(&args.log_level), args.log_json);

    let mut config =
        GatewayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    let addr = config.socket_addr()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        commands = config.commands.values().filter(|enabled| **enabled).count(),
        max_sessions = config.max_sessions,
        "Starting pipegate"
    );

    let state = AppState::from_config(&config);
    let engine = state.engine.clone();
    let app = build_router(state, &config);

    let coordinator = ShutdownCoordinator::new(engine.clone(), config.sessions.shutdown_grace());
    let mut cleanup = CleanupScheduler::spawn(
        engine,
        config.sessions.cleanup_interval(),
        config.sessions.session_timeout(),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let stop_accepting = coordinator.token();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { stop_accepting.cancelled().await })
        .await
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so workers never see it.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(addr = %addr, "pipegate ready");

    let fatal: Option<anyhow::Error> = tokio::select! {
        result = &mut server => Some(match result {
            Ok(Ok(())) => anyhow::anyhow!("HTTP server stopped unexpectedly"),
            Ok(Err(e)) => anyhow::Error::new(e).context("HTTP server failed"),
            Err(e) => anyhow::Error::new(e).context("HTTP server task failed"),
        }),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            None
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            None
        }
        result = cleanup.finished() => {
            error!(?result, "Cleanup scheduler terminated");
            Some(anyhow::anyhow!("cleanup scheduler terminated: {result:?}"))
        }
    };

    coordinator.drain(Some(&mut cleanup)).await;

    if let Some(err) = fatal {
        error!(error = %err, "pipegate stopped after a fatal fault");
        return Err(err);
    }

    match tokio::time::timeout(config.sessions.shutdown_grace(), server).await {
        Ok(Ok(result)) => result.context("HTTP server failed during shutdown")?,
        Ok(Err(e)) => return Err(anyhow::Error::new(e).context("HTTP server task failed")),
        Err(_) => warn!("HTTP server did not stop within the shutdown grace period"),
    }

    info!("pipegate stopped");
    Ok(())
}
