mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use conn_limiter::MemoryRateLimiter;
use ws_bridge::Gateway;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI and environment overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref listen) = cli.listen {
        cfg.network.listen_addr = listen.clone();
    }
    if let Some(ref host) = cli.tor_proxy_host {
        cfg.tor.proxy_host = host.clone();
    }
    if let Some(port) = cli.tor_proxy_port {
        cfg.tor.proxy_port = port;
    }
    if let Some(ref origins) = cli.restrict_origins {
        cfg.admission.origin_allowlist = origins.clone();
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.network.listen_addr,
        tor_proxy = %format!("{}:{}", cfg.tor.proxy_host, cfg.tor.proxy_port),
        origins = cfg.admission.origin_allowlist.len(),
        "ws-gateway starting"
    );

    // 4. Rate limiter, with a background sweep of expired windows.
    let limiter = Arc::new(MemoryRateLimiter::new(cfg.limiter_options()?));
    let _sweeper =
        limiter.spawn_sweeper(Duration::from_secs(cfg.admission.sweep_interval_secs.max(1)));

    info!(
        points = limiter.options().points,
        window = ?limiter.options().duration,
        "connection rate limiter configured"
    );

    // 5. Bind the gateway.
    let gateway_config = cfg.gateway_config()?;
    let gateway = Gateway::bind(gateway_config, limiter)
        .await
        .context("failed to start gateway")?;

    // 6. Serve until the gateway fails or a shutdown signal arrives.
    let result = tokio::select! {
        r = gateway.run() => {
            info!("gateway exited");
            r
        }
        r = shutdown_signal() => r,
    };

    info!("ws-gateway shutting down");
    result
}

/// Resolves on ctrl-c, or SIGTERM on Unix.
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to register SIGTERM handler")?;

        tokio::select! {
            r = ctrl_c => {
                r.context("failed to listen for ctrl-c")?;
                info!("received SIGINT (ctrl-c)");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for ctrl-c")?;
        info!("received SIGINT (ctrl-c)");
    }

    Ok(())
}
