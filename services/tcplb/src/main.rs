//! tcplb
//!
//! L4 load balancer with TLS termination.
//!
//! This binary:
//! - Loads and validates the JSON configuration
//! - Runs an initial health check, then keeps probing backends periodically
//! - Accepts TCP (or TLS) connections and filters them by IP and rate
//! - Relays admitted connections to a round-robin selected backend
//! - Drains connections on SIGINT/SIGTERM

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use tcplb::server::load_acceptor;
use tcplb::{
    logging, Acceptor, Config, HealthChecker, IpFilter, Listener, ProxyEngine, RateLimiter,
    ServerPool, Supervisor,
};

#[derive(Debug, Parser)]
#[command(name = "tcplb", version, about = "L4 TCP/TLS load balancer")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "TCPLB_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    if cli.check {
        println!("{}: configuration OK", cli.config.display());
        return Ok(());
    }

    logging::init(&config.log_level, config.log_format)?;

    info!("Starting tcplb");
    info!(
        listen_addr = %config.listen_addr,
        algorithm = %config.algorithm,
        backends = config.servers.len(),
        tls = config.accept_tls,
        ip_filter_mode = %config.ip_filter_mode,
        "Configuration loaded"
    );

    let pool = Arc::new(ServerPool::from_addresses(config.server_addresses()));
    if pool.is_empty() {
        warn!("No backends configured, every connection will be closed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Health data must exist before the first connection is forwarded.
    let health_checker = Arc::new(HealthChecker::new(
        Arc::clone(&pool),
        config.health_check_interval(),
        config.request_timeout(),
    ));
    health_checker.check_servers().await;
    let health_handle = Arc::clone(&health_checker).start(shutdown_rx.clone());

    let engine = Arc::new(ProxyEngine::new(Arc::clone(&pool), config.request_timeout()));
    let rate_limiter = Arc::new(RateLimiter::per_minute(
        config.max_concurrent_connections(),
        config.max_connections_per_minute(),
    ));
    let eviction_handle = Arc::clone(&rate_limiter).start_eviction(shutdown_rx.clone());
    let ip_filter = Arc::new(IpFilter::from_config(
        &config.ip_filter_mode,
        &config.ip_filter_list,
    ));

    let acceptor = match (&config.tls_cert_file, &config.tls_key_file) {
        (Some(cert), Some(key)) if config.accept_tls => {
            Acceptor::Tls(load_acceptor(cert, key).context("Failed to set up TLS")?)
        }
        _ => Acceptor::Plain,
    };
    let listener = Listener::bind(&config.listen_addr, acceptor)
        .await
        .context("Failed to start listener")?;

    let supervisor = Supervisor::new(listener, ip_filter, rate_limiter, engine)
        .with_handshake_timeout(config.request_timeout())
        .with_grace_period(config.shutdown_grace_period());

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = supervisor.run(shutdown_rx).await {
        error!(error = %e, "Listener failed");
        return Err(e.into());
    }

    for (name, handle) in [("health checker", health_handle), ("eviction", eviction_handle)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Background task panicked");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
