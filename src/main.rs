use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tollgate::config::{Args, TollgateConfig};
use tollgate::http::{AdmissionState, HttpServer};
use tollgate::ratelimit::{RateDecisionEngine, RedisStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Tollgate admission gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref());
    config.apply_args(&args);

    let limits = &config.rate_limiting;
    info!(
        listen_addr = %config.server.listen_addr,
        store_addr = %config.store.addr,
        ip_limit = limits.ip_limit,
        token_limit = limits.token_limit,
        block_duration_secs = limits.block_duration_secs,
        block_flag_mode = ?limits.block_flag_mode,
        "Configuration loaded"
    );

    // Connects in the background; requests are rejected until Redis is reachable.
    let store = RedisStore::new(&config.store.addr, config.store.password.as_deref())?;
    let engine = RateDecisionEngine::with_block_mode(Arc::new(store), limits.block_flag_mode);
    let state = AdmissionState::new(limits.resolver(), engine);

    HttpServer::new(config.server.listen_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Tollgate admission gate stopped");
    Ok(())
}

/// Initialize tracing, honouring `RUST_LOG` and `LOG_FORMAT=json`.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = json
        || std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
