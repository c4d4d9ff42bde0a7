//! Scan engine service.
//!
//! Loads the TOML configuration, wires storage, branch directory and printing
//! bridge into a [`ScanEngine`] and serves the terminal API until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use scan_engine::api::{self, ApiState};
use scan_engine::{AppConfig, InMemoryStorage, ReqwestLabelPrinter, ScanEngine, StaticDirectory, Storage};

/// Package movement scan engine
#[derive(Parser, Debug)]
#[command(name = "scan-engine", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "SCAN_ENGINE_CONFIG", default_value = "config/scan-engine.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load_from_path(&args.config)?;
    scan_engine::telemetry::init_tracing(config.server.json_logs);

    tracing::info!(
        config_file = %args.config.display(),
        listen_addr = %config.server.listen_addr,
        authorization_ttl_secs = config.engine.authorization_ttl_secs,
        relabel_external_express = config.engine.relabel_external_express,
        printing_bridge = ?config.printing.as_ref().map(|p| p.bridge_url.as_str()),
        "Configuration loaded"
    );

    match config.server.database_url.clone() {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .context("failed to connect to database")?;
            scan_engine::migrator()
                .run(&pool)
                .await
                .context("failed to run migrations")?;
            tracing::info!("Using PostgreSQL storage");
            serve(Arc::new(scan_engine::PostgresScanStorage::new(pool)), config).await
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => anyhow::bail!("database_url is set but the postgres feature is not enabled"),
        None => {
            tracing::warn!("No database_url configured, using in-memory storage");
            serve(Arc::new(InMemoryStorage::new()), config).await
        }
    }
}

async fn serve<S: Storage + 'static>(storage: Arc<S>, config: AppConfig) -> anyhow::Result<()> {
    let directory = Arc::new(
        StaticDirectory::from_config(&config.directory).context("invalid [directory] section")?,
    );
    let printer = config.printing.as_ref().map(ReqwestLabelPrinter::new);
    if printer.is_none() {
        tracing::warn!("No printing bridge configured, labels will be issued without a URL");
    }

    let engine = ScanEngine::new(storage, directory, printer, config.engine.clone());
    let state;

    #[cfg(feature = "metrics")]
    {
        let metrics = Arc::new(scan_engine::metrics::ScanMetrics::new(prometheus::Registry::new())?);
        let engine = Arc::new(engine.with_metrics(metrics.clone()));
        state = ApiState::new(engine).with_metrics(metrics);
    }
    #[cfg(not(feature = "metrics"))]
    {
        state = ApiState::new(Arc::new(engine));
    }

    let shutdown_token = CancellationToken::new();
    let background = state.engine.clone().spawn_background(shutdown_token.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    tracing::info!(listen_addr = %config.server.listen_addr, "Scan engine listening");

    let token = shutdown_token.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            token.cancel();
        })
        .await
        .context("server error")?;

    shutdown_token.cancel();
    for result in futures::future::join_all(background).await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    tracing::info!("Scan engine stopped");
    Ok(())
}
