use anyhow::{Context, Result};
use clap::Parser;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod db;
mod envelope;
mod errors;
mod handlers;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

use config::{AppConfig, Args, Command};
use services::{
    admission::AdmissionPolicy, object_store::ObjectStore, rate_limiter::RateLimiter,
    reaper::Reaper,
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match &args.command {
        Some(Command::Seal {
            input,
            output,
            name,
        }) => {
            let key = commands::seal(input, output, name.as_deref()).await?;
            println!("{}", key);
            Ok(())
        }
        Some(Command::Open {
            input,
            key,
            output_dir,
        }) => {
            let written = commands::open(input, key, output_dir).await?;
            println!("{}", written.display());
            Ok(())
        }
        None => serve(&args).await,
    }
}

async fn serve(args: &Args) -> Result<()> {
    let cfg = AppConfig::from_env_and_args(args)?;
    tracing::info!("Starting ephemeral-drop with config: {:?}", cfg);

    // --- Initialize SQLite + schema ---
    let db = Arc::new(db::connect(&cfg.database_path()).await?);
    db::run_migrations(&db).await?;
    if args.migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let store = ObjectStore::open(db.clone(), cfg.blob_dir())
        .await
        .with_context(|| format!("preparing blob directory {}", cfg.blob_dir().display()))?;
    let limiter = Arc::new(RateLimiter::new(cfg.rate_limit_window, cfg.rate_limit_max));
    let admission = AdmissionPolicy::new(cfg.max_file_size, cfg.max_ttl_secs);

    let reaper_task = Reaper::new(store.clone()).start(cfg.reap_interval);
    let compaction_task = limiter.start_compaction();

    // --- Build router ---
    let app = routes::routes::routes(AppState::new(store, admission, limiter));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    for task in [reaper_task, compaction_task] {
        let name = task.name();
        task.stop().await;
        tracing::info!(task = name, "background task stopped");
    }
    db.close().await;

    served.context("serving HTTP")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
