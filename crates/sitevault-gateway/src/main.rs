use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sitevault_core::config::VaultConfig;
use sitevault_scheduler::{
    run_dispatcher, run_retention_worker, BackupStore, DefaultSinkResolver, SchedulerEngine,
};
use tracing::{info, warn};

mod app;
mod auth;
mod error;
mod http;
mod producer;

#[derive(Parser, Debug)]
#[command(name = "sitevault-gateway")]
#[command(version, about = "Backup schedule and chain orchestration gateway", long_about = None)]
struct Cli {
    /// Config file (falls back to $SITEVAULT_CONFIG, then ~/.sitevault/sitevault.toml)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sitevault_gateway=info,sitevault_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: explicit path > SITEVAULT_CONFIG env > ~/.sitevault/sitevault.toml
    let config_path = cli.config.or_else(|| std::env::var("SITEVAULT_CONFIG").ok());
    let config = VaultConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        VaultConfig::default()
    });
    if config.gateway.auth.token.as_deref() == Some("change-me") {
        warn!("gateway.auth.token is the default placeholder; set a real token");
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

    // Created jobs: store -> dispatcher. Completions: store -> retention worker.
    let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::channel(config.scheduler.dispatch_buffer);
    let (retention_tx, retention_rx) =
        tokio::sync::mpsc::channel(config.scheduler.retention_buffer);
    let store = Arc::new(
        BackupStore::new(db)?
            .with_dispatch_queue(dispatch_tx)
            .with_retention_queue(retention_tx),
    );
    info!("database migrations complete");

    let producer = Arc::new(producer::HttpProducer::new(&config.producer)?);
    if config.producer.callback_base_url.is_none() {
        warn!("producer.callback_base_url is not set; site agents will not know where to report");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let engine = SchedulerEngine::new(
        Arc::clone(&store),
        Duration::from_secs(config.scheduler.tick_secs),
    );
    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));
    let dispatcher_task = tokio::spawn(run_dispatcher(
        Arc::clone(&store),
        producer,
        dispatch_rx,
        shutdown_rx.clone(),
    ));
    let retention_task = tokio::spawn(run_retention_worker(
        Arc::clone(&store),
        Arc::new(DefaultSinkResolver),
        retention_rx,
        shutdown_rx,
    ));

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, store));
    let router = app::build_router(state);

    info!("SiteVault gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop the background loops and let them finish their current step
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(engine_task, dispatcher_task, retention_task);
    info!("SiteVault gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
