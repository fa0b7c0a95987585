use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

mod payloads;
mod seed;

/// Persistent job scheduler daemon.
#[derive(Debug, Parser)]
#[command(name = "cadenced", version)]
struct Cli {
    /// Config file (defaults to ~/.cadence/cadence.toml).
    #[arg(long, env = "CADENCE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_daemon=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config =
        cadence_core::CadenceConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
            warn!("Config load failed ({}), using defaults", e);
            cadence_core::CadenceConfig::default()
        });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(cadence_scheduler::SqliteStore::open(db_path)?);

    let registry = payloads::builtin();
    info!(payloads = ?registry.names(), "payloads registered");
    let engine = cadence_scheduler::SchedulerEngine::new(store, registry, config.scheduler.clone());
    let handle = engine.handle();

    let seeds = seed::load(&cadence_core::config::figment(cli.config.as_deref()))?;
    seed::apply(&handle, &seeds, chrono::Utc::now()).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    engine_task.await?;
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
