//! `fieldguardd` — serves guarded models over REST.
//!
//! Usage:
//!   fieldguardd -c <config.toml> [--listen <addr>]

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fieldguard::{Enforcer, HookTable, ModelRegistry};
use fieldguard_store::{RecordStore, rest_router};
use tracing::{info, warn};

use config::ServerConfig;

/// Field guard server.
#[derive(Parser, Debug)]
#[command(name = "fieldguardd", about = "Read-only field enforcement server")]
struct Cli {
    /// Path to config file.
    #[arg(short = 'c', long = "config", required = true)]
    config: PathBuf,

    /// Listen address (overrides the config file and 0.0.0.0:8080).
    #[arg(long = "listen")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    info!("Loading configuration from {}", cli.config.display());
    let server_config = ServerConfig::load(&cli.config)?;
    server_config.verify()?;
    let listen = server_config.listen_addr(cli.listen.as_deref());

    // Initialize storage.
    std::fs::create_dir_all(&server_config.storage.data_dir)?;
    let db_path = server_config.storage.resolve_db_path();
    let store = Arc::new(
        RecordStore::open(&db_path)
            .map_err(|e| anyhow::anyhow!("failed to open record store: {}", e))?,
    );
    info!("Record store opened at {}", db_path.display());

    // Policies are fixed for the lifetime of the process.
    let registry = Arc::new(ModelRegistry::from_configs(server_config.models)?);
    info!("{} models registered", registry.len());
    for model in registry.models() {
        match model.policy() {
            Some(policy) if policy.is_fully_locked() => {
                info!("{} (/{}) is read only", model.name(), model.plural())
            }
            Some(policy) => info!(
                "{} (/{}) protects {} field(s)",
                model.name(),
                model.plural(),
                policy.protected_fields().len()
            ),
            None => info!("{} (/{}) has no read-only fields", model.name(), model.plural()),
        }
    }

    let enforcer = Arc::new(Enforcer::new(registry, store.clone()));
    let hooks = Arc::new(HookTable::bind(enforcer));
    if hooks.is_empty() {
        warn!("No model declares read-only fields, writes pass through unchanged");
    } else {
        info!("{} write hooks bound", hooks.len());
    }

    let app = rest_router(store, hooks);

    // Start server.
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("fieldguardd listening on {}", listen);
    axum::serve(listener, app).await?;

    Ok(())
}
