//! Munifund lifecycle daemon — entry point.
//!
//! Wires the engine's collaborators together (SQLite ledger store, chain
//! gateway client, log notifier), resumes payback monitors for projects
//! already past their raise, then runs until interrupted.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use munifund_engine::chain::GatewayChain;
use munifund_engine::config::Config;
use munifund_engine::notify::LogNotifier;
use munifund_engine::store::SqliteStore;
use munifund_engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;

    let store = SqliteStore::connect(&config.database_url).await?;
    let chain = GatewayChain::new(&config)?;

    let engine = Engine::new(
        Arc::new(store),
        Arc::new(chain),
        Arc::new(LogNotifier),
        config,
    );

    let resumed = engine.resume_monitors().await?;
    info!(resumed, "lifecycle engine running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, cancelling background tasks");
    engine.shutdown();

    Ok(())
}
