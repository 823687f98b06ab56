//! # Alive-Sync Agent
//!
//! Hosts live record collections for real-time collaborative editing.
//!
//! ## Architecture
//!
//! The agent wires together:
//! 1. **Storage**: one `SQLite` database (or memory) shared by all collections
//! 2. **Broadcast**: one topic per collection on an in-process hub
//! 3. **Bridge**: MQTT ingestion of changes made outside live sessions

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod persistence;
mod runtime;

pub use config::AgentConfig;
pub use runtime::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Alive-Sync Agent");

    let config = AgentConfig::from_env()?;
    tracing::info!(
        store = ?config.persistence.store_type,
        collections = config.collections.len(),
        bridge = config.bridge.is_some(),
        "Configuration loaded"
    );

    let agent = Agent::new(config)?;
    agent.run().await?;

    Ok(())
}
