//! # MTConnect Agent
//!
//! Agent runtime that buffers MTConnect observations and assets received
//! over MQTT.
//!
//! ## Architecture
//!
//! The agent runs three concurrent activities:
//! 1. **Ingress**: The MQTT event loop classifies and decodes inbound
//!    devices, observations, conditions, and assets
//! 2. **Buffering**: Decoded records land in the observation ring buffer,
//!    the asset store, and the device registry
//! 3. **Archival**: Assets are periodically drained into `SQLite`

use anyhow::{Context, Result};
use mtconnect_core::AgentIdentity;
use tracing_subscriber::EnvFilter;

mod config;
mod persistence;
mod runtime;

pub use config::AgentConfig;
pub use runtime::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting MTConnect Agent"
    );

    // Load configuration
    let config = AgentConfig::from_env()?;

    // Load identity; a fresh change token is written on every start
    let mut identity = AgentIdentity::load_or_create(&config.identity_path);
    identity
        .save(&config.identity_path)
        .with_context(|| format!("Failed to save {}", config.identity_path.display()))?;

    tracing::info!(
        uuid = %identity.uuid,
        change_token = %identity.change_token,
        "Agent initialized"
    );

    let agent = Agent::new(config, &identity)?;

    // Run agent
    agent.run().await?;

    Ok(())
}
