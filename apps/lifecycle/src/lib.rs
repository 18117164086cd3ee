#![forbid(unsafe_code)]

use anyhow::Result;
use tracing::info;

use crate::{clock::system, config::Config, engine::LifecycleEngine, notify::tracing_sender};

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod invitation;
pub mod ledger;
pub mod notify;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod subscription;

#[cfg(test)]
pub(crate) mod testing;

pub async fn build_engine(config: Config) -> Result<LifecycleEngine> {
    LifecycleEngine::connect(config, system(), tracing_sender()).await
}

/// Starts the engine and runs until ctrl-c.
pub async fn serve(config: Config) -> Result<()> {
    let engine = build_engine(config).await?;
    engine.start().await?;
    info!(
        service = %engine.config().service_name,
        "lifecycle service running"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    engine.stop().await;
    Ok(())
}
