//! Engine start-up shared by the service binaries.

use std::sync::Arc;

use telemetry_engine::{registry::InMemoryRegistry, Engine, EngineConfig};
use tokio_util::sync::CancellationToken;

use crate::{config::SinkConfig, sinks::EngineSink};

/// Load the meter registry and open the engine on the blocking pool. Opening
/// replays the reading log and warms the index, which can take a while.
pub async fn open_engine(config: &EngineConfig, cancel: &CancellationToken) -> anyhow::Result<Engine> {
    let registry_path = config
        .registry_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("engine.registry_path must point at the meter registry CSV"))?;
    let config = config.clone();
    let cancel = cancel.clone();

    let engine = tokio::task::spawn_blocking(move || -> anyhow::Result<Engine> {
        let registry = InMemoryRegistry::load_csv(&registry_path)?;
        tracing::info!(meters = registry.len(), path = %registry_path.display(), "meter registry loaded");
        Ok(Engine::open(&config, Arc::new(registry), &cancel)?)
    })
    .await??;
    Ok(engine)
}

pub fn engine_sink(engine: &Engine, cfg: &SinkConfig) -> EngineSink {
    EngineSink::new(
        engine.coordinator().clone(),
        cfg.batch_size,
        cfg.max_retries,
        cfg.retry_backoff(),
    )
}

/// Persist index snapshots for the next warm start.
pub async fn save_snapshots(engine: &Engine) {
    let engine = engine.clone();
    match tokio::task::spawn_blocking(move || engine.save_snapshots()).await {
        Ok(Ok(written)) => tracing::info!(written, "index snapshots saved"),
        Ok(Err(e)) => tracing::warn!(error = %e, "failed to save index snapshots"),
        Err(e) => tracing::warn!(error = %e, "snapshot task failed"),
    }
}
