use anyhow::{bail, Result};
use ingestion_service::{config::AppConfig, observability, runtime};
use telemetry_engine::domain::WindowSize;
use tokio_util::sync::CancellationToken;

/// Recompute the aggregation index from the reading log and write fresh
/// warm-start snapshots. Optionally limited to one window size.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let only: Option<WindowSize> = match std::env::args().nth(1) {
        Some(arg) => Some(arg.parse().map_err(|e: String| anyhow::anyhow!(e))?),
        None => None,
    };

    let cfg = AppConfig::load()?;
    if cfg.engine.snapshot_dir.is_none() {
        bail!("engine.snapshot_dir must be set to write snapshots");
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling rebuild");
                cancel.cancel();
            }
        }
    });

    let engine = runtime::open_engine(&cfg.engine, &cancel).await?;
    let sizes = match only {
        Some(size) if !engine.index().supports(size) => bail!("window size {size} is not configured"),
        Some(size) => vec![size],
        None => engine.index().window_sizes(),
    };

    let task_engine = engine.clone();
    let task_cancel = cancel.clone();
    let stats = tokio::task::spawn_blocking(move || {
        sizes
            .into_iter()
            .map(|size| task_engine.rebuild(size, &task_cancel))
            .collect::<Result<Vec<_>, _>>()
    })
    .await??;

    for s in &stats {
        tracing::info!(
            window = %s.window,
            readings = s.readings_replayed,
            buckets = s.buckets,
            "window rebuilt"
        );
    }

    runtime::save_snapshots(&engine).await;
    Ok(())
}
