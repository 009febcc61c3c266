use std::{path::Path, sync::atomic::Ordering};

use anyhow::{bail, Result};
use ingestion_service::{
    config::AppConfig,
    observability,
    pipeline::{Pipeline, Sink, Source},
    runtime,
    sources::{ReadingBackfillFileSource, ReadingCsvFileSource},
    transform::{ReadingValidation, SourceTag},
};
use telemetry_engine::domain::MeterReading;
use tokio_util::sync::CancellationToken;

async fn run<S, K>(source: S, sink: K) -> Result<()>
where
    S: Source<MeterReading> + 'static,
    K: Sink<MeterReading> + 'static,
{
    let pipeline: Pipeline<_, MeterReading, _> = Pipeline::new(source, sink)
        .with_transform(ReadingValidation)
        .with_transform(SourceTag("backfill"));
    pipeline.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        bail!("usage: backfill_readings <file.ndjson|file.csv>");
    }
    let file_path = Path::new(&args[1]);

    // Load configuration (can point TELEMETRY_CONFIG to a backfill-specific file).
    let cfg = AppConfig::load()?;
    if cfg.engine.log_path.is_none() {
        bail!("engine.log_path must be set, a backfill into an in-memory log would be lost");
    }

    let engine = runtime::open_engine(&cfg.engine, &CancellationToken::new()).await?;
    let sink = runtime::engine_sink(&engine, &cfg.ingest.sink);
    let stats = sink.stats();

    let is_csv = file_path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        run(ReadingCsvFileSource::new(file_path), sink).await?;
    } else {
        run(ReadingBackfillFileSource::new(file_path), sink).await?;
    }

    tracing::info!(
        file = %file_path.display(),
        accepted = stats.accepted.load(Ordering::Relaxed),
        unchanged = stats.unchanged.load(Ordering::Relaxed),
        rejected = stats.rejected.load(Ordering::Relaxed),
        "backfill complete"
    );

    runtime::save_snapshots(&engine).await;
    Ok(())
}
