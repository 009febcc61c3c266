use anyhow::Result;
use ingestion_service::{
    api::{self, ApiState},
    config::AppConfig,
    metrics_server, observability,
    pipeline::Pipeline,
    runtime,
    sources::{HttpJsonSource, SimulatorSource},
    transform::{ReadingValidation, SourceTag},
};
use telemetry_engine::domain::MeterReading;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let shutdown = CancellationToken::new();
    let engine = runtime::open_engine(&cfg.engine, &shutdown).await?;

    // Collector feed over HTTP
    let source_cfg = &cfg.ingest.source;
    let http_source = HttpJsonSource::new(
        &source_cfg.http_bind_addr,
        source_cfg.channel_capacity,
        source_cfg.max_request_records,
        shutdown.clone(),
    )
    .await?;
    let http_pipeline: Pipeline<_, MeterReading, _> = Pipeline::new(
        http_source,
        runtime::engine_sink(&engine, &cfg.ingest.sink).with_flush_interval(cfg.ingest.sink.flush_interval()),
    )
    .with_transform(ReadingValidation)
    .with_transform(SourceTag("http"));
    // Ends once the ingest listener has stopped and the queue is drained.
    let http_task = tokio::spawn(http_pipeline.run());

    // Optional simulated meters
    let sim_task = cfg.simulator.as_ref().map(|sim_cfg| {
        tracing::info!(meters = sim_cfg.meters.len(), interval_ms = sim_cfg.interval_ms, "simulator enabled");
        let pipeline: Pipeline<_, MeterReading, _> = Pipeline::new(
            SimulatorSource::new(sim_cfg),
            runtime::engine_sink(&engine, &cfg.ingest.sink).with_flush_interval(cfg.ingest.sink.flush_interval()),
        )
        .with_transform(ReadingValidation);
        tokio::spawn(pipeline.run_until(shutdown.clone()))
    });

    let api_state = ApiState {
        engine: engine.clone(),
        shutdown: shutdown.clone(),
    };
    let api_task = tokio::spawn({
        let bind_addr = cfg.query_api.bind_addr.clone();
        async move { api::serve(&bind_addr, api_state).await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, draining pipelines");
    shutdown.cancel();

    if let Err(e) = http_task.await? {
        tracing::error!(error = %e, "http ingestion pipeline failed");
    }
    if let Some(task) = sim_task {
        if let Err(e) = task.await? {
            tracing::error!(error = %e, "simulator pipeline failed");
        }
    }
    api_task.await??;

    runtime::save_snapshots(&engine).await;
    Ok(())
}
