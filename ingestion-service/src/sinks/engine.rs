use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use futures::StreamExt;
use telemetry_engine::{checksum::hash_str, domain::MeterReading, BatchOutcome, ErrorKind, IngestionCoordinator};

use crate::pipeline::{Envelope, PipelineError, Sink};

/// Short content digest of a batch, used to correlate log lines across retries.
fn batch_id(readings: &[MeterReading]) -> String {
    let mut h = blake3::Hasher::new();
    for r in readings {
        h.update(&r.ts.unix_timestamp_nanos().to_le_bytes());
        hash_str(&mut h, &r.meter_id);
        h.update(&r.kwh.to_bits().to_le_bytes());
    }
    let mut id = h.finalize().to_hex().to_string();
    id.truncate(16);
    id
}

/// Running totals across every batch the sink has flushed.
#[derive(Debug, Default)]
pub struct SinkStats {
    pub accepted: AtomicU64,
    pub unchanged: AtomicU64,
    pub rejected: AtomicU64,
    pub retries: AtomicU64,
}

impl SinkStats {
    fn record(&self, outcome: &BatchOutcome) {
        self.accepted.fetch_add(outcome.accepted as u64, Ordering::Relaxed);
        self.unchanged.fetch_add(outcome.unchanged as u64, Ordering::Relaxed);
    }
}

/// Feeds readings into the [`IngestionCoordinator`] in batches.
///
/// Readings rejected because storage was unavailable are resubmitted with
/// linear backoff; every other rejection is final and only logged.
pub struct EngineSink {
    coordinator: IngestionCoordinator,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    flush_interval: Option<Duration>,
    stats: Arc<SinkStats>,
}

impl EngineSink {
    pub fn new(coordinator: IngestionCoordinator, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            coordinator,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
            flush_interval: None,
            stats: Arc::new(SinkStats::default()),
        }
    }

    /// Flush a partial batch once the input has been idle for `interval`.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    async fn submit(&self, readings: Vec<MeterReading>) -> Result<BatchOutcome, PipelineError> {
        let coordinator = self.coordinator.clone();
        tokio::task::spawn_blocking(move || coordinator.submit_batch(readings))
            .await
            .map_err(|e| PipelineError::Sink(format!("coordinator task failed: {e}")))
    }

    async fn flush_batch(&self, batch: &[Envelope<MeterReading>]) -> Result<(), PipelineError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pending: Vec<MeterReading> = batch.iter().map(|e| e.payload.clone()).collect();
        let digest = batch_id(&pending);
        let mut attempt: u32 = 0;
        loop {
            let outcome = self.submit(pending).await?;
            self.stats.record(&outcome);

            let retryable: Vec<MeterReading> = outcome.retryable().cloned().collect();
            for r in outcome.rejected.iter().filter(|r| r.kind != ErrorKind::StorageUnavailable) {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    batch = %digest,
                    meter_id = %r.reading.meter_id,
                    ts = %r.reading.ts,
                    kind = r.kind.as_str(),
                    error = %r.message,
                    "reading rejected"
                );
            }

            if retryable.is_empty() {
                metrics::counter!("engine_sink_flushed_batches_total").increment(1);
                return Ok(());
            }

            if attempt < self.max_retries {
                attempt += 1;
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("engine_sink_retry_total").increment(1);
                let sleep_for = self.retry_backoff * attempt;
                tracing::warn!(
                    batch = %digest,
                    attempt,
                    readings = retryable.len(),
                    "storage unavailable, retrying with backoff"
                );
                tokio::time::sleep(sleep_for).await;
                pending = retryable;
            } else {
                self.stats.rejected.fetch_add(retryable.len() as u64, Ordering::Relaxed);
                metrics::counter!("engine_sink_errors_total").increment(1);
                tracing::error!(batch = %digest, readings = retryable.len(), "storage unavailable, giving up");
                return Err(PipelineError::Sink(format!(
                    "{} readings not stored after {} retries",
                    retryable.len(),
                    self.max_retries
                )));
            }
        }
    }

    async fn flush_and_clear(&self, buffer: &mut Vec<Envelope<MeterReading>>) -> Result<(), PipelineError> {
        let started = buffer.iter().map(|e| e.received_at).min();
        self.flush_batch(buffer).await?;
        buffer.clear();

        // Approximate end-to-end latency from earliest received_at to now.
        if let Some(dur) = started.and_then(|t| SystemTime::now().duration_since(t).ok()) {
            metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Sink<MeterReading> for EngineSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<MeterReading>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut buffer: Vec<Envelope<MeterReading>> = Vec::with_capacity(self.batch_size);

        loop {
            let next = match (self.flush_interval, buffer.is_empty()) {
                (Some(idle), false) => match tokio::time::timeout(idle, input.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.flush_and_clear(&mut buffer).await?;
                        continue;
                    }
                },
                _ => input.next().await,
            };

            let Some(item) = next else { break };
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline for EngineSink");
                    continue;
                }
            };

            buffer.push(env);
            if buffer.len() >= self.batch_size {
                self.flush_and_clear(&mut buffer).await?;
            }
        }

        if !buffer.is_empty() {
            self.flush_and_clear(&mut buffer).await?;
        }

        Ok(())
    }
}
