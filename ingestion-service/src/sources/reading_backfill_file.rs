use std::path::PathBuf;

use async_stream::try_stream;
use telemetry_engine::domain::MeterReading;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// NDJSON backfill source for `MeterReading`.
///
/// Each non-blank line is a JSON object with the same shape as the HTTP
/// ingestion payload (`ts`, `meter_id`, `kwh`, optional `source_system`).
/// A line that fails to parse ends the stream with an error naming the line.
pub struct ReadingBackfillFileSource {
    path: PathBuf,
}

impl ReadingBackfillFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn parse_line(line: &str, line_no: usize) -> Result<MeterReading, PipelineError> {
    serde_json::from_str(line).map_err(|e| {
        metrics::counter!("backfill_readings_parse_errors_total").increment(1);
        PipelineError::Source(format!("failed to parse backfill json line {line_no}: {e}"))
    })
}

#[async_trait::async_trait]
impl Source<MeterReading> for ReadingBackfillFileSource {
    async fn stream(&self) -> EnvelopeStream<MeterReading> {
        let path = self.path.clone();
        let s = try_stream! {
            let file = File::open(&path).await.map_err(|e| {
                PipelineError::Source(format!("failed to open backfill file {}: {e}", path.display()))
            })?;
            let mut lines = BufReader::new(file).lines();
            let mut line_no = 0usize;

            while let Some(line) = lines.next_line().await.map_err(|e| {
                PipelineError::Source(format!("failed to read backfill line: {e}"))
            })? {
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                let reading = parse_line(&line, line_no)?;
                yield Envelope::now(reading);
            }
        };

        Box::pin(s)
    }
}
