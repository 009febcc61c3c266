use std::{fs::File, path::PathBuf};

use csv::StringRecord;
use telemetry_engine::domain::MeterReading;
use time::OffsetDateTime;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// CSV backfill/source for `MeterReading`.
///
/// Expected header columns (by name):
/// - ts (RFC3339 timestamp)
/// - meter_id
/// - kwh
/// - source_system (optional)
pub struct ReadingCsvFileSource {
    path: PathBuf,
}

impl ReadingCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn parse_optional_string(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn record_to_reading(record: &StringRecord, headers: &StringRecord) -> Result<MeterReading, PipelineError> {
    let get = |name: &str| -> Result<&str, PipelineError> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .and_then(|idx| record.get(idx))
            .ok_or_else(|| PipelineError::Source(format!("missing column '{name}' in CSV record")))
    };

    let ts_str = get("ts")?;
    let ts = OffsetDateTime::parse(ts_str.trim(), &time::format_description::well_known::Rfc3339)
        .map_err(|e| PipelineError::Source(format!("invalid ts '{ts_str}': {e}")))?;

    let meter_id = get("meter_id")?.trim().to_string();

    let kwh_str = get("kwh")?;
    let kwh: f64 = kwh_str
        .trim()
        .parse()
        .map_err(|e| PipelineError::Source(format!("invalid kwh '{kwh_str}': {e}")))?;

    let source_system = get("source_system").ok().and_then(parse_optional_string);

    Ok(MeterReading {
        ts,
        meter_id,
        kwh,
        source_system,
    })
}

#[async_trait::async_trait]
impl Source<MeterReading> for ReadingCsvFileSource {
    async fn stream(&self) -> EnvelopeStream<MeterReading> {
        // Blocking CSV reader inside one async task; fine for backfill-sized files.
        let path = self.path.clone();
        let s = async_stream::try_stream! {
            let file = File::open(&path)
                .map_err(|e| PipelineError::Source(format!("failed to open CSV file {}: {e}", path.display())))?;
            let mut rdr = csv::Reader::from_reader(file);
            let headers = rdr
                .headers()
                .map_err(|e| PipelineError::Source(format!("failed to read CSV headers: {e}")))?
                .clone();

            for result in rdr.records() {
                let record = result.map_err(|e| PipelineError::Source(format!(
                    "failed to read CSV record: {e}"
                )))?;

                let reading = match record_to_reading(&record, &headers) {
                    Ok(r) => r,
                    Err(e) => {
                        metrics::counter!("readings_csv_parse_errors_total").increment(1);
                        Err(e)?
                    }
                };

                yield Envelope::now(reading);
            }
        };

        Box::pin(s)
    }
}
