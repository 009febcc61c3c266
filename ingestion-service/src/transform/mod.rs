use crate::pipeline::{Envelope, PipelineError, Transform};
use telemetry_engine::domain::{to_utc, validate_reading, MeterReading};

/// Normalize a reading to UTC and check it against the engine's rules, so
/// malformed input is dropped before it reaches the coordinator.
pub fn validate_meter_reading(mut env: Envelope<MeterReading>) -> Result<Envelope<MeterReading>, PipelineError> {
    env.payload.ts = to_utc(env.payload.ts);
    env.payload.meter_id = env.payload.meter_id.trim().to_string();

    validate_reading(&env.payload).map_err(|e| {
        PipelineError::Transform(format!(
            "meter {} at {}: {e}",
            env.payload.meter_id, env.payload.ts
        ))
    })?;

    Ok(env)
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<MeterReading, MeterReading> for ReadingValidation {
    async fn apply(&self, input: Envelope<MeterReading>) -> Result<Envelope<MeterReading>, PipelineError> {
        match validate_meter_reading(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_readings_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

/// Label readings that arrive without a `source_system`.
#[derive(Clone)]
pub struct SourceTag(pub &'static str);

#[async_trait::async_trait]
impl Transform<MeterReading, MeterReading> for SourceTag {
    async fn apply(&self, mut input: Envelope<MeterReading>) -> Result<Envelope<MeterReading>, PipelineError> {
        if input.payload.source_system.is_none() {
            input.payload.source_system = Some(self.0.to_string());
        }
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn env(meter_id: &str, ts: time::OffsetDateTime, kwh: f64) -> Envelope<MeterReading> {
        Envelope::now(MeterReading::new(meter_id, ts, kwh))
    }

    #[test]
    fn accepts_valid_reading_and_normalizes_to_utc() {
        let res = validate_meter_reading(env(" m-1 ", datetime!(2024-01-01 02:00:00 +02:00), 1.0)).unwrap();
        assert_eq!(res.payload.meter_id, "m-1");
        assert_eq!(res.payload.ts, datetime!(2024-01-01 00:00:00 UTC));
        assert!(res.payload.ts.offset().is_utc());
    }

    #[test]
    fn rejects_negative_kwh() {
        let res = validate_meter_reading(env("m-1", datetime!(2024-01-01 00:00:00 UTC), -0.1));
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }

    #[test]
    fn rejects_out_of_range_ts() {
        let res = validate_meter_reading(env("m-1", datetime!(1800-01-01 00:00:00 UTC), 1.0));
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }

    #[test]
    fn rejects_blank_meter_id() {
        let res = validate_meter_reading(env("  ", datetime!(2024-01-01 00:00:00 UTC), 1.0));
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }

    #[tokio::test]
    async fn source_tag_keeps_existing_label() {
        let mut tagged = env("m-1", datetime!(2024-01-01 00:00:00 UTC), 1.0);
        tagged.payload.source_system = Some("ami-head-end".to_string());
        let out = SourceTag("http").apply(tagged).await.unwrap();
        assert_eq!(out.payload.source_system.as_deref(), Some("ami-head-end"));

        let out = SourceTag("http")
            .apply(env("m-1", datetime!(2024-01-01 00:00:00 UTC), 1.0))
            .await
            .unwrap();
        assert_eq!(out.payload.source_system.as_deref(), Some("http"));
    }
}
