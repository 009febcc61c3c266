use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use telemetry_engine::domain::MeterReading;
use time::OffsetDateTime;

use crate::{
    config::SimulatorConfig,
    pipeline::{Envelope, EnvelopeStream, Source},
};

const SOURCE_SYSTEM: &str = "simulator";

/// Synthetic meter feed for demos and load tests.
///
/// Emits `history_days` of daily readings (0 to 100 kWh) per meter first,
/// then one reading (0 to 10 kWh) per meter every `interval`.
pub struct SimulatorSource {
    meters: Vec<String>,
    interval: Duration,
    history_days: u32,
    seed: Option<u64>,
    max_ticks: Option<u64>,
}

impl SimulatorSource {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            meters: config.meters.clone(),
            interval: Duration::from_millis(config.interval_ms.max(1)),
            history_days: config.history_days,
            seed: config.seed,
            max_ticks: None,
        }
    }

    /// Stop after `ticks` live intervals instead of running forever.
    pub fn with_max_ticks(mut self, ticks: u64) -> Self {
        self.max_ticks = Some(ticks);
        self
    }
}

fn whole_seconds(ts: OffsetDateTime) -> OffsetDateTime {
    ts - time::Duration::nanoseconds(i64::from(ts.nanosecond()))
}

fn reading(meter_id: &str, ts: OffsetDateTime, kwh: f64) -> Envelope<MeterReading> {
    let mut r = MeterReading::new(meter_id, ts, kwh);
    r.source_system = Some(SOURCE_SYSTEM.to_string());
    Envelope::now(r)
}

#[async_trait::async_trait]
impl Source<MeterReading> for SimulatorSource {
    async fn stream(&self) -> EnvelopeStream<MeterReading> {
        let meters = self.meters.clone();
        let interval = self.interval;
        let history_days = self.history_days;
        let max_ticks = self.max_ticks;
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let s = async_stream::stream! {
            let today = whole_seconds(OffsetDateTime::now_utc()).replace_time(time::Time::MIDNIGHT);
            for days_back in (1..=i64::from(history_days)).rev() {
                let ts = today - time::Duration::days(days_back);
                for meter in &meters {
                    yield Ok(reading(meter, ts, rng.gen_range(0.0..10.0) * 10.0));
                }
            }

            let mut ticker = tokio::time::interval(interval);
            let mut ticks = 0u64;
            loop {
                if max_ticks.is_some_and(|max| ticks >= max) {
                    break;
                }
                ticker.tick().await;
                ticks += 1;

                let ts = whole_seconds(OffsetDateTime::now_utc());
                for meter in &meters {
                    yield Ok(reading(meter, ts, rng.gen_range(0.0..10.0)));
                }
                metrics::counter!("simulator_ticks_total").increment(1);
            }
        };

        Box::pin(s)
    }
}
