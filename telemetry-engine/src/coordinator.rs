use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
};

use serde::Serialize;

use crate::{
    domain::{validate_reading, MeterReading, ReadingKey},
    error::{EngineError, ErrorKind},
    index::AggregationIndex,
    store::{AppendOutcome, ReadingStore},
};

/// Batches below this size are applied on the calling thread.
const PARALLEL_THRESHOLD: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub reading: MeterReading,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    /// Readings that are now reflected in the store and index, idempotent
    /// resubmissions included.
    pub accepted: usize,
    /// Accepted readings whose key already held the identical value.
    pub unchanged: usize,
    /// In-batch duplicates dropped in favor of a later reading for the same key.
    pub superseded: usize,
    /// Failures in original batch order.
    pub rejected: Vec<Rejection>,
}

impl BatchOutcome {
    /// Readings rejected for a reason a later resubmission may not hit.
    pub fn retryable(&self) -> impl Iterator<Item = &MeterReading> {
        self.rejected
            .iter()
            .filter(|r| r.kind == ErrorKind::StorageUnavailable)
            .map(|r| &r.reading)
    }
}

enum Applied {
    Appended,
    Unchanged,
}

fn shard_index(key: &ReadingKey, workers: usize) -> usize {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % workers.max(1)
}

/// Admits reading batches from collectors into the store and index.
#[derive(Clone)]
pub struct IngestionCoordinator {
    store: Arc<ReadingStore>,
    index: Arc<AggregationIndex>,
    workers: usize,
}

impl IngestionCoordinator {
    pub fn new(index: Arc<AggregationIndex>, workers: usize) -> Self {
        Self {
            store: Arc::clone(index.store()),
            index,
            workers: workers.max(1),
        }
    }

    /// Deduplicate, validate and apply a batch.
    ///
    /// Within the batch the last reading for a `(meter_id, ts)` key wins.
    /// Each surviving reading's store write and index update form one step:
    /// a reading is either fully applied or rejected.
    pub fn submit_batch(&self, readings: Vec<MeterReading>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        let mut last_for_key: HashMap<ReadingKey, usize> = HashMap::with_capacity(readings.len());
        for (pos, r) in readings.iter().enumerate() {
            last_for_key.insert(r.key(), pos);
        }
        outcome.superseded = readings.len() - last_for_key.len();

        let mut rejected: Vec<(usize, Rejection)> = Vec::new();
        let mut survivors: Vec<(usize, MeterReading)> = Vec::with_capacity(last_for_key.len());
        for (pos, r) in readings.into_iter().enumerate() {
            if last_for_key.get(&r.key()) != Some(&pos) {
                continue;
            }
            match validate_reading(&r) {
                Ok(()) => survivors.push((pos, r)),
                Err(e) => rejected.push((pos, rejection(r, e))),
            }
        }

        let results = if self.workers > 1 && survivors.len() >= PARALLEL_THRESHOLD {
            self.apply_sharded(survivors)
        } else {
            survivors
                .into_iter()
                .map(|(pos, r)| {
                    let res = self.apply(&r);
                    (pos, r, res)
                })
                .collect()
        };

        for (pos, r, res) in results {
            match res {
                Ok(Applied::Appended) => outcome.accepted += 1,
                Ok(Applied::Unchanged) => {
                    outcome.accepted += 1;
                    outcome.unchanged += 1;
                }
                Err(e) => rejected.push((pos, rejection(r, e))),
            }
        }

        rejected.sort_by_key(|(pos, _)| *pos);
        outcome.rejected = rejected.into_iter().map(|(_, r)| r).collect();

        metrics::counter!("readings_accepted_total").increment(outcome.accepted as u64);
        metrics::counter!("readings_unchanged_total").increment(outcome.unchanged as u64);
        metrics::counter!("readings_superseded_total").increment(outcome.superseded as u64);
        for r in &outcome.rejected {
            metrics::counter!("readings_rejected_total", "kind" => r.kind.as_str()).increment(1);
        }
        if !outcome.rejected.is_empty() {
            tracing::warn!(
                accepted = outcome.accepted,
                rejected = outcome.rejected.len(),
                "batch applied with rejections"
            );
        } else {
            tracing::debug!(accepted = outcome.accepted, unchanged = outcome.unchanged, "batch applied");
        }

        outcome
    }

    fn apply(&self, reading: &MeterReading) -> Result<Applied, EngineError> {
        let outcome = self
            .store
            .append_with(reading, |commit| self.index.on_commit(commit))?;
        Ok(match outcome {
            AppendOutcome::Appended { .. } => Applied::Appended,
            AppendOutcome::Unchanged { .. } => Applied::Unchanged,
        })
    }

    /// Apply survivors on scoped worker threads. Keys are unique after dedup,
    /// so sharding by key only spreads load; it never splits a key.
    fn apply_sharded(
        &self,
        survivors: Vec<(usize, MeterReading)>,
    ) -> Vec<(usize, MeterReading, Result<Applied, EngineError>)> {
        let mut shards: Vec<Vec<(usize, MeterReading)>> = (0..self.workers).map(|_| Vec::new()).collect();
        for (pos, r) in survivors {
            let idx = shard_index(&r.key(), self.workers);
            shards[idx].push((pos, r));
        }

        std::thread::scope(|scope| {
            let handles: Vec<_> = shards
                .into_iter()
                .filter(|s| !s.is_empty())
                .map(|shard| {
                    scope.spawn(move || {
                        shard
                            .into_iter()
                            .map(|(pos, r)| {
                                let res = self.apply(&r);
                                (pos, r, res)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|h| match h.join() {
                    Ok(results) => results,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

fn rejection(reading: MeterReading, error: EngineError) -> Rejection {
    Rejection {
        reading,
        kind: error.kind(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{Category, Meter, WindowSize},
        registry::InMemoryRegistry,
        store::MemoryLog,
    };
    use time::{macros::datetime, Duration, OffsetDateTime};

    fn coordinator(workers: usize) -> (Arc<MemoryLog>, Arc<AggregationIndex>, IngestionCoordinator) {
        let registry = InMemoryRegistry::new(
            (1..=5).map(|i| Meter::active(format!("m{i}"), "Central", Category::Residential)),
        );
        let log = Arc::new(MemoryLog::new());
        let store = Arc::new(ReadingStore::open(Arc::new(registry), log.clone()).unwrap());
        let index = Arc::new(AggregationIndex::new(store, &[WindowSize::Hour]));
        (log, index.clone(), IngestionCoordinator::new(index, workers))
    }

    fn hour_sum(index: &AggregationIndex, ts: OffsetDateTime) -> (f64, u64) {
        let b = index
            .query(Some("Central"), None, WindowSize::Hour, ts, ts + Duration::HOUR)
            .unwrap();
        b.first().map(|b| (b.sum, b.count)).unwrap_or((0.0, 0))
    }

    #[test]
    fn last_reading_for_a_key_wins_within_batch() {
        let (_, index, c) = coordinator(1);
        let ts = datetime!(2024-01-01 10:00:00 UTC);
        let out = c.submit_batch(vec![
            MeterReading::new("m1", ts, 10.0),
            MeterReading::new("m2", ts, 1.0),
            MeterReading::new("m1", ts, 15.0),
        ]);
        assert_eq!(out.accepted, 2);
        assert_eq!(out.superseded, 1);
        assert!(out.rejected.is_empty());
        assert_eq!(hour_sum(&index, ts), (16.0, 2));
    }

    #[test]
    fn rejections_are_reported_in_batch_order_without_blocking_others() {
        let (_, index, c) = coordinator(1);
        let ts = datetime!(2024-01-01 10:00:00 UTC);
        let out = c.submit_batch(vec![
            MeterReading::new("ghost", ts, 1.0),
            MeterReading::new("m1", ts, 2.0),
            MeterReading::new("m2", ts, -3.0),
        ]);
        assert_eq!(out.accepted, 1);
        let kinds: Vec<_> = out.rejected.iter().map(|r| (r.reading.meter_id.as_str(), r.kind)).collect();
        assert_eq!(
            kinds,
            vec![("ghost", ErrorKind::UnknownMeter), ("m2", ErrorKind::InvalidReading)]
        );
        assert_eq!(hour_sum(&index, ts), (2.0, 1));
    }

    #[test]
    fn resubmitting_a_batch_is_idempotent() {
        let (log, index, c) = coordinator(1);
        let ts = datetime!(2024-01-01 10:00:00 UTC);
        let batch = vec![MeterReading::new("m1", ts, 0.1), MeterReading::new("m2", ts, 0.2)];

        c.submit_batch(batch.clone());
        let before = index.query(None, None, WindowSize::Hour, ts, ts + Duration::HOUR).unwrap();
        let again = c.submit_batch(batch);
        let after = index.query(None, None, WindowSize::Hour, ts, ts + Duration::HOUR).unwrap();

        assert_eq!(again.accepted, 2);
        assert_eq!(again.unchanged, 2);
        assert_eq!(before, after);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn storage_failure_is_reported_per_item_and_retryable() {
        let (log, index, c) = coordinator(1);
        let ts = datetime!(2024-01-01 10:00:00 UTC);
        log.set_failing(true);
        let out = c.submit_batch(vec![MeterReading::new("m1", ts, 5.0)]);
        assert_eq!(out.accepted, 0);
        assert_eq!(out.rejected[0].kind, ErrorKind::StorageUnavailable);
        assert_eq!(hour_sum(&index, ts), (0.0, 0));

        log.set_failing(false);
        let retry: Vec<_> = out.retryable().cloned().collect();
        let out = c.submit_batch(retry);
        assert_eq!(out.accepted, 1);
        assert_eq!(hour_sum(&index, ts), (5.0, 1));
    }

    #[test]
    fn parallel_workers_apply_large_batches_exactly() {
        let (_, index, c) = coordinator(4);
        let t0 = datetime!(2024-01-01 00:00:00 UTC);
        let batch: Vec<_> = (0..500i64)
            .map(|i| MeterReading::new(format!("m{}", i % 5 + 1), t0 + Duration::minutes(i / 5), 1.0))
            .collect();
        let out = c.submit_batch(batch);
        assert_eq!(out.accepted, 500);

        let total: f64 = index
            .query(None, None, WindowSize::Hour, t0, t0 + Duration::hours(2))
            .unwrap()
            .iter()
            .map(|b| b.sum)
            .sum();
        assert_eq!(total, 500.0);
        assert!(index.verify(WindowSize::Hour).unwrap().is_empty());
    }

    #[test]
    fn correction_scenario_updates_sum_but_not_count() {
        let (_, index, c) = coordinator(1);
        let ts = datetime!(2024-01-01 10:00:00 UTC);
        let batch: Vec<_> = [10.0, 20.0, 30.0, 40.0, 50.0]
            .iter()
            .enumerate()
            .map(|(i, v)| MeterReading::new(format!("m{}", i + 1), ts, *v))
            .collect();
        c.submit_batch(batch);
        assert_eq!(hour_sum(&index, ts), (150.0, 5));

        c.submit_batch(vec![MeterReading::new("m3", ts, 5.0)]);
        assert_eq!(hour_sum(&index, ts), (125.0, 5));
    }
}
