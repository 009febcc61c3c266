use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{AggregationIndex, RebuildStats};
use crate::{
    checksum::hash_str,
    domain::{Bucket, WindowSize},
    error::{EngineError, Result},
};

/// Persisted copy of one window's buckets for warm start.
///
/// `store_sequence` is the store's committed watermark when the snapshot was
/// taken: every reading at or below it is folded into `buckets`. It doubles
/// as the version the buckets are valid for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub window: WindowSize,
    pub store_sequence: u64,
    pub buckets: Vec<Bucket>,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    Restored { buckets: usize },
    Rebuilt(RebuildStats),
}

fn checksum(window: WindowSize, store_sequence: u64, buckets: &[Bucket]) -> String {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, window.as_str());
    h.update(&store_sequence.to_le_bytes());
    h.update(&(buckets.len() as u64).to_le_bytes());
    for b in buckets {
        hash_str(&mut h, &b.region);
        hash_str(&mut h, b.category.as_str());
        hash_str(&mut h, b.window_size.as_str());
        h.update(&b.window_start.unix_timestamp_nanos().to_le_bytes());
        h.update(&b.sum.to_bits().to_le_bytes());
        h.update(&b.count.to_le_bytes());
        h.update(&b.min.to_bits().to_le_bytes());
        h.update(&b.max.to_bits().to_le_bytes());
        h.update(&b.version.to_le_bytes());
    }
    h.finalize().to_hex().to_string()
}

impl IndexSnapshot {
    pub fn new(window: WindowSize, store_sequence: u64, buckets: Vec<Bucket>) -> Self {
        let checksum = checksum(window, store_sequence, &buckets);
        Self {
            window,
            store_sequence,
            buckets,
            checksum,
        }
    }

    pub fn is_intact(&self) -> bool {
        checksum(self.window, self.store_sequence, &self.buckets) == self.checksum
            && self.buckets.iter().all(|b| b.window_size == self.window)
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| EngineError::StorageUnavailable(format!("failed to create {}: {e}", parent.display())))?;
            }
        }
        let encoded = serde_json::to_vec(self)
            .map_err(|e| EngineError::StorageUnavailable(format!("failed to encode snapshot: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, encoded)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| EngineError::StorageUnavailable(format!("failed to write {}: {e}", path.display())))
    }

    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|e| EngineError::StorageUnavailable(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::StorageUnavailable(format!("corrupt snapshot {}: {e}", path.display())))
    }
}

impl AggregationIndex {
    /// Capture the live buckets of `size`. Ingestion pauses while the copy is taken.
    pub fn snapshot(&self, size: WindowSize) -> Result<IndexSnapshot> {
        let _gate = self.lock_window(size)?;
        let store_sequence = self.store.high_water_sequence();
        let buckets = self.live_buckets(size)?;
        Ok(IndexSnapshot::new(size, store_sequence, buckets))
    }

    /// Install a snapshot if it is intact and current; otherwise treat the
    /// mismatch as an index inconsistency and rebuild from the store.
    pub fn restore(&self, snapshot: IndexSnapshot, cancel: &CancellationToken) -> Result<RestoreOutcome> {
        let size = snapshot.window;
        let current = self.store.high_water_sequence();

        let problem = if !snapshot.is_intact() {
            Some("snapshot checksum mismatch".to_string())
        } else if snapshot.store_sequence != current {
            Some(format!(
                "snapshot taken at sequence {} but store is at {current}",
                snapshot.store_sequence
            ))
        } else {
            None
        };

        match problem {
            None => {
                let buckets = snapshot.buckets.len();
                self.install(size, snapshot.buckets)?;
                tracing::info!(window = %size, buckets, "aggregation index restored from snapshot");
                Ok(RestoreOutcome::Restored { buckets })
            }
            Some(detail) => {
                let err = EngineError::IndexInconsistency { window: size, detail };
                metrics::counter!("index_inconsistencies_total").increment(1);
                tracing::warn!(error = %err, "discarding snapshot, rebuilding aggregation index");
                self.rebuild(size, cancel).map(RestoreOutcome::Rebuilt)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{Category, Meter, MeterReading},
        registry::InMemoryRegistry,
        store::{MemoryLog, ReadingStore},
    };
    use std::sync::Arc;
    use time::{macros::datetime, Duration};

    fn setup() -> (Arc<ReadingStore>, AggregationIndex) {
        let registry = InMemoryRegistry::new(vec![Meter::active("m1", "Central", Category::Commercial)]);
        let store = Arc::new(ReadingStore::in_memory(Arc::new(registry)));
        let index = AggregationIndex::new(store.clone(), &[WindowSize::Hour]);
        (store, index)
    }

    fn ingest(store: &ReadingStore, index: &AggregationIndex, hour: i64, kwh: f64) {
        let ts = datetime!(2024-05-01 00:00:00 UTC) + Duration::hours(hour);
        store
            .append_with(&MeterReading::new("m1", ts, kwh), |c| index.on_commit(c))
            .unwrap();
    }

    #[test]
    fn current_snapshot_restores_without_rebuild() {
        let (store, index) = setup();
        ingest(&store, &index, 0, 1.0);
        ingest(&store, &index, 1, 2.0);
        let snap = index.snapshot(WindowSize::Hour).unwrap();
        assert!(snap.is_intact());

        let fresh = AggregationIndex::new(store, &[WindowSize::Hour]);
        let outcome = fresh.restore(snap, &CancellationToken::new()).unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored { buckets: 2 });
        assert!(fresh.verify(WindowSize::Hour).unwrap().is_empty());
    }

    #[test]
    fn stale_snapshot_triggers_rebuild() {
        let (store, index) = setup();
        ingest(&store, &index, 0, 1.0);
        let snap = index.snapshot(WindowSize::Hour).unwrap();
        ingest(&store, &index, 1, 2.0);

        let fresh = AggregationIndex::new(store, &[WindowSize::Hour]);
        match fresh.restore(snap, &CancellationToken::new()).unwrap() {
            RestoreOutcome::Rebuilt(stats) => assert_eq!(stats.buckets, 2),
            other => panic!("expected rebuild, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_during_in_flight_commit_is_not_restored_as_current() {
        let log = Arc::new(MemoryLog::new());
        let registry: Arc<InMemoryRegistry> =
            Arc::new(InMemoryRegistry::new(vec![Meter::active("m1", "Central", Category::Commercial)]));
        let store = Arc::new(ReadingStore::open(registry.clone(), log.clone()).unwrap());
        let index = AggregationIndex::new(store.clone(), &[WindowSize::Hour]);

        let t0 = datetime!(2024-05-01 00:00:00 UTC);
        let t1 = (1..)
            .map(|h| t0 + Duration::hours(h))
            .find(|ts| store.stripe("m1", *ts) != store.stripe("m1", t0))
            .unwrap();

        // The first reading is durable but not yet folded in while a later
        // reading commits and the snapshot is taken.
        let mut snap = None;
        store
            .append_with(&MeterReading::new("m1", t0, 7.0), |c| {
                store
                    .append_with(&MeterReading::new("m1", t1, 1.0), |later| index.on_commit(later))
                    .unwrap();
                snap = Some(index.snapshot(WindowSize::Hour).unwrap());
                index.on_commit(c);
            })
            .unwrap();
        let snap = snap.unwrap();
        assert_eq!(snap.store_sequence, 0);

        let reopened = Arc::new(ReadingStore::open(registry, log).unwrap());
        assert_eq!(reopened.high_water_sequence(), 2);
        let fresh = AggregationIndex::new(reopened, &[WindowSize::Hour]);
        assert!(matches!(
            fresh.restore(snap, &CancellationToken::new()).unwrap(),
            RestoreOutcome::Rebuilt(_)
        ));
        let total: f64 = fresh
            .query(None, None, WindowSize::Hour, t0, t1 + Duration::HOUR)
            .unwrap()
            .iter()
            .map(|b| b.sum)
            .sum();
        assert_eq!(total, 8.0);
        assert!(fresh.verify(WindowSize::Hour).unwrap().is_empty());

        let current = index.snapshot(WindowSize::Hour).unwrap();
        assert_eq!(current.store_sequence, 2);
    }

    #[test]
    fn tampered_snapshot_is_rejected_and_round_trips_through_disk() {
        let (store, index) = setup();
        ingest(&store, &index, 0, 1.0);
        let mut snap = index.snapshot(WindowSize::Hour).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hour.json");
        snap.write_to(&path).unwrap();
        assert_eq!(IndexSnapshot::read_from(&path).unwrap(), snap);

        snap.buckets[0].sum = 50.0;
        assert!(!snap.is_intact());
        let fresh = AggregationIndex::new(store, &[WindowSize::Hour]);
        assert!(matches!(
            fresh.restore(snap, &CancellationToken::new()).unwrap(),
            RestoreOutcome::Rebuilt(_)
        ));
        let b = fresh
            .query(None, None, WindowSize::Hour, datetime!(2024-05-01 00:00:00 UTC), datetime!(2024-05-02 00:00:00 UTC))
            .unwrap();
        assert_eq!(b[0].sum, 1.0);
    }
}
