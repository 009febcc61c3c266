//! Incrementally maintained rollups per region, category and time window.
//!
//! Locking, outermost first:
//! 1. per-window `gate` (read for ingest; write for rebuild swap, verify and
//!    snapshot), always taken for every window in coarse-to-fine order;
//! 2. bucket mutexes, taken in `(window, BucketKey)` order;
//! 3. store series locks (taken by recompute scans).
//!
//! Queries clone each bucket under its mutex, so a bucket is never observed
//! half-updated. Buckets are read one at a time; a query spanning several
//! buckets may see some with and some without a concurrent ingest.
//!
//! While a window is rebuilt, queries keep reading the previous buckets.

mod snapshot;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

pub use snapshot::{IndexSnapshot, RestoreOutcome};

use crate::{
    domain::{full_range, Bucket, BucketKey, Category, Reading, ReadingFilter, WindowSize},
    error::{EngineError, Result},
    store::{PendingCommit, ReadingStore},
};

/// Readings replayed between cancellation checks.
const CANCEL_CHECK_EVERY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildStats {
    pub window: WindowSize,
    pub readings_replayed: usize,
    pub buckets: usize,
    pub recomputed_after_swap: usize,
}

type Cell = Arc<Mutex<Bucket>>;

#[derive(Default)]
struct BucketSeries {
    buckets: RwLock<BTreeMap<OffsetDateTime, Cell>>,
}

#[derive(Default)]
struct BucketTable {
    series: DashMap<(String, Category), Arc<BucketSeries>>,
}

impl BucketTable {
    fn cell(&self, key: &BucketKey) -> Cell {
        let series = Arc::clone(&self.series.entry((key.region.clone(), key.category)).or_default());
        if let Some(cell) = series.buckets.read().get(&key.window_start) {
            return Arc::clone(cell);
        }
        let mut buckets = series.buckets.write();
        Arc::clone(
            buckets
                .entry(key.window_start)
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::empty(key)))),
        )
    }

    fn put(&self, bucket: Bucket) {
        let cell = self.cell(&bucket.key());
        *cell.lock() = bucket;
    }

    /// Snapshot of non-empty buckets matching the selectors with
    /// `window_start` in `[from, to)`.
    fn collect(
        &self,
        region: Option<&str>,
        category: Option<Category>,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Vec<Bucket> {
        if from >= to {
            return Vec::new();
        }
        let series: Vec<Arc<BucketSeries>> = self
            .series
            .iter()
            .filter(|s| {
                let (r, c) = s.key();
                region.map_or(true, |want| want == r) && category.map_or(true, |want| want == *c)
            })
            .map(|s| Arc::clone(s.value()))
            .collect();

        let mut out = Vec::new();
        for s in series {
            let cells: Vec<Cell> = s.buckets.read().range(from..to).map(|(_, c)| Arc::clone(c)).collect();
            out.extend(cells.iter().map(|c| c.lock().clone()).filter(|b| b.count > 0));
        }
        out.sort_by(|a, b| {
            a.window_start
                .cmp(&b.window_start)
                .then_with(|| a.region.cmp(&b.region))
                .then_with(|| a.category.cmp(&b.category))
        });
        out
    }

    fn all(&self) -> Vec<Bucket> {
        let (from, to) = full_range();
        self.collect(None, None, from, to)
    }

    fn len(&self) -> usize {
        self.series.iter().map(|s| s.value().buckets.read().len()).sum()
    }
}

struct WindowIndex {
    size: WindowSize,
    gate: RwLock<()>,
    live: RwLock<Arc<BucketTable>>,
    rebuilding: AtomicBool,
    dirty: DashSet<BucketKey>,
    rebuild_lock: Mutex<()>,
}

impl WindowIndex {
    fn new(size: WindowSize) -> Self {
        Self {
            size,
            gate: RwLock::new(()),
            live: RwLock::new(Arc::new(BucketTable::default())),
            rebuilding: AtomicBool::new(false),
            dirty: DashSet::new(),
            rebuild_lock: Mutex::new(()),
        }
    }

    fn table(&self) -> Arc<BucketTable> {
        Arc::clone(&self.live.read())
    }
}

/// Clears the rebuild flag and dirty set however a rebuild exits.
struct RebuildGuard<'a>(&'a WindowIndex);

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.0.rebuilding.store(false, Ordering::SeqCst);
        self.0.dirty.clear();
    }
}

fn key_for(size: WindowSize, reading: &Reading) -> BucketKey {
    BucketKey {
        region: reading.region.clone(),
        category: reading.category,
        window_size: size,
        window_start: size.floor(reading.ts),
    }
}

pub struct AggregationIndex {
    store: Arc<ReadingStore>,
    /// Coarsest first.
    windows: Vec<WindowIndex>,
}

impl AggregationIndex {
    pub fn new(store: Arc<ReadingStore>, sizes: &[WindowSize]) -> Self {
        let mut sizes = sizes.to_vec();
        sizes.sort_by(|a, b| b.cmp(a));
        sizes.dedup();
        Self {
            store,
            windows: sizes.into_iter().map(WindowIndex::new).collect(),
        }
    }

    /// Supported window sizes, coarsest first.
    pub fn window_sizes(&self) -> Vec<WindowSize> {
        self.windows.iter().map(|w| w.size).collect()
    }

    pub fn supports(&self, size: WindowSize) -> bool {
        self.windows.iter().any(|w| w.size == size)
    }

    pub fn store(&self) -> &Arc<ReadingStore> {
        &self.store
    }

    fn window(&self, size: WindowSize) -> Result<&WindowIndex> {
        self.windows
            .iter()
            .find(|w| w.size == size)
            .ok_or(EngineError::UnsupportedWindow(size))
    }

    /// Fold a reading that is already visible in the store into every window.
    ///
    /// `previous` is the value the reading supersedes, if any.
    pub fn on_ingest(&self, reading: &Reading, previous: Option<&Reading>) {
        self.apply(reading, previous, || {});
    }

    /// Commit hook for [`ReadingStore::append_with`]: locks the affected
    /// buckets, publishes the entry, then updates the buckets.
    pub fn on_commit(&self, commit: &PendingCommit<'_>) {
        self.apply(commit.reading(), commit.previous(), || commit.publish());
    }

    fn apply<F: FnOnce()>(&self, reading: &Reading, previous: Option<&Reading>, publish: F) {
        let _gates: Vec<_> = self.windows.iter().map(|w| w.gate.read()).collect();

        // (window, key, is_new_reading_bucket)
        let mut targets: Vec<(usize, BucketKey, bool)> = Vec::with_capacity(self.windows.len() * 2);
        for (i, w) in self.windows.iter().enumerate() {
            let key = key_for(w.size, reading);
            if let Some(prev) = previous {
                let prev_key = key_for(w.size, prev);
                if prev_key != key {
                    targets.push((i, prev_key, false));
                }
            }
            targets.push((i, key, true));
        }
        targets.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let tables: Vec<Arc<BucketTable>> = self.windows.iter().map(WindowIndex::table).collect();
        let cells: Vec<Cell> = targets.iter().map(|(i, key, _)| tables[*i].cell(key)).collect();
        let mut guards: Vec<_> = cells.iter().map(|c| c.lock()).collect();

        publish();

        for ((i, key, is_new), bucket) in targets.iter().zip(guards.iter_mut()) {
            let consistent = match (*is_new, previous) {
                (true, Some(prev)) if key_for(key.window_size, prev) == *key => bucket.replace(prev.kwh, reading.kwh),
                (true, _) => {
                    bucket.add(reading.kwh);
                    true
                }
                // The superseded value moved to another region/category.
                (false, _) => false,
            };
            if !consistent {
                let fresh = self.recompute(key);
                bucket.reset_to(&fresh);
            }

            let w = &self.windows[*i];
            if w.rebuilding.load(Ordering::SeqCst) {
                w.dirty.insert(key.clone());
            }
        }
    }

    /// Exact bucket contents computed from the store's effective readings.
    fn recompute(&self, key: &BucketKey) -> Bucket {
        let filter = ReadingFilter::region(key.region.clone()).with_category(Some(key.category));
        let end = key.window_size.next(key.window_start);
        let mut bucket = Bucket::empty(key);
        for r in self.store.scan_effective_for_maintenance(&filter, key.window_start, end) {
            bucket.add(r.kwh);
        }
        bucket
    }

    /// Buckets for `size` overlapping `[from, to)`, ascending by window start
    /// and then region and category. Omitted selectors yield a per-key
    /// breakdown, not a merged total.
    pub fn query(
        &self,
        region: Option<&str>,
        category: Option<Category>,
        size: WindowSize,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Bucket>> {
        let w = self.window(size)?;
        Ok(w.table().collect(region, category, size.floor(from), to))
    }

    /// Discard the buckets for `size` and replay the whole store into a
    /// staging table, then swap it in.
    ///
    /// The previous buckets stay live until the swap. Ingests that touch the
    /// window meanwhile are tracked and their buckets recomputed at swap
    /// time. Cancellation leaves the previous buckets untouched.
    pub fn rebuild(&self, size: WindowSize, cancel: &CancellationToken) -> Result<RebuildStats> {
        self.rebuild_then_swap(size, cancel, || {})
    }

    /// `rebuild` with a hook run between the replay and the swap.
    fn rebuild_then_swap<F: FnOnce()>(
        &self,
        size: WindowSize,
        cancel: &CancellationToken,
        before_swap: F,
    ) -> Result<RebuildStats> {
        let w = self.window(size)?;
        let started = Instant::now();
        let _exclusive = w.rebuild_lock.lock();

        {
            let _gate = w.gate.write();
            w.dirty.clear();
            w.rebuilding.store(true, Ordering::SeqCst);
        }
        let _guard = RebuildGuard(w);

        let (staging, readings_replayed) = self.build_table(size, cancel)?;
        before_swap();

        let _gate = w.gate.write();
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let dirty: Vec<BucketKey> = w.dirty.iter().map(|k| k.key().clone()).collect();
        for key in &dirty {
            staging.put(self.recompute(key));
        }
        let buckets = staging.len();
        *w.live.write() = Arc::new(staging);

        metrics::counter!("index_rebuilds_total").increment(1);
        metrics::histogram!("index_rebuild_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            window = %size,
            readings_replayed,
            buckets,
            recomputed = dirty.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregation index rebuilt"
        );

        Ok(RebuildStats {
            window: size,
            readings_replayed,
            buckets,
            recomputed_after_swap: dirty.len(),
        })
    }

    fn build_table(&self, size: WindowSize, cancel: &CancellationToken) -> Result<(BucketTable, usize)> {
        let table = BucketTable::default();
        let (from, to) = full_range();
        let mut replayed = 0usize;
        for r in self.store.scan_effective_for_maintenance(&ReadingFilter::all(), from, to) {
            if replayed % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
                tracing::info!(window = %size, replayed, "index rebuild cancelled");
                return Err(EngineError::Cancelled);
            }
            table.cell(&key_for(size, &r)).lock().add(r.kwh);
            replayed += 1;
        }
        Ok((table, replayed))
    }

    /// Recompute every bucket of `size` from the store and return the keys
    /// whose live aggregate disagrees. Blocks ingestion for the duration.
    pub fn verify(&self, size: WindowSize) -> Result<Vec<BucketKey>> {
        let w = self.window(size)?;
        let _gate = w.gate.write();
        let (expected, _) = self.build_table(size, &CancellationToken::new())?;

        let expected: BTreeMap<BucketKey, Bucket> = expected.all().into_iter().map(|b| (b.key(), b)).collect();
        let live: BTreeMap<BucketKey, Bucket> = w.table().all().into_iter().map(|b| (b.key(), b)).collect();

        let mut mismatched: Vec<BucketKey> = expected
            .iter()
            .filter(|(k, b)| live.get(*k).map_or(true, |l| !l.same_aggregate(b)))
            .map(|(k, _)| k.clone())
            .collect();
        mismatched.extend(live.keys().filter(|k| !expected.contains_key(*k)).cloned());
        mismatched.sort();
        Ok(mismatched)
    }

    /// Verify `size` and rebuild it if any bucket disagrees with the store.
    pub fn check_and_repair(&self, size: WindowSize, cancel: &CancellationToken) -> Result<Option<RebuildStats>> {
        let mismatched = self.verify(size)?;
        if mismatched.is_empty() {
            return Ok(None);
        }
        let err = EngineError::IndexInconsistency {
            window: size,
            detail: format!("{} bucket(s) disagree with the reading store", mismatched.len()),
        };
        metrics::counter!("index_inconsistencies_total").increment(1);
        tracing::warn!(error = %err, "rebuilding aggregation index");
        self.rebuild(size, cancel).map(Some)
    }

    /// Rebuild every supported window, coarsest first.
    pub fn rebuild_all(&self, cancel: &CancellationToken) -> Result<Vec<RebuildStats>> {
        self.window_sizes()
            .into_iter()
            .map(|size| self.rebuild(size, cancel))
            .collect()
    }

    pub fn bucket_count(&self, size: WindowSize) -> Result<usize> {
        Ok(self.window(size)?.table().len())
    }

    fn install(&self, size: WindowSize, buckets: Vec<Bucket>) -> Result<()> {
        let w = self.window(size)?;
        let table = BucketTable::default();
        for b in buckets {
            table.put(b);
        }
        let _gate = w.gate.write();
        *w.live.write() = Arc::new(table);
        Ok(())
    }

    fn live_buckets(&self, size: WindowSize) -> Result<Vec<Bucket>> {
        Ok(self.window(size)?.table().all())
    }

    fn lock_window(&self, size: WindowSize) -> Result<parking_lot::RwLockWriteGuard<'_, ()>> {
        Ok(self.window(size)?.gate.write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{Meter, MeterReading},
        registry::InMemoryRegistry,
    };
    use time::{macros::datetime, Duration};

    fn setup() -> (Arc<ReadingStore>, AggregationIndex) {
        let registry = InMemoryRegistry::new(vec![
            Meter::active("m1", "Central", Category::Residential),
            Meter::active("m2", "Central", Category::Residential),
            Meter::active("m3", "North", Category::Industrial),
        ]);
        let store = Arc::new(ReadingStore::in_memory(Arc::new(registry)));
        let index = AggregationIndex::new(store.clone(), &[WindowSize::Hour, WindowSize::Day, WindowSize::Month]);
        (store, index)
    }

    fn ingest(store: &ReadingStore, index: &AggregationIndex, meter: &str, ts: OffsetDateTime, kwh: f64) {
        store
            .append_with(&MeterReading::new(meter, ts, kwh), |c| index.on_commit(c))
            .unwrap();
    }

    #[test]
    fn windows_are_ordered_coarse_to_fine() {
        let (_, index) = setup();
        assert_eq!(
            index.window_sizes(),
            vec![WindowSize::Month, WindowSize::Day, WindowSize::Hour]
        );
    }

    #[test]
    fn correction_replaces_rather_than_adds() {
        let (store, index) = setup();
        let ts = datetime!(2024-01-01 10:15:00 UTC);
        ingest(&store, &index, "m1", ts, 10.0);
        ingest(&store, &index, "m1", ts, 15.0);

        let b = index
            .query(Some("Central"), None, WindowSize::Hour, ts, ts + Duration::HOUR)
            .unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].sum, 15.0);
        assert_eq!(b[0].count, 1);
        assert_eq!(b[0].min, 15.0);
        assert_eq!(b[0].max, 15.0);
    }

    #[test]
    fn downward_correction_of_max_recomputes_extremes() {
        let (store, index) = setup();
        let ts = datetime!(2024-01-01 10:00:00 UTC);
        ingest(&store, &index, "m1", ts, 40.0);
        ingest(&store, &index, "m2", ts, 20.0);
        ingest(&store, &index, "m1", ts, 5.0);

        let b = &index
            .query(Some("Central"), Some(Category::Residential), WindowSize::Day, ts, ts + Duration::DAY)
            .unwrap()[0];
        assert_eq!(b.sum, 25.0);
        assert_eq!(b.count, 2);
        assert_eq!(b.min, 5.0);
        assert_eq!(b.max, 20.0);
    }

    #[test]
    fn query_without_selectors_returns_per_key_breakdown() {
        let (store, index) = setup();
        let ts = datetime!(2024-01-01 10:00:00 UTC);
        ingest(&store, &index, "m1", ts, 1.0);
        ingest(&store, &index, "m3", ts, 2.0);
        ingest(&store, &index, "m3", ts - Duration::HOUR, 4.0);

        let all = index
            .query(None, None, WindowSize::Hour, ts - Duration::HOUR, ts + Duration::HOUR)
            .unwrap();
        let shape: Vec<_> = all.iter().map(|b| (b.window_start, b.region.as_str(), b.sum)).collect();
        assert_eq!(
            shape,
            vec![
                (ts - Duration::HOUR, "North", 4.0),
                (ts, "Central", 1.0),
                (ts, "North", 2.0),
            ]
        );
    }

    #[test]
    fn query_rejects_unindexed_window() {
        let registry = Arc::new(InMemoryRegistry::default());
        let store = Arc::new(ReadingStore::in_memory(registry));
        let index = AggregationIndex::new(store, &[WindowSize::Day]);
        let ts = datetime!(2024-01-01 00:00:00 UTC);
        assert!(matches!(
            index.query(None, None, WindowSize::Hour, ts, ts + Duration::DAY),
            Err(EngineError::UnsupportedWindow(WindowSize::Hour))
        ));
    }

    #[test]
    fn rebuild_matches_incremental_state() {
        let (store, index) = setup();
        let t0 = datetime!(2024-01-30 22:00:00 UTC);
        for i in 0..200i64 {
            let meter = ["m1", "m2", "m3"][(i % 3) as usize];
            let ts = t0 + Duration::minutes(17 * i);
            ingest(&store, &index, meter, ts, (i % 11) as f64 + 0.5);
            if i % 7 == 0 {
                ingest(&store, &index, meter, ts, (i % 5) as f64);
            }
        }

        for size in index.window_sizes() {
            let before = index.live_buckets(size).unwrap();
            let stats = index.rebuild(size, &CancellationToken::new()).unwrap();
            let after = index.live_buckets(size).unwrap();
            assert_eq!(stats.buckets, after.len());
            assert_eq!(before.len(), after.len());
            for (a, b) in before.iter().zip(after.iter()) {
                assert!(a.same_aggregate(b), "{a:?} != {b:?}");
            }
            assert!(index.verify(size).unwrap().is_empty());
        }
    }

    #[test]
    fn ingest_racing_a_rebuild_is_recomputed_at_swap() {
        let (store, index) = setup();
        let ts = datetime!(2024-01-01 10:00:00 UTC);
        ingest(&store, &index, "m1", ts, 10.0);
        ingest(&store, &index, "m3", ts, 1.0);

        let stats = index
            .rebuild_then_swap(WindowSize::Hour, &CancellationToken::new(), || {
                std::thread::scope(|scope| {
                    scope.spawn(|| {
                        ingest(&store, &index, "m1", ts, 15.0);
                        ingest(&store, &index, "m2", ts + Duration::minutes(5), 2.0);
                    });
                });
            })
            .unwrap();
        assert_eq!(stats.readings_replayed, 2);
        assert_eq!(stats.recomputed_after_swap, 1);

        let b = index
            .query(Some("Central"), None, WindowSize::Hour, ts, ts + Duration::HOUR)
            .unwrap();
        assert_eq!((b[0].sum, b[0].count), (17.0, 2));
        assert!(index.verify(WindowSize::Hour).unwrap().is_empty());
    }

    #[test]
    fn correction_after_meter_moves_shifts_value_between_buckets() {
        let registry = Arc::new(InMemoryRegistry::new(vec![
            Meter::active("m1", "Central", Category::Residential),
            Meter::active("m2", "Central", Category::Residential),
        ]));
        let store = Arc::new(ReadingStore::in_memory(registry.clone()));
        let index = AggregationIndex::new(store.clone(), &[WindowSize::Hour, WindowSize::Day]);
        let ts = datetime!(2024-03-05 08:00:00 UTC);
        ingest(&store, &index, "m1", ts, 10.0);
        ingest(&store, &index, "m2", ts, 3.0);

        registry.upsert(Meter::active("m1", "North", Category::Commercial));
        ingest(&store, &index, "m1", ts, 12.0);

        for size in [WindowSize::Hour, WindowSize::Day] {
            let old = index
                .query(Some("Central"), Some(Category::Residential), size, ts, ts + Duration::HOUR)
                .unwrap();
            assert_eq!((old[0].sum, old[0].count, old[0].max), (3.0, 1, 3.0));

            let new = index
                .query(Some("North"), Some(Category::Commercial), size, ts, ts + Duration::HOUR)
                .unwrap();
            assert_eq!((new[0].sum, new[0].count), (12.0, 1));
            assert!(index.verify(size).unwrap().is_empty());
        }
    }

    #[test]
    fn cancelled_rebuild_keeps_previous_buckets() {
        let (store, index) = setup();
        let ts = datetime!(2024-01-01 10:00:00 UTC);
        ingest(&store, &index, "m1", ts, 3.0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(index.rebuild(WindowSize::Hour, &cancel), Err(EngineError::Cancelled)));

        let b = index.query(None, None, WindowSize::Hour, ts, ts + Duration::HOUR).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].sum, 3.0);
    }

    #[test]
    fn check_and_repair_fixes_drifted_bucket() {
        let (store, index) = setup();
        let ts = datetime!(2024-01-01 10:00:00 UTC);
        ingest(&store, &index, "m1", ts, 3.0);

        // Corrupt the live bucket behind the index's back.
        let mut broken = index.live_buckets(WindowSize::Hour).unwrap().remove(0);
        broken.sum = 99.0;
        index.window(WindowSize::Hour).unwrap().table().put(broken);
        assert_eq!(index.verify(WindowSize::Hour).unwrap().len(), 1);

        let stats = index
            .check_and_repair(WindowSize::Hour, &CancellationToken::new())
            .unwrap()
            .expect("repair should rebuild");
        assert_eq!(stats.buckets, 1);
        assert!(index.verify(WindowSize::Hour).unwrap().is_empty());
        assert!(index
            .check_and_repair(WindowSize::Hour, &CancellationToken::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn concurrent_ingest_from_many_threads_is_exact() {
        let (store, index) = setup();
        let index = Arc::new(index);
        let t0 = datetime!(2024-02-01 00:00:00 UTC);

        std::thread::scope(|scope| {
            for t in 0..4i64 {
                let store = store.clone();
                let index = index.clone();
                scope.spawn(move || {
                    for i in 0..250i64 {
                        let meter = ["m1", "m2", "m3"][((i + t) % 3) as usize];
                        let ts = t0 + Duration::minutes(i * 4 + t);
                        store
                            .append_with(&MeterReading::new(meter, ts, 1.0), |c| index.on_commit(c))
                            .unwrap();
                    }
                });
            }
        });

        let day = index
            .query(None, None, WindowSize::Month, t0, t0 + Duration::days(1))
            .unwrap();
        let total: f64 = day.iter().map(|b| b.sum).sum();
        assert_eq!(total, 1000.0);
        assert!(index.verify(WindowSize::Hour).unwrap().is_empty());
    }

    #[test]
    fn on_ingest_folds_readings_appended_without_the_hook() {
        let (store, index) = setup();
        let ts = datetime!(2024-02-03 07:45:00 UTC);
        for kwh in [4.0, 6.0] {
            let outcome = store.append_with(&MeterReading::new("m3", ts, kwh), |_| {}).unwrap();
            if let crate::store::AppendOutcome::Appended { reading, previous } = outcome {
                index.on_ingest(&reading, previous.as_ref());
            }
        }

        let b = index
            .query(Some("North"), Some(Category::Industrial), WindowSize::Day, ts, ts + Duration::HOUR)
            .unwrap();
        assert_eq!((b[0].sum, b[0].count), (6.0, 1));
        assert!(index.verify(WindowSize::Hour).unwrap().is_empty());
    }
}
