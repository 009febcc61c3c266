//! Append-only reading store.
//!
//! Readings live in per-meter series ordered by `(ts, sequence)`. Mutation is
//! serialized per `(meter_id, ts)` key through striped locks, so ingestion for
//! different meters never contends on a store-wide lock.
//!
//! A newly appended reading is durable before it becomes visible: it is
//! written to the [`ReadingLog`], inserted as *pending*, handed to the commit
//! hook (the aggregation index), and only then marked committed. Query scans
//! see committed entries only; index maintenance scans also see pending ones.

mod log;
mod scan;

use std::{
    cell::OnceCell,
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    hash::{Hash, Hasher},
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use time::OffsetDateTime;

pub use log::{FileLog, MemoryLog, ReadingLog};
pub use scan::{EffectiveScan, ReadingScan};

use crate::{
    domain::{to_utc, validate_reading, Category, MeterReading, Reading, ReadingFilter},
    error::{EngineError, Result},
    registry::MeterRegistry,
};

const KEY_LOCK_STRIPES: usize = 1024;

/// Which entries a scan may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visibility {
    Committed,
    IncludePending,
}

pub(crate) struct Entry {
    pub(crate) reading: Reading,
    committed: AtomicBool,
}

impl Entry {
    pub(crate) fn visible(&self, visibility: Visibility) -> bool {
        visibility == Visibility::IncludePending || self.committed.load(Ordering::Acquire)
    }
}

/// Tracks which sequences have finished so the store can report a prefix
/// that is fully committed.
#[derive(Default)]
struct Watermark {
    /// Every sequence at or below this one has finished.
    frontier: u64,
    /// Highest committed sequence at or below `frontier`.
    committed: u64,
    /// Finished sequences above `frontier`; `true` if committed, `false` if
    /// abandoned before reaching the log.
    ahead: HashMap<u64, bool>,
}

impl Watermark {
    fn at(sequence: u64) -> Self {
        Self {
            frontier: sequence,
            committed: sequence,
            ahead: HashMap::new(),
        }
    }

    fn finish(&mut self, sequence: u64, committed: bool) {
        self.ahead.insert(sequence, committed);
        while let Some(was_committed) = self.ahead.remove(&(self.frontier + 1)) {
            self.frontier += 1;
            if was_committed {
                self.committed = self.frontier;
            }
        }
    }
}

pub(crate) type SeriesMap = BTreeMap<(OffsetDateTime, u64), Arc<Entry>>;

/// All readings of one meter.
pub(crate) struct MeterSeries {
    /// Distinct (region, category) pairs readings of this meter were filed under.
    profiles: RwLock<Vec<(String, Category)>>,
    pub(crate) entries: RwLock<SeriesMap>,
}

impl MeterSeries {
    fn new() -> Self {
        Self {
            profiles: RwLock::new(Vec::new()),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn may_match(&self, filter: &ReadingFilter) -> bool {
        if filter.region.is_none() && filter.category.is_none() {
            return true;
        }
        self.profiles.read().iter().any(|(region, category)| {
            filter.region.as_deref().map_or(true, |r| r == region)
                && filter.category.map_or(true, |c| c == *category)
        })
    }

    fn note_profile(&self, region: &str, category: Category) {
        if self
            .profiles
            .read()
            .iter()
            .any(|(r, c)| r == region && *c == category)
        {
            return;
        }
        let mut profiles = self.profiles.write();
        if !profiles.iter().any(|(r, c)| r == region && *c == category) {
            profiles.push((region.to_string(), category));
        }
    }

    fn latest(&self, ts: OffsetDateTime, visibility: Visibility) -> Option<Reading> {
        self.entries
            .read()
            .range((ts, 0)..=(ts, u64::MAX))
            .rev()
            .find(|(_, e)| e.visible(visibility))
            .map(|(_, e)| e.reading.clone())
    }
}

/// A durable reading whose commit is in progress.
pub struct PendingCommit<'a> {
    store: &'a ReadingStore,
    reading: Reading,
    previous: Option<Reading>,
    entry: OnceCell<Arc<Entry>>,
}

impl PendingCommit<'_> {
    pub fn reading(&self) -> &Reading {
        &self.reading
    }

    /// The value this reading supersedes, if it is a correction.
    pub fn previous(&self) -> Option<&Reading> {
        self.previous.as_ref()
    }

    /// Insert the entry into its series as pending. Idempotent.
    pub fn publish(&self) {
        self.entry
            .get_or_init(|| self.store.insert(self.reading.clone(), false));
    }
}

/// Result of an append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// A new log entry was written. `previous` is the value it supersedes.
    Appended {
        reading: Reading,
        previous: Option<Reading>,
    },
    /// The key already holds this exact value; nothing was written.
    Unchanged { sequence: u64 },
}

impl AppendOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            Self::Appended { reading, .. } => reading.sequence,
            Self::Unchanged { sequence } => *sequence,
        }
    }
}

pub struct ReadingStore {
    registry: Arc<dyn MeterRegistry>,
    log: Arc<dyn ReadingLog>,
    series: DashMap<String, Arc<MeterSeries>>,
    key_locks: Box<[Mutex<()>]>,
    next_sequence: AtomicU64,
    watermark: Mutex<Watermark>,
    entries: AtomicUsize,
}

impl ReadingStore {
    /// Open a store over `log`, replaying every entry it already holds.
    pub fn open(registry: Arc<dyn MeterRegistry>, log: Arc<dyn ReadingLog>) -> Result<Self> {
        let store = Self::empty(registry, log);

        let replayed = store.log.replay()?;
        let mut max_sequence = 0;
        for reading in replayed {
            max_sequence = max_sequence.max(reading.sequence);
            store.insert(reading, true);
        }
        store.next_sequence.store(max_sequence + 1, Ordering::SeqCst);
        *store.watermark.lock() = Watermark::at(max_sequence);

        tracing::info!(
            entries = store.len(),
            meters = store.meter_count(),
            high_water = max_sequence,
            "reading store opened"
        );
        Ok(store)
    }

    /// A store backed by a fresh [`MemoryLog`].
    pub fn in_memory(registry: Arc<dyn MeterRegistry>) -> Self {
        Self::empty(registry, Arc::new(MemoryLog::new()))
    }

    fn empty(registry: Arc<dyn MeterRegistry>, log: Arc<dyn ReadingLog>) -> Self {
        Self {
            registry,
            log,
            series: DashMap::new(),
            key_locks: (0..KEY_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            next_sequence: AtomicU64::new(1),
            watermark: Mutex::new(Watermark::default()),
            entries: AtomicUsize::new(0),
        }
    }

    /// Append a reading and return its sequence.
    pub fn append(&self, input: &MeterReading) -> Result<u64> {
        self.append_with(input, |_| {}).map(|o| o.sequence())
    }

    /// Append a reading, running `on_commit` after it is durable but before it
    /// becomes visible to query scans.
    ///
    /// The hook may call [`PendingCommit::publish`] to insert the entry (as
    /// pending) at a point of its choosing; otherwise it is inserted once the
    /// hook returns. The hook runs under the key lock, so hooks for the same
    /// `(meter_id, ts)` never overlap and observe corrections in sequence order.
    ///
    /// A hook that panics leaves its sequence unfinished, which holds
    /// [`high_water_sequence`](Self::high_water_sequence) back for good.
    pub fn append_with<F>(&self, input: &MeterReading, on_commit: F) -> Result<AppendOutcome>
    where
        F: FnOnce(&PendingCommit<'_>),
    {
        validate_reading(input)?;
        let meter = self
            .registry
            .lookup(&input.meter_id)
            .ok_or_else(|| EngineError::UnknownMeter(input.meter_id.clone()))?;
        let ts = to_utc(input.ts);

        let _key = self.lock_key(&input.meter_id, ts);

        let previous = self.latest_for(&input.meter_id, ts);
        if let Some(prev) = &previous {
            if prev.kwh.to_bits() == input.kwh.to_bits() {
                return Ok(AppendOutcome::Unchanged {
                    sequence: prev.sequence,
                });
            }
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let reading = Reading {
            sequence,
            meter_id: input.meter_id.clone(),
            region: meter.region,
            category: meter.category,
            ts,
            kwh: input.kwh,
        };

        if let Err(e) = self.log.append(&reading) {
            self.watermark.lock().finish(sequence, false);
            return Err(e);
        }

        let pending = PendingCommit {
            store: self,
            reading,
            previous,
            entry: OnceCell::new(),
        };
        on_commit(&pending);
        pending.publish();
        if let Some(entry) = pending.entry.get() {
            entry.committed.store(true, Ordering::Release);
        }
        self.watermark.lock().finish(sequence, true);

        Ok(AppendOutcome::Appended {
            reading: pending.reading,
            previous: pending.previous,
        })
    }

    /// Highest-sequence committed reading for `(meter_id, ts)`.
    pub fn latest_for(&self, meter_id: &str, ts: OffsetDateTime) -> Option<Reading> {
        let series = self.series.get(meter_id).map(|s| Arc::clone(s.value()))?;
        series.latest(to_utc(ts), Visibility::Committed)
    }

    /// Every committed log entry matching `filter` with `ts` in `[from, to)`,
    /// ordered by `ts` then `sequence`. Each call starts a fresh scan.
    pub fn scan_range(&self, filter: &ReadingFilter, from: OffsetDateTime, to: OffsetDateTime) -> ReadingScan {
        ReadingScan::new(self.series_for(filter), filter.clone(), to_utc(from), to_utc(to), Visibility::Committed)
    }

    /// Like [`scan_range`](Self::scan_range) but yields only the effective
    /// (highest-sequence) reading per `(meter_id, ts)`.
    pub fn scan_effective(
        &self,
        filter: &ReadingFilter,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> EffectiveScan {
        EffectiveScan::new(self.scan_range(filter, from, to))
    }

    /// Effective readings including those whose commit hook is still running.
    pub(crate) fn scan_effective_for_maintenance(
        &self,
        filter: &ReadingFilter,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> EffectiveScan {
        EffectiveScan::new(ReadingScan::new(
            self.series_for(filter),
            filter.clone(),
            to_utc(from),
            to_utc(to),
            Visibility::IncludePending,
        ))
    }

    /// Sequence below which the log holds no reading still being committed.
    ///
    /// Every reading with a sequence at or below the returned value has
    /// finished its commit hook. Readings above it may be in flight even if
    /// some later sequences already committed.
    pub fn high_water_sequence(&self) -> u64 {
        self.watermark.lock().committed
    }

    pub fn meter_count(&self) -> usize {
        self.series.len()
    }

    /// Total number of log entries, corrections included.
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn series_for(&self, filter: &ReadingFilter) -> Vec<Arc<MeterSeries>> {
        match &filter.meter_id {
            Some(id) => self.series.get(id).map(|s| vec![Arc::clone(s.value())]).unwrap_or_default(),
            None => self
                .series
                .iter()
                .filter(|s| s.value().may_match(filter))
                .map(|s| Arc::clone(s.value()))
                .collect(),
        }
    }

    fn insert(&self, reading: Reading, committed: bool) -> Arc<Entry> {
        let series = Arc::clone(
            self.series
                .entry(reading.meter_id.clone())
                .or_insert_with(|| Arc::new(MeterSeries::new()))
                .value(),
        );
        series.note_profile(&reading.region, reading.category);

        let key = (reading.ts, reading.sequence);
        let entry = Arc::new(Entry {
            reading,
            committed: AtomicBool::new(committed),
        });
        series.entries.write().insert(key, Arc::clone(&entry));
        self.entries.fetch_add(1, Ordering::Relaxed);
        entry
    }

    pub(crate) fn stripe(&self, meter_id: &str, ts: OffsetDateTime) -> usize {
        let mut h = DefaultHasher::new();
        meter_id.hash(&mut h);
        ts.unix_timestamp_nanos().hash(&mut h);
        (h.finish() as usize) % self.key_locks.len()
    }

    fn lock_key(&self, meter_id: &str, ts: OffsetDateTime) -> MutexGuard<'_, ()> {
        self.key_locks[self.stripe(meter_id, ts)].lock()
    }
}

pub(crate) fn range_bounds(
    from: OffsetDateTime,
    to: OffsetDateTime,
) -> (Bound<(OffsetDateTime, u64)>, Bound<(OffsetDateTime, u64)>) {
    (Bound::Included((from, 0)), Bound::Excluded((to, 0)))
}
