use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
    ops::Bound,
    sync::Arc,
};

use time::OffsetDateTime;

use super::{range_bounds, MeterSeries, Visibility};
use crate::domain::{Reading, ReadingFilter};

/// Entries examined per lock acquisition on a series.
const PAGE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    AllVersions,
    Effective,
}

struct Cursor {
    series: Arc<MeterSeries>,
    resume: Bound<(OffsetDateTime, u64)>,
    buffer: VecDeque<Reading>,
    exhausted: bool,
}

impl Cursor {
    /// Pull the next page from the series. Pages end on a `ts` boundary so an
    /// effective-mode group is never split.
    fn fill(&mut self, filter: &ReadingFilter, to: OffsetDateTime, visibility: Visibility, mode: Mode) {
        let entries = self.series.entries.read();
        let (_, end) = range_bounds(to, to);

        let mut examined = 0usize;
        let mut last_key = None;
        let mut truncated = false;
        let mut group: Option<Reading> = None;

        let emit = |r: Reading, buffer: &mut VecDeque<Reading>| {
            if filter.matches_meter(&r.meter_id, &r.region, r.category) {
                buffer.push_back(r);
            }
        };

        for (key, entry) in entries.range((self.resume, end)) {
            let ts_changed = last_key.map_or(true, |(ts, _): (OffsetDateTime, u64)| ts != key.0);
            if examined >= PAGE && ts_changed {
                truncated = true;
                break;
            }
            examined += 1;
            last_key = Some(*key);

            if !entry.visible(visibility) {
                continue;
            }
            match mode {
                Mode::AllVersions => emit(entry.reading.clone(), &mut self.buffer),
                Mode::Effective => {
                    if let Some(g) = group.take() {
                        if g.ts != key.0 {
                            emit(g, &mut self.buffer);
                        }
                    }
                    group = Some(entry.reading.clone());
                }
            }
        }
        if let Some(g) = group {
            emit(g, &mut self.buffer);
        }

        if let Some(k) = last_key {
            self.resume = Bound::Excluded(k);
        }
        self.exhausted = !truncated;
    }

    fn refill(&mut self, filter: &ReadingFilter, to: OffsetDateTime, visibility: Visibility, mode: Mode) {
        while self.buffer.is_empty() && !self.exhausted {
            self.fill(filter, to, visibility, mode);
        }
    }
}

/// Lazy, time-ordered merge over per-meter series.
///
/// Ordered by `ts`, ties broken by `sequence`. Meters first seen after the
/// scan started are not included; readings appended behind a cursor are
/// skipped, those ahead of it may be observed.
pub struct ReadingScan {
    cursors: Vec<Cursor>,
    heap: BinaryHeap<Reverse<(OffsetDateTime, u64, usize)>>,
    filter: ReadingFilter,
    to: OffsetDateTime,
    visibility: Visibility,
    mode: Mode,
    primed: bool,
}

impl ReadingScan {
    pub(crate) fn new(
        series: Vec<Arc<MeterSeries>>,
        filter: ReadingFilter,
        from: OffsetDateTime,
        to: OffsetDateTime,
        visibility: Visibility,
    ) -> Self {
        let cursors = if from < to {
            let (start, _) = range_bounds(from, to);
            series
                .into_iter()
                .map(|series| Cursor {
                    series,
                    resume: start,
                    buffer: VecDeque::new(),
                    exhausted: false,
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            heap: BinaryHeap::with_capacity(cursors.len()),
            cursors,
            filter,
            to,
            visibility,
            mode: Mode::AllVersions,
            primed: false,
        }
    }

    fn push_head(&mut self, idx: usize) {
        if let Some(head) = self.cursors[idx].buffer.front() {
            self.heap.push(Reverse((head.ts, head.sequence, idx)));
        }
    }

    fn prime(&mut self) {
        self.primed = true;
        for idx in 0..self.cursors.len() {
            self.cursors[idx].refill(&self.filter, self.to, self.visibility, self.mode);
            self.push_head(idx);
        }
    }
}

impl Iterator for ReadingScan {
    type Item = Reading;

    fn next(&mut self) -> Option<Reading> {
        if !self.primed {
            self.prime();
        }

        let Reverse((_, _, idx)) = self.heap.pop()?;
        let reading = self.cursors[idx].buffer.pop_front()?;
        self.cursors[idx].refill(&self.filter, self.to, self.visibility, self.mode);
        self.push_head(idx);
        Some(reading)
    }
}

/// Scan yielding only the highest-sequence visible reading per `(meter_id, ts)`.
pub struct EffectiveScan(ReadingScan);

impl EffectiveScan {
    pub(crate) fn new(mut inner: ReadingScan) -> Self {
        inner.mode = Mode::Effective;
        Self(inner)
    }
}

impl Iterator for EffectiveScan {
    type Item = Reading;

    fn next(&mut self) -> Option<Reading> {
        self.0.next()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::{Category, Meter, MeterReading, ReadingFilter},
        registry::InMemoryRegistry,
        store::ReadingStore,
    };
    use std::sync::Arc;
    use time::{macros::datetime, Duration};

    fn store() -> ReadingStore {
        let registry = InMemoryRegistry::new(vec![
            Meter::active("a", "Central", Category::Residential),
            Meter::active("b", "Central", Category::Industrial),
            Meter::active("c", "North", Category::Residential),
        ]);
        ReadingStore::in_memory(Arc::new(registry))
    }

    #[test]
    fn scan_merges_meters_in_time_then_sequence_order() {
        let s = store();
        let t0 = datetime!(2024-01-01 00:00:00 UTC);
        s.append(&MeterReading::new("b", t0 + Duration::minutes(30), 1.0)).unwrap();
        s.append(&MeterReading::new("a", t0, 2.0)).unwrap();
        s.append(&MeterReading::new("c", t0, 3.0)).unwrap();
        s.append(&MeterReading::new("a", t0 + Duration::minutes(45), 4.0)).unwrap();

        let out: Vec<_> = s
            .scan_range(&ReadingFilter::all(), t0, t0 + Duration::HOUR)
            .map(|r| (r.meter_id, r.kwh))
            .collect();
        assert_eq!(
            out,
            vec![
                ("a".to_string(), 2.0),
                ("c".to_string(), 3.0),
                ("b".to_string(), 1.0),
                ("a".to_string(), 4.0),
            ]
        );
    }

    #[test]
    fn scan_is_half_open_and_filtered() {
        let s = store();
        let t0 = datetime!(2024-01-01 00:00:00 UTC);
        s.append(&MeterReading::new("a", t0, 1.0)).unwrap();
        s.append(&MeterReading::new("c", t0, 1.0)).unwrap();
        s.append(&MeterReading::new("a", t0 + Duration::HOUR, 1.0)).unwrap();

        let central = ReadingFilter::region("Central");
        assert_eq!(s.scan_range(&central, t0, t0 + Duration::HOUR).count(), 1);
        assert_eq!(s.scan_range(&ReadingFilter::all(), t0, t0 + Duration::HOUR).count(), 2);
        assert_eq!(s.scan_range(&ReadingFilter::all(), t0, t0).count(), 0);
    }

    #[test]
    fn effective_scan_collapses_corrections_across_pages() {
        let s = store();
        let t0 = datetime!(2024-01-01 00:00:00 UTC);
        for i in 0..600 {
            let ts = t0 + Duration::minutes(i);
            s.append(&MeterReading::new("a", ts, 1.0)).unwrap();
            if i % 3 == 0 {
                s.append(&MeterReading::new("a", ts, 2.0)).unwrap();
            }
        }
        let to = t0 + Duration::DAY;

        assert_eq!(s.scan_range(&ReadingFilter::all(), t0, to).count(), 800);
        let effective: Vec<_> = s.scan_effective(&ReadingFilter::all(), t0, to).collect();
        assert_eq!(effective.len(), 600);
        let sum: f64 = effective.iter().map(|r| r.kwh).sum();
        assert_eq!(sum, 800.0);
        assert!(effective.windows(2).all(|w| w[0].ts < w[1].ts));
    }

    #[test]
    fn scan_restarts_over_current_state() {
        let s = store();
        let t0 = datetime!(2024-01-01 00:00:00 UTC);
        s.append(&MeterReading::new("a", t0, 1.0)).unwrap();
        let filter = ReadingFilter::all();
        assert_eq!(s.scan_range(&filter, t0, t0 + Duration::HOUR).count(), 1);
        s.append(&MeterReading::new("b", t0, 1.0)).unwrap();
        assert_eq!(s.scan_range(&filter, t0, t0 + Duration::HOUR).count(), 2);
    }
}
