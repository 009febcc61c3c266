//! Dashboard-facing queries over the aggregation index and the reading store.
//!
//! The engine holds no state of its own; every call reads the current index
//! and store. Buckets are read one at a time, so a result spanning several
//! buckets may interleave with concurrent ingestion.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeMap, BinaryHeap, HashMap},
    sync::Arc,
};

use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    domain::{clamp_to_valid, Category, Reading, ReadingFilter, WindowSize},
    index::AggregationIndex,
    store::ReadingStore,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    pub value: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerTotal {
    pub meter_id: String,
    pub total: f64,
}

/// Heap entry ordered so that "greater" means "ranks higher".
struct Ranked(ConsumerTotal);

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .total
            .total_cmp(&other.0.total)
            .then_with(|| other.0.meter_id.cmp(&self.0.meter_id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

#[derive(Clone)]
pub struct QueryEngine {
    index: Arc<AggregationIndex>,
    store: Arc<ReadingStore>,
}

impl QueryEngine {
    pub fn new(index: Arc<AggregationIndex>) -> Self {
        let store = Arc::clone(index.store());
        Self { index, store }
    }

    /// Total kWh over `[from, to)`.
    ///
    /// Fully contained windows of the coarsest indexed size are summed from
    /// the index; the partial edges are resolved at the next finer indexed
    /// size, and whatever no indexed window covers is scanned raw. The result
    /// equals a raw scan of the range up to float accumulation error.
    pub fn total_usage(
        &self,
        region: Option<&str>,
        category: Option<Category>,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> f64 {
        let sizes = self.index.window_sizes();
        self.sum_range(region, category, from, to, &sizes)
    }

    fn sum_range(
        &self,
        region: Option<&str>,
        category: Option<Category>,
        from: OffsetDateTime,
        to: OffsetDateTime,
        sizes: &[WindowSize],
    ) -> f64 {
        if from >= to {
            return 0.0;
        }
        let Some((size, finer)) = sizes.split_first() else {
            return self.raw_sum(region, category, from, to);
        };

        let inner_from = size.ceil(from);
        let inner_to = size.floor(to);
        if inner_from >= inner_to {
            return self.sum_range(region, category, from, to, finer);
        }

        let inner = match self.index.query(region, category, *size, inner_from, inner_to) {
            Ok(buckets) => buckets.iter().map(|b| b.sum).sum(),
            Err(e) => {
                tracing::warn!(error = %e, window = %size, "index query failed, scanning raw readings");
                self.raw_sum(region, category, inner_from, inner_to)
            }
        };

        inner
            + self.sum_range(region, category, from, inner_from, finer)
            + self.sum_range(region, category, inner_to, to, finer)
    }

    fn raw_sum(&self, region: Option<&str>, category: Option<Category>, from: OffsetDateTime, to: OffsetDateTime) -> f64 {
        let filter = ReadingFilter {
            meter_id: None,
            region: region.map(str::to_string),
            category,
        };
        self.store.scan_effective(&filter, from, to).map(|r| r.kwh).sum()
    }

    /// One point per `size` window overlapping `[from, to)`, ascending, with
    /// empty windows reported as zero.
    ///
    /// Served from the index when `size` is indexed, otherwise bucketed from
    /// a raw scan. Per-key buckets are merged into a single value per window.
    /// The range is first narrowed to the valid reading timestamps, so windows
    /// wholly outside them are omitted.
    pub fn time_series(
        &self,
        region: Option<&str>,
        category: Option<Category>,
        size: WindowSize,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Vec<SeriesPoint> {
        let (from, to) = clamp_to_valid(from, to);
        let starts = size.starts_in(from, to);
        if starts.is_empty() {
            return Vec::new();
        }

        let mut acc: BTreeMap<OffsetDateTime, (f64, u64)> = BTreeMap::new();
        match self.index.query(region, category, size, from, to) {
            Ok(buckets) => {
                for b in buckets {
                    let slot = acc.entry(b.window_start).or_insert((0.0, 0));
                    slot.0 += b.sum;
                    slot.1 += b.count;
                }
            }
            Err(_) => {
                let filter = ReadingFilter {
                    meter_id: None,
                    region: region.map(str::to_string),
                    category,
                };
                for r in self.store.scan_effective(&filter, size.floor(from), size.ceil(to)) {
                    let slot = acc.entry(size.floor(r.ts)).or_insert((0.0, 0));
                    slot.0 += r.kwh;
                    slot.1 += 1;
                }
            }
        }

        starts
            .into_iter()
            .map(|window_start| {
                let (value, count) = acc.get(&window_start).copied().unwrap_or((0.0, 0));
                SeriesPoint {
                    window_start,
                    value,
                    count,
                }
            })
            .collect()
    }

    /// Number of points [`time_series`](Self::time_series) returns for `size`
    /// over `[from, to)`.
    pub fn series_len(&self, size: WindowSize, from: OffsetDateTime, to: OffsetDateTime) -> u64 {
        let (from, to) = clamp_to_valid(from, to);
        size.count_in(from, to)
    }

    /// The `n` meters with the highest total over `[from, to)`, descending,
    /// ties broken by ascending meter id.
    pub fn top_consumers(&self, n: usize, from: OffsetDateTime, to: OffsetDateTime) -> Vec<ConsumerTotal> {
        if n == 0 {
            return Vec::new();
        }

        let mut totals: HashMap<String, f64> = HashMap::new();
        for r in self.store.scan_effective(&ReadingFilter::all(), from, to) {
            *totals.entry(r.meter_id).or_insert(0.0) += r.kwh;
        }

        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(n + 1);
        for (meter_id, total) in totals {
            let candidate = Ranked(ConsumerTotal { meter_id, total });
            if heap.len() < n {
                heap.push(Reverse(candidate));
            } else if heap.peek().is_some_and(|Reverse(worst)| candidate > *worst) {
                heap.pop();
                heap.push(Reverse(candidate));
            }
        }

        heap.into_sorted_vec().into_iter().map(|Reverse(r)| r.0).collect()
    }

    /// Time-ordered effective readings of a single meter.
    pub fn load_profile(&self, meter_id: &str, from: OffsetDateTime, to: OffsetDateTime) -> Vec<Reading> {
        let filter = ReadingFilter {
            meter_id: Some(meter_id.to_string()),
            ..ReadingFilter::default()
        };
        self.store.scan_effective(&filter, from, to).collect()
    }
}
