use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{Category, WindowSize};

/// Identity of a rollup bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub region: String,
    pub category: Category,
    pub window_size: WindowSize,
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
}

/// Derived rollup over the effective readings of one region/category/window.
///
/// `count` is the number of distinct `(meter_id, ts)` keys, so a correction
/// never changes it. `version` increments on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub region: String,
    pub category: Category,
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    pub window_size: WindowSize,
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub version: u64,
}

impl Bucket {
    pub fn empty(key: &BucketKey) -> Self {
        Self {
            region: key.region.clone(),
            category: key.category,
            window_start: key.window_start,
            window_size: key.window_size,
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            version: 0,
        }
    }

    pub fn key(&self) -> BucketKey {
        BucketKey {
            region: self.region.clone(),
            category: self.category,
            window_size: self.window_size,
            window_start: self.window_start,
        }
    }

    pub fn window_end(&self) -> OffsetDateTime {
        self.window_size.next(self.window_start)
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Fold in a value for a key this bucket has not seen.
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.version += 1;
    }

    /// Swap `old` for `new` for a key already counted.
    ///
    /// Returns `false` when the old value was an extreme that the new value
    /// no longer reaches; min/max are then stale and the caller must recompute
    /// the bucket from the store.
    pub fn replace(&mut self, old: f64, new: f64) -> bool {
        self.sum = self.sum - old + new;
        self.version += 1;
        self.min = self.min.min(new);
        self.max = self.max.max(new);
        let min_superseded = old <= self.min && new > old;
        let max_superseded = old >= self.max && new < old;
        !(min_superseded || max_superseded)
    }

    /// Overwrite the aggregate with freshly computed values, bumping `version`.
    pub fn reset_to(&mut self, other: &Bucket) {
        let version = self.version + 1;
        *self = other.clone();
        self.version = version;
    }

    /// Compare aggregates ignoring `version`, with a float tolerance on `sum`.
    pub fn same_aggregate(&self, other: &Bucket) -> bool {
        let tolerance = 1e-9 * self.sum.abs().max(other.sum.abs()).max(1.0);
        self.key() == other.key()
            && self.count == other.count
            && (self.sum - other.sum).abs() <= tolerance
            && (self.count == 0 || (self.min == other.min && self.max == other.max))
    }
}
