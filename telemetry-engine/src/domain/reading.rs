use serde::{Deserialize, Serialize};
use time::{macros::datetime, OffsetDateTime, UtcOffset};

use super::Category;
use crate::error::EngineError;

/// A reading as delivered by a collector, before the store has assigned it a
/// sequence or resolved its meter metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub meter_id: String,
    pub kwh: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,
}

impl MeterReading {
    pub fn new(meter_id: impl Into<String>, ts: OffsetDateTime, kwh: f64) -> Self {
        Self {
            ts,
            meter_id: meter_id.into(),
            kwh,
            source_system: None,
        }
    }

    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            meter_id: self.meter_id.clone(),
            ts: to_utc(self.ts),
        }
    }
}

/// An immutable log entry. `sequence` orders entries by ingestion, not by `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sequence: u64,
    pub meter_id: String,
    pub region: String,
    pub category: Category,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kwh: f64,
}

impl Reading {
    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            meter_id: self.meter_id.clone(),
            ts: self.ts,
        }
    }
}

/// Identity of a measurement: at most one effective value exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadingKey {
    pub meter_id: String,
    pub ts: OffsetDateTime,
}

/// Optional selectors applied by store scans. `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadingFilter {
    pub meter_id: Option<String>,
    pub region: Option<String>,
    pub category: Option<Category>,
}

impl ReadingFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: Option<Category>) -> Self {
        self.category = category;
        self
    }

    pub fn matches_meter(&self, meter_id: &str, region: &str, category: Category) -> bool {
        self.meter_id.as_deref().map_or(true, |m| m == meter_id)
            && self.region.as_deref().map_or(true, |r| r == region)
            && self.category.map_or(true, |c| c == category)
    }
}

/// Earliest timestamp a reading may carry.
pub const MIN_TS: OffsetDateTime = datetime!(2000-01-01 00:00:00 UTC);
/// Latest timestamp a reading may carry (inclusive).
pub const MAX_TS: OffsetDateTime = datetime!(2100-01-01 00:00:00 UTC);

/// Half-open range covering every valid reading timestamp.
pub fn full_range() -> (OffsetDateTime, OffsetDateTime) {
    (MIN_TS, MAX_TS + time::Duration::SECOND)
}

/// `[from, to)` narrowed to [`full_range`]. No reading exists outside it.
pub fn clamp_to_valid(from: OffsetDateTime, to: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let (min, max) = full_range();
    (from.max(min), to.min(max))
}

pub fn to_utc(ts: OffsetDateTime) -> OffsetDateTime {
    ts.to_offset(UtcOffset::UTC)
}

/// Pure validation of a `MeterReading`.
///
/// Rules:
/// - meter_id must be non-empty.
/// - kWh must be finite and non-negative.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_reading(r: &MeterReading) -> Result<(), EngineError> {
    if r.meter_id.trim().is_empty() {
        return Err(EngineError::InvalidReading("meter_id must not be empty".to_string()));
    }

    if !r.kwh.is_finite() {
        return Err(EngineError::InvalidReading("kwh must be a finite number".to_string()));
    }

    if r.kwh < 0.0 {
        return Err(EngineError::InvalidReading("kwh must be non-negative".to_string()));
    }

    if r.ts < MIN_TS || r.ts > MAX_TS {
        return Err(EngineError::InvalidReading("timestamp out of allowed range".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    #[test]
    fn validation_accepts_valid_reading() {
        let r = MeterReading::new("m-1", datetime!(2024-01-01 00:00:00 UTC), 1.0);
        assert!(validate_reading(&r).is_ok());
    }

    #[test]
    fn validation_rejects_negative_and_nan_kwh() {
        let neg = MeterReading::new("m-1", datetime!(2024-01-01 00:00:00 UTC), -0.1);
        assert!(matches!(validate_reading(&neg), Err(EngineError::InvalidReading(_))));

        let nan = MeterReading::new("m-1", datetime!(2024-01-01 00:00:00 UTC), f64::NAN);
        assert!(matches!(validate_reading(&nan), Err(EngineError::InvalidReading(_))));
    }

    #[test]
    fn validation_rejects_out_of_range_ts() {
        let r = MeterReading::new("m-1", datetime!(1800-01-01 00:00:00 UTC), 1.0);
        assert!(matches!(validate_reading(&r), Err(EngineError::InvalidReading(_))));
    }

    #[test]
    fn validation_rejects_blank_meter_id() {
        let r = MeterReading::new("  ", datetime!(2024-01-01 00:00:00 UTC), 1.0);
        assert!(matches!(validate_reading(&r), Err(EngineError::InvalidReading(_))));
    }

    #[test]
    fn key_normalizes_offset_to_utc() {
        let local = MeterReading::new("m-1", datetime!(2024-01-01 02:00:00 +02:00), 1.0);
        let utc = MeterReading::new("m-1", datetime!(2024-01-01 00:00:00 UTC), 1.0);
        assert_eq!(local.key(), utc.key());
        assert_eq!(local.key().ts.offset(), offset!(UTC));
    }

    #[test]
    fn filter_matches_on_every_present_selector() {
        let f = ReadingFilter::region("Central").with_category(Some(Category::Residential));
        assert!(f.matches_meter("m1", "Central", Category::Residential));
        assert!(!f.matches_meter("m1", "Central", Category::Industrial));
        assert!(!f.matches_meter("m1", "North", Category::Residential));
        assert!(ReadingFilter::all().matches_meter("x", "y", Category::Public));
    }
}
